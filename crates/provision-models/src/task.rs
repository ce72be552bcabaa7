use crate::bootenv::TemplateInfo;
use crate::model::{Model, Prefix};
use crate::validation::Validation;
use serde::{Deserialize, Serialize};

/// A unit of work run by the agent, made of rendered templates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Task {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub templates: Vec<TemplateInfo>,
    #[serde(default)]
    pub required_params: Vec<String>,
    #[serde(default)]
    pub optional_params: Vec<String>,
    #[serde(flatten)]
    pub validation: Validation,
}

impl Task {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            templates: Vec::new(),
            required_params: Vec::new(),
            optional_params: Vec::new(),
            validation: Validation::default(),
        }
    }
}

impl Model for Task {
    const PREFIX: Prefix = Prefix::Tasks;

    fn key(&self) -> String {
        self.name.clone()
    }

    fn validation_mut(&mut self) -> Option<&mut Validation> {
        Some(&mut self.validation)
    }

    crate::object_conversions!(Task);
}
