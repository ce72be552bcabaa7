use crate::bootenv::TemplateInfo;
use crate::model::{Model, Prefix};
use crate::validation::Validation;
use serde::{Deserialize, Serialize};

/// A named step in a machine's lifecycle: a task list, profiles and an
/// optional bootenv the machine must be in while the stage runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Stage {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub boot_env: String,
    #[serde(default)]
    pub tasks: Vec<String>,
    #[serde(default)]
    pub profiles: Vec<String>,
    #[serde(default)]
    pub templates: Vec<TemplateInfo>,
    /// Entering this stage always reboots the machine
    #[serde(default)]
    pub reboot: bool,
    #[serde(flatten)]
    pub validation: Validation,
}

impl Stage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            boot_env: String::new(),
            tasks: Vec::new(),
            profiles: Vec::new(),
            templates: Vec::new(),
            reboot: false,
            validation: Validation::default(),
        }
    }
}

impl Model for Stage {
    const PREFIX: Prefix = Prefix::Stages;

    fn key(&self) -> String {
        self.name.clone()
    }

    fn validation_mut(&mut self) -> Option<&mut Validation> {
        Some(&mut self.validation)
    }

    crate::object_conversions!(Stage);
}
