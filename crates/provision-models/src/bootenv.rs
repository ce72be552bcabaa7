//! Boot environments and their templates

use crate::model::{Model, Prefix};
use crate::validation::Validation;
use serde::{Deserialize, Serialize};

/// A template rendered per machine and exposed at a rendered path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TemplateInfo {
    pub name: String,
    /// Path template, e.g. `pxelinux.cfg/{{ machine.hex_address }}`
    #[serde(default)]
    pub path: String,
    pub contents: String,
}

impl TemplateInfo {
    pub fn new(
        name: impl Into<String>,
        path: impl Into<String>,
        contents: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            contents: contents.into(),
        }
    }
}

/// Kernel, initrds and boot loader templates a machine boots with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BootEnv {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Only used for machines the system does not know about
    #[serde(default)]
    pub only_unknown: bool,
    #[serde(default)]
    pub kernel: String,
    #[serde(default)]
    pub initrds: Vec<String>,
    #[serde(default)]
    pub boot_params: String,
    #[serde(default)]
    pub required_params: Vec<String>,
    #[serde(default)]
    pub optional_params: Vec<String>,
    #[serde(default)]
    pub templates: Vec<TemplateInfo>,
    #[serde(flatten)]
    pub validation: Validation,
}

impl BootEnv {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            only_unknown: false,
            kernel: String::new(),
            initrds: Vec::new(),
            boot_params: String::new(),
            required_params: Vec::new(),
            optional_params: Vec::new(),
            templates: Vec::new(),
            validation: Validation::default(),
        }
    }

    pub fn template(&self, name: &str) -> Option<&TemplateInfo> {
        self.templates.iter().find(|t| t.name == name)
    }

    /// Whether machines in this bootenv should get PXE boot information
    pub fn net_boot(&self) -> bool {
        self.only_unknown || !self.kernel.is_empty()
    }
}

impl Model for BootEnv {
    const PREFIX: Prefix = Prefix::Bootenvs;

    fn key(&self) -> String {
        self.name.clone()
    }

    fn validation_mut(&mut self) -> Option<&mut Validation> {
        Some(&mut self.validation)
    }

    crate::object_conversions!(BootEnv);
}
