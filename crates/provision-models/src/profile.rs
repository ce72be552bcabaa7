use crate::model::{Model, Prefix};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A named bag of parameters shared by machines and stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
}

impl Profile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            params: BTreeMap::new(),
        }
    }
}

impl Model for Profile {
    const PREFIX: Prefix = Prefix::Profiles;

    fn key(&self) -> String {
        self.name.clone()
    }

    crate::object_conversions!(Profile);
}
