//! Managed machines

use crate::hexaddr::hexaddr;
use crate::model::{Model, Prefix};
use crate::validation::Validation;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use uuid::Uuid;

/// A machine being driven through stages and tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Machine {
    pub uuid: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Ipv4Addr>,
    #[serde(default)]
    pub hardware_addrs: Vec<String>,
    #[serde(default)]
    pub boot_env: String,
    #[serde(default)]
    pub stage: String,
    #[serde(default)]
    pub workflow: String,
    #[serde(default)]
    pub profiles: Vec<String>,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    #[serde(default)]
    pub tasks: Vec<String>,
    #[serde(default)]
    pub current_task: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_job: Option<Uuid>,
    #[serde(default)]
    pub runnable: bool,
    #[serde(default)]
    pub secret: String,
    #[serde(flatten)]
    pub validation: Validation,
}

impl Machine {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
            address: None,
            hardware_addrs: Vec::new(),
            boot_env: String::new(),
            stage: String::new(),
            workflow: String::new(),
            profiles: Vec::new(),
            params: BTreeMap::new(),
            tasks: Vec::new(),
            current_task: 0,
            current_job: None,
            runnable: false,
            secret: String::new(),
            validation: Validation::default(),
        }
    }

    /// Upper-case hex form of the machine address, if it has one
    pub fn hex_address(&self) -> String {
        self.address.map(hexaddr).unwrap_or_default()
    }

    /// Name up to the first dot
    pub fn short_name(&self) -> &str {
        self.name.split('.').next().unwrap_or(&self.name)
    }

    pub fn in_install(&self) -> bool {
        self.boot_env.ends_with("-install")
    }

    /// Tasks not yet started
    pub fn pending_tasks(&self) -> &[String] {
        let next = (self.current_task + 1).max(0) as usize;
        self.tasks.get(next..).unwrap_or(&[])
    }

    pub fn new_secret() -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect()
    }
}

impl Model for Machine {
    const PREFIX: Prefix = Prefix::Machines;

    fn key(&self) -> String {
        if self.uuid.is_nil() {
            String::new()
        } else {
            self.uuid.to_string()
        }
    }

    fn validation_mut(&mut self) -> Option<&mut Validation> {
        Some(&mut self.validation)
    }

    crate::object_conversions!(Machine);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_helpers() {
        let mut m = Machine::new("node1.example.com");
        m.address = Some(Ipv4Addr::new(192, 168, 1, 10));
        m.boot_env = "centos-7-install".to_string();
        assert_eq!(m.short_name(), "node1");
        assert_eq!(m.hex_address(), "C0A8010A");
        assert!(m.in_install());

        m.tasks = vec!["a".into(), "b".into(), "c".into()];
        m.current_task = -1;
        assert_eq!(m.pending_tasks().len(), 3);
        m.current_task = 1;
        assert_eq!(m.pending_tasks(), &["c".to_string()]);
        m.current_task = 2;
        assert!(m.pending_tasks().is_empty());
    }

    #[test]
    fn test_nil_uuid_has_empty_key() {
        let mut m = Machine::new("x");
        assert!(!m.key().is_empty());
        m.uuid = Uuid::nil();
        assert!(m.key().is_empty());
    }

    #[test]
    fn test_secret_shape() {
        let s = Machine::new_secret();
        assert_eq!(s.len(), 16);
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
