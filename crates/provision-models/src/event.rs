use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A change notification published after a store mutation commits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Event {
    pub time: DateTime<Utc>,
    /// Prefix of the changed object
    #[serde(rename = "Type")]
    pub kind: String,
    /// `create`, `update`, `save` or `delete`
    pub action: String,
    pub key: String,
    #[serde(default)]
    pub object: Value,
}

impl Event {
    pub fn new(
        kind: impl Into<String>,
        action: impl Into<String>,
        key: impl Into<String>,
        object: Value,
    ) -> Self {
        Self {
            time: Utc::now(),
            kind: kind.into(),
            action: action.into(),
            key: key.into(),
            object,
        }
    }
}
