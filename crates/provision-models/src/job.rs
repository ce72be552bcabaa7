//! Task execution records

use crate::model::{Model, Prefix};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    #[default]
    Created,
    Running,
    Failed,
    Finished,
    Incomplete,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Created => "created",
            JobState::Running => "running",
            JobState::Failed => "failed",
            JobState::Finished => "finished",
            JobState::Incomplete => "incomplete",
        }
    }

    /// The job will not run again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Failed | JobState::Finished | JobState::Incomplete
        )
    }

    /// Allowed state machine edges
    pub fn can_become(&self, next: JobState) -> bool {
        use JobState::*;
        *self == next
            || matches!(
                (self, next),
                (Created, Running)
                    | (Created, Failed)
                    | (Running, Failed)
                    | (Running, Finished)
                    | (Running, Incomplete)
            )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One run of a task against a machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Job {
    pub uuid: Uuid,
    pub machine: Uuid,
    pub task: String,
    #[serde(default)]
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<Uuid>,
    #[serde(default)]
    pub current: bool,
    #[serde(default)]
    pub state: JobState,
    #[serde(default)]
    pub exit_state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub archived: bool,
}

impl Job {
    pub fn new(machine: Uuid, task: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::now_v7(),
            machine,
            task: task.into(),
            stage: stage.into(),
            previous: None,
            current: false,
            state: JobState::Created,
            exit_state: String::new(),
            start_time: None,
            end_time: None,
            archived: false,
        }
    }
}

impl Model for Job {
    const PREFIX: Prefix = Prefix::Jobs;

    fn key(&self) -> String {
        if self.uuid.is_nil() {
            String::new()
        } else {
            self.uuid.to_string()
        }
    }

    crate::object_conversions!(Job);
}
