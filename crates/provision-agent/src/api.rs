//! The server API the agent depends on
//!
//! [`AgentApi`] is the seam between the state machine and the provisioning
//! server. The HTTP implementation lives in [`crate::client`]; tests drive
//! the agent through a scripted implementation.

use crate::error::Result;
use async_trait::async_trait;
use provision_models::{Job, JobState, Machine, Stage};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// How a wait on the machine ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitOutcome {
    /// The machine matched the predicate
    Complete,
    /// Nothing matched before the timeout
    Timeout,
    /// The process was asked to stop
    Interrupt,
}

impl fmt::Display for WaitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WaitOutcome::Complete => "complete",
            WaitOutcome::Timeout => "timeout",
            WaitOutcome::Interrupt => "interrupt",
        })
    }
}

/// A condition over the JSON form of a machine
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq(String, Value),
    Ne(String, Value),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

impl Predicate {
    pub fn eq(field: &str, value: impl Serialize) -> Self {
        Predicate::Eq(field.to_string(), to_value(value))
    }

    pub fn ne(field: &str, value: impl Serialize) -> Self {
        Predicate::Ne(field.to_string(), to_value(value))
    }

    /// Whether `doc` satisfies the predicate
    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Predicate::Eq(field, want) => doc.get(field) == Some(want),
            Predicate::Ne(field, want) => doc.get(field) != Some(want),
            Predicate::And(all) => all.iter().all(|p| p.matches(doc)),
            Predicate::Or(any) => any.iter().any(|p| p.matches(doc)),
        }
    }

    /// Whether `machine` satisfies the predicate
    pub fn matches_machine(&self, machine: &Machine) -> bool {
        serde_json::to_value(machine)
            .map(|doc| self.matches(&doc))
            .unwrap_or(false)
    }
}

fn to_value(value: impl Serialize) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// One file a job wants written or run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobAction {
    pub name: String,
    /// Where to write `content`; an empty path means run it as a script
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub content: String,
}

impl JobAction {
    pub fn is_script(&self) -> bool {
        self.path.is_empty()
    }
}

/// Name of the action a task uses to ask for the rest of the task list
/// to run inside its job directory
pub const CHROOT_ACTION: &str = "chroot";

/// The next job the server wants the machine to run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobPlan {
    pub job: Job,
    #[serde(default)]
    pub actions: Vec<JobAction>,
    /// Run the rest of the task list inside the job directory
    #[serde(default)]
    pub want_chroot: bool,
}

impl JobPlan {
    pub fn new(job: Job, actions: Vec<JobAction>) -> Self {
        let want_chroot = actions.iter().any(|a| a.name == CHROOT_ACTION);
        Self {
            job,
            actions,
            want_chroot,
        }
    }
}

/// Server operations used by the machine agent
#[async_trait]
pub trait AgentApi: Send + Sync {
    async fn get_machine(&self, uuid: &str) -> Result<Machine>;

    /// Apply the difference between `old` and `new` to the stored machine
    async fn patch_machine(&self, old: &Machine, new: &Machine) -> Result<Machine>;

    /// `Ok(None)` when the job does not exist
    async fn get_job(&self, uuid: &str) -> Result<Option<Job>>;

    async fn patch_job(&self, old: &Job, new: &Job) -> Result<Job>;

    async fn get_stage(&self, name: &str) -> Result<Stage>;

    /// The aggregated `change-stage/map` parameter of the machine
    async fn change_stage_map(&self, machine: &Machine) -> Result<BTreeMap<String, String>>;

    /// Ask the server to PXE boot the machine next time, where supported
    async fn next_boot_pxe(&self, machine: &Machine) -> Result<()>;

    /// Block until `machine` satisfies `pred` or `timeout` passes
    ///
    /// Returns the latest snapshot of the machine alongside the outcome.
    async fn wait_for(
        &self,
        machine: &Machine,
        pred: &Predicate,
        timeout: Duration,
    ) -> Result<(WaitOutcome, Machine)>;

    /// Create the job for the machine's next task, if it has one
    async fn next_job(&self, machine: &Machine) -> Result<Option<JobPlan>>;

    /// Move a job to `state`, recording how it exited
    async fn update_job(&self, job: &Job, state: JobState, exit_state: &str) -> Result<Job> {
        let mut next = job.clone();
        next.state = state;
        next.exit_state = exit_state.to_string();
        self.patch_job(job, &next).await
    }
}
