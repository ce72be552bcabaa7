//! Provisioning Machine Agent
//!
//! Runs on a machine being provisioned and walks it through the tasks of
//! its current stage, moving it to the next stage when the tasks run out
//! and rebooting or powering it off when a task or stage asks for it.
//!
//! # States
//!
//! ```text
//!            ┌──────┐  error  ┌──────────────────────┐
//!            │ Init │◀────────│ any state (backoff)  │
//!            └──┬───┘         └──────────────────────┘
//!               ▼
//!   ┌──────────────────────┐ runnable ┌──────────┐ no task ┌─────────────┐
//!   │   WaitForRunnable    │─────────▶│ RunTask  │────────▶│ ChangeStage │
//!   └──────────────────────┘◀─────────└────┬─────┘         └──────┬──────┘
//!               ▲                          │ workflow             │
//!               │                          ▼                      │
//!               │               ┌────────────────────┐            │
//!               └───────────────│ WaitForChangeStage │◀───────────┘
//!                               └────────────────────┘
//!
//!   Exit | Reboot | PowerOff end the run
//! ```

pub mod api;
pub mod client;
pub mod error;
pub mod power;
pub mod runner;
pub mod task;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{AgentApi, JobAction, JobPlan, Predicate, WaitOutcome};
pub use client::HttpApi;
pub use error::*;
pub use power::{PowerAction, PowerControl, SystemPower};
pub use runner::{AgentState, MachineAgent, Sleeper, TokioSleeper};
pub use task::{RunOutcome, Runner, ScriptRunner, TaskRunner};
