//! Machine power control

use crate::api::AgentApi;
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use provision_models::Machine;
use std::fmt;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    Reboot,
    PowerOff,
}

impl PowerAction {
    /// The system command carrying out the action
    pub fn command(&self) -> &'static str {
        match self {
            PowerAction::Reboot => "reboot",
            PowerAction::PowerOff => "poweroff",
        }
    }
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command())
    }
}

#[async_trait]
pub trait PowerControl: Send + Sync {
    /// Carry out `action` for `machine`
    ///
    /// Returning at all means the machine is still up: `Ok(())` when
    /// power control is disabled, an error when the command failed.
    async fn power(&self, machine: &Machine, action: PowerAction) -> Result<()>;
}

/// Runs the system `reboot`/`poweroff` commands
pub struct SystemPower {
    api: Arc<dyn AgentApi>,
    enabled: bool,
}

impl SystemPower {
    pub fn new(api: Arc<dyn AgentApi>, enabled: bool) -> Self {
        Self { api, enabled }
    }
}

#[async_trait]
impl PowerControl for SystemPower {
    async fn power(&self, machine: &Machine, action: PowerAction) -> Result<()> {
        if !self.enabled {
            info!(action = %action, "power control disabled, not acting");
            return Ok(());
        }
        if let Err(e) = self.api.next_boot_pxe(machine).await {
            warn!(machine = %machine.uuid, error = %e, "cannot set next boot to PXE");
        }
        info!(machine = %machine.uuid, action = %action, "handing machine to the system");
        let status = Command::new(action.command()).status().await;
        match status {
            Ok(status) if status.success() => std::process::exit(0),
            Ok(status) => warn!(action = %action, status = %status, "power command failed"),
            Err(e) => warn!(action = %action, error = %e, "cannot run power command"),
        }
        Err(AgentError::Power(action.command().to_string()))
    }
}
