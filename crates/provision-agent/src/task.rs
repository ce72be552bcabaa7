//! Task execution
//!
//! A job's actions either drop a file somewhere on the machine or run a
//! shell script. Scripts tell the agent what to do next through their
//! exit code:
//!
//! | bit  | meaning                                      |
//! |------|----------------------------------------------|
//! | 16   | stop the agent                               |
//! | 32   | power the machine off                        |
//! | 64   | reboot the machine                           |
//! | 128  | the task is incomplete and must run again    |
//!
//! Any other non-zero bits mean the task failed.

use crate::api::{AgentApi, JobAction, JobPlan};
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use provision_models::{Job, JobState, Machine};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info, warn};

const EXIT_STOP: i32 = 16;
const EXIT_POWEROFF: i32 = 32;
const EXIT_REBOOT: i32 = 64;
const EXIT_INCOMPLETE: i32 = 128;
const EXIT_FLAGS: i32 = EXIT_STOP | EXIT_POWEROFF | EXIT_REBOOT | EXIT_INCOMPLETE;

/// What a finished task asked the agent to do
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOutcome {
    pub reboot: bool,
    pub poweroff: bool,
    pub stop: bool,
    pub failed: bool,
    pub incomplete: bool,
}

impl RunOutcome {
    /// Decode a script exit code
    pub fn from_exit_code(code: i32) -> Self {
        Self {
            stop: code & EXIT_STOP != 0,
            poweroff: code & EXIT_POWEROFF != 0,
            reboot: code & EXIT_REBOOT != 0,
            incomplete: code & EXIT_INCOMPLETE != 0,
            failed: code & !EXIT_FLAGS != 0,
        }
    }

    /// Fold in the outcome of a later action
    pub fn merge(&mut self, other: RunOutcome) {
        self.reboot |= other.reboot;
        self.poweroff |= other.poweroff;
        self.stop |= other.stop;
        self.failed |= other.failed;
        self.incomplete |= other.incomplete;
    }

    /// Whether the remaining actions of the job should be skipped
    fn halts(&self) -> bool {
        self.failed || self.incomplete || self.reboot || self.poweroff || self.stop
    }

    fn job_state(&self) -> (JobState, &'static str) {
        if self.failed {
            (JobState::Failed, "failed")
        } else if self.incomplete {
            (JobState::Incomplete, "incomplete")
        } else {
            (JobState::Finished, "complete")
        }
    }
}

/// A job picked for execution, with the directory it runs in
#[derive(Debug)]
pub struct Runner {
    pub plan: JobPlan,
    pub job_dir: PathBuf,
    /// Root the scripts run under, when inside a chroot
    pub chroot: Option<PathBuf>,
}

impl Runner {
    pub fn job(&self) -> &Job {
        &self.plan.job
    }

    pub fn want_chroot(&self) -> bool {
        self.plan.want_chroot
    }
}

#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Prepare the machine's next job, or `None` when nothing is left
    async fn next(&self, machine: &Machine, chroot: Option<&Path>) -> Result<Option<Runner>>;

    /// Run a prepared job
    ///
    /// Errors are transport or local failures; a task that ran and failed
    /// is reported through [`RunOutcome::failed`].
    async fn run(&self, runner: &Runner) -> Result<RunOutcome>;

    /// Clean up after a job, run or not
    async fn close(&self, runner: Runner);

    /// Let go of a runner whose job directory lives on as a chroot
    async fn release(&self, runner: Runner);
}

/// Runs job actions as files and shell scripts on this machine
pub struct ScriptRunner {
    api: Arc<dyn AgentApi>,
    runner_dir: PathBuf,
    shell: String,
}

impl ScriptRunner {
    pub fn new(api: Arc<dyn AgentApi>, runner_dir: impl Into<PathBuf>) -> Self {
        Self {
            api,
            runner_dir: runner_dir.into(),
            shell: "/bin/sh".to_string(),
        }
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    async fn write_file(&self, runner: &Runner, action: &JobAction) -> Result<()> {
        let rel = action.path.trim_start_matches('/');
        let target = match &runner.chroot {
            Some(root) => root.join(rel),
            None if Path::new(&action.path).is_absolute() => PathBuf::from(&action.path),
            None => runner.job_dir.join(rel),
        };
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, action.content.as_bytes()).await?;
        debug!(action = %action.name, path = %target.display(), "wrote action file");
        Ok(())
    }

    async fn run_script(&self, runner: &Runner, index: usize, action: &JobAction) -> Result<RunOutcome> {
        let script = runner.job_dir.join(format!("{:03}-{}", index, sanitize(&action.name)));
        tokio::fs::write(&script, action.content.as_bytes()).await?;

        let mut cmd = match &runner.chroot {
            Some(root) => {
                let inner = script
                    .strip_prefix(root)
                    .map(|p| Path::new("/").join(p))
                    .unwrap_or_else(|_| script.clone());
                let mut cmd = Command::new("chroot");
                cmd.arg(root).arg(&self.shell).arg(inner);
                cmd
            }
            None => {
                let mut cmd = Command::new(&self.shell);
                cmd.arg(&script);
                cmd
            }
        };
        cmd.current_dir(&runner.job_dir)
            .env("RS_JOB", runner.job().uuid.to_string())
            .env("RS_UUID", runner.job().machine.to_string())
            .env("RS_TASK", &runner.job().task);

        info!(job = %runner.job().uuid, action = %action.name, "running action");
        let status = cmd.status().await?;
        let outcome = match status.code() {
            Some(code) => RunOutcome::from_exit_code(code),
            None => {
                warn!(action = %action.name, "action killed by a signal");
                RunOutcome {
                    failed: true,
                    ..Default::default()
                }
            }
        };
        debug!(action = %action.name, status = %status, outcome = ?outcome, "action finished");
        Ok(outcome)
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[async_trait]
impl TaskRunner for ScriptRunner {
    async fn next(&self, machine: &Machine, chroot: Option<&Path>) -> Result<Option<Runner>> {
        let Some(plan) = self.api.next_job(machine).await? else {
            return Ok(None);
        };
        let base = match chroot {
            Some(root) => root.join("tmp"),
            None => self.runner_dir.clone(),
        };
        tokio::fs::create_dir_all(&base).await?;
        let job_dir = tempfile::Builder::new()
            .prefix("job-")
            .tempdir_in(&base)?
            .keep();
        Ok(Some(Runner {
            plan,
            job_dir,
            chroot: chroot.map(Path::to_path_buf),
        }))
    }

    async fn run(&self, runner: &Runner) -> Result<RunOutcome> {
        let job = self
            .api
            .update_job(runner.job(), JobState::Running, "")
            .await?;
        let mut outcome = RunOutcome::default();
        for (i, action) in runner.plan.actions.iter().enumerate() {
            let step = if action.is_script() {
                self.run_script(runner, i, action).await
            } else {
                self.write_file(runner, action).await.map(|_| RunOutcome::default())
            };
            match step {
                Ok(step) => outcome.merge(step),
                Err(e) => {
                    warn!(job = %job.uuid, action = %action.name, error = %e, "action could not run");
                    outcome.failed = true;
                }
            }
            if outcome.halts() {
                break;
            }
        }
        let (state, exit_state) = outcome.job_state();
        self.api
            .update_job(&job, state, exit_state)
            .await
            .map_err(|e| AgentError::Runner(format!("cannot record result of job {}: {}", job.uuid, e)))?;
        Ok(outcome)
    }

    async fn close(&self, runner: Runner) {
        if let Err(e) = tokio::fs::remove_dir_all(&runner.job_dir).await {
            debug!(dir = %runner.job_dir.display(), error = %e, "cannot remove job directory");
        }
    }

    async fn release(&self, runner: Runner) {
        debug!(dir = %runner.job_dir.display(), "keeping job directory");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedApi;

    #[test]
    fn test_exit_codes() {
        assert_eq!(RunOutcome::from_exit_code(0), RunOutcome::default());
        let o = RunOutcome::from_exit_code(1);
        assert!(o.failed && !o.reboot);
        let o = RunOutcome::from_exit_code(EXIT_REBOOT);
        assert!(o.reboot && !o.failed);
        let o = RunOutcome::from_exit_code(EXIT_POWEROFF | 1);
        assert!(o.poweroff && o.failed);
        let o = RunOutcome::from_exit_code(EXIT_INCOMPLETE | EXIT_REBOOT);
        assert!(o.incomplete && o.reboot && !o.failed);
        assert_eq!(o.job_state().0, JobState::Incomplete);
        assert_eq!(RunOutcome::from_exit_code(EXIT_STOP).job_state().0, JobState::Finished);
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("set hostname/v2"), "set_hostname_v2");
    }

    #[tokio::test]
    async fn test_script_runner_runs_actions() {
        let dir = tempfile::tempdir().unwrap();
        let m = Machine::new("node1");
        let api = Arc::new(ScriptedApi::new(m.clone()));
        let job = Job::new(m.uuid, "hostname", "discover");
        let action = |name: &str, path: &str, content: &str| JobAction {
            name: name.to_string(),
            path: path.to_string(),
            content: content.to_string(),
        };
        api.push_plan(JobPlan::new(
            job,
            vec![
                action("config", "etc/hostname", "node1\n"),
                action("check", "", "test -f etc/hostname && exit 64"),
                action("never", "", "exit 1"),
            ],
        ));

        let tasks = ScriptRunner::new(api.clone(), dir.path());
        let runner = tasks.next(&m, None).await.unwrap().unwrap();
        assert!(!runner.want_chroot());
        let outcome = tasks.run(&runner).await.unwrap();
        assert!(outcome.reboot);
        assert!(!outcome.failed);
        assert_eq!(api.job_states(), vec![JobState::Running, JobState::Finished]);

        let job_dir = runner.job_dir.clone();
        assert_eq!(
            std::fs::read_to_string(job_dir.join("etc/hostname")).unwrap(),
            "node1\n"
        );
        tasks.close(runner).await;
        assert!(!job_dir.exists());
        assert!(tasks.next(&m, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_release_keeps_job_dir() {
        let dir = tempfile::tempdir().unwrap();
        let m = Machine::new("node1");
        let api = Arc::new(ScriptedApi::new(m.clone()));
        let mut plan = JobPlan::new(Job::new(m.uuid, "image", "install"), Vec::new());
        plan.want_chroot = true;
        api.push_plan(plan);

        let tasks = ScriptRunner::new(api.clone(), dir.path());
        let runner = tasks.next(&m, None).await.unwrap().unwrap();
        assert!(runner.want_chroot());
        let job_dir = runner.job_dir.clone();
        tasks.release(runner).await;
        assert!(job_dir.is_dir());
    }
}
