//! The machine agent state machine
//!
//! The agent waits by default after running out of tasks. Three things
//! override that, in priority order:
//!
//! 1. the next stage has its `Reboot` flag set,
//! 2. the `change-stage/map` entry for the next stage ends in `:Stop`,
//!    `:Reboot` or `:Shutdown`,
//! 3. the machine is in a bootenv ending in `-install` with nothing left
//!    to do, in which case the agent exits.
//!
//! A change of bootenv seen while waiting reboots the machine, or exits
//! the agent while an OS install is running.

use crate::api::{AgentApi, Predicate, WaitOutcome};
use crate::error::{AgentError, Result};
use crate::power::{PowerAction, PowerControl};
use crate::task::TaskRunner;
use async_trait::async_trait;
use provision_models::{JobState, Machine, ModelError};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long to back off before retrying after an error
pub const FAILURE_BACKOFF: Duration = Duration::from_secs(30);

/// How long to back off before re-initializing
pub const INIT_BACKOFF: Duration = Duration::from_secs(5);

/// Default bound on a single wait for the machine to change
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Init,
    WaitForRunnable,
    RunTask,
    WaitForChangeStage,
    ChangeStage,
    Exit,
    Reboot,
    PowerOff,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AgentState::Init => "init",
            AgentState::WaitForRunnable => "wait-for-runnable",
            AgentState::RunTask => "run-task",
            AgentState::WaitForChangeStage => "wait-for-change-stage",
            AgentState::ChangeStage => "change-stage",
            AgentState::Exit => "exit",
            AgentState::Reboot => "reboot",
            AgentState::PowerOff => "poweroff",
        })
    }
}

/// Something that can pause the agent
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}

/// Drives one machine through its stages and tasks
pub struct MachineAgent {
    state: AgentState,
    machine: Machine,
    api: Arc<dyn AgentApi>,
    tasks: Arc<dyn TaskRunner>,
    power: Arc<dyn PowerControl>,
    sleeper: Arc<dyn Sleeper>,
    wait_timeout: Duration,
    exit_on_not_runnable: bool,
    exit_on_failure: bool,
    chroot: Option<PathBuf>,
    err: Option<AgentError>,
    visited: Vec<AgentState>,
}

impl MachineAgent {
    /// Create an agent for `machine`, starting in [`AgentState::Init`]
    pub fn new(
        api: Arc<dyn AgentApi>,
        machine: Machine,
        tasks: Arc<dyn TaskRunner>,
        power: Arc<dyn PowerControl>,
    ) -> Self {
        Self {
            state: AgentState::Init,
            machine,
            api,
            tasks,
            power,
            sleeper: Arc::new(TokioSleeper),
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            exit_on_not_runnable: false,
            exit_on_failure: false,
            chroot: None,
            err: None,
            visited: Vec::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Exit instead of retrying after errors and failed tasks
    pub fn exit_on_failure(mut self, exit: bool) -> Self {
        self.exit_on_failure = exit;
        self
    }

    /// Exit when a wait for the machine to become runnable times out
    pub fn exit_on_not_runnable(mut self, exit: bool) -> Self {
        self.exit_on_not_runnable = exit;
        self
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    /// Every state the agent has entered, in order
    pub fn visited(&self) -> &[AgentState] {
        &self.visited
    }

    fn record(&mut self, err: AgentError) {
        warn!(machine = %self.machine.uuid, state = %self.state, error = %err, "Error during run");
        self.err = Some(err);
    }

    fn in_install(&self) -> bool {
        self.machine.boot_env.ends_with("-install")
    }

    async fn exit_or_sleep(&mut self) {
        if self.exit_on_failure {
            self.state = AgentState::Exit;
        } else {
            self.sleeper.sleep(FAILURE_BACKOFF).await;
        }
    }

    async fn init_or_exit(&mut self) {
        if self.exit_on_failure {
            self.state = AgentState::Exit;
        } else {
            self.state = AgentState::Init;
            self.sleeper.sleep(INIT_BACKOFF).await;
        }
    }

    fn reboot_or_exit(&mut self) {
        self.state = if self.in_install() {
            AgentState::Exit
        } else {
            AgentState::Reboot
        };
    }

    /// Fail any job left running by an earlier agent and refresh the
    /// machine from the server
    async fn init(&mut self) {
        self.err = None;
        if let Some(job_id) = self.machine.current_job {
            match self.api.get_job(&job_id.to_string()).await {
                Ok(Some(job)) if matches!(job.state, JobState::Running | JobState::Created) => {
                    info!(job = %job.uuid, task = %job.task, "Marking interrupted job as failed");
                    if let Err(e) = self.api.update_job(&job, JobState::Failed, "failed").await {
                        self.record(e);
                        self.exit_or_sleep().await;
                        return;
                    }
                }
                Ok(_) => {}
                Err(e) => debug!(job = %job_id, error = %e, "cannot read current job"),
            }
        }
        match self.api.get_machine(&self.machine.uuid.to_string()).await {
            Ok(machine) => self.machine = machine,
            Err(e) => {
                self.record(e);
                self.exit_or_sleep().await;
                return;
            }
        }
        self.state = AgentState::WaitForRunnable;
    }

    /// Wait for the machine to satisfy `pred`, then decide where to go
    async fn wait_on(&mut self, snapshot: Machine, pred: Predicate) {
        let pred = Predicate::And(vec![Predicate::eq("Available", true), pred]);
        let (outcome, latest) = match self.api.wait_for(&snapshot, &pred, self.wait_timeout).await {
            Ok(found) => found,
            Err(e) => {
                self.record(e);
                self.init_or_exit().await;
                return;
            }
        };
        info!(outcome = %outcome, "Wait finished");
        match outcome {
            WaitOutcome::Timeout if self.exit_on_not_runnable => {
                self.state = AgentState::Exit;
                return;
            }
            WaitOutcome::Timeout => {}
            WaitOutcome::Interrupt => self.state = AgentState::Exit,
            WaitOutcome::Complete => {
                if latest.boot_env != self.machine.boot_env {
                    info!(from = %self.machine.boot_env, to = %latest.boot_env, "Boot environment changed");
                    self.reboot_or_exit();
                } else if latest.runnable {
                    self.state = AgentState::RunTask;
                } else {
                    self.state = AgentState::WaitForRunnable;
                }
            }
        }
        self.machine = latest;
    }

    async fn wait_runnable(&mut self) {
        info!("Waiting on machine to become runnable");
        let snapshot = self.machine.clone();
        self.wait_on(snapshot, Predicate::eq("Runnable", true)).await;
    }

    async fn wait_change_stage(&mut self) {
        info!("Waiting for system to be runnable and for stage or current tasks to change");
        let m = self.machine.clone();
        let pred = Predicate::Or(vec![
            Predicate::ne("CurrentTask", m.current_task),
            Predicate::ne("Tasks", &m.tasks),
            Predicate::ne("Runnable", m.runnable),
            Predicate::ne("BootEnv", &m.boot_env),
            Predicate::ne("Stage", &m.stage),
        ]);
        self.wait_on(m, pred).await;
    }

    async fn run_task(&mut self) {
        let runner = match self.tasks.next(&self.machine, self.chroot.as_deref()).await {
            Ok(runner) => runner,
            Err(e) => {
                self.record(e);
                self.init_or_exit().await;
                return;
            }
        };
        let Some(runner) = runner else {
            self.state = if self.chroot.is_some() {
                info!("Current tasks finished, exiting chroot");
                AgentState::Exit
            } else if self.machine.workflow.is_empty() {
                info!("Current tasks finished, check to see if stage needs to change");
                AgentState::ChangeStage
            } else {
                info!("Current tasks finished, wait for stage or bootenv to change");
                AgentState::WaitForChangeStage
            };
            return;
        };
        info!(job = %runner.job().uuid, task = %runner.job().task, "Runner created for task");
        if runner.want_chroot() {
            info!(dir = %runner.job_dir.display(), "Task wants to continue inside a chroot");
            self.chroot = Some(runner.job_dir.clone());
            self.tasks.release(runner).await;
            self.state = AgentState::WaitForRunnable;
            return;
        }
        let outcome = match self.tasks.run(&runner).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.tasks.close(runner).await;
                self.record(e);
                self.init_or_exit().await;
                return;
            }
        };
        let job = runner.job().uuid;
        self.tasks.close(runner).await;

        self.state = AgentState::WaitForRunnable;
        if outcome.reboot {
            info!(job = %job, "Task signalled runner to reboot");
            self.reboot_or_exit();
        } else if outcome.poweroff {
            info!(job = %job, "Task signalled runner to poweroff");
            self.state = AgentState::PowerOff;
        } else if outcome.stop {
            info!(job = %job, "Task signalled runner to stop");
            self.state = AgentState::Exit;
        } else if outcome.failed {
            info!(job = %job, "Task signalled that it failed");
            if self.exit_on_failure {
                self.state = AgentState::Exit;
            }
        }
        if outcome.incomplete {
            info!(job = %job, "Task signalled that it was incomplete");
        } else if !outcome.failed {
            info!(job = %job, "Task signalled that it finished normally");
        }
    }

    async fn change_stage(&mut self) {
        self.state = AgentState::WaitForChangeStage;
        let in_install = self.in_install();
        let map = match self.api.change_stage_map(&self.machine).await {
            Ok(map) => map,
            Err(e) => {
                debug!(error = %e, "no change-stage map");
                Default::default()
            }
        };
        let (mut next_stage, target) = match map.get(&self.machine.stage) {
            Some(entry) => match entry.split_once(':') {
                Some((stage, target)) => (stage.to_string(), target.to_string()),
                None => (entry.clone(), String::new()),
            },
            None => (String::new(), String::new()),
        };
        if next_stage.is_empty() {
            next_stage = if in_install {
                "local".to_string()
            } else {
                self.machine.stage.clone()
            };
        }
        if next_stage == self.machine.stage {
            return;
        }
        info!(from = %self.machine.stage, to = %next_stage, "Changing stage");
        let stage = match self.api.get_stage(&next_stage).await {
            Ok(stage) => stage,
            Err(e) => {
                self.record(e);
                self.init_or_exit().await;
                return;
            }
        };

        if stage.boot_env.is_empty() || stage.boot_env == self.machine.boot_env {
            self.state = AgentState::WaitForRunnable;
        } else {
            self.reboot_or_exit();
        }
        match target.as_str() {
            "Reboot" => self.reboot_or_exit(),
            "Stop" => self.state = AgentState::Exit,
            "Shutdown" => self.state = AgentState::PowerOff,
            "" => {}
            other => warn!(directive = %other, "ignoring unknown change-stage directive"),
        }
        if stage.reboot {
            self.reboot_or_exit();
        }

        let mut next = self.machine.clone();
        next.stage = next_stage;
        if let Err(e) = self.api.patch_machine(&self.machine, &next).await {
            self.record(e);
            self.init_or_exit().await;
        }
    }

    /// Run the agent until it exits or hands the machine to the power
    /// controller
    ///
    /// Returns the last error recorded since the agent was last
    /// initialized, if any.
    pub async fn run(&mut self) -> Result<()> {
        let mut runnable = self.machine.clone();
        runnable.runnable = true;
        match self.api.patch_machine(&self.machine, &runnable).await {
            Ok(machine) => self.machine = machine,
            Err(e) => {
                let err = ModelError::new(400, "AGENT_WAIT", "machines", self.machine.uuid.to_string())
                    .with("Failed to mark machine runnable.")
                    .with(e.to_string());
                return Err(err.into());
            }
        }

        loop {
            self.visited.push(self.state);
            info!(state = %self.state, "Agent state");
            match self.state {
                AgentState::Init => self.init().await,
                AgentState::WaitForRunnable => self.wait_runnable().await,
                AgentState::RunTask => self.run_task().await,
                AgentState::WaitForChangeStage => self.wait_change_stage().await,
                AgentState::ChangeStage => self.change_stage().await,
                AgentState::Exit => match self.chroot.take() {
                    Some(dir) => {
                        info!(dir = %dir.display(), "Agent exiting chroot");
                        self.wait_runnable().await;
                    }
                    None => {
                        info!("Agent exiting");
                        return self.err.take().map_or(Ok(()), Err);
                    }
                },
                AgentState::Reboot => {
                    return self.power.power(&self.machine, PowerAction::Reboot).await;
                }
                AgentState::PowerOff => {
                    return self.power.power(&self.machine, PowerAction::PowerOff).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockPower, RecordingSleeper, ScriptedApi, ScriptedTasks, TaskStep};
    use crate::task::RunOutcome;
    use provision_models::Stage;
    use AgentState::*;

    struct Harness {
        api: Arc<ScriptedApi>,
        tasks: Arc<ScriptedTasks>,
        power: Arc<MockPower>,
        sleeper: Arc<RecordingSleeper>,
    }

    impl Harness {
        fn new(machine: Machine) -> Self {
            Self {
                api: Arc::new(ScriptedApi::new(machine)),
                tasks: Arc::new(ScriptedTasks::default()),
                power: Arc::new(MockPower::default()),
                sleeper: Arc::new(RecordingSleeper::default()),
            }
        }

        fn agent(&self) -> MachineAgent {
            let machine = self.api.machine();
            MachineAgent::new(self.api.clone(), machine, self.tasks.clone(), self.power.clone())
                .with_sleeper(self.sleeper.clone())
        }
    }

    fn machine(boot_env: &str, stage: &str) -> Machine {
        let mut m = Machine::new("node1");
        m.boot_env = boot_env.to_string();
        m.stage = stage.to_string();
        m.validation.validated = true;
        m.validation.available = true;
        m
    }

    fn runnable(m: &Machine) -> Machine {
        let mut m = m.clone();
        m.runnable = true;
        m
    }

    fn stage(name: &str, boot_env: &str, reboot: bool) -> Stage {
        let mut s = Stage::new(name);
        s.boot_env = boot_env.to_string();
        s.reboot = reboot;
        s
    }

    #[tokio::test]
    async fn test_task_poweroff_powers_off() {
        let m = machine("sledgehammer", "discover");
        let h = Harness::new(m.clone());
        h.api.push_wait(WaitOutcome::Complete, runnable(&m));
        h.tasks.push(TaskStep::Run(RunOutcome {
            poweroff: true,
            ..Default::default()
        }));

        let mut agent = h.agent();
        agent.run().await.unwrap();
        assert_eq!(agent.visited(), &[Init, WaitForRunnable, RunTask, PowerOff]);
        assert_eq!(h.power.actions(), vec![PowerAction::PowerOff]);
        assert_eq!(h.tasks.closed(), 1);
        assert!(h.api.patches()[0].runnable);
    }

    #[tokio::test]
    async fn test_bootenv_change_reboots_or_exits_install() {
        let m = machine("sledgehammer", "discover");
        let h = Harness::new(m.clone());
        let mut moved = runnable(&m);
        moved.boot_env = "centos-install".to_string();
        h.api.push_wait(WaitOutcome::Complete, moved);
        let mut agent = h.agent();
        agent.run().await.unwrap();
        assert_eq!(agent.visited(), &[Init, WaitForRunnable, Reboot]);
        assert_eq!(h.power.actions(), vec![PowerAction::Reboot]);

        let m = machine("centos-install", "install");
        let h = Harness::new(m.clone());
        let mut moved = runnable(&m);
        moved.boot_env = "local".to_string();
        h.api.push_wait(WaitOutcome::Complete, moved);
        let mut agent = h.agent();
        agent.run().await.unwrap();
        assert_eq!(agent.visited(), &[Init, WaitForRunnable, Exit]);
        assert!(h.power.actions().is_empty());
    }

    #[tokio::test]
    async fn test_wait_outcomes() {
        let m = machine("sledgehammer", "discover");
        let h = Harness::new(m.clone());
        h.api.push_wait(WaitOutcome::Timeout, m.clone());
        let mut agent = h.agent().exit_on_not_runnable(true);
        agent.run().await.unwrap();
        assert_eq!(agent.visited(), &[Init, WaitForRunnable, Exit]);

        // Without the flag a timeout just waits again
        let h = Harness::new(m.clone());
        h.api.push_wait(WaitOutcome::Timeout, m.clone());
        h.api.push_wait(WaitOutcome::Complete, m.clone());
        let mut agent = h.agent();
        agent.run().await.unwrap();
        assert_eq!(
            agent.visited(),
            &[Init, WaitForRunnable, WaitForRunnable, WaitForRunnable, Exit]
        );
        let preds = h.api.predicates();
        assert_eq!(
            preds[0],
            Predicate::And(vec![Predicate::eq("Available", true), Predicate::eq("Runnable", true)])
        );
    }

    #[tokio::test]
    async fn test_no_tasks_without_workflow_changes_stage() {
        let m = machine("sledgehammer", "discover");
        let h = Harness::new(m.clone());
        h.api.push_wait(WaitOutcome::Complete, runnable(&m));
        h.api.set_map(&[("discover", "inventory:Stop")]);
        h.api.add_stage(stage("inventory", "sledgehammer", false));

        let mut agent = h.agent();
        agent.run().await.unwrap();
        assert_eq!(agent.visited(), &[Init, WaitForRunnable, RunTask, ChangeStage, Exit]);
        assert_eq!(h.api.machine().stage, "inventory");
    }

    #[tokio::test]
    async fn test_stage_reboot_flag_beats_map_directive() {
        let m = machine("sledgehammer", "discover");
        let h = Harness::new(m.clone());
        h.api.push_wait(WaitOutcome::Complete, runnable(&m));
        h.api.set_map(&[("discover", "inventory:Stop")]);
        h.api.add_stage(stage("inventory", "", true));

        let mut agent = h.agent();
        agent.run().await.unwrap();
        assert_eq!(agent.visited(), &[Init, WaitForRunnable, RunTask, ChangeStage, Reboot]);
        assert_eq!(h.power.actions(), vec![PowerAction::Reboot]);
    }

    #[tokio::test]
    async fn test_new_bootenv_stage_and_shutdown_directive() {
        let m = machine("sledgehammer", "discover");
        let h = Harness::new(m.clone());
        h.api.push_wait(WaitOutcome::Complete, runnable(&m));
        h.api.set_map(&[("discover", "centos")]);
        h.api.add_stage(stage("centos", "centos-install", false));
        let mut agent = h.agent();
        agent.run().await.unwrap();
        assert_eq!(agent.visited(), &[Init, WaitForRunnable, RunTask, ChangeStage, Reboot]);

        let h = Harness::new(m.clone());
        h.api.push_wait(WaitOutcome::Complete, runnable(&m));
        h.api.set_map(&[("discover", "centos:Shutdown")]);
        h.api.add_stage(stage("centos", "centos-install", false));
        let mut agent = h.agent();
        agent.run().await.unwrap();
        assert_eq!(agent.visited(), &[Init, WaitForRunnable, RunTask, ChangeStage, PowerOff]);
    }

    #[tokio::test]
    async fn test_install_without_map_goes_local() {
        let m = machine("centos-install", "centos");
        let h = Harness::new(m.clone());
        h.api.push_wait(WaitOutcome::Complete, runnable(&m));
        h.api.add_stage(stage("local", "local", false));

        let mut agent = h.agent();
        agent.run().await.unwrap();
        assert_eq!(agent.visited(), &[Init, WaitForRunnable, RunTask, ChangeStage, Exit]);
        assert_eq!(h.api.machine().stage, "local");
    }

    #[tokio::test]
    async fn test_nothing_to_change_waits() {
        let m = machine("sledgehammer", "discover");
        let h = Harness::new(m.clone());
        h.api.push_wait(WaitOutcome::Complete, runnable(&m));
        let mut agent = h.agent();
        agent.run().await.unwrap();
        assert_eq!(
            agent.visited(),
            &[Init, WaitForRunnable, RunTask, ChangeStage, WaitForChangeStage, Exit]
        );

        let mut m = machine("sledgehammer", "discover");
        m.workflow = "provision".to_string();
        let h = Harness::new(m.clone());
        h.api.push_wait(WaitOutcome::Complete, runnable(&m));
        let mut agent = h.agent();
        agent.run().await.unwrap();
        assert_eq!(agent.visited(), &[Init, WaitForRunnable, RunTask, WaitForChangeStage, Exit]);
        match &h.api.predicates()[1] {
            Predicate::And(all) => assert!(matches!(&all[1], Predicate::Or(any) if any.len() == 5)),
            other => panic!("unexpected predicate {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mark_runnable_failure() {
        let m = machine("sledgehammer", "discover");
        let h = Harness::new(m);
        h.api.fail_patches();
        let mut agent = h.agent();
        let err = agent.run().await.unwrap_err();
        match err {
            AgentError::Model(e) => {
                assert_eq!(e.kind, "AGENT_WAIT");
                assert_eq!(e.messages[0], "Failed to mark machine runnable.");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(agent.visited().is_empty());
    }

    #[tokio::test]
    async fn test_runner_errors_back_off() {
        let m = machine("sledgehammer", "discover");
        let h = Harness::new(m.clone());
        h.api.push_wait(WaitOutcome::Complete, runnable(&m));
        h.tasks.push(TaskStep::Error);
        let mut agent = h.agent();
        agent.run().await.unwrap();
        assert_eq!(agent.visited(), &[Init, WaitForRunnable, RunTask, Init, WaitForRunnable, Exit]);
        assert_eq!(h.sleeper.slept(), vec![INIT_BACKOFF]);

        let h = Harness::new(m.clone());
        h.api.push_wait(WaitOutcome::Complete, runnable(&m));
        h.tasks.push(TaskStep::Error);
        let mut agent = h.agent().exit_on_failure(true);
        assert!(matches!(agent.run().await, Err(AgentError::Runner(_))));
        assert_eq!(agent.visited(), &[Init, WaitForRunnable, RunTask, Exit]);
        assert!(h.sleeper.slept().is_empty());
    }

    #[tokio::test]
    async fn test_failed_task() {
        let m = machine("sledgehammer", "discover");
        let failed = TaskStep::Run(RunOutcome {
            failed: true,
            ..Default::default()
        });

        let h = Harness::new(m.clone());
        h.api.push_wait(WaitOutcome::Complete, runnable(&m));
        h.tasks.push(failed.clone());
        let mut agent = h.agent().exit_on_failure(true);
        agent.run().await.unwrap();
        assert_eq!(agent.visited(), &[Init, WaitForRunnable, RunTask, Exit]);

        let h = Harness::new(m.clone());
        h.api.push_wait(WaitOutcome::Complete, runnable(&m));
        h.tasks.push(failed);
        let mut agent = h.agent();
        agent.run().await.unwrap();
        assert_eq!(agent.visited(), &[Init, WaitForRunnable, RunTask, WaitForRunnable, Exit]);
    }

    #[tokio::test]
    async fn test_chroot_round_trip() {
        let m = machine("sledgehammer", "discover");
        let h = Harness::new(m.clone());
        h.api.push_wait(WaitOutcome::Complete, runnable(&m));
        h.api.push_wait(WaitOutcome::Complete, runnable(&m));
        h.tasks.push(TaskStep::Chroot);
        h.tasks.push(TaskStep::Done);

        let mut agent = h.agent();
        agent.run().await.unwrap();
        assert_eq!(
            agent.visited(),
            &[Init, WaitForRunnable, RunTask, WaitForRunnable, RunTask, Exit, Exit]
        );
        let chroots = h.tasks.chroots();
        assert_eq!(chroots[0], None);
        assert_eq!(chroots[1], Some(PathBuf::from(crate::testing::JOB_DIR)));
        assert_eq!(h.tasks.closed(), 0);
        assert_eq!(h.tasks.released(), 1);
    }

    #[tokio::test]
    async fn test_init_fails_running_job() {
        let mut m = machine("sledgehammer", "discover");
        let mut job = provision_models::Job::new(m.uuid, "partition", "discover");
        job.state = JobState::Running;
        m.current_job = Some(job.uuid);
        let h = Harness::new(m);
        h.api.add_job(job);

        let mut agent = h.agent();
        agent.run().await.unwrap();
        assert_eq!(h.api.job_states(), vec![JobState::Failed]);
    }
}
