//! Scripted stand-ins for the server, task runner and power control

use crate::api::{AgentApi, JobPlan, Predicate, WaitOutcome};
use crate::error::{AgentError, Result};
use crate::power::{PowerAction, PowerControl};
use crate::runner::Sleeper;
use crate::task::{RunOutcome, Runner, TaskRunner};
use async_trait::async_trait;
use provision_models::{Job, JobState, Machine, ModelError, Stage};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

pub const JOB_DIR: &str = "/tmp/provision-agent-job";

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// A server whose answers are queued up front
///
/// Waits are answered from a queue; once it runs dry every wait is
/// interrupted, which ends the agent.
pub struct ScriptedApi {
    machine: Mutex<Machine>,
    waits: Mutex<VecDeque<(WaitOutcome, Machine)>>,
    predicates: Mutex<Vec<Predicate>>,
    patches: Mutex<Vec<Machine>>,
    stages: Mutex<HashMap<String, Stage>>,
    map: Mutex<BTreeMap<String, String>>,
    jobs: Mutex<HashMap<String, Job>>,
    job_states: Mutex<Vec<JobState>>,
    plans: Mutex<VecDeque<JobPlan>>,
    fail_patches: Mutex<bool>,
}

impl ScriptedApi {
    pub fn new(machine: Machine) -> Self {
        Self {
            machine: Mutex::new(machine),
            waits: Mutex::default(),
            predicates: Mutex::default(),
            patches: Mutex::default(),
            stages: Mutex::default(),
            map: Mutex::default(),
            jobs: Mutex::default(),
            job_states: Mutex::default(),
            plans: Mutex::default(),
            fail_patches: Mutex::new(false),
        }
    }

    pub fn machine(&self) -> Machine {
        lock(&self.machine).clone()
    }

    pub fn push_wait(&self, outcome: WaitOutcome, machine: Machine) {
        lock(&self.waits).push_back((outcome, machine));
    }

    pub fn set_map(&self, entries: &[(&str, &str)]) {
        *lock(&self.map) = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
    }

    pub fn add_stage(&self, stage: Stage) {
        lock(&self.stages).insert(stage.name.clone(), stage);
    }

    pub fn add_job(&self, job: Job) {
        lock(&self.jobs).insert(job.uuid.to_string(), job);
    }

    pub fn push_plan(&self, plan: JobPlan) {
        lock(&self.plans).push_back(plan);
    }

    pub fn fail_patches(&self) {
        *lock(&self.fail_patches) = true;
    }

    pub fn predicates(&self) -> Vec<Predicate> {
        lock(&self.predicates).clone()
    }

    pub fn patches(&self) -> Vec<Machine> {
        lock(&self.patches).clone()
    }

    pub fn job_states(&self) -> Vec<JobState> {
        lock(&self.job_states).clone()
    }
}

#[async_trait]
impl AgentApi for ScriptedApi {
    async fn get_machine(&self, _uuid: &str) -> Result<Machine> {
        Ok(self.machine())
    }

    async fn patch_machine(&self, _old: &Machine, new: &Machine) -> Result<Machine> {
        if *lock(&self.fail_patches) {
            return Err(AgentError::Api {
                status: 500,
                error: ModelError::new(500, "PATCH", "machines", new.uuid.to_string()),
            });
        }
        lock(&self.patches).push(new.clone());
        *lock(&self.machine) = new.clone();
        Ok(new.clone())
    }

    async fn get_job(&self, uuid: &str) -> Result<Option<Job>> {
        Ok(lock(&self.jobs).get(uuid).cloned())
    }

    async fn patch_job(&self, _old: &Job, new: &Job) -> Result<Job> {
        lock(&self.job_states).push(new.state);
        lock(&self.jobs).insert(new.uuid.to_string(), new.clone());
        Ok(new.clone())
    }

    async fn get_stage(&self, name: &str) -> Result<Stage> {
        lock(&self.stages)
            .get(name)
            .cloned()
            .ok_or_else(|| ModelError::not_found("GET", "stages", name).into())
    }

    async fn change_stage_map(&self, _machine: &Machine) -> Result<BTreeMap<String, String>> {
        Ok(lock(&self.map).clone())
    }

    async fn next_boot_pxe(&self, _machine: &Machine) -> Result<()> {
        Ok(())
    }

    async fn wait_for(
        &self,
        machine: &Machine,
        pred: &Predicate,
        _timeout: Duration,
    ) -> Result<(WaitOutcome, Machine)> {
        lock(&self.predicates).push(pred.clone());
        Ok(lock(&self.waits)
            .pop_front()
            .unwrap_or_else(|| (WaitOutcome::Interrupt, machine.clone())))
    }

    async fn next_job(&self, _machine: &Machine) -> Result<Option<JobPlan>> {
        Ok(lock(&self.plans).pop_front())
    }
}

/// What the next call to [`ScriptedTasks::next`] produces
#[derive(Debug, Clone)]
pub enum TaskStep {
    /// No task left
    Done,
    /// A task that runs with this outcome
    Run(RunOutcome),
    /// A task asking for a chroot
    Chroot,
    /// A task whose run fails outright
    Error,
}

#[derive(Default)]
pub struct ScriptedTasks {
    steps: Mutex<VecDeque<TaskStep>>,
    current: Mutex<Option<TaskStep>>,
    chroots: Mutex<Vec<Option<PathBuf>>>,
    closed: Mutex<usize>,
    released: Mutex<usize>,
}

impl ScriptedTasks {
    pub fn push(&self, step: TaskStep) {
        lock(&self.steps).push_back(step);
    }

    /// The chroot passed to each `next` call
    pub fn chroots(&self) -> Vec<Option<PathBuf>> {
        lock(&self.chroots).clone()
    }

    pub fn closed(&self) -> usize {
        *lock(&self.closed)
    }

    pub fn released(&self) -> usize {
        *lock(&self.released)
    }
}

#[async_trait]
impl TaskRunner for ScriptedTasks {
    async fn next(&self, machine: &Machine, chroot: Option<&Path>) -> Result<Option<Runner>> {
        lock(&self.chroots).push(chroot.map(Path::to_path_buf));
        let step = lock(&self.steps).pop_front().unwrap_or(TaskStep::Done);
        if matches!(step, TaskStep::Done) {
            return Ok(None);
        }
        let job = Job::new(machine.uuid, "scripted", &machine.stage);
        let mut plan = JobPlan::new(job, Vec::new());
        plan.want_chroot = matches!(step, TaskStep::Chroot);
        *lock(&self.current) = Some(step);
        Ok(Some(Runner {
            plan,
            job_dir: PathBuf::from(JOB_DIR),
            chroot: chroot.map(Path::to_path_buf),
        }))
    }

    async fn run(&self, _runner: &Runner) -> Result<RunOutcome> {
        match lock(&self.current).take() {
            Some(TaskStep::Run(outcome)) => Ok(outcome),
            Some(TaskStep::Error) => Err(AgentError::Runner("scripted failure".to_string())),
            _ => Ok(RunOutcome::default()),
        }
    }

    async fn close(&self, _runner: Runner) {
        *lock(&self.closed) += 1;
    }

    async fn release(&self, _runner: Runner) {
        *lock(&self.released) += 1;
    }
}

#[derive(Default)]
pub struct MockPower {
    actions: Mutex<Vec<PowerAction>>,
}

impl MockPower {
    pub fn actions(&self) -> Vec<PowerAction> {
        lock(&self.actions).clone()
    }
}

#[async_trait]
impl PowerControl for MockPower {
    async fn power(&self, _machine: &Machine, action: PowerAction) -> Result<()> {
        lock(&self.actions).push(action);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn slept(&self) -> Vec<Duration> {
        lock(&self.slept).clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        lock(&self.slept).push(duration);
    }
}
