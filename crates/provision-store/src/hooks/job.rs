use super::Hooks;
use crate::error::Result;
use crate::request::RequestTracker;
use chrono::Utc;
use provision_models::{Job, JobState, Machine, Model, ModelError, Stage, Task};
use tracing::{info, warn};

pub struct JobHooks;

impl Hooks<Job> for JobHooks {
    fn on_create(&self, rt: &mut RequestTracker<'_>, job: &mut Job) -> Result<()> {
        job.current = true;
        if job.previous.is_none() {
            job.previous = rt
                .find::<Machine>(&job.machine.to_string())?
                .and_then(|m| m.current_job);
        }
        Ok(())
    }

    fn on_change(&self, _rt: &mut RequestTracker<'_>, old: &Job, job: &mut Job) -> Result<()> {
        job.current = old.current;
        Ok(())
    }

    fn before_save(&self, rt: &mut RequestTracker<'_>, old: Option<&Job>, job: &mut Job) -> Result<()> {
        let old_state = old.map(|o| o.state).unwrap_or_default();
        let changed = old_state != job.state;
        let mut err = ModelError::validation(job);
        if !old_state.can_become(job.state) {
            err.push(format!("Cannot change state from {} to {}", old_state, job.state));
            return Err(err.into());
        }
        if changed && job.state.is_terminal() {
            job.end_time = Some(Utc::now());
        }
        if !job.current {
            return Ok(());
        }

        let machine = rt.find::<Machine>(&job.machine.to_string())?;
        if machine.is_none() {
            err.push(format!("Machine {} does not exist", job.machine));
        }
        if !rt.contains::<Task>(&job.task)? {
            err.push(format!("Task {} does not exist", job.task));
        }
        let stage = rt.find::<Stage>(&job.stage)?;
        if stage.is_none() {
            err.push(format!("Stage {} does not exist", job.stage));
        }
        if err.has_errors() {
            return Err(err.into());
        }

        if stage.is_some_and(|s| !s.validation.available) {
            warn!(job = %job.uuid, stage = %job.stage, "stage is not available, failing job");
            job.state = JobState::Failed;
            job.end_time.get_or_insert_with(Utc::now);
        } else if changed && job.state == JobState::Running {
            job.start_time = Some(Utc::now());
        }

        // Only touch the machine once nothing can reject the job any more.
        if old_state != JobState::Failed && job.state == JobState::Failed {
            if let Some(mut m) = machine.filter(|m| m.runnable) {
                info!(job = %job.uuid, machine = %m.uuid, "job failed, machine no longer runnable");
                m.runnable = false;
                rt.save(m)?;
            }
        }
        Ok(())
    }

    fn after_save(&self, rt: &mut RequestTracker<'_>, job: &Job) {
        if !job.current {
            return;
        }
        if let Some(prev) = job.previous {
            if let Ok(Some(mut p)) = rt.find::<Job>(&prev.to_string()) {
                if p.current {
                    p.current = false;
                    if let Err(e) = rt.save(p) {
                        warn!(job = %prev, error = %e, "cannot retire previous job");
                    }
                }
            }
        }
        if let Ok(Some(mut m)) = rt.find::<Machine>(&job.machine.to_string()) {
            if m.current_job != Some(job.uuid) {
                m.current_job = Some(job.uuid);
                if let Err(e) = rt.save(m) {
                    warn!(job = %job.uuid, error = %e, "cannot record current job on machine");
                }
            }
        }
    }

    fn before_delete(&self, rt: &mut RequestTracker<'_>, job: &Job) -> Result<()> {
        if matches!(job.state, JobState::Finished | JobState::Failed) {
            return Ok(());
        }
        if !rt.contains::<Machine>(&job.machine.to_string())? {
            return Ok(());
        }
        let superseded = rt
            .store(Job::PREFIX)?
            .iter::<Job>()
            .any(|j| j.previous == Some(job.uuid));
        if superseded {
            return Ok(());
        }
        Err(ModelError::validation(job)
            .with(format!("Jobs {} is not in a deletable state: {}", job.uuid, job.state))
            .into())
    }
}

#[cfg(test)]
mod tests {
    use crate::locks::Action;
    use crate::testing::tracker;
    use provision_models::{Job, JobState, Machine, Prefix, Stage, Task};

    fn setup(dt: &crate::DataTracker) -> Machine {
        let mut rt = dt.request_for(Prefix::Stages, Action::Create);
        rt.do_(|rt| {
            rt.create(Task::new("inventory")).unwrap();
            let mut stage = Stage::new("discover");
            stage.tasks.push("inventory".to_string());
            rt.create(stage).unwrap();
            let mut m = Machine::new("node1");
            m.stage = "discover".to_string();
            rt.create(m).unwrap()
        })
    }

    #[test]
    fn test_job_lifecycle() {
        let dt = tracker();
        let m = setup(&dt);
        let mut rt = dt.request_for(Prefix::Jobs, Action::Create);
        rt.do_(|rt| {
            let first = rt.create(Job::new(m.uuid, "inventory", "discover")).unwrap();
            assert!(first.current);
            let machine = rt.find::<Machine>(&m.uuid.to_string()).unwrap().unwrap();
            assert_eq!(machine.current_job, Some(first.uuid));

            let mut running = first.clone();
            running.state = JobState::Running;
            let running = rt.update(running).unwrap();
            assert!(running.start_time.is_some());

            let mut back = running.clone();
            back.state = JobState::Created;
            let err = rt.update(back).unwrap_err();
            assert_eq!(
                err.model().unwrap().messages,
                vec!["Cannot change state from running to created".to_string()]
            );

            let mut failed = running.clone();
            failed.state = JobState::Failed;
            let failed = rt.update(failed).unwrap();
            assert!(failed.end_time.is_some());
            let machine = rt.find::<Machine>(&m.uuid.to_string()).unwrap().unwrap();
            assert!(!machine.runnable);

            let second = rt.create(Job::new(m.uuid, "inventory", "discover")).unwrap();
            assert_eq!(second.previous, Some(first.uuid));
            assert!(!rt.find::<Job>(&first.uuid.to_string()).unwrap().unwrap().current);

            let err = rt.create(Job::new(m.uuid, "missing", "discover")).unwrap_err();
            assert_eq!(err.model().unwrap().messages, vec!["Task missing does not exist".to_string()]);
        });
    }

    #[test]
    fn test_rejected_failure_leaves_machine_alone() {
        let dt = tracker();
        let m = setup(&dt);
        let mut rt = dt.request_for(Prefix::Stages, Action::Create);
        rt.do_(|rt| rt.create(Task::new("extra")).unwrap());
        let mut rt = dt.request_for(Prefix::Jobs, Action::Create);
        let job = rt.do_(|rt| rt.create(Job::new(m.uuid, "extra", "discover")).unwrap());

        let mut rt = dt.request_for(Prefix::Tasks, Action::Delete);
        rt.do_(|rt| rt.remove::<Task>("extra").unwrap());

        let mut rt = dt.request_for(Prefix::Jobs, Action::Update);
        rt.do_(|rt| {
            let mut failed = job.clone();
            failed.state = JobState::Failed;
            let err = rt.update(failed).unwrap_err();
            assert_eq!(err.model().unwrap().messages, vec!["Task extra does not exist".to_string()]);
            let stored = rt.find::<Job>(&job.uuid.to_string()).unwrap().unwrap();
            assert_eq!(stored.state, JobState::Created);
            let machine = rt.find::<Machine>(&m.uuid.to_string()).unwrap().unwrap();
            assert!(machine.runnable);
        });
    }

    #[test]
    fn test_job_delete_rules() {
        let dt = tracker();
        let m = setup(&dt);
        let mut rt = dt.request_for(Prefix::Jobs, Action::Create);
        let job = rt.do_(|rt| rt.create(Job::new(m.uuid, "inventory", "discover")).unwrap());

        let mut rt = dt.request_for(Prefix::Jobs, Action::Delete);
        rt.do_(|rt| {
            let err = rt.remove::<Job>(&job.uuid.to_string()).unwrap_err();
            assert_eq!(err.code(), 422);
            assert_eq!(
                err.model().unwrap().messages,
                vec![format!("Jobs {} is not in a deletable state: created", job.uuid)]
            );
        });

        let mut rt = dt.request_for(Prefix::Machines, Action::Delete);
        rt.do_(|rt| rt.remove::<Machine>(&m.uuid.to_string()).unwrap());

        let mut rt = dt.request_for(Prefix::Jobs, Action::Delete);
        rt.do_(|rt| {
            let stored = rt.find::<Job>(&job.uuid.to_string()).unwrap().unwrap();
            assert!(!stored.current);
            rt.remove::<Job>(&job.uuid.to_string()).unwrap();
        });
    }
}
