use super::Hooks;
use crate::error::Result;
use crate::index::check_unique;
use crate::render::check_templates;
use crate::request::RequestTracker;
use provision_models::{Machine, Model, ModelError, Stage, Task};

pub struct TaskHooks;

impl Hooks<Task> for TaskHooks {
    fn before_save(&self, rt: &mut RequestTracker<'_>, _old: Option<&Task>, task: &mut Task) -> Result<()> {
        let mut err = ModelError::validation(task);
        if let Err(e) = check_unique(task, &rt.items::<Task>()?) {
            err.merge(e);
        }
        for msg in check_templates(&task.templates) {
            err.push(msg);
        }
        task.validation.finish(err.messages.clone());
        Ok(err.or_ok()?)
    }

    fn before_delete(&self, rt: &mut RequestTracker<'_>, task: &Task) -> Result<()> {
        let mut err = ModelError::still_in_use(task);
        for stage in rt.store(Stage::PREFIX)?.iter::<Stage>() {
            if stage.tasks.contains(&task.name) {
                err.push(format!("{}:{} still uses {}", Stage::PREFIX, stage.name, task.name));
            }
        }
        for m in rt.store(Machine::PREFIX)?.iter::<Machine>() {
            if m.tasks.contains(&task.name) {
                err.push(format!("{}:{} still uses {}", Machine::PREFIX, m.key(), task.name));
            }
        }
        Ok(err.or_ok()?)
    }
}

#[cfg(test)]
mod tests {
    use crate::locks::Action;
    use crate::testing::tracker;
    use provision_models::{Prefix, Stage, Task, TemplateInfo};

    #[test]
    fn test_task_in_use() {
        let dt = tracker();
        let mut rt = dt.request_for(Prefix::Tasks, Action::Create);
        rt.do_(|rt| {
            let mut bad = Task::new("broken");
            bad.templates.push(TemplateInfo::new("t", "x", "{% if %}"));
            assert_eq!(rt.create(bad).unwrap_err().code(), 422);

            rt.create(Task::new("install")).unwrap();
        });

        let mut rt = dt.request_for(Prefix::Stages, Action::Create);
        rt.do_(|rt| {
            let mut stage = Stage::new("disk");
            stage.tasks.push("install".to_string());
            rt.create(stage).unwrap();
        });

        let mut rt = dt.request_for(Prefix::Tasks, Action::Delete);
        rt.do_(|rt| {
            let err = rt.remove::<Task>("install").unwrap_err();
            assert_eq!(err.code(), 409);
            assert_eq!(err.model().unwrap().messages, vec!["stages:disk still uses install".to_string()]);
        });
    }
}
