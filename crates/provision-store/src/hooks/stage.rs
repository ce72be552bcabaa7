use super::Hooks;
use crate::error::Result;
use crate::index::check_unique;
use crate::render::{self, check_templates};
use crate::request::RequestTracker;
use crate::tracker::PREF_DEFAULT_STAGE;
use provision_models::{BootEnv, Machine, Model, ModelError, Profile, Stage, Task};

pub struct StageHooks;

fn machines_in(rt: &RequestTracker<'_>, stage: &str) -> Vec<Machine> {
    rt.store(Machine::PREFIX)
        .map(|s| {
            s.iter::<Machine>()
                .filter(|m| m.stage == stage)
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

/// Reasons `stage` cannot be used; assumes its templates compile
pub(super) fn validate_stage(rt: &RequestTracker<'_>, stage: &Stage) -> Vec<String> {
    let mut errors = Vec::new();
    for name in &stage.tasks {
        if !rt.contains::<Task>(name).unwrap_or(false) {
            errors.push(format!("Task {} does not exist", name));
        }
    }
    for name in &stage.profiles {
        if !rt.contains::<Profile>(name).unwrap_or(false) {
            errors.push(format!("Profile {} does not exist", name));
        }
    }
    if !stage.boot_env.is_empty() {
        match rt.find::<BootEnv>(&stage.boot_env).ok().flatten() {
            None => errors.push(format!("BootEnv {} does not exist", stage.boot_env)),
            Some(env) if !env.validation.available => errors.push(format!(
                "Stage {} wants BootEnv {}, which is not available",
                stage.name, stage.boot_env
            )),
            Some(env) => {
                for et in &env.templates {
                    for st in stage.templates.iter().filter(|st| st.path == et.path) {
                        errors.push(format!(
                            "Stage {} Template {} overlaps with BootEnv {} Template {}",
                            stage.name, st.name, env.name, et.name
                        ));
                    }
                }
            }
        }
    }
    for m in machines_in(rt, &stage.name) {
        render::make_renderers(rt, stage, Some(&m), &mut errors);
    }
    errors
}

/// Register the stage templates of every machine in `stage`
pub(super) fn register_stage(rt: &RequestTracker<'_>, stage: &Stage) {
    if !stage.validation.available || stage.templates.is_empty() {
        return;
    }
    for m in machines_in(rt, &stage.name) {
        render::register(rt, stage, Some(&m));
    }
}

impl Hooks<Stage> for StageHooks {
    fn before_save(&self, rt: &mut RequestTracker<'_>, _old: Option<&Stage>, stage: &mut Stage) -> Result<()> {
        let mut err = ModelError::validation(stage);
        for msg in check_templates(&stage.templates) {
            err.push(msg);
        }
        if let Err(e) = check_unique(stage, &rt.items::<Stage>()?) {
            err.merge(e);
        }
        if err.has_errors() {
            stage.validation.errors = err.messages.clone();
            return Err(err.into());
        }
        let errors = validate_stage(rt, stage);
        stage.validation.finish(errors);
        Ok(())
    }

    fn after_save(&self, rt: &mut RequestTracker<'_>, stage: &Stage) {
        register_stage(rt, stage);
    }

    fn before_delete(&self, rt: &mut RequestTracker<'_>, stage: &Stage) -> Result<()> {
        let mut err = ModelError::still_in_use(stage);
        if rt.dt().pref(PREF_DEFAULT_STAGE) == stage.name {
            err.push(format!(
                "Stage {} is the active {}, cannot remove it",
                stage.name, PREF_DEFAULT_STAGE
            ));
        }
        for m in machines_in(rt, &stage.name) {
            err.push(format!("Stage {} in use by Machine {}", stage.name, m.name));
        }
        Ok(err.or_ok()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::Action;
    use crate::testing::tracker;
    use provision_models::{Prefix, TemplateInfo};

    #[test]
    fn test_stage_references() {
        let dt = tracker();
        let mut rt = dt.request_for(Prefix::Stages, Action::Create);
        rt.do_(|rt| {
            let mut stage = Stage::new("discover");
            stage.tasks.push("inventory".to_string());
            stage.profiles.push("rack1".to_string());
            stage.boot_env = "nope".to_string();
            let stage = rt.create(stage).unwrap();
            assert!(stage.validation.validated);
            assert!(!stage.validation.available);
            assert_eq!(
                stage.validation.errors,
                vec![
                    "Task inventory does not exist".to_string(),
                    "Profile rack1 does not exist".to_string(),
                    "BootEnv nope does not exist".to_string(),
                ]
            );

            let mut overlap = Stage::new("overlap");
            overlap.boot_env = "local".to_string();
            overlap
                .templates
                .push(TemplateInfo::new("mine", "{{ machine.address }}.ipxe", "#!ipxe"));
            let overlap = rt.create(overlap).unwrap();
            assert_eq!(
                overlap.validation.errors,
                vec!["Stage overlap Template mine overlaps with BootEnv local Template ipxe".to_string()]
            );
        });
    }

    #[test]
    fn test_stage_delete_rules() {
        let dt = tracker();
        let mut rt = dt.request_for(Prefix::Stages, Action::Delete);
        rt.do_(|rt| {
            let err = rt.remove::<Stage>("none").unwrap_err();
            assert_eq!(err.code(), 409);

            rt.create(Stage::new("burnin")).unwrap();
            let mut m = Machine::new("node2");
            m.stage = "burnin".to_string();
            rt.create(m).unwrap();
            let err = rt.remove::<Stage>("burnin").unwrap_err();
            assert_eq!(
                err.model().unwrap().messages,
                vec!["Stage burnin in use by Machine node2".to_string()]
            );
        });
    }
}
