use super::{validate_ip4, Hooks};
use crate::error::Result;
use crate::index::check_unique;
use crate::render;
use crate::request::RequestTracker;
use crate::tracker::{PREF_DEFAULT_BOOTENV, PREF_DEFAULT_STAGE};
use provision_models::{BootEnv, Job, Machine, ModelError, Profile, Stage, Task};
use std::collections::HashMap;
use tracing::{debug, warn};

pub struct MachineHooks;

/// Stage and bootenv a machine is created from
const CREATE_STAGE: &str = "none";
const CREATE_BOOTENV: &str = "local";

impl MachineHooks {
    /// Validate `m` against the objects it names, adopting the tasks
    /// and bootenv of a newly entered stage
    ///
    /// Errors in `fatal` make the machine unsaveable; `soft` errors only
    /// make it unavailable.
    fn validate(
        rt: &RequestTracker<'_>,
        old_stage: &str,
        old_env: &str,
        m: &mut Machine,
        fatal: &mut ModelError,
        soft: &mut Vec<String>,
    ) -> Result<()> {
        if let Some(addr) = m.address.filter(|a| !a.is_unspecified()) {
            validate_ip4(fatal, addr);
        }
        if let Err(e) = check_unique(m, &rt.items::<Machine>()?) {
            fatal.merge(e);
        }

        let mut seen: HashMap<&str, usize> = HashMap::new();
        for (i, name) in m.profiles.iter().enumerate() {
            if !rt.contains::<Profile>(name)? {
                soft.push(format!("Profile {} (at {}) does not exist", name, i));
            } else if let Some(at) = seen.get(name.as_str()) {
                fatal.push(format!("Duplicate profile {}: at {} and {}", name, at, i));
            } else {
                seen.insert(name.as_str(), i);
            }
        }

        match rt.find::<Stage>(&m.stage)? {
            None => {
                m.current_task = 0;
                m.tasks.clear();
                fatal.push(format!("Stage {} does not exist", m.stage));
            }
            Some(stage) if !stage.validation.available => {
                m.current_task = 0;
                m.tasks.clear();
                soft.push(format!(
                    "Machine {} wants Stage {}, which is not available",
                    m.uuid, m.stage
                ));
            }
            Some(stage) if stage.name != old_stage => {
                if !stage.boot_env.is_empty() {
                    m.boot_env = stage.boot_env.clone();
                    if m.boot_env != old_env {
                        m.runnable = false;
                    }
                }
                m.tasks = stage.tasks.clone();
                m.current_task = if m.tasks.is_empty() { 0 } else { -1 };
            }
            Some(_) => {}
        }

        match rt.find::<BootEnv>(&m.boot_env)? {
            None => soft.push(format!("Bootenv {} does not exist", m.boot_env)),
            Some(env) if env.only_unknown => soft.push(format!(
                "BootEnv {} does not allow Machine assignments, it has the OnlyUnknown flag.",
                env.name
            )),
            Some(env) if !env.validation.available => {
                soft.push(format!("BootEnv {} is not available", env.name))
            }
            Some(_) => {}
        }

        for (i, name) in m.tasks.iter().enumerate() {
            if !rt.contains::<Task>(name)? {
                soft.push(format!("Task {} (at {}) does not exist", name, i));
            }
        }
        Ok(())
    }

    fn deregister(rt: &RequestTracker<'_>, m: &Machine) {
        if let Ok(Some(env)) = rt.find::<BootEnv>(&m.boot_env) {
            render::deregister(rt, &env, Some(m));
        }
        if let Ok(Some(stage)) = rt.find::<Stage>(&m.stage) {
            render::deregister(rt, &stage, Some(m));
        }
    }
}

impl Hooks<Machine> for MachineHooks {
    fn on_create(&self, rt: &mut RequestTracker<'_>, m: &mut Machine) -> Result<()> {
        if m.stage.is_empty() {
            m.stage = rt.dt().pref(PREF_DEFAULT_STAGE);
        }
        if m.boot_env.is_empty() {
            m.boot_env = rt.dt().pref(PREF_DEFAULT_BOOTENV);
        }
        m.runnable = true;
        if !m.tasks.is_empty() {
            m.current_task = -1;
        }
        Ok(())
    }

    fn on_change(&self, rt: &mut RequestTracker<'_>, old: &Machine, m: &mut Machine) -> Result<()> {
        if m.stage.is_empty() {
            m.stage = CREATE_STAGE.to_string();
        }
        let forced = rt.forced();
        let mut err = ModelError::validation(m);
        let stage_changed = old.stage != m.stage;

        if stage_changed && old.current_task != old.tasks.len() as i32 && !forced {
            err.push("Can not change stages with pending tasks unless forced");
        }
        if !stage_changed && m.current_task != -1 && m.current_task != old.current_task {
            err.push(format!(
                "Cannot change CurrentTask from {} to {}",
                old.current_task, m.current_task
            ));
        }
        if m.current_task != -1 && old.tasks != m.tasks {
            let mut bound = m.current_task.max(0) as usize;
            if bound != old.tasks.len() {
                bound += 1;
            }
            let bound = bound.min(old.tasks.len());
            if m.tasks.len() < old.tasks.len() && m.tasks.len() < bound {
                err.push("Cannot remove tasks that have already executed or are already executing");
            } else if m.tasks.get(..bound) != old.tasks.get(..bound) {
                err.push("Cannot change tasks that have already executed or are executing");
            }
        }
        if m.stage != CREATE_STAGE && !stage_changed && old.boot_env != m.boot_env && !forced {
            err.push(format!(
                "Can not change bootenv while in a stage unless forced. old: {} new {}",
                old.boot_env, m.boot_env
            ));
        }
        if m.runnable && old.tasks.is_empty() && !m.tasks.is_empty() {
            m.current_task = -1;
        }
        Ok(err.or_ok()?)
    }

    fn before_save(&self, rt: &mut RequestTracker<'_>, old: Option<&Machine>, m: &mut Machine) -> Result<()> {
        if m.secret.is_empty() {
            m.secret = Machine::new_secret();
        }
        let (old_stage, old_env) = match old {
            Some(o) => (o.stage.clone(), o.boot_env.clone()),
            None => (CREATE_STAGE.to_string(), CREATE_BOOTENV.to_string()),
        };

        let mut fatal = ModelError::validation(m);
        let mut soft = Vec::new();
        Self::validate(rt, &old_stage, &old_env, m, &mut fatal, &mut soft)?;
        if fatal.has_errors() {
            fatal.messages.extend(soft);
            m.validation.errors = fatal.messages.clone();
            return Err(fatal.into());
        }
        m.validation.finish(soft);
        if !m.validation.available {
            m.runnable = false;
        }
        if let Some(old) = old {
            Self::deregister(rt, old);
        }
        Ok(())
    }

    fn after_save(&self, rt: &mut RequestTracker<'_>, m: &Machine) {
        let mut errors = Vec::new();
        if let Ok(Some(env)) = rt.find::<BootEnv>(&m.boot_env) {
            if env.validation.available && !env.only_unknown {
                errors.extend(render::register(rt, &env, Some(m)));
            }
        }
        if let Ok(Some(stage)) = rt.find::<Stage>(&m.stage) {
            if stage.validation.available {
                errors.extend(render::register(rt, &stage, Some(m)));
            }
        }
        if !errors.is_empty() {
            warn!(machine = %m.uuid, errors = ?errors, "some templates did not render");
        }
    }

    fn after_delete(&self, rt: &mut RequestTracker<'_>, m: &Machine) {
        Self::deregister(rt, m);
        let Some(id) = m.current_job else {
            return;
        };
        match rt.find::<Job>(&id.to_string()) {
            Ok(Some(mut job)) => {
                debug!(job = %id, machine = %m.uuid, "retiring current job of deleted machine");
                job.current = false;
                if let Err(e) = rt.save(job) {
                    warn!(job = %id, error = %e, "cannot retire job");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(job = %id, error = %e, "cannot look up current job"),
        }
    }
}
