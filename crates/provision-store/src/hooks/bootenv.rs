use super::stage::{register_stage, validate_stage};
use super::Hooks;
use crate::error::Result;
use crate::fs::clean_path;
use crate::index::check_unique;
use crate::render::{self, check_templates};
use crate::request::RequestTracker;
use crate::tracker::{PREF_DEFAULT_BOOTENV, PREF_UNKNOWN_BOOTENV};
use provision_models::{BootEnv, Machine, Model, ModelError, Stage};
use std::path::Path;
use tracing::{debug, warn};

pub struct BootEnvHooks;

/// Problems that keep `env` from being usable, as opposed to invalid
fn availability(env: &BootEnv, file_root: &Path) -> Vec<String> {
    let mut errors = Vec::new();
    let has = |name: &str| env.template(name).is_some();
    if !has("ipxe") && !(has("pxelinux") && has("elilo")) {
        errors.push("bootenv: Missing elilo or pxelinux template".to_string());
    }
    let mut check = |what: &str, file: &str| {
        let found = clean_path(file)
            .map(|p| file_root.join(p))
            .ok()
            .filter(|p| p.is_file());
        if found.is_none() {
            errors.push(format!(
                "bootenv: {}: missing {} {} ({})",
                env.name,
                what,
                file,
                file_root.join(file.trim_start_matches('/')).display()
            ));
        }
    };
    if !env.kernel.is_empty() {
        check("kernel", &env.kernel);
    }
    for initrd in &env.initrds {
        check("initrd", initrd);
    }
    errors
}

impl BootEnvHooks {
    fn machines_in(rt: &RequestTracker<'_>, name: &str) -> Result<Vec<Machine>> {
        Ok(rt
            .store(Machine::PREFIX)?
            .iter::<Machine>()
            .filter(|m| m.boot_env == name)
            .cloned()
            .collect())
    }

    fn is_unknown_env(rt: &RequestTracker<'_>, env: &BootEnv) -> bool {
        env.only_unknown && rt.dt().pref(PREF_UNKNOWN_BOOTENV) == env.name
    }
}

impl Hooks<BootEnv> for BootEnvHooks {
    fn before_save(&self, rt: &mut RequestTracker<'_>, _old: Option<&BootEnv>, env: &mut BootEnv) -> Result<()> {
        let mut err = ModelError::validation(env);
        if let Err(e) = check_unique(env, &rt.items::<BootEnv>()?) {
            err.merge(e);
        }
        for msg in check_templates(&env.templates) {
            err.push(msg);
        }
        if err.has_errors() {
            env.validation.errors = err.messages.clone();
            return Err(err.into());
        }

        let mut errors = availability(env, &rt.dt().config().file_root);
        if env.only_unknown {
            render::make_renderers(rt, env, None, &mut errors);
        } else {
            for m in Self::machines_in(rt, &env.name)? {
                render::make_renderers(rt, env, Some(&m), &mut errors);
            }
        }
        env.validation.finish(errors);
        Ok(())
    }

    fn after_save(&self, rt: &mut RequestTracker<'_>, env: &BootEnv) {
        if env.validation.available {
            if env.only_unknown {
                if Self::is_unknown_env(rt, env) {
                    render::register(rt, env, None);
                }
            } else if let Ok(machines) = Self::machines_in(rt, &env.name) {
                for m in &machines {
                    render::register(rt, env, Some(m));
                }
            }
        }

        let Ok(stages) = rt.items::<Stage>() else {
            return;
        };
        for mut stage in stages.into_iter().filter(|s| s.boot_env == env.name) {
            debug!(stage = %stage.name, bootenv = %env.name, "revalidating stage");
            let errors = validate_stage(rt, &stage);
            stage.validation.finish(errors);
            register_stage(rt, &stage);
            if let Err(e) = rt.refresh(stage) {
                warn!(bootenv = %env.name, error = %e, "cannot refresh dependent stage");
            }
        }
    }

    fn before_delete(&self, rt: &mut RequestTracker<'_>, env: &BootEnv) -> Result<()> {
        let mut err = ModelError::still_in_use(env);
        let pref = if env.only_unknown {
            PREF_UNKNOWN_BOOTENV
        } else {
            PREF_DEFAULT_BOOTENV
        };
        if rt.dt().pref(pref) == env.name {
            err.push(format!("BootEnv {} is the active {}, cannot remove it", env.name, pref));
        }
        if !env.only_unknown {
            for m in Self::machines_in(rt, &env.name)? {
                err.push(format!("Bootenv {} in use by Machine {}", env.name, m.name));
            }
            for s in rt.store(Stage::PREFIX)?.iter::<Stage>() {
                if s.boot_env == env.name {
                    err.push(format!("Bootenv {} in use by Stage {}", env.name, s.name));
                }
            }
        }
        Ok(err.or_ok()?)
    }

    fn after_delete(&self, rt: &mut RequestTracker<'_>, env: &BootEnv) {
        if env.only_unknown {
            render::deregister(rt, env, None);
        }
    }
}
