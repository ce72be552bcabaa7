//! Template rendering into the boot file lookaside
//!
//! BootEnvs and Stages carry templates with a path template and a body
//! template. For each machine using one, the path is rendered once at
//! registration time and the body every time the path is fetched, so the
//! provisioner address can follow whichever local address the requester
//! reached us on.

use crate::conncache::AddrCache;
use crate::fs::{FileSystem, RenderFn};
use crate::request::RequestTracker;
use bytes::Bytes;
use minijinja::{Environment, Error as MiniJinjaError, ErrorKind as MiniJinjaErrorKind, UndefinedBehavior};
use provision_models::{BootEnv, Machine, Profile, Stage, TemplateInfo};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tracing::{debug, warn};

/// Something that owns renderable templates
pub trait TemplateSource {
    fn source_name(&self) -> &str;

    fn templates(&self) -> &[TemplateInfo];

    fn required_params(&self) -> &[String] {
        &[]
    }

    fn boot_env(&self) -> Option<&BootEnv> {
        None
    }
}

impl TemplateSource for BootEnv {
    fn source_name(&self) -> &str {
        &self.name
    }

    fn templates(&self) -> &[TemplateInfo] {
        &self.templates
    }

    fn required_params(&self) -> &[String] {
        &self.required_params
    }

    fn boot_env(&self) -> Option<&BootEnv> {
        Some(self)
    }
}

impl TemplateSource for Stage {
    fn source_name(&self) -> &str {
        &self.name
    }

    fn templates(&self) -> &[TemplateInfo] {
        &self.templates
    }
}

/// Check that every template and path compiles; returns error messages
pub fn check_templates(templates: &[TemplateInfo]) -> Vec<String> {
    let env = Environment::new();
    let mut errors = Vec::new();
    for (i, t) in templates.iter().enumerate() {
        if t.path.is_empty() {
            errors.push(format!("Template[{}] needs a Path", i));
        } else if let Err(e) = env.template_from_str(&t.path) {
            errors.push(format!("Template[{}] path does not compile: {}", i, e));
        }
        if let Err(e) = env.template_from_str(&t.contents) {
            errors.push(format!("Template[{}] ({}) does not compile: {}", i, t.name, e));
        }
    }
    errors
}

#[derive(Debug, Clone, Serialize)]
struct MachineView {
    uuid: String,
    name: String,
    short_name: String,
    description: String,
    address: String,
    hex_address: String,
    hardware_addrs: Vec<String>,
    boot_env: String,
    stage: String,
}

impl From<&Machine> for MachineView {
    fn from(m: &Machine) -> Self {
        Self {
            uuid: m.uuid.to_string(),
            name: m.name.clone(),
            short_name: m.short_name().to_string(),
            description: m.description.clone(),
            address: m.address.map(|a| a.to_string()).unwrap_or_default(),
            hex_address: m.hex_address(),
            hardware_addrs: m.hardware_addrs.clone(),
            boot_env: m.boot_env.clone(),
            stage: m.stage.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct EnvView {
    name: String,
    kernel: String,
    initrds: Vec<String>,
    boot_params: String,
}

#[derive(Serialize)]
struct Vars<'a> {
    machine: Option<&'a MachineView>,
    env: Option<&'a EnvView>,
    provisioner_address: String,
    api_url: String,
    file_url: String,
    params: &'a BTreeMap<String, Value>,
}

/// Everything a template can see about one machine
pub struct RenderContext {
    machine: Option<MachineView>,
    env: Option<EnvView>,
    params: BTreeMap<String, Value>,
    static_ip: Option<Ipv4Addr>,
    api_port: u16,
    static_port: u16,
    cache: Arc<AddrCache>,
}

impl RenderContext {
    /// Snapshot the machine, its bootenv and its merged params
    pub fn new(rt: &RequestTracker<'_>, machine: Option<&Machine>, env: Option<&BootEnv>) -> Self {
        let dt = rt.dt();
        let config = dt.config();
        Self {
            machine: machine.map(MachineView::from),
            env: env.map(|e| EnvView {
                name: e.name.clone(),
                kernel: e.kernel.clone(),
                initrds: e.initrds.clone(),
                boot_params: e.boot_params.clone(),
            }),
            params: machine.map(|m| merged_params(rt, m)).unwrap_or_default(),
            static_ip: config.static_ip,
            api_port: config.api_port,
            static_port: config.static_port,
            cache: dt.cache().clone(),
        }
    }

    /// Our address as seen from `remote`
    pub fn provisioner_address(&self, remote: Option<IpAddr>) -> String {
        remote
            .and_then(|r| self.cache.local_for(r))
            .map(|a| a.to_string())
            .or_else(|| self.static_ip.map(|a| a.to_string()))
            .unwrap_or_else(|| Ipv4Addr::UNSPECIFIED.to_string())
    }

    fn environment(&self) -> Environment<'static> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);
        let params = self.params.clone();
        env.add_function(
            "param",
            move |name: String| -> Result<minijinja::Value, MiniJinjaError> {
                params
                    .get(&name)
                    .map(minijinja::Value::from_serialize)
                    .ok_or_else(|| {
                        MiniJinjaError::new(
                            MiniJinjaErrorKind::UndefinedError,
                            format!("No such machine parameter {}", name),
                        )
                    })
            },
        );
        env
    }

    pub fn render(&self, source: &str, remote: Option<IpAddr>) -> Result<String, MiniJinjaError> {
        let env = self.environment();
        let addr = self.provisioner_address(remote);
        let rendered_env;
        let mut vars = Vars {
            machine: self.machine.as_ref(),
            env: self.env.as_ref(),
            api_url: format!("https://{}:{}", addr, self.api_port),
            file_url: format!("http://{}:{}", addr, self.static_port),
            provisioner_address: addr,
            params: &self.params,
        };
        if let Some(e) = &self.env {
            let boot_params = env.render_str(&e.boot_params, &vars)?;
            rendered_env = EnvView {
                boot_params,
                ..e.clone()
            };
            vars.env = Some(&rendered_env);
        }
        env.render_str(source, &vars)
    }
}

/// Machine params overlaid on the params of its profiles, in order
fn merged_params(rt: &RequestTracker<'_>, m: &Machine) -> BTreeMap<String, Value> {
    let mut params = BTreeMap::new();
    for name in m.profiles.iter().rev() {
        if let Ok(Some(p)) = rt.find::<Profile>(name) {
            params.extend(p.params);
        }
    }
    params.extend(m.params.clone());
    params
}

/// One rendered path bound to its body template
pub struct Renderer {
    pub path: String,
    pub name: String,
    contents: String,
    ctx: Arc<RenderContext>,
}

impl Renderer {
    pub fn render(&self, remote: Option<IpAddr>) -> Result<String, MiniJinjaError> {
        self.ctx.render(&self.contents, remote)
    }

    fn into_render_fn(self) -> RenderFn {
        Arc::new(move |remote: Option<IpAddr>| -> Result<Bytes, String> {
            self.render(remote).map(Bytes::from).map_err(|e| e.to_string())
        })
    }
}

/// Build the renderers `source` provides for `machine`, recording
/// problems in `errors`
pub fn make_renderers<S: TemplateSource>(
    rt: &RequestTracker<'_>,
    source: &S,
    machine: Option<&Machine>,
    errors: &mut Vec<String>,
) -> Vec<Renderer> {
    if machine.is_none() && !source.required_params().is_empty() {
        errors.push("Machine is nil or does not have params".to_string());
        return Vec::new();
    }
    let env = match source.boot_env() {
        Some(env) => Some(env.clone()),
        None => machine
            .and_then(|m| rt.find::<BootEnv>(&m.boot_env).ok().flatten()),
    };
    let ctx = Arc::new(RenderContext::new(rt, machine, env.as_ref()));
    for p in source.required_params() {
        if !ctx.params.contains_key(p) {
            errors.push(format!("Missing required parameter {} for {}", p, source.source_name()));
        }
    }
    let mut out = Vec::new();
    for t in source.templates() {
        match ctx.render(&t.path, None) {
            Ok(path) if !path.trim().is_empty() => out.push(Renderer {
                path,
                name: t.name.clone(),
                contents: t.contents.clone(),
                ctx: ctx.clone(),
            }),
            Ok(_) => errors.push(format!("Template {} renders an empty path", t.name)),
            Err(e) => errors.push(format!("Unable to render path for template {}: {}", t.name, e)),
        }
    }
    out
}

fn install(fs: &FileSystem, renderers: Vec<Renderer>) {
    for r in renderers {
        let path = r.path.clone();
        if let Err(e) = fs.add_dynamic(&path, r.into_render_fn()) {
            warn!(%path, error = %e, "cannot register rendered template");
        }
    }
}

/// Register the paths `source` renders for `machine`; returns problems
pub fn register<S: TemplateSource>(
    rt: &RequestTracker<'_>,
    source: &S,
    machine: Option<&Machine>,
) -> Vec<String> {
    let mut errors = Vec::new();
    let renderers = make_renderers(rt, source, machine, &mut errors);
    debug!(source = source.source_name(), count = renderers.len(), "registering renderers");
    install(rt.dt().fs(), renderers);
    errors
}

/// Remove the paths `source` renders for `machine`
pub fn deregister<S: TemplateSource>(rt: &RequestTracker<'_>, source: &S, machine: Option<&Machine>) {
    let mut errors = Vec::new();
    for r in make_renderers(rt, source, machine, &mut errors) {
        rt.dt().fs().del_dynamic(&r.path);
    }
}
