//! Per-type lifecycle hooks run by the request pipeline
//!
//! Hooks validate and cross-link objects. They receive the request
//! tracker explicitly, so they can look at (and write to) any store the
//! request has locked, and they never keep a reference to it afterwards.
//!
//! The pipeline calls them in a fixed order:
//!
//! ```text
//!  create: on_create → before_save(None) → persist → after_save
//!  update: on_change → before_save(Some(old)) → persist → after_save
//!  save:   before_save(old) → persist → after_save
//!  remove: before_delete → remove → after_delete
//! ```

mod bootenv;
mod job;
mod lease;
mod machine;
mod profile;
mod reservation;
mod stage;
mod subnet;
mod task;

pub use bootenv::BootEnvHooks;
pub use job::JobHooks;
pub use lease::LeaseHooks;
pub use machine::MachineHooks;
pub use profile::ProfileHooks;
pub use reservation::ReservationHooks;
pub use stage::StageHooks;
pub use subnet::SubnetHooks;
pub use task::TaskHooks;

use crate::error::Result;
use crate::request::RequestTracker;
use provision_models::{
    BootEnv, Job, Lease, Machine, Model, ModelError, Profile, Reservation, Stage, Subnet, Task,
};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Lifecycle callbacks for one model type; every method defaults to a
/// no-op
pub trait Hooks<T: Model>: Send + Sync {
    /// Fill defaults and validate a new object
    fn on_create(&self, _rt: &mut RequestTracker<'_>, _obj: &mut T) -> Result<()> {
        Ok(())
    }

    /// Validate a replacement against the object it replaces
    fn on_change(&self, _rt: &mut RequestTracker<'_>, _old: &T, _obj: &mut T) -> Result<()> {
        Ok(())
    }

    /// Final validation before the object is persisted
    fn before_save(&self, _rt: &mut RequestTracker<'_>, _old: Option<&T>, _obj: &mut T) -> Result<()> {
        Ok(())
    }

    fn after_save(&self, _rt: &mut RequestTracker<'_>, _obj: &T) {}

    /// Refuse a delete, typically because something still references
    /// the object
    fn before_delete(&self, _rt: &mut RequestTracker<'_>, _obj: &T) -> Result<()> {
        Ok(())
    }

    fn after_delete(&self, _rt: &mut RequestTracker<'_>, _obj: &T) {}
}

/// Hooks for types nothing was registered for
pub struct NoHooks;

impl<T: Model> Hooks<T> for NoHooks {}

/// Hooks keyed by model type
#[derive(Default)]
pub struct HookRegistry {
    hooks: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The hooks every model type ships with
    pub fn standard() -> Self {
        let mut reg = Self::new();
        reg.register::<BootEnv>(Arc::new(BootEnvHooks));
        reg.register::<Job>(Arc::new(JobHooks));
        reg.register::<Lease>(Arc::new(LeaseHooks));
        reg.register::<Machine>(Arc::new(MachineHooks));
        reg.register::<Profile>(Arc::new(ProfileHooks));
        reg.register::<Reservation>(Arc::new(ReservationHooks));
        reg.register::<Stage>(Arc::new(StageHooks));
        reg.register::<Subnet>(Arc::new(SubnetHooks));
        reg.register::<Task>(Arc::new(TaskHooks));
        reg
    }

    pub fn register<T: Model>(&mut self, hooks: Arc<dyn Hooks<T>>) {
        self.hooks.insert(TypeId::of::<T>(), Box::new(hooks));
    }

    pub fn get<T: Model>(&self) -> Arc<dyn Hooks<T>> {
        self.hooks
            .get(&TypeId::of::<T>())
            .and_then(|h| h.downcast_ref::<Arc<dyn Hooks<T>>>())
            .cloned()
            .unwrap_or_else(|| Arc::new(NoHooks))
    }
}

/// Record an error unless `addr` is a usable unicast address
pub(crate) fn validate_ip4(err: &mut ModelError, addr: Ipv4Addr) {
    if addr.is_unspecified()
        || addr.is_loopback()
        || addr.is_multicast()
        || addr.is_broadcast()
        || addr.is_link_local()
    {
        err.push(format!("{} is not a valid IP address", addr));
    }
}
