//! Request-scoped access to the data tracker
//!
//! A [`RequestTracker`] names the stores it needs when it is built and
//! only takes their locks inside [`RequestTracker::do_`]. Every object
//! operation runs the per-type hook pipeline and queues a change event;
//! queued events are published once the locks are released, so
//! subscribers never observe a change that is still being made.

use crate::error::{Result, StoreError};
use crate::hooks::Hooks;
use crate::index::Index;
use crate::render;
use crate::store::Store;
use crate::tracker::{DataTracker, Stores, PREF_UNKNOWN_BOOTENV};
use provision_models::{BootEnv, Event, Model, ModelError, Prefix};
use std::sync::Arc;
use tracing::{error, warn};

pub use json_patch::Patch;

/// A unit of work against a fixed set of locked stores
pub struct RequestTracker<'a> {
    dt: &'a DataTracker,
    locks: Vec<Prefix>,
    exclusive: bool,
    force: bool,
    active: Option<Stores<'a>>,
    to_publish: Vec<Event>,
}

fn prefix_of<T: Model>() -> &'static str {
    T::PREFIX.as_str()
}

impl<'a> RequestTracker<'a> {
    pub(crate) fn new(dt: &'a DataTracker, locks: Vec<Prefix>) -> Self {
        Self {
            dt,
            locks,
            exclusive: false,
            force: false,
            active: None,
            to_publish: Vec::new(),
        }
    }

    pub(crate) fn new_exclusive(dt: &'a DataTracker) -> Self {
        Self {
            exclusive: true,
            ..Self::new(dt, Prefix::ALL.to_vec())
        }
    }

    /// Let hooks accept changes they would otherwise refuse, such as a
    /// stage change with tasks still pending
    pub fn with_force(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn forced(&self) -> bool {
        self.force
    }

    pub fn dt(&self) -> &'a DataTracker {
        self.dt
    }

    /// Lock, run `f`, unlock, then publish queued events
    ///
    /// # Panics
    ///
    /// Calling `do_` again from inside `f` is a programming error.
    pub fn do_<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        if self.active.is_some() {
            panic!("Recursive lock of request tracker!");
        }
        let stores = if self.exclusive {
            self.dt.lock_all()
        } else {
            self.dt.lock_ents(&self.locks)
        };
        self.active = Some(stores);
        let res = f(self);
        self.active = None;
        let events = std::mem::take(&mut self.to_publish);
        self.dt.publish(events);
        res
    }

    pub fn stores(&self) -> Result<&Stores<'a>> {
        self.active.as_ref().ok_or(StoreError::OutsideDo)
    }

    fn store_mut(&mut self, prefix: Prefix) -> Result<&mut Store> {
        self.active
            .as_mut()
            .ok_or(StoreError::OutsideDo)?
            .get_mut(prefix)
    }

    pub fn store(&self, prefix: Prefix) -> Result<&Store> {
        self.stores()?.get(prefix)
    }

    pub fn find<T: Model>(&self, key: &str) -> Result<Option<T>> {
        Ok(self.store(T::PREFIX)?.get::<T>(key).cloned())
    }

    pub fn contains<T: Model>(&self, key: &str) -> Result<bool> {
        Ok(self.store(T::PREFIX)?.contains(key))
    }

    pub fn items<T: Model>(&self) -> Result<Vec<T>> {
        Ok(self.store(T::PREFIX)?.items())
    }

    /// Objects with keys in `[lower, upper]`
    pub fn between<T: Model>(&self, lower: String, upper: String) -> Result<Vec<T>> {
        Ok(self.store(T::PREFIX)?.between(lower..=upper))
    }

    pub fn index<T: Model>(&self) -> Result<Index<T>> {
        Ok(self.store(T::PREFIX)?.index())
    }

    /// Queue an event to publish after the locks are released
    pub fn publish(&mut self, kind: Prefix, action: &str, key: String, object: serde_json::Value) {
        self.to_publish
            .push(Event::new(kind.as_str(), action, key, object));
    }

    fn queue<T: Model>(&mut self, obj: &T, action: &str) {
        match serde_json::to_value(obj) {
            Ok(v) => self.publish(T::PREFIX, action, obj.key(), v),
            Err(e) => warn!(prefix = %T::PREFIX, key = %obj.key(), error = %e, "event body not serializable"),
        }
    }

    fn hooks_for<T: Model>(&self) -> Arc<dyn Hooks<T>> {
        self.dt.hooks().get::<T>()
    }

    fn persist<T: Model>(&self, obj: &T, action: &str) -> Result<()> {
        let mut clean = obj.clone();
        if let Some(v) = clean.validation_mut() {
            v.clear();
        }
        let key = obj.key();
        let body = serde_json::to_vec(&clean)?;
        self.dt
            .backing()
            .save(T::PREFIX, &key, &body)
            .inspect_err(|e| {
                error!(prefix = %T::PREFIX, key = %key, action, error = %e, "failed to persist object")
            })
    }

    fn prepare<T: Model>(obj: &mut T) {
        obj.fill();
        if let Some(v) = obj.validation_mut() {
            v.clear();
        }
    }

    fn finish_save<T: Model>(&mut self, mut obj: T, old: Option<&T>, action: &str) -> Result<T> {
        let hooks = self.hooks_for::<T>();
        hooks.before_save(self, old, &mut obj)?;
        self.persist(&obj, action)?;
        self.store_mut(T::PREFIX)?.insert(obj.clone().into_object());
        hooks.after_save(self, &obj);
        self.queue(&obj, action);
        Ok(obj)
    }

    /// Create a new object; fails if the key is empty or taken
    pub fn create<T: Model>(&mut self, mut obj: T) -> Result<T> {
        let key = obj.key();
        if key.is_empty() {
            return Err(ModelError::bad_request("CREATE", prefix_of::<T>(), "")
                .with("Empty key not allowed")
                .into());
        }
        if self.contains::<T>(&key)? {
            return Err(ModelError::conflict("CREATE", prefix_of::<T>(), &key)
                .with("already exists")
                .into());
        }
        Self::prepare(&mut obj);
        let hooks = self.hooks_for::<T>();
        hooks.on_create(self, &mut obj)?;
        self.finish_save(obj, None, "create")
    }

    /// Replace an existing object
    pub fn update<T: Model>(&mut self, mut obj: T) -> Result<T> {
        let key = obj.key();
        let old = self
            .find::<T>(&key)?
            .ok_or_else(|| ModelError::not_found("PUT", prefix_of::<T>(), &key))?;
        Self::prepare(&mut obj);
        let hooks = self.hooks_for::<T>();
        hooks.on_change(self, &old, &mut obj)?;
        self.finish_save(obj, Some(&old), "update")
    }

    /// Apply a JSON patch to an existing object, then update it
    pub fn patch<T: Model>(&mut self, key: &str, patch: &Patch) -> Result<T> {
        let old = self
            .find::<T>(key)?
            .ok_or_else(|| ModelError::not_found("PATCH", prefix_of::<T>(), key))?;
        let mut doc = serde_json::to_value(&old)?;
        for (line, op) in patch.0.iter().enumerate() {
            if let Err(e) = json_patch::patch(&mut doc, std::slice::from_ref(op)) {
                let op_json = serde_json::to_string(op).unwrap_or_default();
                return Err(ModelError::conflict("PATCH", prefix_of::<T>(), key)
                    .with(format!("Patch error at line {}: {}", line, e))
                    .with(format!("Patch line: {}", op_json))
                    .into());
            }
        }
        let obj: T = serde_json::from_value(doc).map_err(|e| {
            ModelError::not_acceptable("PATCH", prefix_of::<T>(), key).with(e.to_string())
        })?;
        if obj.key() != key {
            return Err(ModelError::new(422, "PATCH", prefix_of::<T>(), key)
                .with("Cannot change the key of an object")
                .into());
        }
        self.update(obj)
    }

    /// Create or replace without the create/change hooks
    pub fn save<T: Model>(&mut self, mut obj: T) -> Result<T> {
        let key = obj.key();
        if key.is_empty() {
            return Err(ModelError::bad_request("SAVE", prefix_of::<T>(), "")
                .with("Empty key not allowed")
                .into());
        }
        let old = self.find::<T>(&key)?;
        Self::prepare(&mut obj);
        self.finish_save(obj, old.as_ref(), "save")
    }

    /// Remove an object, returning what was removed
    pub fn remove<T: Model>(&mut self, key: &str) -> Result<T> {
        let obj = self
            .find::<T>(key)?
            .ok_or_else(|| ModelError::not_found("DELETE", prefix_of::<T>(), key))?;
        let hooks = self.hooks_for::<T>();
        hooks.before_delete(self, &obj)?;
        self.dt.backing().remove(T::PREFIX, key).inspect_err(|e| {
            error!(prefix = %T::PREFIX, key = %key, action = "delete", error = %e, "failed to remove object")
        })?;
        self.store_mut(T::PREFIX)?.remove(key);
        hooks.after_delete(self, &obj);
        self.queue(&obj, "delete");
        Ok(obj)
    }

    /// Rerun the save hooks over every loaded object of a type, writing
    /// back only the objects the hooks changed
    pub(crate) fn reload<T: Model>(&mut self) -> Result<()> {
        let hooks = self.hooks_for::<T>();
        for old in self.items::<T>()? {
            let mut obj = old.clone();
            Self::prepare(&mut obj);
            if let Err(e) = hooks.before_save(self, Some(&old), &mut obj) {
                warn!(prefix = %T::PREFIX, key = %obj.key(), error = %e, "object failed validation on load");
            }
            if stored_form(&obj)? != stored_form(&old)? {
                self.persist(&obj, "load")?;
            }
            self.store_mut(T::PREFIX)?.insert(obj.clone().into_object());
            hooks.after_save(self, &obj);
        }
        Ok(())
    }

    /// Replace the in-memory copy of an object whose persisted form did
    /// not change, such as after recomputing its validation state
    pub(crate) fn refresh<T: Model>(&mut self, obj: T) -> Result<()> {
        self.store_mut(T::PREFIX)?.insert(obj.into_object());
        Ok(())
    }

    /// Register the renderers of the bootenv unknown machines boot into
    pub(crate) fn render_unknown(&mut self) -> Result<()> {
        let name = self.dt.pref(PREF_UNKNOWN_BOOTENV);
        match self.find::<BootEnv>(&name)? {
            Some(env) => {
                render::register(self, &env, None);
                Ok(())
            }
            None => {
                warn!(bootenv = %name, "unknown bootenv does not exist");
                Ok(())
            }
        }
    }
}

fn stored_form<T: Model>(obj: &T) -> Result<serde_json::Value> {
    let mut clean = obj.clone();
    if let Some(v) = clean.validation_mut() {
        v.clear();
    }
    Ok(serde_json::to_value(&clean)?)
}
