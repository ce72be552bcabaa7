//! The data tracker: owner of every store, their locks and the event bus
//!
//! All objects live in memory, one [`Store`] per [`Prefix`], each behind
//! its own mutex. A request names the prefixes it needs up front and
//! [`DataTracker::lock_ents`] takes them in prefix order, so two requests
//! can never wait on each other in a cycle. A global reader/writer lock
//! sits above the per-store mutexes: ordinary requests share it, while
//! [`DataTracker::lock_all`] takes it exclusively for startup loading
//! and other whole-world checks.

use crate::backing::{BackingStore, LayeredBacking};
use crate::conncache::AddrCache;
use crate::content::default_layer;
use crate::error::{Result, StoreError};
use crate::fs::FileSystem;
use crate::hooks::HookRegistry;
use crate::locks::{locks_for, Action};
use crate::request::RequestTracker;
use crate::store::Store;
use provision_models::{
    BootEnv, Event, Job, Lease, Machine, ModelError, Object, Prefix, Profile,
    Reservation, Stage, Subnet, Task,
};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub const PREF_DEFAULT_STAGE: &str = "defaultStage";
pub const PREF_DEFAULT_BOOTENV: &str = "defaultBootEnv";
pub const PREF_UNKNOWN_BOOTENV: &str = "unknownBootEnv";

const EVENT_CAPACITY: usize = 1024;

fn default_prefs() -> BTreeMap<String, String> {
    BTreeMap::from([
        (PREF_DEFAULT_STAGE.to_string(), "none".to_string()),
        (PREF_DEFAULT_BOOTENV.to_string(), "local".to_string()),
        (PREF_UNKNOWN_BOOTENV.to_string(), "ignore".to_string()),
    ])
}

/// Settings the tracker hands to renderers and validators
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Directory static files and boot images are served from
    pub file_root: PathBuf,
    /// Address to advertise when the connection cache has no answer
    pub static_ip: Option<Ipv4Addr>,
    pub api_port: u16,
    pub static_port: u16,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            file_root: PathBuf::from("/var/lib/provision/tftpboot"),
            static_ip: None,
            api_port: 8092,
            static_port: 8091,
        }
    }
}

#[allow(dead_code)]
enum GlobalGuard<'a> {
    Shared(RwLockReadGuard<'a, ()>),
    Exclusive(RwLockWriteGuard<'a, ()>),
}

/// A set of locked stores
///
/// Dropping it releases the stores before the global lock.
pub struct Stores<'a> {
    stores: BTreeMap<Prefix, MutexGuard<'a, Store>>,
    _global: GlobalGuard<'a>,
}

impl<'a> Stores<'a> {
    pub fn get(&self, prefix: Prefix) -> Result<&Store> {
        self.stores
            .get(&prefix)
            .map(|g| &**g)
            .ok_or(StoreError::NotLocked(prefix))
    }

    pub fn get_mut(&mut self, prefix: Prefix) -> Result<&mut Store> {
        self.stores
            .get_mut(&prefix)
            .map(|g| &mut **g)
            .ok_or(StoreError::NotLocked(prefix))
    }

    pub fn is_locked(&self, prefix: Prefix) -> bool {
        self.stores.contains_key(&prefix)
    }

    pub fn locked(&self) -> impl Iterator<Item = Prefix> + '_ {
        self.stores.keys().copied()
    }

    pub fn exclusive(&self) -> bool {
        matches!(self._global, GlobalGuard::Exclusive(_))
    }
}

/// Owner of all stores, preferences, hooks and the event bus
pub struct DataTracker {
    backing: Arc<dyn BackingStore>,
    global: RwLock<()>,
    stores: BTreeMap<Prefix, Mutex<Store>>,
    prefs: RwLock<BTreeMap<String, String>>,
    events: broadcast::Sender<Event>,
    hooks: HookRegistry,
    fs: Arc<FileSystem>,
    cache: Arc<AddrCache>,
    config: TrackerConfig,
}

impl DataTracker {
    /// Build a tracker over `backing` with the default content layered
    /// underneath, then load and revalidate everything
    pub fn new(backing: Arc<dyn BackingStore>, config: TrackerConfig) -> Result<Self> {
        let layered = LayeredBacking::new(backing).with_layer(Arc::new(default_layer()?));
        Self::with_backing(Arc::new(layered), config)
    }

    /// Build a tracker over exactly `backing`, without default content
    pub fn with_backing(backing: Arc<dyn BackingStore>, config: TrackerConfig) -> Result<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let stores = Prefix::ALL
            .into_iter()
            .map(|p| (p, Mutex::new(Store::new(p))))
            .collect();
        let dt = Self {
            backing,
            global: RwLock::new(()),
            stores,
            prefs: RwLock::new(default_prefs()),
            events,
            hooks: HookRegistry::standard(),
            fs: Arc::new(FileSystem::new(config.file_root.clone())),
            cache: Arc::new(AddrCache::new()),
            config,
        };
        dt.load()?;
        Ok(dt)
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn fs(&self) -> &Arc<FileSystem> {
        &self.fs
    }

    pub fn cache(&self) -> &Arc<AddrCache> {
        &self.cache
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub(crate) fn backing(&self) -> &dyn BackingStore {
        self.backing.as_ref()
    }

    /// Lock the named stores, in prefix order, sharing the global lock
    pub fn lock_ents(&self, prefixes: &[Prefix]) -> Stores<'_> {
        let global = self.global.read().unwrap_or_else(PoisonError::into_inner);
        self.lock_stores(prefixes, GlobalGuard::Shared(global))
    }

    /// Lock every store, holding the global lock exclusively
    pub fn lock_all(&self) -> Stores<'_> {
        let global = self.global.write().unwrap_or_else(PoisonError::into_inner);
        self.lock_stores(&Prefix::ALL, GlobalGuard::Exclusive(global))
    }

    fn lock_stores<'a>(&'a self, prefixes: &[Prefix], global: GlobalGuard<'a>) -> Stores<'a> {
        let mut wanted = prefixes.to_vec();
        wanted.sort();
        wanted.dedup();
        let mut stores = BTreeMap::new();
        for prefix in wanted {
            if let Some(m) = self.stores.get(&prefix) {
                stores.insert(prefix, m.lock().unwrap_or_else(PoisonError::into_inner));
            }
        }
        Stores {
            stores,
            _global: global,
        }
    }

    /// A request tracker that will lock `prefixes` when it runs
    pub fn request(&self, prefixes: &[Prefix]) -> RequestTracker<'_> {
        RequestTracker::new(self, prefixes.to_vec())
    }

    /// A request tracker with the declared locks for `action` on `prefix`
    pub fn request_for(&self, prefix: Prefix, action: Action) -> RequestTracker<'_> {
        self.request(locks_for(prefix, action))
    }

    /// A request tracker holding every store exclusively
    pub fn request_all(&self) -> RequestTracker<'_> {
        RequestTracker::new_exclusive(self)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, events: Vec<Event>) {
        for ev in events {
            debug!(kind = %ev.kind, action = %ev.action, key = %ev.key, "publishing event");
            // No subscribers is not an error
            let _ = self.events.send(ev);
        }
    }

    pub fn pref(&self, name: &str) -> String {
        let prefs = self.prefs.read().unwrap_or_else(PoisonError::into_inner);
        prefs.get(name).cloned().unwrap_or_default()
    }

    pub fn prefs(&self) -> BTreeMap<String, String> {
        self.prefs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Validate and apply preference changes
    ///
    /// Locks bootenvs and stages itself, so it must not be called from
    /// inside a request that holds them.
    pub fn set_prefs(&self, changes: &BTreeMap<String, String>) -> Result<()> {
        let mut err = ModelError::new(422, provision_models::VALIDATION_ERROR, "preferences", "");
        let mut accepted = Vec::new();
        let mut unknown_changed = false;
        {
            let stores = self.lock_ents(&[Prefix::Bootenvs, Prefix::Stages]);
            let bootenvs = stores.get(Prefix::Bootenvs)?;
            let stages = stores.get(Prefix::Stages)?;
            for (name, val) in changes {
                match name.as_str() {
                    PREF_DEFAULT_BOOTENV | PREF_UNKNOWN_BOOTENV => {
                        let Some(env) = bootenvs.get::<BootEnv>(val) else {
                            err.push(format!("{}: Bootenv {} does not exist", name, val));
                            continue;
                        };
                        if name == PREF_DEFAULT_BOOTENV && env.only_unknown {
                            err.push(format!(
                                "{}: Bootenv {} is only for unknown machines",
                                name, val
                            ));
                            continue;
                        }
                        unknown_changed |= name == PREF_UNKNOWN_BOOTENV;
                        accepted.push((name.clone(), val.clone()));
                    }
                    PREF_DEFAULT_STAGE => {
                        if stages.contains(val) {
                            accepted.push((name.clone(), val.clone()));
                        } else {
                            err.push(format!("{}: Stage {} does not exist", name, val));
                        }
                    }
                    _ => {
                        err.push(format!("Unknown preference {}", name));
                    }
                }
            }
        }
        {
            let mut prefs = self.prefs.write().unwrap_or_else(PoisonError::into_inner);
            for (name, val) in accepted {
                info!(pref = %name, value = %val, "preference updated");
                prefs.insert(name, val);
            }
        }
        if unknown_changed {
            let mut rt = self.request(&[Prefix::Bootenvs, Prefix::Machines, Prefix::Profiles]);
            rt.do_(|rt| rt.render_unknown())?;
        }
        err.or_ok().map_err(StoreError::from)
    }

    /// Load every prefix from the backing store, then revalidate the
    /// objects whose state depends on others
    fn load(&self) -> Result<()> {
        {
            let mut stores = self.lock_all();
            for prefix in Prefix::ALL {
                let store = stores.get_mut(prefix)?;
                for (key, data) in self.backing.list(prefix)? {
                    match Object::from_slice(prefix, &data) {
                        Ok(obj) => {
                            store.insert(obj);
                        }
                        Err(e) => {
                            warn!(prefix = %prefix, key = %key, error = %e, "skipping undecodable object");
                        }
                    }
                }
                debug!(prefix = %prefix, count = store.len(), "loaded store");
            }
        }

        let mut rt = self.request_all();
        rt.do_(|rt| -> Result<()> {
            rt.reload::<Task>()?;
            rt.reload::<Profile>()?;
            rt.reload::<BootEnv>()?;
            rt.reload::<Stage>()?;
            rt.reload::<Machine>()?;
            rt.reload::<Job>()?;
            rt.reload::<Subnet>()?;
            rt.reload::<Reservation>()?;
            rt.reload::<Lease>()?;
            rt.render_unknown()
        })?;
        info!("data tracker loaded");
        Ok(())
    }
}
