//! Durable key-value backing stores
//!
//! Every prefix is a flat table of key → JSON body. The DataTracker keeps
//! its own in-memory index of decoded objects and only goes to the
//! backing store to load at startup and to persist writes.
//!
//! - [`MemoryBacking`] - volatile storage for tests and development
//! - [`RedbBacking`](crate::RedbBacking) - local embedded database
//! - [`LayeredBacking`] - a writable layer over read-only default layers

use crate::error::{Result, StoreError};
use crate::redb_backing::RedbBacking;
use provision_models::Prefix;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

/// Key-value persistence for store objects
pub trait BackingStore: Send + Sync {
    /// All (key, body) pairs stored under a prefix
    fn list(&self, prefix: Prefix) -> Result<Vec<(String, Vec<u8>)>>;

    /// Store or replace one body
    fn save(&self, prefix: Prefix, key: &str, value: &[u8]) -> Result<()>;

    /// Remove one body; removing a missing key is not an error
    fn remove(&self, prefix: Prefix, key: &str) -> Result<()>;

    /// Read-only layers refuse writes
    fn read_only(&self) -> bool {
        false
    }
}

fn read_only_error(prefix: Prefix, key: &str) -> StoreError {
    StoreError::Backing {
        prefix,
        key: key.to_string(),
        message: "read only".to_string(),
    }
}

/// In-memory backing store
#[derive(Default)]
pub struct MemoryBacking {
    data: RwLock<HashMap<Prefix, BTreeMap<String, Vec<u8>>>>,
    read_only: bool,
}

impl MemoryBacking {
    /// Create a new empty memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Freeze the current contents; further writes fail
    pub fn into_read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Seed a body, bypassing the read-only flag
    pub fn seed(&self, prefix: Prefix, key: &str, value: Vec<u8>) {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        data.entry(prefix).or_default().insert(key.to_string(), value);
    }

    pub fn contains(&self, prefix: Prefix, key: &str) -> bool {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        data.get(&prefix).map(|t| t.contains_key(key)).unwrap_or(false)
    }
}

impl BackingStore for MemoryBacking {
    fn list(&self, prefix: Prefix) -> Result<Vec<(String, Vec<u8>)>> {
        let data = self
            .data
            .read()
            .map_err(|e| StoreError::Database(format!("lock poisoned: {}", e)))?;
        Ok(data
            .get(&prefix)
            .map(|t| t.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn save(&self, prefix: Prefix, key: &str, value: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(read_only_error(prefix, key));
        }
        let mut data = self
            .data
            .write()
            .map_err(|e| StoreError::Database(format!("lock poisoned: {}", e)))?;
        data.entry(prefix)
            .or_default()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, prefix: Prefix, key: &str) -> Result<()> {
        if self.read_only {
            return Err(read_only_error(prefix, key));
        }
        let mut data = self
            .data
            .write()
            .map_err(|e| StoreError::Database(format!("lock poisoned: {}", e)))?;
        if let Some(table) = data.get_mut(&prefix) {
            table.remove(key);
        }
        Ok(())
    }

    fn read_only(&self) -> bool {
        self.read_only
    }
}

/// A writable layer stacked over read-only lower layers
///
/// Reads merge every layer with upper layers winning. Writes always land
/// in the writable layer. Removing a key that only exists in a lower
/// layer fails, since that object cannot be made to go away.
pub struct LayeredBacking {
    writable: Arc<dyn BackingStore>,
    lower: Vec<Arc<dyn BackingStore>>,
}

impl LayeredBacking {
    pub fn new(writable: Arc<dyn BackingStore>) -> Self {
        Self {
            writable,
            lower: Vec::new(),
        }
    }

    /// Add a lower layer; layers added later sit further down
    pub fn with_layer(mut self, layer: Arc<dyn BackingStore>) -> Self {
        self.lower.push(layer);
        self
    }
}

impl BackingStore for LayeredBacking {
    fn list(&self, prefix: Prefix) -> Result<Vec<(String, Vec<u8>)>> {
        let mut merged = BTreeMap::new();
        for layer in self.lower.iter().rev() {
            merged.extend(layer.list(prefix)?);
        }
        merged.extend(self.writable.list(prefix)?);
        Ok(merged.into_iter().collect())
    }

    fn save(&self, prefix: Prefix, key: &str, value: &[u8]) -> Result<()> {
        self.writable.save(prefix, key, value)
    }

    fn remove(&self, prefix: Prefix, key: &str) -> Result<()> {
        let upper = self.writable.list(prefix)?;
        if upper.iter().any(|(k, _)| k == key) {
            return self.writable.remove(prefix, key);
        }
        for layer in &self.lower {
            if layer.list(prefix)?.iter().any(|(k, _)| k == key) {
                return Err(read_only_error(prefix, key));
            }
        }
        Ok(())
    }
}

/// Storage configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    /// In-memory storage (for testing)
    #[default]
    Memory,

    /// ReDB local database
    Redb { path: String },
}

/// Create a backing store from configuration
pub fn create_backing(config: &StoreConfig) -> Result<Arc<dyn BackingStore>> {
    match config {
        StoreConfig::Memory => Ok(Arc::new(MemoryBacking::new())),
        StoreConfig::Redb { path } => Ok(Arc::new(RedbBacking::open(path)?)),
    }
}
