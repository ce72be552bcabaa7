//! Provision object store
//!
//! An in-memory, indexed copy of every object, persisted through a
//! pluggable [`BackingStore`] and guarded by per-prefix locks. All
//! mutation goes through a [`RequestTracker`], which runs the per-type
//! [`hooks`] around each write and publishes change events once its
//! locks are released.
//!
//! ```text
//!   DataTracker ── lock_ents(prefixes) ──▶ Stores ──▶ Store (per prefix)
//!        │                                               │
//!        ├── HookRegistry                                └── Object index
//!        ├── FileSystem (rendered templates)
//!        ├── AddrCache (remote → local)
//!        └── BackingStore (memory | redb, layered over defaults)
//! ```

pub mod backing;
pub mod conncache;
pub mod content;
pub mod error;
pub mod fs;
pub mod hooks;
pub mod index;
pub mod indexes;
pub mod locks;
pub mod redb_backing;
pub mod render;
pub mod request;
pub mod store;
pub mod tracker;

pub use backing::{create_backing, BackingStore, LayeredBacking, MemoryBacking, StoreConfig};
pub use conncache::AddrCache;
pub use error::{Result, StoreError};
pub use fs::{FileSystem, FsError};
pub use hooks::{HookRegistry, Hooks};
pub use index::{check_unique, Index, Indexed, Maker};
pub use locks::{locks_for, Action};
pub use redb_backing::RedbBacking;
pub use request::{Patch, RequestTracker};
pub use store::Store;
pub use tracker::{
    DataTracker, Stores, TrackerConfig, PREF_DEFAULT_BOOTENV, PREF_DEFAULT_STAGE,
    PREF_UNKNOWN_BOOTENV,
};
