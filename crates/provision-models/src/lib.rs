//! Provision data model
//!
//! Plain data types shared by the object store, the DHCP allocation
//! engine and the machine agent. Every persisted type implements
//! [`Model`], which ties it to a store [`Prefix`] and to its variant of
//! the [`Object`] enum so that store lookups never need runtime casts.
//!
//! ```text
//!   Lease ──addr──▶ Reservation        Machine ──stage──▶ Stage ──tasks──▶ Task
//!     │                                   │                 │
//!     └──addr──▶ Subnet (CIDR)            └──bootenv──▶ BootEnv ◀──┘
//!                                         │
//!                                         └──uuid──▶ Job ──task──▶ Task
//! ```
//!
//! References between objects are weak: they are names or keys that
//! get resolved (and re-checked) by the store on every operation.

pub mod bootenv;
pub mod dhcp_option;
pub mod error;
pub mod event;
pub mod hexaddr;
pub mod job;
pub mod lease;
pub mod machine;
pub mod model;
pub mod profile;
pub mod reservation;
pub mod stage;
pub mod subnet;
pub mod task;
pub mod validation;

pub use bootenv::*;
pub use dhcp_option::*;
pub use error::*;
pub use event::*;
pub use hexaddr::*;
pub use job::*;
pub use lease::*;
pub use machine::*;
pub use model::*;
pub use profile::*;
pub use reservation::*;
pub use stage::*;
pub use subnet::*;
pub use task::*;
pub use validation::*;
