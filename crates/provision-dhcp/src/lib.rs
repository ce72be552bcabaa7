//! Provisioning DHCP Server
//!
//! This crate hands out addresses from the subnets and reservations in
//! the object store and tells PXE clients where to find their boot
//! files. It can also run as a ProxyDHCP/BINL responder next to an
//! existing DHCP server, answering only the boot questions.
//!
//! # Architecture
//!
//! ```text
//!   UDP :67 / :4011
//!        │
//!        ▼
//!   DhcpServer::process ──▶ serve_dhcp | serve_proxy | serve_binl
//!        │
//!        ▼
//!   engine (strategy token)
//!        ├── Reservation ──▶ Lease
//!        └── Subnet picker ──▶ Lease  PROBE ─▶ OFFER ─▶ ACK
//!        │
//!        ▼
//!   ReplyBuilder + OptionMap ──▶ relay | unicast | broadcast
//!
//!   every step is published as a DhcpEvent
//! ```
//!
//! # Example
//!
//! ```ignore
//! use provision_dhcp::{DhcpConfig, DhcpServer, NoProbe};
//! use std::net::Ipv4Addr;
//! use std::sync::Arc;
//!
//! let config = DhcpConfig::new(Ipv4Addr::new(192, 168, 1, 1))
//!     .with_network("192.168.1.1/24".parse()?);
//! let server = Arc::new(DhcpServer::new(config, tracker, Arc::new(NoProbe)));
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! server.run(shutdown_rx).await?;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod options;
pub mod packet;
pub mod picker;
pub mod probe;
pub mod server;
pub mod strategy;

pub use config::*;
pub use engine::{Allocation, Disposal};
pub use error::*;
pub use options::OptionMap;
pub use packet::{ClientArch, DhcpRequest, ReplyBuilder, ReqState};
pub use probe::{AddressProbe, NoProbe, StaticProbe};
pub use server::*;
pub use strategy::Strategy;
