//! Permanent address bindings

use crate::dhcp_option::DhcpOption;
use crate::hexaddr::hexaddr;
use crate::model::{Model, Prefix};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Lease duration granted through a reservation not covered by a subnet
pub const RESERVATION_LEASE_SECS: i64 = 2 * 60 * 60;

/// Binds one address to one (strategy, token) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Reservation {
    pub addr: Ipv4Addr,
    pub token: String,
    pub strategy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_server: Option<Ipv4Addr>,
    #[serde(default)]
    pub options: Vec<DhcpOption>,
    #[serde(default)]
    pub description: String,
}

impl Reservation {
    pub fn new(addr: Ipv4Addr, strategy: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            addr,
            token: token.into(),
            strategy: strategy.into(),
            next_server: None,
            options: Vec::new(),
            description: String::new(),
        }
    }

    pub fn owned_by(&self, strategy: &str, token: &str) -> bool {
        self.strategy == strategy && self.token == token
    }
}

impl Model for Reservation {
    const PREFIX: Prefix = Prefix::Reservations;

    fn key(&self) -> String {
        hexaddr(self.addr)
    }

    crate::object_conversions!(Reservation);
}
