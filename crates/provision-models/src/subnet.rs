//! Subnets and their active ranges

use crate::dhcp_option::DhcpOption;
use crate::hexaddr::hexaddr;
use crate::model::{Model, Prefix};
use chrono::Duration;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Names of the address pickers a subnet may select
pub const PICKERS: [&str; 3] = ["none", "nextFree", "mostExpired"];

/// Smallest accepted active lease time, in seconds
pub const MIN_ACTIVE_LEASE_SECS: u32 = 60;

/// Smallest accepted reserved lease time, in seconds
pub const MIN_RESERVED_LEASE_SECS: u32 = 7200;

fn default_true() -> bool {
    true
}

fn default_picker() -> String {
    "nextFree".to_string()
}

/// A network the DHCP server hands out addresses on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Subnet {
    pub name: String,
    /// CIDR, kept as text so bad input surfaces as a validation error
    pub subnet: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Answer with PXE information only, never hand out addresses
    #[serde(default)]
    pub proxy: bool,
    /// Never offer PXE boot information
    #[serde(default)]
    pub unmanaged: bool,
    #[serde(default)]
    pub only_reservations: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_server: Option<Ipv4Addr>,
    pub active_start: Ipv4Addr,
    pub active_end: Ipv4Addr,
    pub active_lease_time: u32,
    pub reserved_lease_time: u32,
    pub strategy: String,
    #[serde(default = "default_picker")]
    pub picker: String,
    #[serde(default)]
    pub options: Vec<DhcpOption>,
    /// Rotating cursor used by the `nextFree` picker
    #[serde(default, rename = "NextLeasableIP", skip_serializing_if = "Option::is_none")]
    pub next_leasable_ip: Option<Ipv4Addr>,
}

impl Subnet {
    /// A subnet with sane lease times and the default picker
    pub fn new(
        name: impl Into<String>,
        cidr: impl Into<String>,
        active_start: Ipv4Addr,
        active_end: Ipv4Addr,
    ) -> Self {
        Self {
            name: name.into(),
            subnet: cidr.into(),
            enabled: true,
            proxy: false,
            unmanaged: false,
            only_reservations: false,
            next_server: None,
            active_start,
            active_end,
            active_lease_time: MIN_ACTIVE_LEASE_SECS,
            reserved_lease_time: MIN_RESERVED_LEASE_SECS,
            strategy: "MAC".to_string(),
            picker: default_picker(),
            options: Vec::new(),
            next_leasable_ip: None,
        }
    }

    pub fn network(&self) -> Option<Ipv4Network> {
        self.subnet.parse().ok()
    }

    pub fn in_subnet_range(&self, ip: Ipv4Addr) -> bool {
        self.network().map(|n| n.contains(ip)).unwrap_or(false)
    }

    pub fn in_active_range(&self, ip: Ipv4Addr) -> bool {
        !self.only_reservations && self.active_start <= ip && ip <= self.active_end
    }

    /// Lease duration for an address in this subnet
    pub fn lease_time_for(&self, ip: Ipv4Addr) -> Duration {
        if self.in_active_range(ip) {
            Duration::seconds(i64::from(self.active_lease_time))
        } else {
            Duration::seconds(i64::from(self.reserved_lease_time))
        }
    }

    /// Inclusive hex key bounds of the active range
    pub fn active_bounds(&self) -> (String, String) {
        (hexaddr(self.active_start), hexaddr(self.active_end))
    }

    /// Inclusive hex key bounds of the whole network
    pub fn subnet_bounds(&self) -> Option<(String, String)> {
        let net = self.network()?;
        Some((hexaddr(net.network()), hexaddr(net.broadcast())))
    }
}

impl Model for Subnet {
    const PREFIX: Prefix = Prefix::Subnets;

    fn key(&self) -> String {
        self.name.clone()
    }

    fn fill(&mut self) {
        if self.picker.is_empty() {
            self.picker = default_picker();
        }
    }

    crate::object_conversions!(Subnet);
}
