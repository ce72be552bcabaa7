//! DHCP leases

use crate::hexaddr::hexaddr;
use crate::model::{Model, Prefix};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Lifecycle of a lease as seen by the DHCP server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LeaseState {
    /// Offered to a client, not yet confirmed
    #[default]
    Offer,
    /// Confirmed by a DHCPREQUEST
    Ack,
    /// Freshly picked, waiting for an in-use probe
    Probe,
    /// Synthesized for a proxy subnet, never persisted
    Fake,
}

/// An address handed out to a client identified by (strategy, token)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Lease {
    pub addr: Ipv4Addr,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub strategy: String,
    pub expire_time: DateTime<Utc>,
    #[serde(default)]
    pub state: LeaseState,
}

impl Lease {
    pub fn new(addr: Ipv4Addr, strategy: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            addr,
            token: token.into(),
            strategy: strategy.into(),
            expire_time: Utc::now(),
            state: LeaseState::default(),
        }
    }

    pub fn expired(&self) -> bool {
        self.expire_time < Utc::now()
    }

    /// Expire the lease now
    pub fn expire(&mut self) {
        self.expire_time = Utc::now();
    }

    /// Make the address unusable for a short while and drop its owner
    pub fn invalidate(&mut self) {
        self.expire_time = Utc::now() + Duration::seconds(2);
        self.token.clear();
        self.strategy.clear();
    }

    /// A lease is valid while it has an owner and has not expired
    pub fn valid(&self) -> bool {
        !self.token.is_empty() && !self.expired()
    }

    pub fn is_fake(&self) -> bool {
        self.state == LeaseState::Fake
    }

    pub fn owned_by(&self, strategy: &str, token: &str) -> bool {
        self.strategy == strategy && self.token == token
    }
}

impl Model for Lease {
    const PREFIX: Prefix = Prefix::Leases;

    fn key(&self) -> String {
        hexaddr(self.addr)
    }

    crate::object_conversions!(Lease);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_expiry_helpers() {
        let mut lease = Lease::new(Ipv4Addr::new(10, 0, 0, 10), "MAC", "aa:bb:cc:dd:ee:ff");
        lease.expire_time = Utc::now() + Duration::minutes(1);
        assert!(!lease.expired());
        assert!(lease.valid());

        lease.expire();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(lease.expired());

        lease.invalidate();
        assert!(!lease.expired());
        assert!(lease.token.is_empty());
        assert!(lease.strategy.is_empty());
        assert!(!lease.valid());
    }

    #[test]
    fn test_lease_json_shape() {
        let lease = Lease::new(Ipv4Addr::new(10, 0, 0, 10), "MAC", "aa");
        let json = serde_json::to_value(&lease).unwrap();
        assert_eq!(json["Addr"], "10.0.0.10");
        assert_eq!(json["State"], "OFFER");
        assert!(json.get("ExpireTime").is_some());
        assert_eq!(lease.key(), "0A00000A");
    }
}
