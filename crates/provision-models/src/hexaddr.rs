//! Hex address keys
//!
//! Leases and reservations are keyed by the upper-case hex form of the
//! big-endian bytes of their IPv4 address. Lexicographic order of those
//! keys is numeric address order, which is what makes range queries over
//! a subnet's active span work on plain string keys.

use std::net::Ipv4Addr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddrError {
    #[error("invalid hex address: {0}")]
    InvalidHex(String),
}

/// Hex key for an address, e.g. `192.168.1.10` → `C0A8010A`
pub fn hexaddr(addr: Ipv4Addr) -> String {
    format!("{:08X}", u32::from(addr))
}

/// Parse a hex key back into an address
pub fn parse_hexaddr(key: &str) -> Result<Ipv4Addr, AddrError> {
    if key.len() != 8 {
        return Err(AddrError::InvalidHex(key.to_string()));
    }
    u32::from_str_radix(key, 16)
        .map(Ipv4Addr::from)
        .map_err(|_| AddrError::InvalidHex(key.to_string()))
}

/// Unicast, non-loopback, non-link-local IPv4 address
pub fn is_global_unicast(addr: Ipv4Addr) -> bool {
    !(addr.is_unspecified()
        || addr.is_broadcast()
        || addr.is_multicast()
        || addr.is_loopback()
        || addr.is_link_local())
}
