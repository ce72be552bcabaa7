//! Address-in-use probing
//!
//! Before a freshly picked address is offered the server asks an
//! [`AddressProbe`] whether something on the network already answers
//! at it.

use async_trait::async_trait;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::Duration;

#[async_trait]
pub trait AddressProbe: Send + Sync {
    /// `Some(true)` if the address is in use, `Some(false)` if it is
    /// free, `None` if the probe is shutting down
    async fn in_use(&self, addr: Ipv4Addr, timeout: Duration) -> Option<bool>;
}

/// Reports every address as free
#[derive(Debug, Default)]
pub struct NoProbe;

#[async_trait]
impl AddressProbe for NoProbe {
    async fn in_use(&self, _addr: Ipv4Addr, _timeout: Duration) -> Option<bool> {
        Some(false)
    }
}

/// Reports a fixed set of addresses as taken
#[derive(Debug, Default)]
pub struct StaticProbe {
    taken: Mutex<HashSet<Ipv4Addr>>,
}

impl StaticProbe {
    pub fn new(taken: impl IntoIterator<Item = Ipv4Addr>) -> Self {
        Self {
            taken: Mutex::new(taken.into_iter().collect()),
        }
    }

    pub fn release(&self, addr: Ipv4Addr) {
        self.taken
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&addr);
    }
}

#[async_trait]
impl AddressProbe for StaticProbe {
    async fn in_use(&self, addr: Ipv4Addr, _timeout: Duration) -> Option<bool> {
        Some(
            self.taken
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains(&addr),
        )
    }
}
