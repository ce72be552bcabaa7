//! Remote → local address cache
//!
//! Remembers which of our addresses each remote host last reached us on,
//! so rendered templates can point a machine back at an address it can
//! actually route to. Entries are swept on a fixed interval: each sweep
//! evicts entries still marked from the previous sweep and marks the
//! rest. A lookup clears the mark, so anything used at least once per
//! interval survives.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Interval between mark-and-evict sweeps
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Entry {
    remote: IpAddr,
    local: IpAddr,
    marked: AtomicBool,
}

/// Sorted remote → local address map with a background sweeper
#[derive(Debug)]
pub struct AddrCache {
    entries: RwLock<Vec<Entry>>,
    stop: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Default for AddrCache {
    fn default() -> Self {
        Self::new()
    }
}

impl AddrCache {
    pub fn new() -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            entries: RwLock::new(Vec::new()),
            stop,
            sweeper: Mutex::new(None),
        }
    }

    /// Record that `remote` reached us on `local`
    pub fn add(&self, local: IpAddr, remote: IpAddr) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.binary_search_by(|e| e.remote.cmp(&remote)) {
            Ok(i) => {
                let entry = &mut entries[i];
                entry.local = local;
                entry.marked.store(false, Ordering::Relaxed);
            }
            Err(i) => {
                debug!(%local, %remote, "caching local address");
                entries.insert(
                    i,
                    Entry {
                        remote,
                        local,
                        marked: AtomicBool::new(false),
                    },
                );
            }
        }
    }

    /// The local address `remote` last reached us on
    pub fn local_for(&self, remote: IpAddr) -> Option<IpAddr> {
        if remote.is_unspecified() {
            return None;
        }
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let i = entries.binary_search_by(|e| e.remote.cmp(&remote)).ok()?;
        let entry = &entries[i];
        entry.marked.store(false, Ordering::Relaxed);
        Some(entry.local)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict entries marked since the last sweep, then mark the rest
    pub fn sweep(&self) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|e| !e.marked.load(Ordering::Relaxed));
        for e in entries.iter() {
            e.marked.store(true, Ordering::Relaxed);
        }
        if entries.len() != before {
            debug!(evicted = before - entries.len(), "swept address cache");
        }
    }

    /// Spawn the periodic sweeper on the current tokio runtime
    pub fn start(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if sweeper.is_some() {
            return;
        }
        let _ = self.stop.send(false);
        let cache = Arc::downgrade(self);
        let mut stop = self.stop.subscribe();
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(cache) = cache.upgrade() else { break };
                        cache.sweep();
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("address cache sweeper stopped");
        }));
    }

    /// Signal the sweeper to stop and wait for it
    pub async fn stop(&self) {
        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let _ = self.stop.send(true);
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(o: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, o))
    }

    #[test]
    fn test_add_and_lookup() {
        let cache = AddrCache::new();
        cache.add(ip(1), ip(50));
        cache.add(ip(1), ip(20));
        cache.add(ip(2), ip(50));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.local_for(ip(50)), Some(ip(2)));
        assert_eq!(cache.local_for(ip(20)), Some(ip(1)));
        assert_eq!(cache.local_for(ip(99)), None);
        assert_eq!(cache.local_for(IpAddr::V4(Ipv4Addr::UNSPECIFIED)), None);
    }

    #[test]
    fn test_mark_and_evict() {
        let cache = AddrCache::new();
        cache.add(ip(1), ip(50));
        cache.add(ip(1), ip(51));

        cache.sweep();
        assert_eq!(cache.len(), 2);

        assert!(cache.local_for(ip(50)).is_some());
        cache.sweep();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.local_for(ip(51)), None);
        assert_eq!(cache.local_for(ip(50)), Some(ip(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweeper() {
        let cache = Arc::new(AddrCache::new());
        cache.add(ip(1), ip(50));
        cache.start();

        tokio::time::sleep(SWEEP_INTERVAL * 2 + Duration::from_secs(1)).await;
        assert!(cache.is_empty());

        cache.stop().await;
        cache.add(ip(1), ip(50));
        tokio::time::sleep(SWEEP_INTERVAL * 3).await;
        assert_eq!(cache.len(), 1);
    }
}
