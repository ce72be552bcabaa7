//! Lease allocation
//!
//! Every entry point runs as one request against the lease, reservation
//! and subnet stores, so a lookup and the write that follows it see a
//! consistent view.
//!
//! Clients are identified by `(strategy, token)`. A lease is only ever
//! handed to its owner, except that an expired lease may be taken over.
//! Reservations always win: a lease that contradicts a reservation is
//! invalidated, and a reserved address is never picked for anyone else.

use crate::error::{DhcpError, Result};
use crate::picker::Pool;
use chrono::{Duration, Utc};
use provision_models::{
    hexaddr, is_global_unicast, Lease, LeaseState, Model, Prefix, Reservation, Subnet,
    RESERVATION_LEASE_SECS,
};
use provision_store::{locks_for, Action, DataTracker, RequestTracker};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use tracing::{debug, info, warn};

/// An address being handed out, and what covers it
#[derive(Debug, Clone)]
pub struct Allocation {
    pub lease: Lease,
    pub subnet: Option<Subnet>,
    pub reservation: Option<Reservation>,
    /// The address was just picked and must be probed before it is offered
    pub fresh: bool,
}

impl Allocation {
    /// How long the lease runs
    pub fn duration(&self) -> Duration {
        lease_duration(self.subnet.as_ref(), self.lease.addr)
    }
}

/// Outcome of a DECLINE or RELEASE
#[derive(Debug, Clone, PartialEq)]
pub enum Disposal {
    /// No lease at the address
    Unknown,
    /// The sender does not own the lease; nothing was changed
    Spoofed(Lease),
    Done(Lease),
}

fn lease_duration(subnet: Option<&Subnet>, addr: Ipv4Addr) -> Duration {
    subnet
        .map(|s| s.lease_time_for(addr))
        .unwrap_or_else(|| Duration::seconds(RESERVATION_LEASE_SECS))
}

fn dhcp_request(dt: &DataTracker) -> RequestTracker<'_> {
    dt.request(locks_for(Prefix::Leases, Action::Update))
}

fn fake(addr: Ipv4Addr, strategy: &str, token: &str) -> Lease {
    Lease {
        state: LeaseState::Fake,
        ..Lease::new(addr, strategy, token)
    }
}

fn subnet_for(rt: &RequestTracker<'_>, addr: Ipv4Addr) -> Result<Option<Subnet>> {
    Ok(rt
        .store(Prefix::Subnets)?
        .iter::<Subnet>()
        .find(|s| s.in_subnet_range(addr))
        .cloned())
}

/// The lease a client already holds
///
/// With a requested address the lease at that address is used, and it
/// must belong to the client unless it has expired. Without one, any
/// lease the client owns is used. A lease whose reservation names a
/// different owner is invalidated and refused.
fn existing(
    rt: &mut RequestTracker<'_>,
    strategy: &str,
    token: &str,
    req: Option<Ipv4Addr>,
) -> Result<Option<Lease>> {
    let found = match req.filter(|a| is_global_unicast(*a)) {
        Some(addr) => {
            let Some(lease) = rt.find::<Lease>(&hexaddr(addr))? else {
                return Err(DhcpError::NoLease(addr));
            };
            if !lease.owned_by(strategy, token) && !lease.expired() {
                return Err(DhcpError::LeaseNak(format!(
                    "Lease for {} owned by {}:{}",
                    addr, lease.strategy, lease.token
                )));
            }
            lease
        }
        None => {
            let owned = rt
                .store(Prefix::Leases)?
                .iter::<Lease>()
                .find(|l| l.owned_by(strategy, token))
                .cloned();
            match owned {
                Some(lease) => lease,
                None => return Ok(None),
            }
        }
    };
    let mut lease = found;
    if let Some(res) = rt.find::<Reservation>(&lease.key())? {
        if !res.owned_by(strategy, token) {
            let msg = format!(
                "Reservation {} ({}:{}) conflicts with {}:{}",
                res.addr, res.strategy, res.token, strategy, token
            );
            lease.invalidate();
            rt.save(lease)?;
            return Err(DhcpError::LeaseNak(msg));
        }
    }
    if !lease.owned_by(strategy, token) {
        debug!(addr = %lease.addr, old = %lease.token, new = %token, "taking over expired lease");
        lease.strategy = strategy.to_string();
        lease.token = token.to_string();
    }
    Ok(Some(lease))
}

/// Remove every other lease held by `(strategy, token)` so that only
/// the one at `keep` stays with the client
fn drop_superseded(rt: &mut RequestTracker<'_>, strategy: &str, token: &str, keep: &str) -> Result<()> {
    let stale: Vec<String> = rt
        .store(Prefix::Leases)?
        .iter::<Lease>()
        .filter(|l| l.owned_by(strategy, token) && l.key() != keep)
        .map(|l| l.key())
        .collect();
    for old in stale {
        debug!(key = %old, "removing superseded lease");
        rt.remove::<Lease>(&old)?;
    }
    Ok(())
}

fn find_lease_in(
    rt: &mut RequestTracker<'_>,
    strategy: &str,
    token: &str,
    req: Option<Ipv4Addr>,
) -> Result<Option<Allocation>> {
    let mut lease = match existing(rt, strategy, token, req) {
        Ok(Some(lease)) => lease,
        Ok(None) => return Ok(None),
        Err(DhcpError::NoLease(addr)) => {
            let reservation = rt.find::<Reservation>(&hexaddr(addr))?;
            let subnet = subnet_for(rt, addr)?;
            return match (&subnet, &reservation) {
                (None, None) => Ok(None),
                (Some(s), None) if s.proxy => Ok(Some(Allocation {
                    lease: fake(addr, strategy, token),
                    subnet,
                    reservation,
                    fresh: false,
                })),
                (Some(s), None) if !s.enabled => Ok(None),
                _ => Err(DhcpError::NoLease(addr)),
            };
        }
        Err(e) => return Err(e),
    };
    let key = lease.key();
    let reservation = rt.find::<Reservation>(&key)?;
    let subnet = subnet_for(rt, lease.addr)?;
    if subnet.is_none() && reservation.is_none() {
        rt.remove::<Lease>(&key)?;
        return Err(DhcpError::LeaseNak(format!(
            "Lease {} has no reservation or subnet, it is dead to us.",
            lease.addr
        )));
    }
    if reservation.is_none() && subnet.as_ref().is_some_and(|s| !s.enabled) {
        debug!(addr = %lease.addr, "lease is in a disabled subnet");
        return Ok(None);
    }
    drop_superseded(rt, strategy, token, &key)?;
    lease.state = LeaseState::Ack;
    lease.expire_time = Utc::now() + lease_duration(subnet.as_ref(), lease.addr);
    let lease = rt.save(lease)?;
    Ok(Some(Allocation {
        lease,
        subnet,
        reservation,
        fresh: false,
    }))
}

/// Confirm the lease a client is asking for in a DHCPREQUEST
///
/// On success the lease is acknowledged and its expiry pushed out by the
/// lease time of whatever covers it. Errors that satisfy
/// [`DhcpError::is_nak`] mean the client must be NAKed; `Ok(None)` means
/// the request is not ours to answer.
pub fn find_lease(
    dt: &DataTracker,
    strategy: &str,
    token: &str,
    req: Option<Ipv4Addr>,
) -> Result<Option<Allocation>> {
    dhcp_request(dt).do_(|rt| find_lease_in(rt, strategy, token, req))
}

fn via_reservation(
    rt: &RequestTracker<'_>,
    strategy: &str,
    token: &str,
    req: Option<Ipv4Addr>,
) -> Result<Option<Allocation>> {
    let reservation = match req.filter(|a| is_global_unicast(*a)) {
        Some(addr) => rt.find::<Reservation>(&hexaddr(addr))?,
        None => rt
            .store(Prefix::Reservations)?
            .iter::<Reservation>()
            .find(|r| r.owned_by(strategy, token))
            .cloned(),
    };
    let Some(reservation) = reservation.filter(|r| r.owned_by(strategy, token)) else {
        return Ok(None);
    };
    let lease = match rt.find::<Lease>(&reservation.key())? {
        None => Lease::new(reservation.addr, strategy, token),
        Some(lease) if lease.owned_by(strategy, token) => lease,
        Some(mut lease) if lease.expired() => {
            debug!(addr = %lease.addr, old = %lease.token, "reclaiming expired lease for its reservation");
            lease.strategy = strategy.to_string();
            lease.token = token.to_string();
            lease.state = LeaseState::Offer;
            lease
        }
        Some(lease) => {
            info!(
                addr = %reservation.addr,
                holder = %format!("{}:{}", lease.strategy, lease.token),
                "reserved address is still leased to another client"
            );
            return Ok(None);
        }
    };
    let subnet = subnet_for(rt, reservation.addr)?;
    Ok(Some(Allocation {
        lease,
        subnet,
        reservation: Some(reservation),
        fresh: false,
    }))
}

fn via_subnet(
    rt: &mut RequestTracker<'_>,
    strategy: &str,
    token: &str,
    req: Option<Ipv4Addr>,
    via: &[Ipv4Addr],
) -> Result<Option<Allocation>> {
    let found = rt
        .store(Prefix::Subnets)?
        .iter::<Subnet>()
        .find(|s| {
            s.strategy == strategy
                && via.iter().any(|v| is_global_unicast(*v) && s.in_subnet_range(*v))
        })
        .cloned();
    let Some(mut subnet) = found else {
        return Ok(None);
    };
    if !subnet.enabled || subnet.only_reservations {
        debug!(subnet = %subnet.name, "subnet does not hand out addresses");
        return Ok(None);
    }
    if subnet.proxy {
        return Ok(Some(Allocation {
            lease: fake(Ipv4Addr::UNSPECIFIED, strategy, token),
            subnet: Some(subnet),
            reservation: None,
            fresh: false,
        }));
    }

    let (lower, upper) = subnet.active_bounds();
    let leases: HashMap<Ipv4Addr, Lease> = rt
        .between::<Lease>(lower.clone(), upper.clone())?
        .into_iter()
        .map(|l| (l.addr, l))
        .collect();
    let reserved: HashSet<Ipv4Addr> = rt
        .between::<Reservation>(lower, upper)?
        .into_iter()
        .map(|r| r.addr)
        .collect();

    let owned = leases
        .values()
        .find(|l| {
            l.owned_by(strategy, token)
                && !reserved.contains(&l.addr)
                && (req.is_none() || req == Some(l.addr))
        })
        .cloned();
    if let Some(lease) = owned {
        return Ok(Some(Allocation {
            lease,
            subnet: Some(subnet),
            reservation: None,
            fresh: false,
        }));
    }

    let cursor = subnet.next_leasable_ip;
    let mut pool = Pool {
        subnet: &mut subnet,
        leases,
        reserved,
    };
    let picked = pool.pick(strategy, token, req).map(|addr| match pool.leases.remove(&addr) {
        Some(mut lease) => {
            lease.strategy = strategy.to_string();
            lease.token = token.to_string();
            lease
        }
        None => Lease::new(addr, strategy, token),
    });
    if subnet.next_leasable_ip != cursor {
        subnet = rt.save(subnet)?;
    }
    let Some(mut lease) = picked else {
        info!(subnet = %subnet.name, "no free address");
        return Ok(None);
    };
    lease.state = LeaseState::Probe;
    Ok(Some(Allocation {
        lease,
        subnet: Some(subnet),
        reservation: None,
        fresh: true,
    }))
}

fn find_or_create_in(
    rt: &mut RequestTracker<'_>,
    strategy: &str,
    token: &str,
    req: Option<Ipv4Addr>,
    via: &[Ipv4Addr],
) -> Result<Option<Allocation>> {
    let held = match existing(rt, strategy, token, req) {
        Ok(held) => held,
        Err(e) if e.is_nak() => {
            debug!(error = %e, "not reusing requested lease");
            None
        }
        Err(e) => return Err(e),
    };

    let mut alloc = None;
    if let Some(lease) = held {
        let reservation = rt.find::<Reservation>(&lease.key())?;
        let subnet = subnet_for(rt, lease.addr)?;
        match (&subnet, &reservation) {
            (None, None) => {
                debug!(addr = %lease.addr, "dropping lease nothing covers");
                rt.remove::<Lease>(&lease.key())?;
            }
            (Some(s), None) if !s.enabled || s.proxy => {}
            _ => {
                alloc = Some(Allocation {
                    lease,
                    subnet,
                    reservation,
                    fresh: false,
                })
            }
        }
    }
    if alloc.is_none() {
        alloc = via_reservation(rt, strategy, token, req)?;
    }
    if alloc.is_none() {
        alloc = via_subnet(rt, strategy, token, req, via)?;
    }
    let Some(mut alloc) = alloc else {
        return Ok(None);
    };
    if alloc.lease.is_fake() {
        return Ok(Some(alloc));
    }

    let key = alloc.lease.key();
    drop_superseded(rt, strategy, token, &key)?;

    alloc.lease.expire_time = Utc::now() + alloc.duration();
    alloc.lease = if rt.contains::<Lease>(&key)? {
        rt.save(alloc.lease)?
    } else {
        rt.create(alloc.lease)?
    };
    Ok(Some(alloc))
}

/// Find or allocate a lease for a client in a DHCPDISCOVER
///
/// Tried in order: the lease the client already holds, a reservation for
/// the client, then a pick from the subnet that one of the `via`
/// addresses lives in. A freshly picked lease comes back in the
/// [`LeaseState::Probe`] state with `fresh` set; a proxy subnet yields a
/// fake lease that is never stored.
pub fn find_or_create_lease(
    dt: &DataTracker,
    strategy: &str,
    token: &str,
    req: Option<Ipv4Addr>,
    via: &[Ipv4Addr],
) -> Result<Option<Allocation>> {
    dhcp_request(dt).do_(|rt| find_or_create_in(rt, strategy, token, req, via))
}

/// A placeholder lease for answering PXE clients without handing out
/// an address
pub fn fake_lease(
    dt: &DataTracker,
    strategy: &str,
    token: &str,
    via: &[Ipv4Addr],
) -> Result<Option<Allocation>> {
    dhcp_request(dt).do_(|rt| {
        let reservation = rt
            .store(Prefix::Reservations)?
            .iter::<Reservation>()
            .find(|r| r.owned_by(strategy, token))
            .cloned();
        if let Some(reservation) = reservation {
            return Ok(Some(Allocation {
                lease: fake(Ipv4Addr::UNSPECIFIED, strategy, token),
                subnet: subnet_for(rt, reservation.addr)?,
                reservation: Some(reservation),
                fresh: false,
            }));
        }
        let subnet = rt
            .store(Prefix::Subnets)?
            .iter::<Subnet>()
            .find(|s| s.enabled && s.strategy == strategy && via.iter().any(|v| s.in_subnet_range(*v)))
            .cloned();
        Ok(subnet.map(|s| Allocation {
            lease: fake(Ipv4Addr::UNSPECIFIED, strategy, token),
            subnet: Some(s),
            reservation: None,
            fresh: false,
        }))
    })
}

/// Move a probed lease to OFFER
pub fn confirm_offer(dt: &DataTracker, lease: &Lease) -> Result<Option<Lease>> {
    dhcp_request(dt).do_(|rt| {
        let Some(mut current) = rt.find::<Lease>(&lease.key())? else {
            return Ok(None);
        };
        if !current.owned_by(&lease.strategy, &lease.token) {
            return Ok(None);
        }
        current.state = LeaseState::Offer;
        Ok(Some(rt.save(current)?))
    })
}

/// Something else answered at the address of `lease`; keep it out of
/// circulation for an hour
pub fn mark_in_use(dt: &DataTracker, lease: &Lease) -> Result<()> {
    dhcp_request(dt).do_(|rt| {
        let Some(mut current) = rt.find::<Lease>(&lease.key())? else {
            return Ok(());
        };
        current.invalidate();
        current.expire_time = Utc::now() + Duration::hours(1);
        rt.save(current)?;
        Ok(())
    })
}

/// Remove the lease at `addr`, if any
pub fn drop_lease(dt: &DataTracker, addr: Ipv4Addr) -> Result<()> {
    dhcp_request(dt).do_(|rt| {
        let key = hexaddr(addr);
        if rt.contains::<Lease>(&key)? {
            rt.remove::<Lease>(&key)?;
        }
        Ok(())
    })
}

/// Remove leases left half-allocated by an earlier run
pub fn purge_probes(dt: &DataTracker) -> Result<usize> {
    dhcp_request(dt).do_(|rt| {
        let probing: Vec<String> = rt
            .store(Prefix::Leases)?
            .iter::<Lease>()
            .filter(|l| l.state == LeaseState::Probe)
            .map(|l| l.key())
            .collect();
        for key in &probing {
            rt.remove::<Lease>(key)?;
        }
        Ok(probing.len())
    })
}

fn dispose(
    dt: &DataTracker,
    addr: Ipv4Addr,
    token_for: impl Fn(&str) -> Option<String>,
    apply: impl FnOnce(&mut Lease),
) -> Result<Disposal> {
    dhcp_request(dt).do_(|rt| {
        let Some(mut lease) = rt.find::<Lease>(&hexaddr(addr))? else {
            return Ok(Disposal::Unknown);
        };
        if token_for(&lease.strategy).as_deref() != Some(lease.token.as_str()) {
            warn!(addr = %addr, "ignoring spoofed lease change");
            return Ok(Disposal::Spoofed(lease));
        }
        apply(&mut lease);
        Ok(Disposal::Done(rt.save(lease)?))
    })
}

/// Handle a DECLINE: the client found the address in use
///
/// `token_for` computes the sender's token under a named strategy; only
/// the lease owner may decline it.
pub fn decline_lease(
    dt: &DataTracker,
    addr: Ipv4Addr,
    token_for: impl Fn(&str) -> Option<String>,
) -> Result<Disposal> {
    dispose(dt, addr, token_for, Lease::invalidate)
}

/// Handle a RELEASE: the client is done with the address
pub fn release_lease(
    dt: &DataTracker,
    addr: Ipv4Addr,
    token_for: impl Fn(&str) -> Option<String>,
) -> Result<Disposal> {
    dispose(dt, addr, token_for, Lease::expire)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use provision_store::{MemoryBacking, TrackerConfig};
    use std::sync::Arc;

    pub fn tracker() -> DataTracker {
        let config = TrackerConfig {
            file_root: std::env::temp_dir().join("provision-dhcp-tests"),
            ..TrackerConfig::default()
        };
        DataTracker::new(Arc::new(MemoryBacking::new()), config).unwrap()
    }

    pub fn seed(dt: &DataTracker, f: impl FnOnce(&mut RequestTracker<'_>)) {
        dhcp_request(dt).do_(f)
    }

    fn ip(c: u8, d: u8) -> Ipv4Addr {
        Ipv4Addr::new(192, 168, c, d)
    }

    fn lease_count(dt: &DataTracker) -> usize {
        dhcp_request(dt).do_(|rt| rt.items::<Lease>().unwrap().len())
    }

    fn find(dt: &DataTracker, addr: Ipv4Addr) -> Option<Lease> {
        dhcp_request(dt).do_(|rt| rt.find::<Lease>(&hexaddr(addr)).unwrap())
    }

    fn addr_of(r: Result<Option<Allocation>>) -> Option<Ipv4Addr> {
        r.unwrap().map(|a| a.lease.addr)
    }

    #[test]
    fn test_allocates_in_order_until_exhausted() {
        let dt = tracker();
        let via = [Ipv4Addr::new(10, 0, 0, 1)];
        seed(&dt, |rt| {
            rt.create(Subnet::new(
                "lab",
                "10.0.0.0/24",
                Ipv4Addr::new(10, 0, 0, 10),
                Ipv4Addr::new(10, 0, 0, 12),
            ))
            .unwrap();
        });

        for (token, last) in [("aa", 10), ("bb", 11), ("cc", 12)] {
            let alloc = find_or_create_lease(&dt, "MAC", token, None, &via).unwrap().unwrap();
            assert_eq!(alloc.lease.addr, Ipv4Addr::new(10, 0, 0, last));
            assert_eq!(alloc.lease.state, LeaseState::Probe);
            assert!(alloc.fresh);
        }
        assert!(find_or_create_lease(&dt, "MAC", "dd", None, &via).unwrap().is_none());
        assert_eq!(lease_count(&dt), 3);
    }

    #[test]
    fn test_reservation_wins_over_requested_address() {
        let dt = tracker();
        let reserved = Ipv4Addr::new(10, 0, 0, 5);
        seed(&dt, |rt| {
            rt.create(Reservation::new(reserved, "MAC", "bb")).unwrap();
        });

        let alloc = find_or_create_lease(&dt, "MAC", "bb", None, &[]).unwrap().unwrap();
        assert_eq!(alloc.lease.addr, reserved);
        assert!(alloc.reservation.is_some());
        assert!(!alloc.fresh);
        let left = alloc.lease.expire_time - Utc::now();
        assert!(left > Duration::seconds(RESERVATION_LEASE_SECS - 60));

        assert!(find_or_create_lease(&dt, "MAC", "cc", Some(reserved), &[])
            .unwrap()
            .is_none());
        assert_eq!(find(&dt, reserved).unwrap().token, "bb");
    }

    #[test]
    fn test_expired_lease_taken_over_on_request() {
        let dt = tracker();
        let addr = Ipv4Addr::new(10, 0, 0, 10);
        seed(&dt, |rt| {
            rt.create(Subnet::new(
                "lab",
                "10.0.0.0/24",
                addr,
                Ipv4Addr::new(10, 0, 0, 20),
            ))
            .unwrap();
            let mut old = Lease::new(addr, "MAC", "dd");
            old.expire_time = Utc::now() - Duration::minutes(5);
            rt.save(old).unwrap();
        });

        let alloc = find_lease(&dt, "MAC", "ee", Some(addr)).unwrap().unwrap();
        assert_eq!(alloc.lease.addr, addr);
        assert_eq!(alloc.lease.token, "ee");
        assert_eq!(alloc.lease.state, LeaseState::Ack);
        assert!(!alloc.lease.expired());
    }

    #[test]
    fn test_takeover_on_request_drops_clients_other_lease() {
        let dt = tracker();
        let addr = Ipv4Addr::new(10, 0, 0, 10);
        let other = Ipv4Addr::new(10, 0, 0, 11);
        seed(&dt, |rt| {
            rt.create(Subnet::new("lab", "10.0.0.0/24", addr, Ipv4Addr::new(10, 0, 0, 20)))
                .unwrap();
            let mut old = Lease::new(addr, "MAC", "dd");
            old.expire_time = Utc::now() - Duration::minutes(5);
            rt.save(old).unwrap();
            let mut live = Lease::new(other, "MAC", "ee");
            live.expire_time = Utc::now() + Duration::minutes(5);
            rt.save(live).unwrap();
        });

        let alloc = find_lease(&dt, "MAC", "ee", Some(addr)).unwrap().unwrap();
        assert_eq!(alloc.lease.addr, addr);
        assert!(find(&dt, other).is_none());
        let held: Vec<Ipv4Addr> = dhcp_request(&dt).do_(|rt| {
            rt.items::<Lease>()
                .unwrap()
                .into_iter()
                .filter(|l| l.owned_by("MAC", "ee") && !l.expired())
                .map(|l| l.addr)
                .collect()
        });
        assert_eq!(held, vec![addr]);
    }

    #[test]
    fn test_renewal_is_idempotent() {
        let dt = tracker();
        let addr = Ipv4Addr::new(10, 0, 0, 10);
        seed(&dt, |rt| {
            rt.create(Subnet::new("lab", "10.0.0.0/24", addr, Ipv4Addr::new(10, 0, 0, 20)))
                .unwrap();
            rt.create(Lease::new(addr, "MAC", "aa")).unwrap();
        });
        let first = find_lease(&dt, "MAC", "aa", Some(addr)).unwrap().unwrap();
        let second = find_lease(&dt, "MAC", "aa", Some(addr)).unwrap().unwrap();
        assert_eq!(first.lease.addr, second.lease.addr);
        assert!(second.lease.expire_time >= first.lease.expire_time);
        assert_eq!(lease_count(&dt), 1);
    }

    #[test]
    fn test_renew() {
        let dt = tracker();
        let res1 = ip(123, 10);
        let subn2 = ip(124, 81);
        seed(&dt, |rt| {
            rt.create(Reservation::new(res1, "MAC", "res1")).unwrap();
            let mut sub = Subnet::new("sn", "192.168.124.0/24", ip(124, 80), ip(124, 83));
            sub.strategy = "MAC".to_string();
            rt.create(sub).unwrap();
            rt.create(Lease::new(res1, "MAC", "res1")).unwrap();
            rt.create(Lease::new(ip(124, 80), "MAC", "subn1")).unwrap();
            rt.create(Lease::new(subn2, "MAC", "subn2")).unwrap();
        });

        assert_eq!(addr_of(find_lease(&dt, "MAC", "res1", Some(res1))), Some(res1));
        assert_eq!(
            addr_of(find_lease(&dt, "MAC", "subn1", Some(ip(124, 80)))),
            Some(ip(124, 80))
        );

        let err = find_lease(&dt, "MAC", "subn1", Some(ip(124, 82))).unwrap_err();
        assert!(err.is_nak());
        assert!(matches!(err, DhcpError::NoLease(_)));

        let err = find_lease(&dt, "MAC", "subn1", Some(res1)).unwrap_err();
        assert!(err.is_nak());

        // A reservation for someone else invalidates the lease under it
        seed(&dt, |rt| {
            rt.create(Reservation::new(subn2, "MAC", "res2")).unwrap();
        });
        let err = find_lease(&dt, "MAC", "subn2", Some(subn2)).unwrap_err();
        assert!(err.to_string().contains("conflicts with MAC:subn2"));
        let invalidated = find(&dt, subn2).unwrap();
        assert!(invalidated.token.is_empty());

        // Without a reservation or subnet the lease is removed
        seed(&dt, |rt| {
            rt.remove::<Reservation>(&hexaddr(res1)).unwrap();
        });
        let err = find_lease(&dt, "MAC", "res1", None).unwrap_err();
        assert!(err.to_string().contains("dead to us"));
        assert!(find(&dt, res1).is_none());
    }

    #[test]
    fn test_reservation_only_creates() {
        let dt = tracker();
        let via = [ip(124, 1)];
        let res1 = ip(124, 10);
        seed(&dt, |rt| {
            rt.create(Reservation::new(res1, "MAC", "res1")).unwrap();
            rt.create(Reservation::new(ip(124, 11), "MAC", "res2")).unwrap();
        });

        assert!(find_or_create_lease(&dt, "MAC", "nobody", None, &via).unwrap().is_none());
        assert!(find_or_create_lease(&dt, "MAC", "res1", Some(ip(124, 11)), &via)
            .unwrap()
            .is_none());
        assert_eq!(
            addr_of(find_or_create_lease(&dt, "MAC", "res1", Some(res1), &via)),
            Some(res1)
        );
        assert_eq!(addr_of(find_or_create_lease(&dt, "MAC", "res1", None, &via)), Some(res1));

        // An expired lease on the reserved address is reclaimed, a live one is not
        seed(&dt, |rt| {
            let mut other = Lease::new(ip(124, 11), "MAC", "intruder");
            other.expire_time = Utc::now() + Duration::hours(1);
            rt.save(other).unwrap();
        });
        assert!(find_or_create_lease(&dt, "MAC", "res2", None, &via).unwrap().is_none());
        seed(&dt, |rt| {
            let mut other = rt.find::<Lease>(&hexaddr(ip(124, 11))).unwrap().unwrap();
            other.expire();
            rt.save(other).unwrap();
        });
        let alloc = find_or_create_lease(&dt, "MAC", "res2", None, &via).unwrap().unwrap();
        assert_eq!(alloc.lease.addr, ip(124, 11));
        assert_eq!(alloc.lease.token, "res2");
    }

    #[test]
    fn test_subnet_creates() {
        let dt = tracker();
        let via = [ip(124, 1)];
        seed(&dt, |rt| {
            let mut sub = Subnet::new("sn", "192.168.124.0/24", ip(124, 80), ip(124, 83));
            sub.picker = "none".to_string();
            rt.create(sub).unwrap();
            rt.create(Reservation::new(ip(124, 83), "MAC", "res1")).unwrap();
        });

        assert!(find_or_create_lease(&dt, "MAC", "sub1", Some(ip(124, 80)), &via)
            .unwrap()
            .is_none());

        seed(&dt, |rt| {
            let mut sub = rt.find::<Subnet>("sn").unwrap().unwrap();
            sub.picker = "nextFree".to_string();
            sub.next_leasable_ip = Some(ip(124, 81));
            rt.save(sub).unwrap();
        });

        assert!(find_or_create_lease(&dt, "MAC", "sub1", Some(ip(124, 80)), &[])
            .unwrap()
            .is_none());
        assert!(find_or_create_lease(&dt, "MAC2", "sub1", Some(ip(124, 80)), &via)
            .unwrap()
            .is_none());

        let create = |token: &str, req: Option<Ipv4Addr>| {
            addr_of(find_or_create_lease(&dt, "MAC", token, req, &via))
        };
        assert_eq!(create("sub1", Some(ip(124, 81))), Some(ip(124, 81)));
        assert_eq!(create("sub2", Some(ip(124, 81))), None);
        assert_eq!(create("sub2", None), Some(ip(124, 82)));
        assert_eq!(create("sub3", None), Some(ip(124, 80)));

        seed(&dt, |rt| {
            for (last, age) in [(81, Duration::seconds(2)), (80, Duration::hours(2)), (82, Duration::hours(48))] {
                let mut l = rt.find::<Lease>(&hexaddr(ip(124, last))).unwrap().unwrap();
                l.expire_time = Utc::now() - age;
                rt.save(l).unwrap();
            }
        });

        assert_eq!(create("sub4", Some(ip(124, 83))), None);
        assert_eq!(create("sub4", Some(ip(124, 82))), Some(ip(124, 82)));
        assert_eq!(create("sub4", Some(ip(124, 82))), Some(ip(124, 82)));
        assert_eq!(create("sub4", None), Some(ip(124, 82)));
        assert_eq!(create("sub5", None), Some(ip(124, 80)));
        assert_eq!(create("sub6", None), Some(ip(124, 81)));
        assert_eq!(create("sub7", None), None);
        assert_eq!(create("res1", None), Some(ip(124, 83)));
    }

    #[test]
    fn test_proxy_and_disabled_subnets() {
        let dt = tracker();
        let via = [ip(124, 1)];
        seed(&dt, |rt| {
            let mut sub = Subnet::new("proxy", "192.168.124.0/24", ip(124, 80), ip(124, 83));
            sub.proxy = true;
            rt.create(sub).unwrap();
            let mut off = Subnet::new("off", "192.168.125.0/24", ip(125, 80), ip(125, 83));
            off.enabled = false;
            rt.create(off).unwrap();
        });

        let alloc = find_or_create_lease(&dt, "MAC", "aa", None, &via).unwrap().unwrap();
        assert!(alloc.lease.is_fake());
        assert_eq!(alloc.lease.addr, Ipv4Addr::UNSPECIFIED);
        assert_eq!(lease_count(&dt), 0);

        let alloc = find_lease(&dt, "MAC", "aa", Some(ip(124, 90))).unwrap().unwrap();
        assert!(alloc.lease.is_fake());

        assert!(find_or_create_lease(&dt, "MAC", "aa", None, &[ip(125, 1)]).unwrap().is_none());
        assert!(find_lease(&dt, "MAC", "aa", Some(ip(125, 90))).unwrap().is_none());
        assert!(find_lease(&dt, "MAC", "aa", Some(ip(126, 90))).unwrap().is_none());

        let alloc = fake_lease(&dt, "MAC", "aa", &via).unwrap().unwrap();
        assert_eq!(alloc.subnet.unwrap().name, "proxy");
        assert!(fake_lease(&dt, "MAC", "aa", &[ip(127, 1)]).unwrap().is_none());
    }

    #[test]
    fn test_new_lease_replaces_old_one() {
        let dt = tracker();
        let via = [ip(124, 1)];
        seed(&dt, |rt| {
            rt.create(Subnet::new("sn", "192.168.124.0/24", ip(124, 80), ip(124, 90)))
                .unwrap();
        });
        assert_eq!(
            addr_of(find_or_create_lease(&dt, "MAC", "aa", None, &via)),
            Some(ip(124, 80))
        );
        assert_eq!(
            addr_of(find_or_create_lease(&dt, "MAC", "aa", Some(ip(124, 85)), &via)),
            Some(ip(124, 85))
        );
        assert_eq!(lease_count(&dt), 1);
        assert!(find(&dt, ip(124, 80)).is_none());
    }

    #[test]
    fn test_probe_outcomes() {
        let dt = tracker();
        let via = [ip(124, 1)];
        seed(&dt, |rt| {
            rt.create(Subnet::new("sn", "192.168.124.0/24", ip(124, 80), ip(124, 81)))
                .unwrap();
        });
        let first = find_or_create_lease(&dt, "MAC", "aa", None, &via).unwrap().unwrap();
        mark_in_use(&dt, &first.lease).unwrap();
        let marked = find(&dt, first.lease.addr).unwrap();
        assert!(!marked.valid());
        assert!(!marked.expired());

        let second = find_or_create_lease(&dt, "MAC", "aa", None, &via).unwrap().unwrap();
        assert_eq!(second.lease.addr, ip(124, 81));
        let offered = confirm_offer(&dt, &second.lease).unwrap().unwrap();
        assert_eq!(offered.state, LeaseState::Offer);

        let again = find_or_create_lease(&dt, "MAC", "aa", None, &via).unwrap().unwrap();
        assert!(!again.fresh);
        assert_eq!(again.lease.state, LeaseState::Offer);

        drop_lease(&dt, ip(124, 81)).unwrap();
        assert!(find(&dt, ip(124, 81)).is_none());
    }

    #[test]
    fn test_purge_probes() {
        let dt = tracker();
        let via = [ip(124, 1)];
        seed(&dt, |rt| {
            rt.create(Subnet::new("sn", "192.168.124.0/24", ip(124, 80), ip(124, 90)))
                .unwrap();
        });
        find_or_create_lease(&dt, "MAC", "aa", None, &via).unwrap();
        let kept = find_or_create_lease(&dt, "MAC", "bb", None, &via).unwrap().unwrap();
        confirm_offer(&dt, &kept.lease).unwrap();
        assert_eq!(purge_probes(&dt).unwrap(), 1);
        assert_eq!(lease_count(&dt), 1);
    }

    #[test]
    fn test_decline_and_release_check_owner() {
        let dt = tracker();
        let addr = ip(124, 80);
        seed(&dt, |rt| {
            rt.create(Subnet::new("sn", "192.168.124.0/24", addr, ip(124, 90))).unwrap();
            let mut l = Lease::new(addr, "MAC", "aa");
            l.expire_time = Utc::now() + Duration::hours(1);
            rt.create(l).unwrap();
        });
        let as_token = |token: &'static str| move |_: &str| Some(token.to_string());

        assert_eq!(release_lease(&dt, ip(124, 99), as_token("aa")).unwrap(), Disposal::Unknown);
        assert!(matches!(
            release_lease(&dt, addr, as_token("bb")).unwrap(),
            Disposal::Spoofed(_)
        ));
        assert!(find(&dt, addr).unwrap().valid());

        match release_lease(&dt, addr, as_token("aa")).unwrap() {
            Disposal::Done(l) => assert_eq!(l.token, "aa"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(find(&dt, addr).unwrap().expired());

        match decline_lease(&dt, addr, as_token("aa")).unwrap() {
            Disposal::Done(l) => assert!(l.token.is_empty()),
            other => panic!("unexpected {:?}", other),
        }
    }
}
