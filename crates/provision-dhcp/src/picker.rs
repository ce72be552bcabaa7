//! Address pickers
//!
//! A subnet names one picker; each name expands to a chain that is
//! tried in order until one of them produces an address or refuses
//! outright:
//!
//! | picker        | chain                          |
//! |---------------|--------------------------------|
//! | `none`        | none                           |
//! | `nextFree`    | hint, nextFree, mostExpired    |
//! | `mostExpired` | hint, mostExpired              |
//!
//! Only addresses nobody holds a lease on count as free. Expired
//! leases are reclaimed by `mostExpired` alone, oldest first.

use provision_models::{Lease, Subnet};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;

/// What a picker decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pick {
    /// Use this address
    Addr(Ipv4Addr),
    /// Nothing here, try the next picker
    Next,
    /// Refuse; no later picker may hand out an address
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Picker {
    None,
    Hint,
    NextFree,
    MostExpired,
}

impl Picker {
    /// The chain a subnet picker name expands to
    pub fn chain(name: &str) -> &'static [Picker] {
        match name {
            "none" => &[Picker::None],
            "mostExpired" => &[Picker::Hint, Picker::MostExpired],
            _ => &[Picker::Hint, Picker::NextFree, Picker::MostExpired],
        }
    }
}

/// The active range of one subnet and what is already taken in it
pub struct Pool<'a> {
    pub subnet: &'a mut Subnet,
    /// Leases inside the active range, keyed by address
    pub leases: HashMap<Ipv4Addr, Lease>,
    /// Reserved addresses inside the active range
    pub reserved: HashSet<Ipv4Addr>,
}

impl Pool<'_> {
    /// Run the subnet's picker chain
    pub fn pick(&mut self, strategy: &str, token: &str, hint: Option<Ipv4Addr>) -> Option<Ipv4Addr> {
        for picker in Picker::chain(&self.subnet.picker) {
            let pick = match picker {
                Picker::None => Pick::Stop,
                Picker::Hint => self.pick_hint(strategy, token, hint),
                Picker::NextFree => self.pick_next_free(),
                Picker::MostExpired => self.pick_most_expired(),
            };
            match pick {
                Pick::Addr(addr) => return Some(addr),
                Pick::Stop => return None,
                Pick::Next => continue,
            }
        }
        None
    }

    /// The address the client asked for, if it may have it
    fn pick_hint(&self, strategy: &str, token: &str, hint: Option<Ipv4Addr>) -> Pick {
        let Some(addr) = hint.filter(|a| self.subnet.in_active_range(*a)) else {
            return Pick::Next;
        };
        if self.reserved.contains(&addr) {
            return Pick::Stop;
        }
        match self.leases.get(&addr) {
            None => Pick::Addr(addr),
            Some(l) if l.owned_by(strategy, token) || l.expired() => Pick::Addr(addr),
            Some(_) => Pick::Stop,
        }
    }

    fn pick_next_free(&mut self) -> Pick {
        let used: HashSet<Ipv4Addr> = self
            .leases
            .keys()
            .chain(self.reserved.iter())
            .copied()
            .collect();
        let cursor = self.subnet.next_leasable_ip.unwrap_or(self.subnet.active_start);
        match next_free(self.subnet.active_start, self.subnet.active_end, cursor, &used) {
            Some((addr, next)) => {
                self.subnet.next_leasable_ip = Some(next);
                Pick::Addr(addr)
            }
            None => Pick::Next,
        }
    }

    fn pick_most_expired(&self) -> Pick {
        self.leases
            .values()
            .filter(|l| l.expired() && !self.reserved.contains(&l.addr))
            .min_by_key(|l| l.expire_time)
            .map(|l| Pick::Addr(l.addr))
            .unwrap_or(Pick::Next)
    }
}

/// First address in `[start, end]` not in `used`, scanning from `cursor`
/// to `end` and then from `start` up to `cursor`
///
/// Returns the address and the cursor to resume from next time.
pub fn next_free(
    start: Ipv4Addr,
    end: Ipv4Addr,
    cursor: Ipv4Addr,
    used: &HashSet<Ipv4Addr>,
) -> Option<(Ipv4Addr, Ipv4Addr)> {
    let (start, end) = (u32::from(start), u32::from(end));
    let cursor = u32::from(cursor).clamp(start, end.max(start));
    (cursor..=end)
        .chain(start..cursor)
        .map(Ipv4Addr::from)
        .find(|a| !used.contains(a))
        .map(|a| {
            let next = u32::from(a).checked_add(1).unwrap_or(start);
            (a, Ipv4Addr::from(next))
        })
}
