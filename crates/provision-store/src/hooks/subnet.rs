use super::{validate_ip4, Hooks};
use crate::error::Result;
use crate::request::RequestTracker;
use ipnetwork::Ipv4Network;
use provision_models::{
    Model, ModelError, Subnet, MIN_ACTIVE_LEASE_SECS, MIN_RESERVED_LEASE_SECS, PICKERS,
};

pub struct SubnetHooks;

impl Hooks<Subnet> for SubnetHooks {
    fn before_save(&self, rt: &mut RequestTracker<'_>, _old: Option<&Subnet>, s: &mut Subnet) -> Result<()> {
        let mut err = ModelError::validation(s);
        let net: Ipv4Network = match s.subnet.parse() {
            Ok(net) => net,
            Err(e) => {
                err.push(format!("Invalid subnet {}: {}", s.subnet, e));
                return Err(err.into());
            }
        };
        validate_ip4(&mut err, net.network());
        if s.strategy.is_empty() {
            err.push("Strategy must have a value");
        }
        if !PICKERS.contains(&s.picker.as_str()) {
            err.push(format!("Unknown picker {}", s.picker));
        }
        if !s.only_reservations {
            validate_ip4(&mut err, s.active_start);
            validate_ip4(&mut err, s.active_end);
            if !net.contains(s.active_start) {
                err.push(format!("ActiveStart {} not in subnet range {}", s.active_start, net));
            }
            if !net.contains(s.active_end) {
                err.push(format!("ActiveEnd {} not in subnet range {}", s.active_end, net));
            }
            if s.active_start >= s.active_end {
                err.push("ActiveStart must be less than ActiveEnd");
            }
            if s.active_lease_time < MIN_ACTIVE_LEASE_SECS {
                err.push(format!(
                    "ActiveLeaseTime must be greater than or equal to {} seconds, not {}",
                    MIN_ACTIVE_LEASE_SECS, s.active_lease_time
                ));
            }
        }
        if s.reserved_lease_time < MIN_RESERVED_LEASE_SECS {
            err.push(format!(
                "ReservedLeaseTime must be greater than or equal to {} seconds, not {}",
                MIN_RESERVED_LEASE_SECS, s.reserved_lease_time
            ));
        }
        if err.has_errors() {
            return Err(err.into());
        }

        for other in rt.store(Subnet::PREFIX)?.iter::<Subnet>() {
            if other.name == s.name {
                continue;
            }
            let overlaps = other
                .network()
                .is_some_and(|o| o.contains(net.network()) || net.contains(o.network()));
            if overlaps {
                err.push(format!("Overlaps subnet {}", other.name));
            }
        }
        if let Some(cursor) = s.next_leasable_ip {
            if !s.in_active_range(cursor) {
                s.next_leasable_ip = None;
            }
        }
        Ok(err.or_ok()?)
    }
}
