use super::{validate_ip4, Hooks};
use crate::error::Result;
use crate::index::check_unique;
use crate::request::RequestTracker;
use provision_models::{Lease, Model, ModelError, Reservation, Subnet};

pub struct LeaseHooks;

impl Hooks<Lease> for LeaseHooks {
    fn on_create(&self, rt: &mut RequestTracker<'_>, lease: &mut Lease) -> Result<()> {
        let mut err = ModelError::validation(lease);
        validate_ip4(&mut err, lease.addr);
        if lease.token.is_empty() {
            err.push("Lease Token cannot be empty!");
        }
        if lease.strategy.is_empty() {
            err.push("Lease Strategy cannot be empty!");
        }
        if err.has_errors() {
            return Err(err.into());
        }
        let key = lease.key();
        if let Some(res) = rt.find::<Reservation>(&key)? {
            if !res.owned_by(&lease.strategy, &lease.token) {
                err.push(format!(
                    "Reservation {} ({}:{}) conflicts with {}:{}",
                    res.addr,
                    res.strategy,
                    res.token,
                    lease.strategy,
                    lease.token
                ));
                return Err(err.into());
            }
            return Ok(());
        }

        if let Some(other) = rt
            .store(Lease::PREFIX)?
            .iter::<Lease>()
            .find(|l| l.key() != key && !l.expired() && l.owned_by(&lease.strategy, &lease.token))
        {
            err.push(format!(
                "Lease {} already has Strategy {}: Token {}",
                other.key(),
                lease.strategy,
                lease.token
            ));
            return Err(err.into());
        }

        let subnet = rt
            .store(Subnet::PREFIX)?
            .iter::<Subnet>()
            .find(|s| s.in_subnet_range(lease.addr))
            .cloned();
        match subnet.as_ref().and_then(|s| s.network().map(|n| (s, n))) {
            None => {
                err.push("Cannot create Lease without a reservation or a subnet");
            }
            Some((s, net)) if lease.addr == net.network() || lease.addr == net.broadcast() => {
                err.push(format!(
                    "Address {} is a network or broadcast address for subnet {}",
                    lease.addr, s.name
                ));
            }
            Some(_) => {}
        }
        Ok(err.or_ok()?)
    }

    fn on_change(&self, _rt: &mut RequestTracker<'_>, old: &Lease, lease: &mut Lease) -> Result<()> {
        let mut err = ModelError::validation(lease);
        if lease.token != old.token {
            err.push("Token cannot change");
        }
        if lease.strategy != old.strategy {
            err.push("Strategy cannot change");
        }
        Ok(err.or_ok()?)
    }

    fn before_save(&self, rt: &mut RequestTracker<'_>, _old: Option<&Lease>, lease: &mut Lease) -> Result<()> {
        let others = rt.items::<Lease>()?;
        Ok(check_unique(lease, &others)?)
    }
}
