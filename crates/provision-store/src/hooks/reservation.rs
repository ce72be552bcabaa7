use super::{validate_ip4, Hooks};
use crate::error::Result;
use crate::request::RequestTracker;
use provision_models::{Model, ModelError, Reservation};

pub struct ReservationHooks;

impl Hooks<Reservation> for ReservationHooks {
    fn before_save(
        &self,
        rt: &mut RequestTracker<'_>,
        _old: Option<&Reservation>,
        res: &mut Reservation,
    ) -> Result<()> {
        let mut err = ModelError::validation(res);
        validate_ip4(&mut err, res.addr);
        if res.token.is_empty() {
            err.push("Reservation Token cannot be empty!");
        }
        if res.strategy.is_empty() {
            err.push("Reservation Strategy cannot be empty!");
        }
        if res.next_server.is_some_and(|ns| ns.is_unspecified()) {
            res.next_server = None;
        }
        if let Some(ns) = res.next_server {
            validate_ip4(&mut err, ns);
        }
        let key = res.key();
        if let Some(other) = rt
            .store(Reservation::PREFIX)?
            .iter::<Reservation>()
            .find(|r| r.key() != key && r.owned_by(&res.strategy, &res.token))
        {
            err.push(format!(
                "Reservation {} already has Strategy {}: Token {}",
                other.key(),
                res.strategy,
                res.token
            ));
        }
        Ok(err.or_ok()?)
    }
}
