//! Which stores an operation on each entity must lock

use provision_models::Prefix;
use std::fmt;
use std::str::FromStr;

/// Kinds of request made against an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Get,
    Create,
    Update,
    Patch,
    Delete,
    Actions,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Get => "get",
            Action::Create => "create",
            Action::Update => "update",
            Action::Patch => "patch",
            Action::Delete => "delete",
            Action::Actions => "actions",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "get" => Ok(Action::Get),
            "create" => Ok(Action::Create),
            "update" => Ok(Action::Update),
            "patch" => Ok(Action::Patch),
            "delete" => Ok(Action::Delete),
            "actions" => Ok(Action::Actions),
            other => Err(format!("unknown action {}", other)),
        }
    }
}

use Prefix::*;

const DHCP_LOCKS: &[Prefix] = &[Leases, Reservations, Subnets];

/// Stores to lock for `action` on objects under `prefix`
///
/// The returned order is not significant; the tracker always locks in
/// [`Prefix`] order.
pub fn locks_for(prefix: Prefix, action: Action) -> &'static [Prefix] {
    match (prefix, action) {
        (Leases | Reservations | Subnets, _) => DHCP_LOCKS,

        (Machines, Action::Get | Action::Actions) => &[Stages, Bootenvs, Machines, Profiles],
        (Machines, Action::Delete) => &[Stages, Bootenvs, Machines, Jobs, Tasks],
        (Machines, _) => &[Stages, Bootenvs, Machines, Tasks, Profiles],

        (Jobs, Action::Get) => &[Jobs],
        (Jobs, Action::Delete) => &[Machines, Jobs],
        (Jobs, Action::Actions) => &[Stages, Jobs, Machines, Tasks, Profiles, Bootenvs],
        (Jobs, _) => &[Stages, Bootenvs, Jobs, Machines, Tasks, Profiles],

        (Bootenvs, Action::Get | Action::Actions) => &[Bootenvs],
        (Bootenvs, _) => &[Stages, Bootenvs, Machines, Tasks, Profiles],

        (Stages, Action::Get) => &[Stages],
        (Stages, Action::Actions) => &[Stages, Profiles],
        (Stages, _) => &[Stages, Bootenvs, Machines, Tasks, Profiles],

        (Tasks, Action::Get | Action::Actions) => &[Tasks],
        (Tasks, _) => &[Tasks, Stages, Machines, Jobs],

        (Profiles, Action::Get | Action::Actions) => &[Profiles],
        (Profiles, _) => &[Profiles, Machines, Stages],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dhcp_entities_share_locks() {
        for p in [Leases, Reservations, Subnets] {
            for a in [Action::Get, Action::Create, Action::Delete, Action::Actions] {
                assert_eq!(locks_for(p, a), DHCP_LOCKS);
            }
        }
    }

    #[test]
    fn test_machine_delete_locks_jobs() {
        assert!(locks_for(Machines, Action::Delete).contains(&Jobs));
        assert!(!locks_for(Machines, Action::Update).contains(&Jobs));
        assert!(locks_for(Machines, Action::Patch).contains(&Tasks));
    }

    #[test]
    fn test_every_write_locks_its_own_prefix() {
        for p in Prefix::ALL {
            for a in [Action::Get, Action::Create, Action::Update, Action::Patch, Action::Delete] {
                assert!(locks_for(p, a).contains(&p), "{} {}", p, a);
            }
        }
    }

    #[test]
    fn test_action_parse() {
        assert_eq!("patch".parse::<Action>().unwrap(), Action::Patch);
        assert!("frob".parse::<Action>().is_err());
    }
}
