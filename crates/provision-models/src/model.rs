//! Store prefixes and the typed object layer

use crate::validation::Validation;
use crate::{BootEnv, Job, Lease, Machine, Profile, Reservation, Stage, Subnet, Task};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Name of one object collection
///
/// The derived ordering is the global lock order: whenever several
/// stores are locked together they are locked in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Prefix {
    Bootenvs,
    Jobs,
    Leases,
    Machines,
    Profiles,
    Reservations,
    Stages,
    Subnets,
    Tasks,
}

impl Prefix {
    pub const ALL: [Prefix; 9] = [
        Prefix::Bootenvs,
        Prefix::Jobs,
        Prefix::Leases,
        Prefix::Machines,
        Prefix::Profiles,
        Prefix::Reservations,
        Prefix::Stages,
        Prefix::Subnets,
        Prefix::Tasks,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Prefix::Bootenvs => "bootenvs",
            Prefix::Jobs => "jobs",
            Prefix::Leases => "leases",
            Prefix::Machines => "machines",
            Prefix::Profiles => "profiles",
            Prefix::Reservations => "reservations",
            Prefix::Stages => "stages",
            Prefix::Subnets => "subnets",
            Prefix::Tasks => "tasks",
        }
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Prefix {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Prefix::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown prefix {}", s))
    }
}

/// A persisted object type
///
/// `into_object`/`from_object` connect the type to its [`Object`]
/// variant, so generic store code can hold heterogeneous collections
/// and still hand back concrete types without casting.
pub trait Model:
    Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const PREFIX: Prefix;

    /// Identity key within the prefix
    fn key(&self) -> String;

    /// Normalize defaults before a write
    fn fill(&mut self) {}

    /// Validation state, for types that carry one
    fn validation_mut(&mut self) -> Option<&mut Validation> {
        None
    }

    fn into_object(self) -> Object;

    fn from_object(obj: &Object) -> Option<&Self>;
}

/// Any persisted object, tagged by type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Object {
    BootEnv(BootEnv),
    Job(Job),
    Lease(Lease),
    Machine(Machine),
    Profile(Profile),
    Reservation(Reservation),
    Stage(Stage),
    Subnet(Subnet),
    Task(Task),
}

macro_rules! object_variants {
    ($($variant:ident => $prefix:ident),* $(,)?) => {
        impl Object {
            pub fn prefix(&self) -> Prefix {
                match self {
                    $(Object::$variant(_) => Prefix::$prefix,)*
                }
            }

            pub fn key(&self) -> String {
                match self {
                    $(Object::$variant(o) => o.key(),)*
                }
            }

            /// JSON body of the wrapped object, without the variant tag
            pub fn to_value(&self) -> serde_json::Result<serde_json::Value> {
                match self {
                    $(Object::$variant(o) => serde_json::to_value(o),)*
                }
            }

            /// Decode a stored JSON body for the given prefix
            pub fn from_slice(prefix: Prefix, data: &[u8]) -> serde_json::Result<Object> {
                match prefix {
                    $(Prefix::$prefix => serde_json::from_slice::<$variant>(data).map(Object::$variant),)*
                }
            }
        }

        $(
            impl From<$variant> for Object {
                fn from(o: $variant) -> Self {
                    Object::$variant(o)
                }
            }
        )*
    };
}

object_variants! {
    BootEnv => Bootenvs,
    Job => Jobs,
    Lease => Leases,
    Machine => Machines,
    Profile => Profiles,
    Reservation => Reservations,
    Stage => Stages,
    Subnet => Subnets,
    Task => Tasks,
}

/// Implements the `Object` plumbing of [`Model`] for a type
#[macro_export]
macro_rules! object_conversions {
    ($variant:ident) => {
        fn into_object(self) -> $crate::Object {
            $crate::Object::$variant(self)
        }

        fn from_object(obj: &$crate::Object) -> Option<&Self> {
            match obj {
                $crate::Object::$variant(o) => Some(o),
                _ => None,
            }
        }
    };
}
