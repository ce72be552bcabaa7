//! In-memory collection of decoded objects for one prefix

use crate::index::Index;
use provision_models::{Model, Object, Prefix};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;

/// Objects of one prefix, ordered by key
#[derive(Debug)]
pub struct Store {
    prefix: Prefix,
    objs: BTreeMap<String, Object>,
}

impl Store {
    pub fn new(prefix: Prefix) -> Self {
        Self {
            prefix,
            objs: BTreeMap::new(),
        }
    }

    pub fn prefix(&self) -> Prefix {
        self.prefix
    }

    pub fn len(&self) -> usize {
        self.objs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objs.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objs.contains_key(key)
    }

    pub fn find(&self, key: &str) -> Option<&Object> {
        self.objs.get(key)
    }

    /// Typed lookup; `None` if missing or stored under another type
    pub fn get<T: Model>(&self, key: &str) -> Option<&T> {
        self.objs.get(key).and_then(T::from_object)
    }

    /// Typed view of every object, in key order
    pub fn iter<T: Model>(&self) -> impl Iterator<Item = &T> {
        self.objs.values().filter_map(T::from_object)
    }

    pub fn items<T: Model>(&self) -> Vec<T> {
        self.iter::<T>().cloned().collect()
    }

    /// Objects whose keys fall in `range`, in key order
    ///
    /// Lease and reservation keys are fixed-width hex addresses, so a key
    /// range is an address range.
    pub fn between<T: Model>(&self, range: RangeInclusive<String>) -> Vec<T> {
        if range.start() > range.end() {
            return Vec::new();
        }
        self.objs
            .range(range)
            .filter_map(|(_, o)| T::from_object(o))
            .cloned()
            .collect()
    }

    /// An index snapshot for querying
    pub fn index<T: Model>(&self) -> Index<T> {
        Index::new(self.items())
    }

    pub(crate) fn insert(&mut self, obj: Object) -> Option<Object> {
        self.objs.insert(obj.key(), obj)
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<Object> {
        self.objs.remove(key)
    }
}
