//! Ordered queries over object collections
//!
//! An [`Index`] is a snapshot of items that can be sorted by one of the
//! per-field [`Maker`]s a type declares, then narrowed with range and
//! predicate filters. Range filters binary search the sorted items, so a
//! maker must provide both an ordering and a way to build a reference
//! item from a query string.

use provision_models::{Model, ModelError};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexError {
    /// A range filter was used before `sort`
    #[error("index is not sorted")]
    Unsorted,

    /// The query value could not be parsed for the field
    #[error("invalid {kind} value {value}: {message}")]
    BadValue {
        kind: &'static str,
        value: String,
        message: String,
    },

    #[error("no index named {0}")]
    NoSuchIndex(String),
}

type LessFn<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;
type FillFn<T> = Arc<dyn Fn(&str) -> Result<T, String> + Send + Sync>;

/// Ordering and parse functions for one field of `T`
pub struct Maker<T> {
    pub kind: &'static str,
    pub unique: bool,
    less: LessFn<T>,
    fill: FillFn<T>,
}

impl<T> Clone for Maker<T> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            unique: self.unique,
            less: self.less.clone(),
            fill: self.fill.clone(),
        }
    }
}

impl<T> fmt::Debug for Maker<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Maker")
            .field("kind", &self.kind)
            .field("unique", &self.unique)
            .finish_non_exhaustive()
    }
}

impl<T> Maker<T> {
    pub fn new(
        kind: &'static str,
        unique: bool,
        less: impl Fn(&T, &T) -> bool + Send + Sync + 'static,
        fill: impl Fn(&str) -> Result<T, String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            unique,
            less: Arc::new(less),
            fill: Arc::new(fill),
        }
    }

    pub fn less(&self, a: &T, b: &T) -> bool {
        (self.less)(a, b)
    }

    pub fn compare(&self, a: &T, b: &T) -> Ordering {
        if self.less(a, b) {
            Ordering::Less
        } else if self.less(b, a) {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }

    /// Reference item for a query string
    pub fn fill(&self, value: &str) -> Result<T, IndexError> {
        (self.fill)(value).map_err(|message| IndexError::BadValue {
            kind: self.kind,
            value: value.to_string(),
            message,
        })
    }
}

/// Types that declare per-field indexes
pub trait Indexed: Sized {
    fn indexes() -> BTreeMap<&'static str, Maker<Self>>;
}

/// A queryable snapshot of items
#[derive(Debug)]
pub struct Index<T> {
    items: Vec<T>,
    sorter: Option<Maker<T>>,
}

impl<T> Index<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items,
            sorter: None,
        }
    }

    pub fn items(self) -> Vec<T> {
        self.items
    }

    pub fn count(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Sort by `maker`, enabling range filters on its field
    pub fn sort(mut self, maker: &Maker<T>) -> Self {
        self.items.sort_by(|a, b| maker.compare(a, b));
        self.sorter = Some(maker.clone());
        self
    }

    fn sorter(&self) -> Result<&Maker<T>, IndexError> {
        self.sorter.as_ref().ok_or(IndexError::Unsorted)
    }

    /// Items in `[lower, upper)` where `lower` is the first item passing
    /// `lower_test` and `upper` the first passing `upper_test`
    pub fn subset(
        mut self,
        lower_test: impl Fn(&T) -> bool,
        upper_test: impl Fn(&T) -> bool,
    ) -> Self {
        let lo = self.items.partition_point(|i| !lower_test(i));
        let hi = self.items.partition_point(|i| !upper_test(i)).max(lo);
        self.items.truncate(hi);
        self.items.drain(..lo);
        self
    }

    /// Items whose field lies in `[lower, upper]`
    pub fn between(self, lower: &str, upper: &str) -> Result<Self, IndexError> {
        let maker = self.sorter()?.clone();
        let lo = maker.fill(lower)?;
        let hi = maker.fill(upper)?;
        Ok(self.subset(
            |i| !maker.less(i, &lo),
            |i| maker.less(&hi, i),
        ))
    }

    pub fn eq(self, value: &str) -> Result<Self, IndexError> {
        self.between(value, value)
    }

    pub fn ne(self, value: &str) -> Result<Self, IndexError> {
        let maker = self.sorter()?.clone();
        let reference = maker.fill(value)?;
        Ok(self.select(|i| maker.compare(i, &reference) != Ordering::Equal))
    }

    pub fn lt(self, value: &str) -> Result<Self, IndexError> {
        let maker = self.sorter()?.clone();
        let reference = maker.fill(value)?;
        Ok(self.subset(|_| true, |i| !maker.less(i, &reference)))
    }

    pub fn lte(self, value: &str) -> Result<Self, IndexError> {
        let maker = self.sorter()?.clone();
        let reference = maker.fill(value)?;
        Ok(self.subset(|_| true, |i| maker.less(&reference, i)))
    }

    pub fn gt(self, value: &str) -> Result<Self, IndexError> {
        let maker = self.sorter()?.clone();
        let reference = maker.fill(value)?;
        Ok(self.subset(|i| maker.less(&reference, i), |_| false))
    }

    pub fn gte(self, value: &str) -> Result<Self, IndexError> {
        let maker = self.sorter()?.clone();
        let reference = maker.fill(value)?;
        Ok(self.subset(|i| !maker.less(i, &reference), |_| false))
    }

    pub fn select(mut self, pred: impl Fn(&T) -> bool) -> Self {
        self.items.retain(|i| pred(i));
        self
    }

    pub fn offset(mut self, n: usize) -> Self {
        let n = n.min(self.items.len());
        self.items.drain(..n);
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.items.truncate(n);
        self
    }

    pub fn reverse(mut self) -> Self {
        self.items.reverse();
        self
    }
}

impl<T: Indexed> Index<T> {
    /// Sort by a named index of `T`
    pub fn sort_by_name(self, name: &str) -> Result<Self, IndexError> {
        let indexes = T::indexes();
        let maker = indexes
            .get(name)
            .ok_or_else(|| IndexError::NoSuchIndex(name.to_string()))?;
        Ok(self.sort(maker))
    }
}

/// Reject `obj` if it collides with another item on any unique index
pub fn check_unique<T: Model + Indexed>(obj: &T, others: &[T]) -> Result<(), ModelError> {
    let key = obj.key();
    let mut err = ModelError::validation(obj);
    for (name, maker) in T::indexes() {
        if !maker.unique {
            continue;
        }
        for other in others {
            if other.key() == key {
                continue;
            }
            if maker.compare(obj, other) == Ordering::Equal {
                err.push(format!(
                    "{} {} violates unique index {} with {}",
                    T::PREFIX,
                    key,
                    name,
                    other.key()
                ));
            }
        }
    }
    err.or_ok()
}
