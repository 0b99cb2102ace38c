//! Composable predicates over cluster entities
//!
//! A [`Predicate`] is a first-class, cloneable boolean test. Predicates
//! combine with `and`, `or` and `not`, and any slice of entities can be
//! narrowed with [`Filter::filter_by`], which keeps the items every
//! predicate accepts.
//!
//! ```ignore
//! let usable = devices.filter_by(&[
//!     block_device::is_active(),
//!     block_device::is_type(DiskKind::Sparse),
//!     block_device::is_usable(used),
//! ]);
//! ```

use kube::Resource;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// Predicate
// =============================================================================

/// Boolean test over `T`
pub struct Predicate<T> {
    name: Arc<str>,
    check: Arc<dyn Fn(&T) -> bool + Send + Sync>,
}

impl<T> Clone for Predicate<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            check: self.check.clone(),
        }
    }
}

impl<T> fmt::Debug for Predicate<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Predicate").field(&self.name).finish()
    }
}

impl<T> Predicate<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn matches(&self, item: &T) -> bool {
        (self.check)(item)
    }
}

impl<T: 'static> Predicate<T> {
    /// Wrap a closure as a named predicate
    pub fn new(name: impl Into<String>, check: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        Self {
            name: Arc::from(name.into()),
            check: Arc::new(check),
        }
    }

    pub fn and(self, other: Predicate<T>) -> Self {
        let name = format!("({} && {})", self.name, other.name);
        Self::new(name, move |item| self.matches(item) && other.matches(item))
    }

    pub fn or(self, other: Predicate<T>) -> Self {
        let name = format!("({} || {})", self.name, other.name);
        Self::new(name, move |item| self.matches(item) || other.matches(item))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        let name = format!("!{}", self.name);
        Self::new(name, move |item| !self.matches(item))
    }
}

// =============================================================================
// Filter
// =============================================================================

/// Narrow a list to the items every predicate accepts
pub trait Filter<T> {
    /// Borrowing filter
    fn filter_by(&self, predicates: &[Predicate<T>]) -> Vec<&T>;

    /// Cloning filter
    fn filtered(&self, predicates: &[Predicate<T>]) -> Vec<T>
    where
        T: Clone,
    {
        self.filter_by(predicates).into_iter().cloned().collect()
    }

    /// First item passing all predicates
    fn find_by(&self, predicates: &[Predicate<T>]) -> Option<&T>;

    /// Whether any item passes all predicates
    fn any_match(&self, predicates: &[Predicate<T>]) -> bool {
        self.find_by(predicates).is_some()
    }
}

fn passes<T>(predicates: &[Predicate<T>], item: &T) -> bool {
    predicates.iter().all(|p| p.matches(item))
}

impl<T> Filter<T> for [T] {
    fn filter_by(&self, predicates: &[Predicate<T>]) -> Vec<&T> {
        self.iter().filter(|item| passes(predicates, item)).collect()
    }

    fn find_by(&self, predicates: &[Predicate<T>]) -> Option<&T> {
        self.iter().find(|item| passes(predicates, item))
    }
}

impl<T> Filter<T> for Vec<T> {
    fn filter_by(&self, predicates: &[Predicate<T>]) -> Vec<&T> {
        self.as_slice().filter_by(predicates)
    }

    fn find_by(&self, predicates: &[Predicate<T>]) -> Option<&T> {
        self.as_slice().find_by(predicates)
    }
}

/// Filters the values of a keyed collection, in key order
impl<K, T> Filter<T> for BTreeMap<K, T> {
    fn filter_by(&self, predicates: &[Predicate<T>]) -> Vec<&T> {
        self.values().filter(|item| passes(predicates, item)).collect()
    }

    fn find_by(&self, predicates: &[Predicate<T>]) -> Option<&T> {
        self.values().find(|item| passes(predicates, item))
    }
}

// =============================================================================
// Metadata Predicates
// =============================================================================

/// Object carries label `key=value`
pub fn has_label<K: Resource + 'static>(key: &str, value: &str) -> Predicate<K> {
    let (key, value) = (key.to_string(), value.to_string());
    Predicate::new(format!("has_label({}={})", key, value), move |obj: &K| {
        obj.meta()
            .labels
            .as_ref()
            .and_then(|l| l.get(&key))
            .map(|v| *v == value)
            .unwrap_or(false)
    })
}

// =============================================================================
// Block Device Predicates
// =============================================================================

pub mod block_device {
    use super::Predicate;
    use crate::crd::{BlockDevice, DiskKind};
    use std::collections::{BTreeMap, BTreeSet};

    pub fn is_active() -> Predicate<BlockDevice> {
        Predicate::new("is_active", BlockDevice::is_active)
    }

    pub fn is_claimed() -> Predicate<BlockDevice> {
        Predicate::new("is_claimed", BlockDevice::is_claimed)
    }

    pub fn is_type(kind: DiskKind) -> Predicate<BlockDevice> {
        Predicate::new(format!("is_type({})", kind), move |bd: &BlockDevice| {
            bd.spec.device_type == kind
        })
    }

    /// Device is not referenced by any pool in `used`
    pub fn is_usable(used: BTreeMap<String, usize>) -> Predicate<BlockDevice> {
        Predicate::new("is_usable", move |bd: &BlockDevice| {
            used.get(bd.name()).copied().unwrap_or(0) == 0
        })
    }

    /// Device lives on a node outside `excluded`
    pub fn is_on_usable_node(excluded: BTreeSet<String>) -> Predicate<BlockDevice> {
        Predicate::new("is_on_usable_node", move |bd: &BlockDevice| {
            !excluded.contains(bd.node())
        })
    }

    pub fn has_no_filesystem() -> Predicate<BlockDevice> {
        Predicate::new("has_no_filesystem", |bd: &BlockDevice| !bd.has_filesystem())
    }

    pub fn is_unpartitioned() -> Predicate<BlockDevice> {
        Predicate::new("is_unpartitioned", |bd: &BlockDevice| !bd.spec.partitioned)
    }
}

// =============================================================================
// Pool Predicates
// =============================================================================

pub mod pool {
    use super::Predicate;
    use crate::crd::{Pool, PoolPhase};

    pub fn is_status(phase: PoolPhase) -> Predicate<Pool> {
        Predicate::new(format!("is_status({})", phase), move |p: &Pool| p.phase() == phase)
    }

    pub fn is_on_node(node: &str) -> Predicate<Pool> {
        let node = node.to_string();
        Predicate::new(format!("is_on_node({})", node), move |p: &Pool| p.node() == node)
    }

    pub fn contains_device(device: &str) -> Predicate<Pool> {
        let device = device.to_string();
        Predicate::new(format!("contains_device({})", device), move |p: &Pool| {
            p.contains_device(&device)
        })
    }
}

// =============================================================================
// Block Device Claim Predicates
// =============================================================================

pub mod claim {
    use super::Predicate;
    use crate::crd::BlockDeviceClaim;

    pub fn is_owned_by(pcc: &str) -> Predicate<BlockDeviceClaim> {
        let pcc = pcc.to_string();
        Predicate::new(format!("is_owned_by({})", pcc), move |c: &BlockDeviceClaim| {
            c.is_owned_by(&pcc)
        })
    }

    pub fn has_predecessor() -> Predicate<BlockDeviceClaim> {
        Predicate::new("has_predecessor", |c: &BlockDeviceClaim| c.predecessor().is_some())
    }

    /// Claim of a device that is replacing `device`
    pub fn is_replacing(device: &str) -> Predicate<BlockDeviceClaim> {
        let device = device.to_string();
        Predicate::new(format!("is_replacing({})", device), move |c: &BlockDeviceClaim| {
            c.predecessor() == Some(device.as_str())
        })
    }

    pub fn is_for_device(device: &str) -> Predicate<BlockDeviceClaim> {
        let device = device.to_string();
        Predicate::new(format!("is_for_device({})", device), move |c: &BlockDeviceClaim| {
            c.block_device() == device
        })
    }
}
