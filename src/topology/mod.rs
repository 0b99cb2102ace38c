//! Placement: which devices on which nodes form each pool
//!
//! [`DeviceIndex`] snapshots the cluster for one claim; [`Planner`] turns
//! that snapshot into a [`Plan`].

pub mod device_index;
pub mod planner;

pub use device_index::DeviceIndex;
pub use planner::{Plan, PlanEntry, Planner, SkippedPool, DISK_COUNT_MULTIPLIER};
