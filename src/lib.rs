//! Pool Cluster Operator
//!
//! Control plane for declarative storage pool clusters. A
//! PoolClusterClaim describes which nodes should host a storage pool and
//! which block devices back each pool; this crate turns that intent into
//! Pool objects and block device claims, and guards the claim against
//! changes that would lose data.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Cluster API store                         │
//! └───────┬──────────────────────────┬───────────────────────▲───────┘
//!         │ AdmissionReview          │ watch events          │ writes
//! ┌───────▼──────────┐      ┌────────▼─────────┐   ┌─────────┴────────┐
//! │ Admission webhook│      │    Work queue    │──▶│    Reconciler    │
//! │   (/validate)    │      │  (keyed, dedup)  │   │   (N workers)    │
//! └───────┬──────────┘      └──────────────────┘   └─────────┬────────┘
//!         │                                                  │
//!         └───────────────┐              ┌───────────────────┘
//!                   ┌─────▼──────────────▼─────┐
//!                   │ Device index + planner   │
//!                   └──────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`crd`]: custom resources and well-known keys
//! - [`domain`]: builders and predicates
//! - [`client`]: cluster API abstraction, live and in-memory
//! - [`topology`]: device index and topology planner
//! - [`controller`]: reconciler, work queue and runner
//! - [`admission`]: validating webhook
//! - [`bootstrap`]: webhook certificates and registration
//! - [`metrics`]: prometheus collectors
//! - [`error`]: error types and handling

pub mod admission;
pub mod bootstrap;
pub mod client;
pub mod controller;
pub mod crd;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod topology;

#[cfg(test)]
mod fixtures;

// Re-export commonly used types
pub use admission::{AdmissionConfig, AdmissionState, Validator};

pub use bootstrap::{bootstrap, BootstrapConfig, CertBundle};

pub use client::{fabricator, ClientFabricator, ClientSet, MemoryCluster, ResourceClient};

pub use controller::{Controller, ControllerConfig, PoolClusterReconciler};

pub use crd::{
    BlockDevice, BlockDeviceClaim, Pool, PoolClusterClaim, PoolClusterClaimSpec,
    PoolClusterClaimStatus, RaidType, VolumeClaim, VolumeReplica,
};

pub use error::{Error, ErrorAction, Result};

pub use metrics::Metrics;

pub use topology::{DeviceIndex, Plan, Planner};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
