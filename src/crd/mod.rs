//! Custom Resource Definitions for the pool cluster operator
//!
//! This module contains all CRD types:
//! - PoolClusterClaim: Declarative request for a set of pools across nodes
//! - Pool: One materialised pool on one node, owned by a PoolClusterClaim
//! - BlockDevice: A disk or sparse file published by the discovery daemon
//! - BlockDeviceClaim: Binds a BlockDevice to a PoolClusterClaim
//! - VolumeClaim: Places volume replicas on pools
//! - VolumeReplica: One replica of a volume living on a pool

pub mod block_device;
pub mod block_device_claim;
pub mod pool;
pub mod pool_cluster_claim;
pub mod volume_claim;
pub mod volume_replica;

pub use block_device::*;
pub use block_device_claim::*;
pub use pool::*;
pub use pool_cluster_claim::*;
pub use volume_claim::*;
pub use volume_replica::*;

// Re-export common types for convenience
pub use chrono::{DateTime, Utc};
pub use std::collections::BTreeMap;

// =============================================================================
// Well-known Keys
// =============================================================================

/// API group shared by every custom kind
pub const API_GROUP: &str = "openebs.io";

/// Label carrying the owning PoolClusterClaim name
pub const PCC_NAME_LABEL: &str = "openebs.io/pool-cluster-claim";

/// Label carrying the pool name on volume replicas
pub const POOL_NAME_LABEL: &str = "openebs.io/pool-name";

/// Label carrying the volume name on volume replicas
pub const VOLUME_NAME_LABEL: &str = "openebs.io/volume-name";

/// Node host name label
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// Tag label on block devices
pub const BLOCK_DEVICE_TAG_LABEL: &str = "openebs.io/block-device-tag";

/// Annotation on a PoolClusterClaim that bypasses delete validation
pub const SKIP_VALIDATION_ANNOTATION: &str = "openebs.io/skip-validation";

/// Annotation on a BlockDeviceClaim naming the block device it replaces
pub const PREDECESSOR_ANNOTATION: &str = "openebs.io/bd-predecessor";

/// Finalizer placed on PoolClusterClaims and BlockDeviceClaims
pub const POOL_PROTECTION_FINALIZER: &str = "openebs.io/pool-protection";
