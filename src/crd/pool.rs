//! Pool CRD
//!
//! A Pool is the materialised storage pool on one node. The reconciler
//! creates it from a plan; the node agent builds the actual pool and reports
//! progress through the status.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::pool_cluster_claim::{PoolConfig, RaidType};
use super::PCC_NAME_LABEL;

// =============================================================================
// Pool CRD
// =============================================================================

/// Pool represents one pool of a PoolClusterClaim on a single node.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "openebs.io",
    version = "v1",
    kind = "Pool",
    plural = "pools",
    status = "PoolStatus",
    printcolumn = r#"{"name": "Host", "type": "string", "jsonPath": ".spec.hostName"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct PoolSpecification {
    /// Node the pool lives on
    pub host_name: String,

    /// Node selector copied from the claim
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,

    /// Pool configuration copied from the claim
    #[serde(default)]
    pub pool_config: PoolConfig,

    /// Materialised raid groups
    #[serde(default)]
    pub raid_groups: Vec<PoolRaidGroup>,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// Raid group with resolved device IDs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolRaidGroup {
    /// Group name (group0, group1, ...)
    pub name: String,

    /// Raid type
    pub r#type: RaidType,

    /// Devices, in order
    #[serde(default)]
    pub block_devices: Vec<PoolBlockDevice>,
}

impl PoolRaidGroup {
    pub fn device_names(&self) -> impl Iterator<Item = &str> {
        self.block_devices.iter().map(|d| d.block_device_name.as_str())
    }

    pub fn contains(&self, device: &str) -> bool {
        self.device_names().any(|d| d == device)
    }
}

/// Device entry in a pool raid group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolBlockDevice {
    pub block_device_name: String,
    pub device_id: String,
    #[serde(default)]
    pub capacity: u64,
}

// =============================================================================
// Status
// =============================================================================

/// Status of the Pool, written by the node agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    /// Current phase
    #[serde(default)]
    pub phase: PoolPhase,

    /// Per-device state
    #[serde(default)]
    pub devices: Vec<PoolDeviceStatus>,

    /// Clones on this pool and the volumes they were cut from
    #[serde(default)]
    pub dependent_clones: Vec<DependentClone>,

    /// Usable capacity in bytes
    #[serde(default)]
    pub capacity: u64,
}

/// Pool lifecycle phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum PoolPhase {
    #[default]
    Pending,
    Healthy,
    Degraded,
    Offline,
}

impl std::fmt::Display for PoolPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolPhase::Pending => write!(f, "Pending"),
            PoolPhase::Healthy => write!(f, "Healthy"),
            PoolPhase::Degraded => write!(f, "Degraded"),
            PoolPhase::Offline => write!(f, "Offline"),
        }
    }
}

/// State of one device inside the pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolDeviceStatus {
    pub name: String,
    pub state: PoolDeviceState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum PoolDeviceState {
    Online,
    Resilvering,
    Faulted,
    Removed,
}

/// A clone volume that depends on a snapshot of `source_volume`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DependentClone {
    pub volume: String,
    pub source_volume: String,
}

// =============================================================================
// Implementations
// =============================================================================

impl Pool {
    /// Get the pool name
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unknown")
    }

    /// Node hosting this pool
    pub fn node(&self) -> &str {
        &self.spec.host_name
    }

    /// Owning claim, read from the label
    pub fn pcc_name(&self) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(PCC_NAME_LABEL))
            .map(String::as_str)
    }

    pub fn phase(&self) -> PoolPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Every device name across all raid groups
    pub fn block_device_names(&self) -> impl Iterator<Item = &str> {
        self.spec.raid_groups.iter().flat_map(|g| g.device_names())
    }

    pub fn contains_device(&self, device: &str) -> bool {
        self.block_device_names().any(|d| d == device)
    }

    /// State the node agent reports for a device
    pub fn device_state(&self, device: &str) -> Option<PoolDeviceState> {
        self.status
            .as_ref()
            .and_then(|s| s.devices.iter().find(|d| d.name == device))
            .map(|d| d.state)
    }

    /// Clones on this pool whose source is `volume`
    pub fn clones_of<'a>(&'a self, volume: &'a str) -> impl Iterator<Item = &'a DependentClone> {
        self.status
            .iter()
            .flat_map(|s| s.dependent_clones.iter())
            .filter(move |c| c.source_volume == volume)
    }
}
