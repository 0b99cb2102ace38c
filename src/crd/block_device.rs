//! BlockDevice CRD
//!
//! Published by the device discovery daemon on each node. The operator only
//! reads block devices; it never writes them.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::pool_cluster_claim::DiskKind;

// =============================================================================
// BlockDevice CRD
// =============================================================================

/// BlockDevice is a disk or sparse file available on a node.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "openebs.io",
    version = "v1",
    kind = "BlockDevice",
    plural = "blockdevices",
    shortname = "bd",
    status = "BlockDeviceStatus",
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.nodeName"}"#,
    printcolumn = r#"{"name": "Size", "type": "integer", "jsonPath": ".spec.capacity"}"#,
    printcolumn = r#"{"name": "ClaimState", "type": "string", "jsonPath": ".status.claimState"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceSpec {
    /// Node the device is attached to
    pub node_name: String,

    /// Device path, e.g. /dev/sdb
    #[serde(default)]
    pub path: String,

    /// Capacity in bytes
    #[serde(default)]
    pub capacity: u64,

    /// Disk or sparse file
    #[serde(default)]
    pub device_type: DiskKind,

    /// Stable links grouped by kind (by-id, by-path)
    #[serde(default)]
    pub dev_links: Vec<DevLink>,

    /// Filesystem found on the device
    #[serde(default)]
    pub filesystem: Option<FileSystemInfo>,

    /// Whether the device carries a partition table
    #[serde(default)]
    pub partitioned: bool,

    /// Name of the claim bound to this device
    #[serde(default)]
    pub claim_ref: Option<String>,
}

// =============================================================================
// Sub-Types
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DevLink {
    /// Link kind, e.g. by-id
    pub kind: String,
    #[serde(default)]
    pub links: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileSystemInfo {
    #[serde(default)]
    pub fs_type: Option<String>,
    #[serde(default)]
    pub mount_point: Option<String>,
}

impl FileSystemInfo {
    pub fn is_empty(&self) -> bool {
        self.fs_type.as_deref().map(str::is_empty).unwrap_or(true)
            && self.mount_point.as_deref().map(str::is_empty).unwrap_or(true)
    }
}

// =============================================================================
// Status
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceStatus {
    #[serde(default)]
    pub state: DeviceState,
    #[serde(default)]
    pub claim_state: ClaimState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum DeviceState {
    Active,
    Inactive,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ClaimState {
    #[default]
    Unclaimed,
    Claimed,
    Released,
}

impl std::fmt::Display for ClaimState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClaimState::Unclaimed => write!(f, "Unclaimed"),
            ClaimState::Claimed => write!(f, "Claimed"),
            ClaimState::Released => write!(f, "Released"),
        }
    }
}

/// Dev-link kind preferred for device IDs
pub const STABLE_LINK_KIND: &str = "by-id";

// =============================================================================
// Implementations
// =============================================================================

impl BlockDevice {
    /// Get the device name
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unknown")
    }

    pub fn node(&self) -> &str {
        &self.spec.node_name
    }

    pub fn is_active(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.state == DeviceState::Active)
            .unwrap_or(false)
    }

    pub fn claim_state(&self) -> ClaimState {
        self.status.as_ref().map(|s| s.claim_state).unwrap_or_default()
    }

    pub fn is_claimed(&self) -> bool {
        self.claim_state() == ClaimState::Claimed
    }

    pub fn has_filesystem(&self) -> bool {
        self.spec
            .filesystem
            .as_ref()
            .map(|fs| !fs.is_empty())
            .unwrap_or(false)
    }

    /// Stable identifier used in pool raid groups: the first by-id link,
    /// then the first link of any kind, then the device path. Empty when
    /// none is known.
    pub fn device_id(&self) -> &str {
        let links = &self.spec.dev_links;
        links
            .iter()
            .filter(|l| l.kind == STABLE_LINK_KIND)
            .chain(links.iter().filter(|l| l.kind != STABLE_LINK_KIND))
            .find_map(|l| l.links.iter().find(|s| !s.is_empty()))
            .map(String::as_str)
            .unwrap_or(self.spec.path.as_str())
    }

    /// Identifier used to derive claim names
    pub fn uid_or_name(&self) -> &str {
        self.metadata
            .uid
            .as_deref()
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| self.name())
    }
}
