//! BlockDeviceClaim CRD
//!
//! Binds one block device to one PoolClusterClaim. During a replacement the
//! claim of the incoming device carries the name of the device it replaces.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{PCC_NAME_LABEL, POOL_PROTECTION_FINALIZER, PREDECESSOR_ANNOTATION};

// =============================================================================
// BlockDeviceClaim CRD
// =============================================================================

/// BlockDeviceClaim reserves a BlockDevice for a PoolClusterClaim.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "openebs.io",
    version = "v1",
    kind = "BlockDeviceClaim",
    plural = "blockdeviceclaims",
    shortname = "bdc",
    derive = "PartialEq",
    status = "BlockDeviceClaimStatus",
    printcolumn = r#"{"name": "BlockDevice", "type": "string", "jsonPath": ".spec.blockDeviceName"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceClaimSpec {
    /// Device this claim binds
    pub block_device_name: String,

    /// Node the device lives on
    #[serde(default)]
    pub host_name: String,

    /// Requested capacity in bytes
    #[serde(default)]
    pub capacity: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceClaimStatus {
    #[serde(default)]
    pub phase: ClaimPhase,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ClaimPhase {
    #[default]
    Pending,
    Bound,
    Released,
}

impl BlockDeviceClaim {
    /// Get the claim name
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unknown")
    }

    pub fn block_device(&self) -> &str {
        &self.spec.block_device_name
    }

    /// Owning claim, read from the label
    pub fn pcc_name(&self) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(PCC_NAME_LABEL))
            .map(String::as_str)
    }

    pub fn is_owned_by(&self, pcc: &str) -> bool {
        self.pcc_name() == Some(pcc)
    }

    /// Device this claim's device is replacing, if a replacement is running
    pub fn predecessor(&self) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(PREDECESSOR_ANNOTATION))
            .map(String::as_str)
            .filter(|p| !p.is_empty())
    }

    pub fn has_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .map(|f| f.iter().any(|x| x == POOL_PROTECTION_FINALIZER))
            .unwrap_or(false)
    }
}
