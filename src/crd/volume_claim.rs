//! VolumeClaim CRD
//!
//! A volume claim places `replicaCount` replicas of one volume on pools. It
//! references pools by name only; it never owns them.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// VolumeClaim asks for replicas of a volume on named pools.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "openebs.io",
    version = "v1",
    kind = "VolumeClaim",
    plural = "volumeclaims",
    shortname = "vc",
    status = "VolumeClaimStatus",
    printcolumn = r#"{"name": "Replicas", "type": "integer", "jsonPath": ".spec.replicaCount"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeClaimSpec {
    /// Replica count, immutable after creation
    pub replica_count: u32,

    /// Requested capacity in bytes
    #[serde(default)]
    pub capacity: u64,

    /// Pools the replicas should live on
    #[serde(default)]
    pub replica_pool_info: Vec<ReplicaPoolInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaPoolInfo {
    pub pool_name: String,
}

impl From<&str> for ReplicaPoolInfo {
    fn from(name: &str) -> Self {
        Self {
            pool_name: name.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeClaimStatus {
    #[serde(default)]
    pub phase: VolumeClaimPhase,

    /// Pools currently holding a replica
    #[serde(default)]
    pub pool_info: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum VolumeClaimPhase {
    #[default]
    Pending,
    Bound,
    Failed,
}

impl std::fmt::Display for VolumeClaimPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeClaimPhase::Pending => write!(f, "Pending"),
            VolumeClaimPhase::Bound => write!(f, "Bound"),
            VolumeClaimPhase::Failed => write!(f, "Failed"),
        }
    }
}

impl VolumeClaim {
    /// Get the claim name
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unknown")
    }

    /// Name of the backing volume
    pub fn volume_name(&self) -> &str {
        self.name()
    }

    pub fn phase(&self) -> VolumeClaimPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Desired pool names, in order
    pub fn spec_pool_names(&self) -> Vec<&str> {
        self.spec
            .replica_pool_info
            .iter()
            .map(|p| p.pool_name.as_str())
            .collect()
    }

    /// Observed pool names, in order
    pub fn status_pool_names(&self) -> Vec<&str> {
        self.status
            .iter()
            .flat_map(|s| s.pool_info.iter())
            .map(String::as_str)
            .collect()
    }
}
