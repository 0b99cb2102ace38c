//! VolumeReplica CRD
//!
//! One replica of a volume on one pool, labelled with the pool's name.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{POOL_NAME_LABEL, VOLUME_NAME_LABEL};

#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "openebs.io",
    version = "v1",
    kind = "VolumeReplica",
    plural = "volumereplicas",
    shortname = "vr",
    status = "VolumeReplicaStatus",
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeReplicaSpec {
    /// Replica capacity in bytes
    #[serde(default)]
    pub capacity: u64,

    /// Target address the replica serves
    #[serde(default)]
    pub target_ip: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeReplicaStatus {
    #[serde(default)]
    pub phase: String,
}

impl VolumeReplica {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unknown")
    }

    fn label(&self, key: &str) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(key))
            .map(String::as_str)
    }

    pub fn pool_name(&self) -> Option<&str> {
        self.label(POOL_NAME_LABEL)
    }

    pub fn volume_name(&self) -> Option<&str> {
        self.label(VOLUME_NAME_LABEL)
    }
}
