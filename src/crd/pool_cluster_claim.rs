//! PoolClusterClaim CRD
//!
//! The top-level declarative resource. An administrator asks for pools of a
//! given raid layout, either pinned per node (manual mode) or spread over
//! any capable nodes up to `maxPools` (auto mode).

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use super::POOL_PROTECTION_FINALIZER;

// =============================================================================
// PoolClusterClaim CRD
// =============================================================================

/// PoolClusterClaim describes the desired pools of one storage cluster.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "openebs.io",
    version = "v1",
    kind = "PoolClusterClaim",
    plural = "poolclusterclaims",
    shortname = "pcc",
    status = "PoolClusterClaimStatus",
    printcolumn = r#"{"name": "Mode", "type": "string", "jsonPath": ".spec.mode"}"#,
    printcolumn = r#"{"name": "Desired", "type": "integer", "jsonPath": ".status.desiredPools"}"#,
    printcolumn = r#"{"name": "Provisioned", "type": "integer", "jsonPath": ".status.provisionedPools"}"#,
    printcolumn = r#"{"name": "Healthy", "type": "integer", "jsonPath": ".status.healthyPools"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct PoolClusterClaimSpec {
    /// Kind of block device the pools are built from
    #[serde(default)]
    pub disk_kind: DiskKind,

    /// Provisioning mode
    #[serde(default)]
    pub mode: ProvisioningMode,

    /// Number of pools to keep in auto mode
    #[serde(default)]
    pub max_pools: Option<u32>,

    /// Shared pool configuration in auto mode
    #[serde(default)]
    pub pool_config: Option<PoolConfig>,

    /// Per-node pool specs in manual mode
    #[serde(default)]
    pub pools: Vec<PoolSpec>,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// Kind of block device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DiskKind {
    Sparse,
    #[default]
    Disk,
}

impl std::fmt::Display for DiskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiskKind::Sparse => write!(f, "sparse"),
            DiskKind::Disk => write!(f, "disk"),
        }
    }
}

/// How pools are placed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ProvisioningMode {
    Auto,
    #[default]
    Manual,
}

impl std::fmt::Display for ProvisioningMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProvisioningMode::Auto => write!(f, "auto"),
            ProvisioningMode::Manual => write!(f, "manual"),
        }
    }
}

/// Raid layout of one raid group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RaidType {
    Striped,
    Mirrored,
    Raidz,
    Raidz2,
}

impl RaidType {
    /// Number of block devices one group of this type holds. For striped
    /// this is the minimum.
    pub fn device_count(&self) -> usize {
        match self {
            RaidType::Striped => 1,
            RaidType::Mirrored => 2,
            RaidType::Raidz => 3,
            RaidType::Raidz2 => 6,
        }
    }

    /// Whether a group of this type may grow by single devices
    pub fn is_striped(&self) -> bool {
        matches!(self, RaidType::Striped)
    }

    /// Check a group's device count against this type's arity
    pub fn check_count(&self, count: usize) -> std::result::Result<(), String> {
        let required = self.device_count();
        match self {
            RaidType::Striped if count < required => Err(format!(
                "striped raid group needs at least {} block device, got {}",
                required, count
            )),
            RaidType::Striped => Ok(()),
            _ if count != required => Err(format!(
                "{} raid group needs exactly {} block devices, got {}",
                self, required, count
            )),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Display for RaidType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaidType::Striped => write!(f, "striped"),
            RaidType::Mirrored => write!(f, "mirrored"),
            RaidType::Raidz => write!(f, "raidz"),
            RaidType::Raidz2 => write!(f, "raidz2"),
        }
    }
}

impl FromStr for RaidType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "striped" | "stripe" => Ok(RaidType::Striped),
            "mirrored" | "mirror" => Ok(RaidType::Mirrored),
            "raidz" => Ok(RaidType::Raidz),
            "raidz2" => Ok(RaidType::Raidz2),
            other => Err(format!("unsupported raid type {:?}", other)),
        }
    }
}

/// Pool level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    /// Raid type of the pool
    #[serde(default)]
    pub pool_type: Option<String>,

    /// Raid type used by raid groups that do not declare one
    #[serde(default)]
    pub default_raid_group_type: Option<String>,

    /// Compression algorithm passed to the node agent
    #[serde(default)]
    pub compression: Option<String>,

    /// Mark the pool read-only
    #[serde(default)]
    pub read_only: bool,
}

impl PoolConfig {
    /// Raid type a group falls back to when it does not declare one
    pub fn fallback_raid_type(&self) -> Option<&str> {
        self.default_raid_group_type
            .as_deref()
            .filter(|t| !t.is_empty())
            .or_else(|| self.pool_type.as_deref().filter(|t| !t.is_empty()))
    }
}

/// Pool placed on the node matched by `node_selector`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolSpec {
    /// Labels selecting exactly one node
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,

    /// Configuration of this pool
    #[serde(default)]
    pub pool_config: PoolConfig,

    /// Raid groups, in order
    #[serde(default)]
    pub raid_groups: Vec<RaidGroup>,
}

impl PoolSpec {
    /// Resolved raid type string of a group, empty when neither the group nor
    /// the pool config declares one
    pub fn raid_type_of<'a>(&'a self, group: &'a RaidGroup) -> &'a str {
        if !group.raid_type.is_empty() {
            return &group.raid_type;
        }
        self.pool_config.fallback_raid_type().unwrap_or("")
    }

    /// Names of every block device in this pool spec
    pub fn block_device_names(&self) -> impl Iterator<Item = &str> {
        self.raid_groups.iter().flat_map(|g| g.device_names())
    }

    /// Render the node selector as `k=v,k=v`
    pub fn selector_string(&self) -> String {
        format_selector(&self.node_selector)
    }
}

/// One redundancy unit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RaidGroup {
    /// Raid type; empty inherits the pool's default
    #[serde(rename = "type", default)]
    pub raid_type: String,

    /// Block devices, in order
    #[serde(default)]
    pub block_devices: Vec<BlockDeviceRef>,
}

impl RaidGroup {
    pub fn device_names(&self) -> impl Iterator<Item = &str> {
        self.block_devices.iter().map(|bd| bd.block_device_name.as_str())
    }

    pub fn contains(&self, device: &str) -> bool {
        self.device_names().any(|d| d == device)
    }
}

/// Reference to a block device by name
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceRef {
    pub block_device_name: String,
}

impl From<&str> for BlockDeviceRef {
    fn from(name: &str) -> Self {
        Self {
            block_device_name: name.to_string(),
        }
    }
}

// =============================================================================
// Status
// =============================================================================

/// Status of the PoolClusterClaim
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolClusterClaimStatus {
    /// Pools that currently exist
    #[serde(default)]
    pub provisioned_pools: u32,

    /// Pools the claim asks for
    #[serde(default)]
    pub desired_pools: u32,

    /// Pools reporting Healthy
    #[serde(default)]
    pub healthy_pools: u32,

    /// Conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Condition types surfaced on a PoolClusterClaim
pub mod condition_type {
    pub const READY: &str = "Ready";
    pub const PROVISIONING_FAILED: &str = "ProvisioningFailed";
    pub const REPLACEMENT_IN_PROGRESS: &str = "ReplacementInProgress";
}

/// Status condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    pub r#type: String,
    /// Status: True, False, Unknown
    pub status: String,
    /// Last transition time
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,
    /// Reason
    #[serde(default)]
    pub reason: Option<String>,
    /// Message
    #[serde(default)]
    pub message: Option<String>,
}

impl Condition {
    pub fn new(r#type: &str, status: bool, reason: &str, message: impl Into<String>) -> Self {
        Self {
            r#type: r#type.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            last_transition_time: Some(Utc::now()),
            reason: Some(reason.to_string()),
            message: Some(message.into()),
        }
    }

    /// Same type, status, reason and message; transition time is ignored
    pub fn same_as(&self, other: &Condition) -> bool {
        self.r#type == other.r#type
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }

    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

// =============================================================================
// Implementations
// =============================================================================

impl PoolClusterClaim {
    /// Get the claim name
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unknown")
    }

    /// Whether the claim has been marked for deletion
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .map(|f| f.iter().any(|x| x == POOL_PROTECTION_FINALIZER))
            .unwrap_or(false)
    }

    pub fn is_auto(&self) -> bool {
        self.spec.mode == ProvisioningMode::Auto
    }

    /// Number of pools this claim wants
    pub fn desired_pool_count(&self) -> usize {
        match self.spec.mode {
            ProvisioningMode::Auto => self.spec.max_pools.unwrap_or(0) as usize,
            ProvisioningMode::Manual => self.spec.pools.len(),
        }
    }

    /// Raid type of pools in auto mode
    pub fn auto_raid_type(&self) -> Option<RaidType> {
        self.spec
            .pool_config
            .as_ref()
            .and_then(|c| c.pool_type.as_deref().or(c.default_raid_group_type.as_deref()))
            .and_then(|t| t.parse().ok())
    }

    /// Every block device name referenced by any pool spec
    pub fn block_device_names(&self) -> BTreeSet<String> {
        self.spec
            .pools
            .iter()
            .flat_map(|p| p.block_device_names())
            .map(str::to_string)
            .collect()
    }

    /// Whether the skip-validation annotation is set to true
    pub fn skips_validation(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(super::SKIP_VALIDATION_ANNOTATION))
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    /// Look up a condition on the status
    pub fn condition(&self, r#type: &str) -> Option<&Condition> {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.iter().find(|c| c.r#type == r#type))
    }
}

impl PoolClusterClaimStatus {
    /// Set a condition, keeping the old transition time when nothing changed
    pub fn set_condition(&mut self, condition: Condition) {
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.r#type == condition.r#type)
        {
            if !existing.same_as(&condition) {
                let keep_time = existing.status == condition.status;
                let time = existing.last_transition_time;
                *existing = condition;
                if keep_time {
                    existing.last_transition_time = time;
                }
            }
        } else {
            self.conditions.push(condition);
        }
    }

    /// Drop a condition by type
    pub fn remove_condition(&mut self, r#type: &str) {
        self.conditions.retain(|c| c.r#type != r#type);
    }
}

/// Render a label map as a Kubernetes equality selector
pub fn format_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raid_type_parse_and_display() {
        assert_eq!("mirror".parse::<RaidType>().unwrap(), RaidType::Mirrored);
        assert_eq!("Raidz2".parse::<RaidType>().unwrap(), RaidType::Raidz2);
        assert!("raid5".parse::<RaidType>().is_err());
        assert_eq!(RaidType::Striped.to_string(), "striped");
    }

    #[test]
    fn test_raid_type_arity() {
        assert!(RaidType::Striped.check_count(0).is_err());
        assert!(RaidType::Striped.check_count(5).is_ok());
        assert!(RaidType::Mirrored.check_count(2).is_ok());
        assert!(RaidType::Mirrored.check_count(3).is_err());
        assert!(RaidType::Raidz.check_count(3).is_ok());
        assert!(RaidType::Raidz2.check_count(5).is_err());
    }

    #[test]
    fn test_raid_type_inherits_default() {
        let spec = PoolSpec {
            pool_config: PoolConfig {
                default_raid_group_type: Some("mirrored".into()),
                ..Default::default()
            },
            raid_groups: vec![
                RaidGroup {
                    raid_type: String::new(),
                    block_devices: vec!["d1".into(), "d2".into()],
                },
                RaidGroup {
                    raid_type: "striped".into(),
                    block_devices: vec!["d3".into()],
                },
            ],
            ..Default::default()
        };
        assert_eq!(spec.raid_type_of(&spec.raid_groups[0]), "mirrored");
        assert_eq!(spec.raid_type_of(&spec.raid_groups[1]), "striped");
        assert_eq!(spec.block_device_names().count(), 3);
    }

    #[test]
    fn test_set_condition_keeps_transition_time() {
        let mut status = PoolClusterClaimStatus::default();
        status.set_condition(Condition::new(condition_type::READY, true, "Provisioned", "ok"));
        let first = status.conditions[0].last_transition_time;

        status.set_condition(Condition::new(condition_type::READY, true, "Provisioned", "ok"));
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].last_transition_time, first);

        status.set_condition(Condition::new(condition_type::READY, false, "Failed", "boom"));
        assert_eq!(status.conditions.len(), 1);
        assert!(!status.conditions[0].is_true());
    }

    #[test]
    fn test_deserialize_manual_claim() {
        let yaml = r#"
apiVersion: openebs.io/v1
kind: PoolClusterClaim
metadata:
  name: cluster-a
spec:
  pools:
    - nodeSelector:
        kubernetes.io/hostname: n1
      poolConfig:
        defaultRaidGroupType: mirrored
      raidGroups:
        - blockDevices:
            - blockDeviceName: d1
            - blockDeviceName: d2
"#;
        let pcc: PoolClusterClaim = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(pcc.name(), "cluster-a");
        assert_eq!(pcc.spec.mode, ProvisioningMode::Manual);
        assert_eq!(pcc.spec.disk_kind, DiskKind::Disk);
        assert_eq!(pcc.desired_pool_count(), 1);
        assert_eq!(pcc.spec.pools[0].selector_string(), "kubernetes.io/hostname=n1");
        assert!(pcc.block_device_names().contains("d2"));
    }
}
