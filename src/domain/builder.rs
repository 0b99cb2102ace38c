//! Fluent builders for cluster entities
//!
//! Every `with_*` call records a problem instead of failing, so a chain can
//! be written without intermediate `?`. [`build`](PoolBuilder::build)
//! returns the entity or an [`Error::Builder`] that lists every accumulated
//! problem.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;
use std::collections::{BTreeMap, BTreeSet};

use crate::crd::{
    BlockDevice, BlockDeviceClaim, BlockDeviceClaimSpec, BlockDeviceSpec, BlockDeviceStatus,
    ClaimState, DevLink, DeviceState, DiskKind, FileSystemInfo, Pool, PoolBlockDevice,
    PoolClusterClaim, PoolClusterClaimSpec, PoolConfig, PoolRaidGroup, PoolSpec,
    PoolSpecification, ProvisioningMode, RaidGroup, RaidType, VolumeClaim, VolumeClaimPhase,
    VolumeClaimSpec, VolumeClaimStatus, VolumeReplica, VolumeReplicaSpec, HOSTNAME_LABEL,
    PCC_NAME_LABEL, POOL_NAME_LABEL, POOL_PROTECTION_FINALIZER, PREDECESSOR_ANNOTATION,
    VOLUME_NAME_LABEL,
};
use crate::error::{Error, Result};

// =============================================================================
// Deterministic Names
// =============================================================================

fn sha256_hex(input: &str) -> String {
    openssl::sha::sha256(input.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Claim name for a block device, stable across retries
pub fn block_device_claim_name(device_uid: &str) -> String {
    format!("bdc-{}", &sha256_hex(device_uid)[..32])
}

/// Pool name for a claim on a node, stable across retries
pub fn pool_name(pcc: &str, node: &str) -> String {
    format!("{}-{}", pcc, &sha256_hex(node)[..6])
}

/// Controller owner reference pointing at a claim
pub fn owner_reference(pcc: &PoolClusterClaim) -> Option<OwnerReference> {
    let mut owner = pcc.controller_owner_ref(&())?;
    owner.block_owner_deletion = Some(true);
    Some(owner)
}

/// Metadata pieces shared by every builder
#[derive(Debug, Default)]
struct MetaParts {
    name: Option<String>,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
    finalizers: Vec<String>,
    owner: Option<OwnerReference>,
    uid: Option<String>,
}

impl MetaParts {
    fn apply<K: Resource>(self, obj: &mut K) {
        let meta = obj.meta_mut();
        if !self.labels.is_empty() {
            meta.labels = Some(self.labels);
        }
        if !self.annotations.is_empty() {
            meta.annotations = Some(self.annotations);
        }
        if !self.finalizers.is_empty() {
            meta.finalizers = Some(self.finalizers);
        }
        if let Some(owner) = self.owner {
            meta.owner_references = Some(vec![owner]);
        }
        if self.uid.is_some() {
            meta.uid = self.uid;
        }
    }
}

fn finish(kind: &str, errors: Vec<String>) -> Result<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Builder {
            kind: kind.to_string(),
            errors,
        })
    }
}

// =============================================================================
// PoolClusterClaim
// =============================================================================

/// Builder for [`PoolClusterClaim`]
#[derive(Debug, Default)]
pub struct PoolClusterClaimBuilder {
    meta: MetaParts,
    spec: PoolClusterClaimSpec,
    errors: Vec<String>,
}

impl PoolClusterClaimBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: &str) -> Self {
        if name.is_empty() {
            self.errors.push("missing name".into());
        } else {
            self.meta.name = Some(name.to_string());
        }
        self
    }

    pub fn with_disk_kind(mut self, kind: DiskKind) -> Self {
        self.spec.disk_kind = kind;
        self
    }

    /// Switch to auto mode with `max_pools` pools of `pool_type`
    pub fn with_auto(mut self, max_pools: u32, pool_type: RaidType) -> Self {
        if max_pools == 0 {
            self.errors.push("auto mode needs maxPools greater than zero".into());
        }
        self.spec.mode = ProvisioningMode::Auto;
        self.spec.max_pools = Some(max_pools);
        self.spec.pool_config = Some(PoolConfig {
            pool_type: Some(pool_type.to_string()),
            ..Default::default()
        });
        self
    }

    /// Add a manual pool pinned to `node` by host name
    pub fn with_pool_on_node(self, node: &str, raid_type: RaidType, groups: &[&[&str]]) -> Self {
        let spec = PoolSpec {
            node_selector: BTreeMap::from([(HOSTNAME_LABEL.to_string(), node.to_string())]),
            pool_config: PoolConfig {
                default_raid_group_type: Some(raid_type.to_string()),
                ..Default::default()
            },
            raid_groups: groups
                .iter()
                .map(|devices| RaidGroup {
                    raid_type: raid_type.to_string(),
                    block_devices: devices.iter().map(|d| (*d).into()).collect(),
                })
                .collect(),
        };
        self.with_pool(spec)
    }

    pub fn with_pool(mut self, pool: PoolSpec) -> Self {
        if pool.node_selector.is_empty() {
            self.errors.push("pool spec without node selector".into());
        }
        self.spec.mode = ProvisioningMode::Manual;
        self.spec.pools.push(pool);
        self
    }

    pub fn with_annotation(mut self, key: &str, value: &str) -> Self {
        self.meta.annotations.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_uid(mut self, uid: &str) -> Self {
        self.meta.uid = Some(uid.to_string());
        self
    }

    pub fn build(self) -> Result<PoolClusterClaim> {
        let mut errors = self.errors;
        let name = self.meta.name.clone().unwrap_or_default();
        if self.meta.name.is_none() && !errors.iter().any(|e| e == "missing name") {
            errors.push("missing name".into());
        }
        finish("PoolClusterClaim", errors)?;

        let mut pcc = PoolClusterClaim::new(&name, self.spec);
        self.meta.apply(&mut pcc);
        Ok(pcc)
    }
}

// =============================================================================
// Pool
// =============================================================================

/// Builder for [`Pool`]; validates raid group arity and device uniqueness
#[derive(Debug, Default)]
pub struct PoolBuilder {
    meta: MetaParts,
    host_name: Option<String>,
    node_selector: BTreeMap<String, String>,
    pool_config: PoolConfig,
    raid_groups: Vec<PoolRaidGroup>,
    errors: Vec<String>,
}

impl PoolBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: &str) -> Self {
        if name.is_empty() {
            self.errors.push("missing name".into());
        } else {
            self.meta.name = Some(name.to_string());
        }
        self
    }

    /// Label and owner-reference the pool to its claim
    pub fn with_owner(mut self, pcc: &PoolClusterClaim) -> Self {
        self.meta
            .labels
            .insert(PCC_NAME_LABEL.to_string(), pcc.name().to_string());
        match owner_reference(pcc) {
            Some(owner) => self.meta.owner = Some(owner),
            None => self
                .errors
                .push(format!("owner {} has no uid", pcc.name())),
        }
        self
    }

    pub fn with_host(mut self, node: &str) -> Self {
        if node.is_empty() {
            self.errors.push("missing host name".into());
        } else {
            self.meta
                .labels
                .insert(HOSTNAME_LABEL.to_string(), node.to_string());
            self.host_name = Some(node.to_string());
        }
        self
    }

    pub fn with_node_selector(mut self, selector: BTreeMap<String, String>) -> Self {
        self.node_selector = selector;
        self
    }

    pub fn with_pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    pub fn with_raid_group(mut self, group: PoolRaidGroup) -> Self {
        if let Err(reason) = group.r#type.check_count(group.block_devices.len()) {
            self.errors.push(format!("raid group {}: {}", group.name, reason));
        }
        for device in &group.block_devices {
            if device.device_id.is_empty() {
                self.errors.push(format!(
                    "block device {} has no device ID",
                    device.block_device_name
                ));
            }
        }
        self.raid_groups.push(group);
        self
    }

    pub fn with_raid_groups(self, groups: impl IntoIterator<Item = PoolRaidGroup>) -> Self {
        groups.into_iter().fold(self, Self::with_raid_group)
    }

    pub fn build(self) -> Result<Pool> {
        let mut errors = self.errors;
        if self.meta.name.is_none() && !errors.iter().any(|e| e == "missing name") {
            errors.push("missing name".into());
        }
        if self.host_name.is_none() && !errors.iter().any(|e| e == "missing host name") {
            errors.push("missing host name".into());
        }
        if self.raid_groups.is_empty() {
            errors.push("pool needs at least one raid group".into());
        }
        let mut seen = BTreeSet::new();
        for device in self.raid_groups.iter().flat_map(|g| g.device_names()) {
            if !seen.insert(device) {
                errors.push(format!("block device {} used twice", device));
            }
        }
        finish("Pool", errors)?;

        let name = self.meta.name.clone().unwrap_or_default();
        let mut pool = Pool::new(
            &name,
            PoolSpecification {
                host_name: self.host_name.unwrap_or_default(),
                node_selector: self.node_selector,
                pool_config: self.pool_config,
                raid_groups: self.raid_groups,
            },
        );
        self.meta.apply(&mut pool);
        Ok(pool)
    }
}

/// Raid group entry for a device
pub fn pool_block_device(bd: &BlockDevice) -> PoolBlockDevice {
    PoolBlockDevice {
        block_device_name: bd.name().to_string(),
        device_id: bd.device_id().to_string(),
        capacity: bd.spec.capacity,
    }
}

// =============================================================================
// BlockDevice
// =============================================================================

/// Builder for [`BlockDevice`]
#[derive(Debug, Default)]
pub struct BlockDeviceBuilder {
    meta: MetaParts,
    spec: Option<BlockDeviceSpec>,
    status: BlockDeviceStatus,
    errors: Vec<String>,
}

impl BlockDeviceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn spec(&mut self) -> &mut BlockDeviceSpec {
        self.spec.get_or_insert_with(|| BlockDeviceSpec {
            node_name: String::new(),
            path: String::new(),
            capacity: 0,
            device_type: DiskKind::Disk,
            dev_links: vec![],
            filesystem: None,
            partitioned: false,
            claim_ref: None,
        })
    }

    pub fn with_name(mut self, name: &str) -> Self {
        if name.is_empty() {
            self.errors.push("missing name".into());
        } else {
            self.meta.name = Some(name.to_string());
        }
        self
    }

    pub fn with_uid(mut self, uid: &str) -> Self {
        self.meta.uid = Some(uid.to_string());
        self
    }

    pub fn with_node(mut self, node: &str) -> Self {
        if node.is_empty() {
            self.errors.push("missing node name".into());
        }
        self.meta
            .labels
            .insert(HOSTNAME_LABEL.to_string(), node.to_string());
        self.spec().node_name = node.to_string();
        self
    }

    pub fn with_capacity(mut self, bytes: u64) -> Self {
        self.spec().capacity = bytes;
        self
    }

    pub fn with_kind(mut self, kind: DiskKind) -> Self {
        self.spec().device_type = kind;
        self
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.spec().path = path.to_string();
        self
    }

    pub fn with_dev_link(mut self, kind: &str, link: &str) -> Self {
        let links = &mut self.spec().dev_links;
        match links.iter_mut().find(|l| l.kind == kind) {
            Some(existing) => existing.links.push(link.to_string()),
            None => links.push(DevLink {
                kind: kind.to_string(),
                links: vec![link.to_string()],
            }),
        }
        self
    }

    pub fn with_filesystem(mut self, fs_type: &str, mount_point: &str) -> Self {
        self.spec().filesystem = Some(FileSystemInfo {
            fs_type: Some(fs_type.to_string()),
            mount_point: Some(mount_point.to_string()).filter(|m| !m.is_empty()),
        });
        self
    }

    pub fn partitioned(mut self) -> Self {
        self.spec().partitioned = true;
        self
    }

    pub fn active(mut self, active: bool) -> Self {
        self.status.state = if active {
            DeviceState::Active
        } else {
            DeviceState::Inactive
        };
        self
    }

    /// Mark the device claimed by `claim`
    pub fn claimed_by(mut self, claim: &str) -> Self {
        self.status.claim_state = ClaimState::Claimed;
        self.spec().claim_ref = Some(claim.to_string());
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.meta.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(mut self) -> Result<BlockDevice> {
        let spec = self.spec().clone();
        let mut errors = self.errors;
        if self.meta.name.is_none() && !errors.iter().any(|e| e == "missing name") {
            errors.push("missing name".into());
        }
        if spec.node_name.is_empty() && !errors.iter().any(|e| e == "missing node name") {
            errors.push("missing node name".into());
        }
        finish("BlockDevice", errors)?;

        let name = self.meta.name.clone().unwrap_or_default();
        let mut bd = BlockDevice::new(&name, spec);
        bd.status = Some(self.status);
        self.meta.apply(&mut bd);
        Ok(bd)
    }
}

// =============================================================================
// BlockDeviceClaim
// =============================================================================

/// Builder for [`BlockDeviceClaim`]
#[derive(Debug, Default)]
pub struct BlockDeviceClaimBuilder {
    meta: MetaParts,
    device: Option<String>,
    host_name: String,
    capacity: u64,
    errors: Vec<String>,
}

impl BlockDeviceClaimBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim for `bd`, named deterministically from its UID
    pub fn for_device(bd: &BlockDevice) -> Self {
        let mut builder = Self::new();
        builder.meta.name = Some(block_device_claim_name(bd.uid_or_name()));
        builder.device = Some(bd.name().to_string());
        builder.host_name = bd.node().to_string();
        builder.capacity = bd.spec.capacity;
        builder
            .meta
            .labels
            .insert(HOSTNAME_LABEL.to_string(), bd.node().to_string());
        builder
    }

    pub fn with_name(mut self, name: &str) -> Self {
        if name.is_empty() {
            self.errors.push("missing name".into());
        } else {
            self.meta.name = Some(name.to_string());
        }
        self
    }

    pub fn with_block_device(mut self, device: &str) -> Self {
        if device.is_empty() {
            self.errors.push("missing block device name".into());
        } else {
            self.device = Some(device.to_string());
        }
        self
    }

    /// Label, finalize and owner-reference the claim to a pool cluster claim
    pub fn with_owner(mut self, pcc: &PoolClusterClaim) -> Self {
        self.meta
            .labels
            .insert(PCC_NAME_LABEL.to_string(), pcc.name().to_string());
        self.meta
            .finalizers
            .push(POOL_PROTECTION_FINALIZER.to_string());
        match owner_reference(pcc) {
            Some(owner) => self.meta.owner = Some(owner),
            None => self
                .errors
                .push(format!("owner {} has no uid", pcc.name())),
        }
        self
    }

    /// Only the owner label, for claims that exist outside a reconcile
    pub fn with_owner_label(mut self, pcc: &str) -> Self {
        self.meta
            .labels
            .insert(PCC_NAME_LABEL.to_string(), pcc.to_string());
        self
    }

    pub fn with_predecessor(mut self, device: &str) -> Self {
        if device.is_empty() {
            self.errors.push("empty predecessor".into());
        } else {
            self.meta
                .annotations
                .insert(PREDECESSOR_ANNOTATION.to_string(), device.to_string());
        }
        self
    }

    pub fn build(self) -> Result<BlockDeviceClaim> {
        let mut errors = self.errors;
        if self.meta.name.is_none() && !errors.iter().any(|e| e == "missing name") {
            errors.push("missing name".into());
        }
        if self.device.is_none() && !errors.iter().any(|e| e == "missing block device name") {
            errors.push("missing block device name".into());
        }
        finish("BlockDeviceClaim", errors)?;

        let name = self.meta.name.clone().unwrap_or_default();
        let mut bdc = BlockDeviceClaim::new(
            &name,
            BlockDeviceClaimSpec {
                block_device_name: self.device.unwrap_or_default(),
                host_name: self.host_name,
                capacity: self.capacity,
            },
        );
        self.meta.apply(&mut bdc);
        Ok(bdc)
    }
}

// =============================================================================
// VolumeClaim
// =============================================================================

/// Builder for [`VolumeClaim`]
#[derive(Debug, Default)]
pub struct VolumeClaimBuilder {
    meta: MetaParts,
    replica_count: Option<u32>,
    pools: Vec<String>,
    status: Option<VolumeClaimStatus>,
    errors: Vec<String>,
}

impl VolumeClaimBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: &str) -> Self {
        if name.is_empty() {
            self.errors.push("missing name".into());
        } else {
            self.meta.name = Some(name.to_string());
        }
        self
    }

    pub fn with_replica_count(mut self, count: u32) -> Self {
        if count == 0 {
            self.errors.push("replica count must be positive".into());
        }
        self.replica_count = Some(count);
        self
    }

    pub fn with_pools(mut self, pools: &[&str]) -> Self {
        self.pools = pools.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_status(mut self, phase: VolumeClaimPhase, pools: &[&str]) -> Self {
        self.status = Some(VolumeClaimStatus {
            phase,
            pool_info: pools.iter().map(|p| p.to_string()).collect(),
        });
        self
    }

    pub fn build(self) -> Result<VolumeClaim> {
        let mut errors = self.errors;
        if self.meta.name.is_none() && !errors.iter().any(|e| e == "missing name") {
            errors.push("missing name".into());
        }
        if self.replica_count.is_none() {
            errors.push("missing replica count".into());
        }
        finish("VolumeClaim", errors)?;

        let name = self.meta.name.clone().unwrap_or_default();
        let mut vc = VolumeClaim::new(
            &name,
            VolumeClaimSpec {
                replica_count: self.replica_count.unwrap_or_default(),
                capacity: 0,
                replica_pool_info: self.pools.iter().map(|p| p.as_str().into()).collect(),
            },
        );
        vc.status = self.status;
        self.meta.apply(&mut vc);
        Ok(vc)
    }
}

// =============================================================================
// VolumeReplica
// =============================================================================

/// Builder for [`VolumeReplica`]
#[derive(Debug, Default)]
pub struct VolumeReplicaBuilder {
    meta: MetaParts,
    errors: Vec<String>,
}

impl VolumeReplicaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: &str) -> Self {
        if name.is_empty() {
            self.errors.push("missing name".into());
        } else {
            self.meta.name = Some(name.to_string());
        }
        self
    }

    pub fn on_pool(mut self, pool: &str) -> Self {
        if pool.is_empty() {
            self.errors.push("missing pool name".into());
        }
        self.meta
            .labels
            .insert(POOL_NAME_LABEL.to_string(), pool.to_string());
        self
    }

    pub fn for_volume(mut self, volume: &str) -> Self {
        self.meta
            .labels
            .insert(VOLUME_NAME_LABEL.to_string(), volume.to_string());
        self
    }

    pub fn build(self) -> Result<VolumeReplica> {
        let mut errors = self.errors;
        if self.meta.name.is_none() && !errors.iter().any(|e| e == "missing name") {
            errors.push("missing name".into());
        }
        if !self.meta.labels.contains_key(POOL_NAME_LABEL) {
            errors.push("missing pool name".into());
        }
        finish("VolumeReplica", errors)?;

        let name = self.meta.name.clone().unwrap_or_default();
        let mut vr = VolumeReplica::new(
            &name,
            VolumeReplicaSpec {
                capacity: 0,
                target_ip: None,
            },
        );
        self.meta.apply(&mut vr);
        Ok(vr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn pcc_with_uid() -> PoolClusterClaim {
        PoolClusterClaimBuilder::new()
            .with_name("pcc-a")
            .with_uid("uid-pcc-a")
            .with_auto(2, RaidType::Striped)
            .build()
            .unwrap()
    }

    fn device(name: &str) -> BlockDevice {
        BlockDeviceBuilder::new()
            .with_name(name)
            .with_uid(&format!("uid-{}", name))
            .with_node("n1")
            .with_capacity(1 << 30)
            .with_dev_link("by-id", &format!("/dev/disk/by-id/{}", name))
            .active(true)
            .build()
            .unwrap()
    }

    #[test]
    fn test_claim_name_is_deterministic() {
        let a = block_device_claim_name("uid-1");
        let b = block_device_claim_name("uid-1");
        let c = block_device_claim_name("uid-2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("bdc-"));
        assert_eq!(a.len(), 4 + 32);
        assert_eq!(pool_name("pcc-a", "n1"), pool_name("pcc-a", "n1"));
        assert_ne!(pool_name("pcc-a", "n1"), pool_name("pcc-a", "n2"));
    }

    #[test]
    fn test_builder_accumulates_errors() {
        let err = PoolBuilder::new()
            .with_name("")
            .with_host("")
            .with_raid_group(PoolRaidGroup {
                name: "group0".into(),
                r#type: RaidType::Mirrored,
                block_devices: vec![pool_block_device(&device("d1"))],
            })
            .build()
            .unwrap_err();

        assert_matches!(err, Error::Builder { ref kind, ref errors } if kind == "Pool" && errors.len() == 3);
    }

    #[test]
    fn test_pool_builder_rejects_duplicate_devices() {
        let d1 = pool_block_device(&device("d1"));
        let err = PoolBuilder::new()
            .with_name("p")
            .with_host("n1")
            .with_raid_group(PoolRaidGroup {
                name: "group0".into(),
                r#type: RaidType::Striped,
                block_devices: vec![d1.clone(), d1],
            })
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("used twice"));
    }

    #[test]
    fn test_pool_builder_with_owner() {
        let pcc = pcc_with_uid();
        let pool = PoolBuilder::new()
            .with_name(&pool_name("pcc-a", "n1"))
            .with_owner(&pcc)
            .with_host("n1")
            .with_raid_group(PoolRaidGroup {
                name: "group0".into(),
                r#type: RaidType::Striped,
                block_devices: vec![pool_block_device(&device("d1"))],
            })
            .build()
            .unwrap();

        assert_eq!(pool.pcc_name(), Some("pcc-a"));
        let owners = pool.metadata.owner_references.unwrap();
        assert_eq!(owners[0].uid, "uid-pcc-a");
        assert_eq!(owners[0].controller, Some(true));
    }

    #[test]
    fn test_claim_builder_for_device() {
        let pcc = pcc_with_uid();
        let bd = device("d3");
        let bdc = BlockDeviceClaimBuilder::for_device(&bd)
            .with_owner(&pcc)
            .with_predecessor("d2")
            .build()
            .unwrap();

        assert_eq!(bdc.name(), block_device_claim_name("uid-d3"));
        assert_eq!(bdc.block_device(), "d3");
        assert_eq!(bdc.spec.host_name, "n1");
        assert!(bdc.is_owned_by("pcc-a"));
        assert!(bdc.has_finalizer());
        assert_eq!(bdc.predecessor(), Some("d2"));
    }

    #[test]
    fn test_claim_builder_without_owner_uid() {
        let pcc = PoolClusterClaimBuilder::new()
            .with_name("no-uid")
            .with_auto(1, RaidType::Striped)
            .build()
            .unwrap();
        let err = BlockDeviceClaimBuilder::for_device(&device("d1"))
            .with_owner(&pcc)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("has no uid"));
    }

    #[test]
    fn test_block_device_builder() {
        let bd = BlockDeviceBuilder::new()
            .with_name("sparse-1")
            .with_node("n2")
            .with_kind(DiskKind::Sparse)
            .with_path("/var/openebs/sparse/0")
            .with_filesystem("ext4", "/mnt")
            .partitioned()
            .claimed_by("bdc-x")
            .active(false)
            .build()
            .unwrap();
        assert_eq!(bd.node(), "n2");
        assert!(!bd.is_active());
        assert!(bd.is_claimed());
        assert!(bd.has_filesystem());
        assert!(bd.spec.partitioned);
        assert_eq!(bd.device_id(), "/var/openebs/sparse/0");

        let err = BlockDeviceBuilder::new().build().unwrap_err();
        assert_matches!(err, Error::Builder { ref errors, .. } if errors.len() == 2);
    }

    #[test]
    fn test_claim_and_replica_builders() {
        let pcc = PoolClusterClaimBuilder::new()
            .with_name("pcc-m")
            .with_pool_on_node("n1", RaidType::Mirrored, &[&["d1", "d2"]])
            .with_annotation(crate::crd::SKIP_VALIDATION_ANNOTATION, "true")
            .build()
            .unwrap();
        assert_eq!(pcc.spec.mode, ProvisioningMode::Manual);
        assert!(pcc.skips_validation());
        assert_eq!(pcc.spec.pools[0].raid_groups[0].block_devices.len(), 2);

        let vc = VolumeClaimBuilder::new()
            .with_name("vol-1")
            .with_replica_count(1)
            .with_pools(&["p1"])
            .with_status(VolumeClaimPhase::Bound, &["p1"])
            .build()
            .unwrap();
        assert_eq!(vc.status_pool_names(), vec!["p1"]);

        let vr = VolumeReplicaBuilder::new()
            .with_name("vol-1-p1")
            .on_pool("p1")
            .for_volume("vol-1")
            .build()
            .unwrap();
        assert_eq!(vr.pool_name(), Some("p1"));

        assert!(VolumeReplicaBuilder::new().with_name("x").build().is_err());
        assert!(VolumeClaimBuilder::new().with_name("x").build().is_err());
    }
}
