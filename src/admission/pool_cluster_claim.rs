//! PoolClusterClaim admission rules
//!
//! Structural checks need nothing but the object. Placement checks read
//! nodes, block devices and claims to confirm every referenced device can
//! actually back the pool it is listed under.

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::client::{ClientSet, ListSelector};
use crate::crd::{PoolClusterClaim, PoolSpec, RaidGroup, RaidType, PCC_NAME_LABEL, POOL_NAME_LABEL};
use crate::error::{Error, Result};
use crate::topology::planner::resolve_node;
use crate::topology::DeviceIndex;

use super::replacement;

fn invalid<T>(message: impl Into<String>) -> Result<T> {
    Err(Error::Validation(message.into()))
}

// =============================================================================
// Structure
// =============================================================================

/// Checks that need only the claim itself
pub fn validate_structure(pcc: &PoolClusterClaim) -> Result<()> {
    if pcc.is_auto() {
        return validate_auto(pcc);
    }
    if pcc.spec.pools.is_empty() {
        return invalid("pools in pool cluster claim should have at least one item");
    }

    let duplicates = duplicate_devices(pcc);
    if !duplicates.is_empty() {
        return invalid(format!(
            "pool cluster claim {} has duplicate blockdevices entries {:?}",
            pcc.name(),
            duplicates
        ));
    }

    for spec in &pcc.spec.pools {
        validate_pool_spec(spec).map_err(|e| Error::Validation(format!("invalid pool spec: {}", e)))?;
    }
    Ok(())
}

fn validate_auto(pcc: &PoolClusterClaim) -> Result<()> {
    if pcc.spec.max_pools.unwrap_or(0) == 0 {
        return invalid("maxPools should be at least 1 in auto mode");
    }
    if pcc.auto_raid_type().is_none() {
        return invalid("auto mode needs a supported poolType in poolConfig");
    }
    if !pcc.spec.pools.is_empty() {
        return invalid("pools cannot be listed in auto mode");
    }
    Ok(())
}

fn validate_pool_spec(spec: &PoolSpec) -> std::result::Result<(), String> {
    if spec.node_selector.is_empty() {
        return Err("node selector should not be empty".into());
    }
    if spec.raid_groups.is_empty() {
        return Err("at least one raid group should be present on pool spec".into());
    }
    spec.raid_groups
        .iter()
        .try_for_each(|group| validate_raid_group(spec, group))
}

fn validate_raid_group(spec: &PoolSpec, group: &RaidGroup) -> std::result::Result<(), String> {
    let declared = spec.raid_type_of(group);
    if declared.is_empty() {
        return Err("any one type at raid group or default raid group type be specified".into());
    }
    let raid_type: RaidType = declared
        .parse()
        .map_err(|_| format!("unsupported raid type '{}' specified", declared))?;
    raid_type
        .check_count(group.block_devices.len())
        .map_err(|reason| {
            format!(
                "number of block devices honouring raid type should be specified: {}",
                reason
            )
        })?;
    if group.device_names().any(str::is_empty) {
        return Err("block device name cannot be empty".into());
    }
    Ok(())
}

/// Device names listed more than once across the claim, sorted
fn duplicate_devices(pcc: &PoolClusterClaim) -> Vec<String> {
    let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
    for device in pcc.spec.pools.iter().flat_map(|p| p.block_device_names()) {
        *seen.entry(device).or_insert(0) += 1;
    }
    seen.into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(device, _)| device.to_string())
        .collect()
}

// =============================================================================
// Placement
// =============================================================================

/// Checks against the cluster: node uniqueness and device usability.
/// A selector matching no node is accepted and left to the reconciler.
pub async fn validate_placement(pcc: &PoolClusterClaim, clients: &ClientSet) -> Result<()> {
    check_placement(pcc, clients, &BTreeSet::new()).await
}

/// Devices in `in_use` already back the claim. They must still exist on the
/// pool's node, but their state is the node agent's concern.
async fn check_placement(
    pcc: &PoolClusterClaim,
    clients: &ClientSet,
    in_use: &BTreeSet<String>,
) -> Result<()> {
    if pcc.is_auto() {
        return Ok(());
    }
    let index = DeviceIndex::build(clients, pcc).await?;
    let mut nodes = BTreeSet::new();

    for spec in &pcc.spec.pools {
        let node = match resolve_node(spec, &index) {
            Ok(Some(node)) => node,
            Ok(None) => {
                debug!(selector = %spec.selector_string(), "Selector matches no node, skipping device checks");
                continue;
            }
            Err(e) => return invalid(e.to_string()),
        };
        if !nodes.insert(node.clone()) {
            return invalid(format!("duplicate node {} entry", node));
        }
        for device in spec.block_device_names() {
            check_device(device, &node, &index, in_use.contains(device))?;
        }
    }
    Ok(())
}

fn check_device(name: &str, node: &str, index: &DeviceIndex, in_use: bool) -> Result<()> {
    let Some(bd) = index.device(name) else {
        return invalid(format!("failed to get block device {}", name));
    };
    if bd.node() != node {
        return invalid(format!(
            "block device {} doesn't belong to pool node {}",
            name, node
        ));
    }
    if in_use {
        return Ok(());
    }
    if !bd.is_active() {
        return invalid(format!("block device {} is not active", name));
    }
    if bd.has_filesystem() {
        return invalid(format!("block device {} carries a filesystem", name));
    }
    if !index.is_claimable(bd) {
        return invalid(format!("can't use claimed blockdevice {}", name));
    }
    Ok(())
}

// =============================================================================
// Operations
// =============================================================================

pub async fn validate_create(pcc: &PoolClusterClaim, clients: &ClientSet) -> Result<()> {
    validate_structure(pcc)?;
    validate_placement(pcc, clients).await
}

/// Create checks, plus the shape of every change to a pool spec that exists
/// in both versions. Devices the old version already lists skip the
/// usability checks.
pub async fn validate_update(
    old: &PoolClusterClaim,
    new: &PoolClusterClaim,
    clients: &ClientSet,
) -> Result<()> {
    if old.spec == new.spec {
        return Ok(());
    }
    if old.spec.mode != new.spec.mode {
        return invalid(format!(
            "provisioning mode cannot change from {} to {}",
            old.spec.mode, new.spec.mode
        ));
    }
    validate_structure(new)?;
    check_placement(new, clients, &old.block_device_names()).await?;
    if new.is_auto() {
        return Ok(());
    }

    let index = DeviceIndex::build(clients, old).await?;
    for new_spec in &new.spec.pools {
        let Some(old_spec) = common_spec(old, new_spec, &index) else {
            continue;
        };
        replacement::validate_spec_change(old, old_spec, new_spec, &index)?;
    }
    Ok(())
}

/// The old pool spec that targets the same node as `spec`
fn common_spec<'a>(
    old: &'a PoolClusterClaim,
    spec: &PoolSpec,
    index: &DeviceIndex,
) -> Option<&'a PoolSpec> {
    let node = resolve_node(spec, index).ok().flatten();
    old.spec.pools.iter().find(|candidate| {
        candidate.node_selector == spec.node_selector
            || (node.is_some() && resolve_node(candidate, index).ok().flatten() == node)
    })
}

/// Refuse deletion while any owned pool still hosts a volume replica
pub async fn validate_delete(
    name: &str,
    pcc: Option<&PoolClusterClaim>,
    clients: &ClientSet,
) -> Result<()> {
    if pcc.map(PoolClusterClaim::skips_validation).unwrap_or(false) {
        debug!(pcc = %name, "Delete validation skipped by annotation");
        return Ok(());
    }
    let pools = clients
        .pools
        .list(&ListSelector::label(PCC_NAME_LABEL, name))
        .await?;
    for pool in &pools {
        let replicas = clients
            .volume_replicas
            .list(&ListSelector::label(POOL_NAME_LABEL, pool.name()))
            .await?;
        if !replicas.is_empty() {
            return invalid(format!(
                "invalid pcc {} deletion: volume still exists on pool {}",
                name,
                pool.name()
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{BlockDeviceRef, PoolConfig, HOSTNAME_LABEL, SKIP_VALIDATION_ANNOTATION};
    use crate::domain::{
        BlockDeviceBuilder, BlockDeviceClaimBuilder, PoolBuilder, PoolClusterClaimBuilder,
        VolumeReplicaBuilder,
    };
    use crate::fixtures::{auto_pcc, cluster_with, disk, manual_pcc, GIB};
    use assert_matches::assert_matches;

    fn message(result: Result<()>) -> String {
        match result {
            Err(Error::Validation(m)) => m,
            other => panic!("expected a validation error, got {:?}", other),
        }
    }

    fn spec_on(node: &str, groups: Vec<RaidGroup>) -> PoolSpec {
        PoolSpec {
            node_selector: BTreeMap::from([(HOSTNAME_LABEL.to_string(), node.to_string())]),
            pool_config: PoolConfig::default(),
            raid_groups: groups,
        }
    }

    fn group(raid_type: &str, devices: &[&str]) -> RaidGroup {
        RaidGroup {
            raid_type: raid_type.to_string(),
            block_devices: devices.iter().map(|d| BlockDeviceRef::from(*d)).collect(),
        }
    }

    fn claim_with(pools: Vec<PoolSpec>) -> PoolClusterClaim {
        let mut builder = PoolClusterClaimBuilder::new().with_name("c");
        for pool in pools {
            builder = builder.with_pool(pool);
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_empty_pool_list_rejected() {
        let mut pcc = manual_pcc("c", "n1", RaidType::Striped, &[&["d1"]]);
        pcc.spec.pools.clear();
        assert!(message(validate_structure(&pcc)).contains("at least one item"));
    }

    #[test]
    fn test_arity_rejections() {
        let striped_empty = claim_with(vec![spec_on("n1", vec![group("striped", &[])])]);
        assert!(message(validate_structure(&striped_empty)).contains("honouring raid type"));

        let mirrored_three = claim_with(vec![spec_on("n1", vec![group("mirrored", &["a", "b", "c"])])]);
        assert!(message(validate_structure(&mirrored_three)).contains("honouring raid type"));

        let raidz_ok = claim_with(vec![spec_on("n1", vec![group("raidz", &["a", "b", "c"])])]);
        assert!(validate_structure(&raidz_ok).is_ok());
    }

    #[test]
    fn test_raid_type_must_resolve() {
        let untyped = claim_with(vec![spec_on("n1", vec![group("", &["a"])])]);
        assert!(message(validate_structure(&untyped)).contains("default raid group type"));

        let unknown = claim_with(vec![spec_on("n1", vec![group("raid5", &["a"])])]);
        assert!(message(validate_structure(&unknown)).contains("unsupported raid type 'raid5'"));

        let mut inherited = spec_on("n1", vec![group("", &["a", "b"])]);
        inherited.pool_config.default_raid_group_type = Some("mirrored".into());
        assert!(validate_structure(&claim_with(vec![inherited])).is_ok());
    }

    #[test]
    fn test_duplicates_and_empty_names_rejected() {
        let duplicated = claim_with(vec![
            spec_on("n1", vec![group("striped", &["a", "b"])]),
            spec_on("n2", vec![group("striped", &["b"])]),
        ]);
        assert!(message(validate_structure(&duplicated)).contains("[\"b\"]"));

        let unnamed = claim_with(vec![spec_on("n1", vec![group("striped", &[""])])]);
        assert!(message(validate_structure(&unnamed)).contains("cannot be empty"));

        let mut no_selector = claim_with(vec![spec_on("n1", vec![group("striped", &["a"])])]);
        no_selector.spec.pools[0].node_selector.clear();
        assert!(message(validate_structure(&no_selector)).contains("node selector"));
    }

    #[test]
    fn test_auto_mode_structure() {
        assert!(validate_structure(&auto_pcc("a", 2, RaidType::Mirrored)).is_ok());
        let mut zero = auto_pcc("a", 2, RaidType::Mirrored);
        zero.spec.max_pools = Some(0);
        assert!(message(validate_structure(&zero)).contains("maxPools"));
    }

    #[tokio::test]
    async fn test_placement_checks_devices() {
        let formatted = BlockDeviceBuilder::new()
            .with_name("fs")
            .with_uid("uid-fs")
            .with_node("n1")
            .with_capacity(10 * GIB)
            .with_dev_link("by-id", "/dev/disk/by-id/fs")
            .with_filesystem("ext4", "/mnt")
            .active(true)
            .build()
            .unwrap();
        let devices = vec![disk("d1", "n1", 10), disk("d2", "n2", 10), formatted];
        let (_cluster, clients) = cluster_with(&["n1", "n2"], devices).await;

        let ok = manual_pcc("c", "n1", RaidType::Striped, &[&["d1"]]);
        assert!(validate_placement(&ok, &clients).await.is_ok());

        let foreign = manual_pcc("c", "n1", RaidType::Striped, &[&["d2"]]);
        assert!(message(validate_placement(&foreign, &clients).await).contains("doesn't belong"));

        let missing = manual_pcc("c", "n1", RaidType::Striped, &[&["ghost"]]);
        assert!(message(validate_placement(&missing, &clients).await).contains("ghost"));

        let with_fs = manual_pcc("c", "n1", RaidType::Striped, &[&["fs"]]);
        assert!(message(validate_placement(&with_fs, &clients).await).contains("filesystem"));

        let twice = claim_with(vec![
            spec_on("n1", vec![group("striped", &["d1"])]),
            spec_on("n1", vec![group("striped", &["fs"])]),
        ]);
        assert!(message(validate_placement(&twice, &clients).await).contains("duplicate node n1"));

        // No node matches: left to the reconciler
        let nowhere = manual_pcc("c", "n9", RaidType::Striped, &[&["d1"]]);
        assert!(validate_placement(&nowhere, &clients).await.is_ok());
    }

    #[tokio::test]
    async fn test_device_claimed_elsewhere_rejected() {
        let claimed = BlockDeviceBuilder::new()
            .with_name("d1")
            .with_uid("uid-d1")
            .with_node("n1")
            .with_capacity(10 * GIB)
            .with_dev_link("by-id", "/dev/disk/by-id/d1")
            .active(true)
            .claimed_by("bdc-other")
            .build()
            .unwrap();
        let (_cluster, clients) = cluster_with(&["n1"], vec![claimed.clone()]).await;
        let other = BlockDeviceClaimBuilder::for_device(&claimed)
            .with_name("bdc-other")
            .with_owner_label("someone-else")
            .build()
            .unwrap();
        clients.block_device_claims.create(&other).await.unwrap();

        let pcc = manual_pcc("c", "n1", RaidType::Striped, &[&["d1"]]);
        assert!(message(validate_placement(&pcc, &clients).await).contains("claimed"));
    }

    #[tokio::test]
    async fn test_delete_with_live_replicas_rejected() {
        let (_cluster, clients) = cluster_with(&["n1"], vec![disk("d1", "n1", 10)]).await;
        let q = PoolClusterClaimBuilder::new()
            .with_name("q")
            .with_uid("uid-q")
            .with_pool_on_node("n1", RaidType::Striped, &[&["d1"]])
            .build()
            .unwrap();
        let bd = clients.block_devices.get("d1").await.unwrap();
        let pool = PoolBuilder::new()
            .with_name("q-1")
            .with_owner(&q)
            .with_host("n1")
            .with_raid_group(crate::crd::PoolRaidGroup {
                name: "group0".into(),
                r#type: RaidType::Striped,
                block_devices: vec![crate::domain::pool_block_device(&bd)],
            })
            .build()
            .unwrap();
        clients.pools.create(&pool).await.unwrap();
        assert!(validate_delete("q", Some(&q), &clients).await.is_ok());

        let replica = VolumeReplicaBuilder::new()
            .with_name("vol-1-q-1")
            .on_pool("q-1")
            .for_volume("vol-1")
            .build()
            .unwrap();
        clients.volume_replicas.create(&replica).await.unwrap();
        let m = message(validate_delete("q", Some(&q), &clients).await);
        assert_eq!(m, "invalid pcc q deletion: volume still exists on pool q-1");

        let skipping = PoolClusterClaimBuilder::new()
            .with_name("q")
            .with_pool_on_node("n1", RaidType::Striped, &[&["d1"]])
            .with_annotation(SKIP_VALIDATION_ANNOTATION, "true")
            .build()
            .unwrap();
        assert!(validate_delete("q", Some(&skipping), &clients).await.is_ok());
    }

    #[tokio::test]
    async fn test_unchanged_spec_is_always_allowed() {
        let (_cluster, clients) = cluster_with(&["n1"], vec![]).await;
        // Would fail placement: d1 does not exist
        let pcc = manual_pcc("c", "n1", RaidType::Striped, &[&["d1"]]);
        let mut relabelled = pcc.clone();
        relabelled
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert("team".into(), "storage".into());
        assert!(validate_update(&pcc, &relabelled, &clients).await.is_ok());
    }

    #[tokio::test]
    async fn test_inactive_device_in_use_does_not_block_other_edits() {
        let inactive = |name: &str| {
            BlockDeviceBuilder::new()
                .with_name(name)
                .with_uid(&format!("uid-{}", name))
                .with_node("n1")
                .with_capacity(10 * GIB)
                .active(false)
                .build()
                .unwrap()
        };
        let (_cluster, clients) = cluster_with(&["n1"], vec![inactive("d1"), inactive("d2")]).await;
        let old = manual_pcc("c", "n1", RaidType::Striped, &[&["d1"]]);

        let mut compressed = old.clone();
        compressed.spec.pools[0].pool_config.compression = Some("lz4".into());
        assert!(validate_update(&old, &compressed, &clients).await.is_ok());

        // A device new to the claim is still checked
        let expanded = manual_pcc("c", "n1", RaidType::Striped, &[&["d1", "d2"]]);
        assert!(message(validate_update(&old, &expanded, &clients).await).contains("d2 is not active"));

        // A fresh claim on the same device is still checked
        assert!(message(validate_create(&old, &clients).await).contains("d1 is not active"));
    }

    #[tokio::test]
    async fn test_mode_switch_rejected() {
        let (_cluster, clients) = cluster_with(&["n1"], vec![disk("d1", "n1", 10)]).await;
        let manual = manual_pcc("c", "n1", RaidType::Striped, &[&["d1"]]);
        let auto = auto_pcc("c", 1, RaidType::Striped);
        assert_matches!(
            validate_update(&manual, &auto, &clients).await,
            Err(Error::Validation(ref m)) if m.contains("provisioning mode")
        );
    }
}
