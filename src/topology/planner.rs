//! Topology planner
//!
//! Turns a PoolClusterClaim and a [`DeviceIndex`] into a [`Plan`]: the pools
//! that should be created this cycle, each pinned to one node with its raid
//! groups fully resolved to device IDs.
//!
//! Planning is pure. Nodes are chosen in name order and devices within a
//! node in name order, so identical inputs give identical plans.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use super::device_index::DeviceIndex;
use crate::crd::{
    BlockDevice, PoolBlockDevice, PoolClusterClaim, PoolConfig, PoolRaidGroup, PoolSpec,
    ProvisioningMode, RaidGroup, RaidType, HOSTNAME_LABEL,
};
use crate::domain::{pool_block_device, pool_name};
use crate::error::{Error, Result};

/// Raid groups per pool in auto mode. Striped pools get one group of
/// `device_count * DISK_COUNT_MULTIPLIER` devices instead.
pub const DISK_COUNT_MULTIPLIER: usize = 1;

/// Name of the `i`-th raid group of a pool
pub fn group_name(i: usize) -> String {
    format!("group{}", i)
}

// =============================================================================
// Plan
// =============================================================================

/// One pool to create
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanEntry {
    pub pool_name: String,
    pub node: String,
    pub node_selector: BTreeMap<String, String>,
    pub pool_config: PoolConfig,
    pub raid_groups: Vec<PoolRaidGroup>,
}

impl PlanEntry {
    pub fn block_device_names(&self) -> impl Iterator<Item = &str> {
        self.raid_groups.iter().flat_map(|g| g.device_names())
    }
}

/// A manual pool spec that could not be placed this cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedPool {
    pub selector: String,
    pub reason: String,
}

/// Result of planning one cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub entries: Vec<PlanEntry>,
    pub skipped: Vec<SkippedPool>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn nodes(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.node.as_str()).collect()
    }
}

// =============================================================================
// Planner
// =============================================================================

/// Computes placement for one claim
#[derive(Debug, Clone, Copy, Default)]
pub struct Planner;

impl Planner {
    pub fn new() -> Self {
        Self
    }

    /// Plan the pools still missing for `pcc`
    pub fn plan(&self, pcc: &PoolClusterClaim, index: &DeviceIndex) -> Result<Plan> {
        let plan = match pcc.spec.mode {
            ProvisioningMode::Auto => self.plan_auto(pcc, index)?,
            ProvisioningMode::Manual => self.plan_manual(pcc, index)?,
        };
        debug!(
            pcc = %pcc.name(),
            mode = %pcc.spec.mode,
            planned = plan.entries.len(),
            skipped = plan.skipped.len(),
            "Computed plan"
        );
        Ok(plan)
    }

    fn plan_auto(&self, pcc: &PoolClusterClaim, index: &DeviceIndex) -> Result<Plan> {
        let raid_type = pcc.auto_raid_type().ok_or_else(|| {
            Error::Validation(format!(
                "pool cluster claim {} in auto mode has no valid pool type",
                pcc.name()
            ))
        })?;

        let pending = pcc.desired_pool_count().saturating_sub(index.pools().len());
        if pending == 0 {
            return Ok(Plan::default());
        }

        let required = raid_type.device_count() * DISK_COUNT_MULTIPLIER;
        let candidates = index.candidate_nodes();
        if candidates.is_empty() {
            return Err(Error::NoCandidates {
                pcc: pcc.name().to_string(),
            });
        }

        let qualified: Vec<(&String, &Vec<BlockDevice>)> = candidates
            .iter()
            .filter(|(_, devices)| devices.len() >= required)
            .collect();
        if qualified.is_empty() {
            // Report the best-equipped node so the message is actionable
            let (node, devices) = candidates
                .iter()
                .max_by(|a, b| a.1.len().cmp(&b.1.len()).then_with(|| b.0.cmp(a.0)))
                .map(|(n, d)| (n.clone(), d.len()))
                .unwrap_or_default();
            return Err(Error::InsufficientDevicesOnNode {
                node,
                required,
                found: devices,
            });
        }

        let pool_config = pcc.spec.pool_config.clone().unwrap_or_default();
        let mut plan = Plan::default();
        for (node, devices) in qualified.into_iter().take(pending) {
            let chosen = &devices[..required];
            let raid_groups = chunk_groups(raid_type, chosen)?;
            plan.entries.push(PlanEntry {
                pool_name: pool_name(pcc.name(), node),
                node: node.clone(),
                node_selector: BTreeMap::from([(HOSTNAME_LABEL.to_string(), node.clone())]),
                pool_config: pool_config.clone(),
                raid_groups,
            });
        }
        Ok(plan)
    }

    fn plan_manual(&self, pcc: &PoolClusterClaim, index: &DeviceIndex) -> Result<Plan> {
        let used_nodes = index.used_nodes();
        let mut visited = BTreeSet::new();
        let mut plan = Plan::default();

        for spec in &pcc.spec.pools {
            let node = match resolve_node(spec, index)? {
                Some(node) => node,
                None => {
                    plan.skipped.push(SkippedPool {
                        selector: spec.selector_string(),
                        reason: "node selector matches no node".into(),
                    });
                    continue;
                }
            };
            if !visited.insert(node.clone()) || used_nodes.contains(&node) {
                continue;
            }

            let raid_groups = spec
                .raid_groups
                .iter()
                .enumerate()
                .map(|(i, group)| resolve_group(spec, group, &group_name(i), &node, index))
                .collect::<Result<Vec<_>>>()?;

            plan.entries.push(PlanEntry {
                pool_name: pool_name(pcc.name(), &node),
                node_selector: spec.node_selector.clone(),
                pool_config: spec.pool_config.clone(),
                node,
                raid_groups,
            });
        }
        Ok(plan)
    }
}

/// Node a manual pool spec pins to. `None` when the selector matches no node.
pub fn resolve_node(spec: &PoolSpec, index: &DeviceIndex) -> Result<Option<String>> {
    let matched = index.nodes_matching(&spec.node_selector);
    match matched.len() {
        0 => Ok(None),
        1 => Ok(matched.into_iter().next()),
        n => Err(Error::NodeSelectorUnmatched {
            selector: spec.selector_string(),
            matched: n,
        }),
    }
}

/// Parse the raid type a group resolves to
pub fn group_raid_type(spec: &PoolSpec, group: &RaidGroup, name: &str) -> Result<RaidType> {
    let declared = spec.raid_type_of(group);
    declared.parse().map_err(|reason: String| Error::InvalidArity {
        group: name.to_string(),
        raid_type: declared.to_string(),
        count: group.block_devices.len(),
        reason,
    })
}

/// Resolve one manual raid group against the index: arity, node membership,
/// device state and device IDs
pub fn resolve_group(
    spec: &PoolSpec,
    group: &RaidGroup,
    name: &str,
    node: &str,
    index: &DeviceIndex,
) -> Result<PoolRaidGroup> {
    let raid_type = group_raid_type(spec, group, name)?;
    raid_type
        .check_count(group.block_devices.len())
        .map_err(|reason| Error::InvalidArity {
            group: name.to_string(),
            raid_type: raid_type.to_string(),
            count: group.block_devices.len(),
            reason,
        })?;

    let block_devices = group
        .device_names()
        .map(|device| resolve_device(device, node, index))
        .collect::<Result<Vec<_>>>()?;

    Ok(PoolRaidGroup {
        name: name.to_string(),
        r#type: raid_type,
        block_devices,
    })
}

/// Look up a device that must live on `node` and be usable by this claim
pub fn resolve_device(device: &str, node: &str, index: &DeviceIndex) -> Result<PoolBlockDevice> {
    let bd = index.device(device).ok_or_else(|| Error::ResourceNotFound {
        kind: "BlockDevice".into(),
        name: device.to_string(),
    })?;
    if bd.node() != node {
        return Err(Error::DeviceNotOnNode {
            device: device.to_string(),
            node: node.to_string(),
        });
    }
    if !bd.is_active() {
        return Err(Error::DeviceInactive {
            device: device.to_string(),
        });
    }
    if !index.is_claimable(bd) {
        return Err(Error::PreconditionFailed(format!(
            "block device {} is claimed by another pool cluster claim",
            device
        )));
    }
    with_device_id(bd)
}

fn with_device_id(bd: &BlockDevice) -> Result<PoolBlockDevice> {
    let entry = pool_block_device(bd);
    if entry.device_id.is_empty() {
        return Err(Error::DeviceMissingId {
            device: bd.name().to_string(),
        });
    }
    Ok(entry)
}

/// Split `devices` into raid groups of `raid_type`
fn chunk_groups(raid_type: RaidType, devices: &[BlockDevice]) -> Result<Vec<PoolRaidGroup>> {
    let resolved = devices
        .iter()
        .map(with_device_id)
        .collect::<Result<Vec<_>>>()?;

    let per_group = if raid_type.is_striped() {
        resolved.len()
    } else {
        raid_type.device_count()
    };
    Ok(resolved
        .chunks(per_group.max(1))
        .enumerate()
        .map(|(i, chunk)| PoolRaidGroup {
            name: group_name(i),
            r#type: raid_type,
            block_devices: chunk.to_vec(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::DiskKind;
    use crate::domain::{BlockDeviceBuilder, PoolBuilder, PoolClusterClaimBuilder};
    use crate::fixtures::{auto_pcc, disk, node, sparse};
    use assert_matches::assert_matches;

    fn five_node_index(pcc: &PoolClusterClaim) -> DeviceIndex {
        let devices = (1..=5)
            .map(|i| sparse(&format!("d{}", i), &format!("n{}", i)))
            .collect();
        let nodes = (1..=5).map(|i| node(&format!("n{}", i))).collect();
        DeviceIndex::from_parts(pcc, vec![], devices, vec![], nodes)
    }

    #[test]
    fn test_auto_striped_picks_first_nodes() {
        let pcc = auto_pcc("p", 3, RaidType::Striped);
        let plan = Planner::new().plan(&pcc, &five_node_index(&pcc)).unwrap();

        assert_eq!(plan.nodes(), vec!["n1", "n2", "n3"]);
        for entry in &plan.entries {
            assert_eq!(entry.raid_groups.len(), 1);
            assert_eq!(entry.raid_groups[0].name, "group0");
            assert_eq!(entry.raid_groups[0].block_devices.len(), 1);
            assert_eq!(entry.pool_name, pool_name("p", &entry.node));
        }
        assert_eq!(
            plan.entries[1].raid_groups[0].block_devices[0].device_id,
            "/dev/disk/by-id/d2"
        );
    }

    #[test]
    fn test_plan_is_deterministic() {
        let pcc = auto_pcc("p", 3, RaidType::Striped);
        let index = five_node_index(&pcc);

        // Same cluster state presented in a different order
        let mut shuffled_devices: Vec<BlockDevice> = (1..=5)
            .rev()
            .map(|i| sparse(&format!("d{}", i), &format!("n{}", i)))
            .collect();
        shuffled_devices.rotate_left(2);
        let shuffled = DeviceIndex::from_parts(&pcc, vec![], shuffled_devices, vec![], vec![]);

        let planner = Planner::new();
        let a = serde_json::to_vec(&planner.plan(&pcc, &index).unwrap()).unwrap();
        let b = serde_json::to_vec(&planner.plan(&pcc, &index).unwrap()).unwrap();
        let c = serde_json::to_vec(&planner.plan(&pcc, &shuffled).unwrap()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn test_auto_mirrored_chunks_devices() {
        let pcc = PoolClusterClaimBuilder::new()
            .with_name("m")
            .with_auto(1, RaidType::Mirrored)
            .build()
            .unwrap();
        let devices = vec![disk("c", "n1", 10), disk("a", "n1", 10), disk("b", "n1", 10)];
        let index = DeviceIndex::from_parts(&pcc, vec![], devices, vec![], vec![]);

        let plan = Planner::new().plan(&pcc, &index).unwrap();
        assert_eq!(plan.entries.len(), 1);
        let group = &plan.entries[0].raid_groups[0];
        assert_eq!(group.r#type, RaidType::Mirrored);
        assert_eq!(group.device_names().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_auto_counts_existing_pools() {
        let pcc = auto_pcc("p", 2, RaidType::Striped);
        let existing = PoolBuilder::new()
            .with_name(&pool_name("p", "n1"))
            .with_owner(&pcc)
            .with_host("n1")
            .with_raid_group(PoolRaidGroup {
                name: "group0".into(),
                r#type: RaidType::Striped,
                block_devices: vec![pool_block_device(&sparse("d1", "n1"))],
            })
            .build()
            .unwrap();
        let devices = (1..=3)
            .map(|i| sparse(&format!("d{}", i), &format!("n{}", i)))
            .collect();
        let index = DeviceIndex::from_parts(&pcc, vec![existing.clone()], devices, vec![], vec![]);

        let plan = Planner::new().plan(&pcc, &index).unwrap();
        assert_eq!(plan.nodes(), vec!["n2"]);

        let full = DeviceIndex::from_parts(
            &pcc,
            vec![existing.clone(), {
                let mut second = existing;
                second.metadata.name = Some(pool_name("p", "n2"));
                second.spec.host_name = "n2".into();
                second
            }],
            vec![],
            vec![],
            vec![],
        );
        assert!(Planner::new().plan(&pcc, &full).unwrap().is_empty());
    }

    #[test]
    fn test_auto_errors() {
        let pcc = auto_pcc("p", 1, RaidType::Raidz);
        let empty = DeviceIndex::from_parts(&pcc, vec![], vec![], vec![], vec![]);
        assert_matches!(
            Planner::new().plan(&pcc, &empty),
            Err(Error::NoCandidates { ref pcc }) if pcc == "p"
        );

        let short = DeviceIndex::from_parts(
            &pcc,
            vec![],
            vec![sparse("a", "n1"), sparse("b", "n1"), sparse("c", "n2")],
            vec![],
            vec![],
        );
        assert_matches!(
            Planner::new().plan(&pcc, &short),
            Err(Error::InsufficientDevicesOnNode { ref node, required: 3, found: 2 }) if node == "n1"
        );

        let striped = auto_pcc("s", 1, RaidType::Striped);
        let no_id = BlockDeviceBuilder::new()
            .with_name("bare")
            .with_node("n1")
            .with_kind(DiskKind::Sparse)
            .active(true)
            .build()
            .unwrap();
        let index = DeviceIndex::from_parts(&striped, vec![], vec![no_id], vec![], vec![]);
        assert_matches!(
            Planner::new().plan(&striped, &index),
            Err(Error::DeviceMissingId { ref device }) if device == "bare"
        );
    }

    #[test]
    fn test_manual_plan_resolves_groups() {
        let pcc = PoolClusterClaimBuilder::new()
            .with_name("m")
            .with_uid("uid-m")
            .with_pool_on_node("n1", RaidType::Mirrored, &[&["d1", "d2"], &["d3", "d4"]])
            .build()
            .unwrap();
        let devices = (1..=4).map(|i| disk(&format!("d{}", i), "n1", 10)).collect();
        let index = DeviceIndex::from_parts(&pcc, vec![], devices, vec![], vec![node("n1")]);

        let plan = Planner::new().plan(&pcc, &index).unwrap();
        assert_eq!(plan.nodes(), vec!["n1"]);
        let groups = &plan.entries[0].raid_groups;
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[1].name, "group1");
        assert_eq!(groups[1].device_names().collect::<Vec<_>>(), vec!["d3", "d4"]);
    }

    #[test]
    fn test_manual_plan_errors() {
        let mirrored_three = PoolClusterClaimBuilder::new()
            .with_name("m")
            .with_pool_on_node("n1", RaidType::Mirrored, &[&["d1", "d2", "d3"]])
            .build()
            .unwrap();
        let devices: Vec<BlockDevice> = (1..=3).map(|i| disk(&format!("d{}", i), "n1", 10)).collect();
        let index = DeviceIndex::from_parts(&mirrored_three, vec![], devices.clone(), vec![], vec![node("n1")]);
        assert_matches!(
            Planner::new().plan(&mirrored_three, &index),
            Err(Error::InvalidArity { count: 3, .. })
        );

        let elsewhere = PoolClusterClaimBuilder::new()
            .with_name("m")
            .with_pool_on_node("n1", RaidType::Striped, &[&["d9"]])
            .build()
            .unwrap();
        let index = DeviceIndex::from_parts(
            &elsewhere,
            vec![],
            vec![disk("d9", "n2", 10)],
            vec![],
            vec![node("n1"), node("n2")],
        );
        assert_matches!(
            Planner::new().plan(&elsewhere, &index),
            Err(Error::DeviceNotOnNode { ref device, ref node }) if device == "d9" && node == "n1"
        );

        let inactive = BlockDeviceBuilder::new()
            .with_name("d9")
            .with_node("n1")
            .with_dev_link("by-id", "/dev/disk/by-id/d9")
            .active(false)
            .build()
            .unwrap();
        let index = DeviceIndex::from_parts(&elsewhere, vec![], vec![inactive], vec![], vec![node("n1")]);
        assert_matches!(
            Planner::new().plan(&elsewhere, &index),
            Err(Error::DeviceInactive { .. })
        );
    }

    #[test]
    fn test_manual_zero_match_is_skipped() {
        let pcc = PoolClusterClaimBuilder::new()
            .with_name("m")
            .with_pool_on_node("gone", RaidType::Striped, &[&["d1"]])
            .with_pool_on_node("n1", RaidType::Striped, &[&["d2"]])
            .build()
            .unwrap();
        let index = DeviceIndex::from_parts(
            &pcc,
            vec![],
            vec![disk("d1", "gone", 10), disk("d2", "n1", 10)],
            vec![],
            vec![node("n1")],
        );

        let plan = Planner::new().plan(&pcc, &index).unwrap();
        assert_eq!(plan.nodes(), vec!["n1"]);
        assert_eq!(plan.skipped.len(), 1);
        assert_eq!(plan.skipped[0].selector, "kubernetes.io/hostname=gone");
    }
}
