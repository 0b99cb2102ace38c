//! Changes to pools that already exist
//!
//! A raid group of a live pool may change in exactly three ways: one device
//! swapped for another (replacement), devices appended to a striped group,
//! or whole groups appended to the pool (expansion). Anything else would
//! lose data and is refused. The admission webhook applies the same
//! [`classify`] rules before a change is stored; the reconciler asserts them
//! again before acting.

use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use crate::client::{ClientSet, DeleteOptions, PatchType};
use crate::crd::{
    BlockDevice, BlockDeviceClaim, Pool, PoolBlockDevice, PoolClusterClaim, PoolDeviceState,
    PoolRaidGroup, PoolSpec, RaidType, POOL_PROTECTION_FINALIZER, PREDECESSOR_ANNOTATION,
};
use crate::domain::predicate::pool;
use crate::domain::{BlockDeviceClaimBuilder, Filter};
use crate::error::{Error, Result};
use crate::topology::planner::{group_name, resolve_device, resolve_group};
use crate::topology::DeviceIndex;

// =============================================================================
// Group Classification
// =============================================================================

/// How the desired device list of a raid group differs from the current one
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupChange {
    Unchanged,
    /// Exactly one device swapped
    Replacement { old: String, new: String },
    /// Devices appended to a striped group
    Expansion { added: Vec<String> },
}

/// Classify the move from `current` to `desired` for a group of `raid_type`.
/// The error is the reason the move is not allowed.
pub fn classify(
    raid_type: RaidType,
    current: &[&str],
    desired: &[&str],
) -> std::result::Result<GroupChange, String> {
    let current_set: BTreeSet<&str> = current.iter().copied().collect();
    let desired_set: BTreeSet<&str> = desired.iter().copied().collect();
    let removed: Vec<&str> = current_set.difference(&desired_set).copied().collect();
    let added: Vec<&str> = desired_set.difference(&current_set).copied().collect();

    match (removed.len(), added.len()) {
        (0, 0) => Ok(GroupChange::Unchanged),
        (0, _) if raid_type.is_striped() => Ok(GroupChange::Expansion {
            added: desired
                .iter()
                .filter(|d| !current_set.contains(*d))
                .map(|d| d.to_string())
                .collect(),
        }),
        (0, _) => Err(format!(
            "adding block devices to existing {} raid group is not valid operation",
            raid_type
        )),
        (_, 0) => Err(format!(
            "removing block device from {} raid group is not valid operation",
            raid_type
        )),
        (1, 1) if raid_type.is_striped() => {
            Err("cannot replace blockdevice in stripe raid group".to_string())
        }
        (1, 1) => Ok(GroupChange::Replacement {
            old: removed[0].to_string(),
            new: added[0].to_string(),
        }),
        _ => Err("cannot replace more than one blockdevice in a raid group".to_string()),
    }
}

/// Pairing of current raid groups with desired ones
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupPairing {
    /// `(current index, desired index)` of groups sharing a device
    pub matched: Vec<(usize, usize)>,
    /// Desired groups with no current counterpart
    pub added: Vec<usize>,
    /// Current groups with no desired counterpart
    pub removed: Vec<usize>,
}

/// Pair groups by device membership. A desired group is paired with the
/// first current group it shares a device with.
pub fn pair_groups(current: &[Vec<&str>], desired: &[Vec<&str>]) -> GroupPairing {
    let mut pairing = GroupPairing::default();
    let mut taken = BTreeSet::new();
    for (ci, current_group) in current.iter().enumerate() {
        let found = desired.iter().enumerate().find(|(di, group)| {
            !taken.contains(di) && group.iter().any(|d| current_group.contains(d))
        });
        match found {
            Some((di, _)) => {
                taken.insert(di);
                pairing.matched.push((ci, di));
            }
            None => pairing.removed.push(ci),
        }
    }
    pairing.added = (0..desired.len()).filter(|di| !taken.contains(di)).collect();
    pairing
}

// =============================================================================
// Claims
// =============================================================================

/// Create the claim for `bd`, or adopt the one a previous attempt created.
/// With `predecessor` set the claim is annotated with the device it replaces.
pub async fn ensure_claim(
    clients: &ClientSet,
    pcc: &PoolClusterClaim,
    bd: &BlockDevice,
    predecessor: Option<&str>,
) -> Result<BlockDeviceClaim> {
    let mut builder = BlockDeviceClaimBuilder::for_device(bd).with_owner(pcc);
    if let Some(old) = predecessor {
        builder = builder.with_predecessor(old);
    }
    let claim = builder.build()?;

    match clients.block_device_claims.create(&claim).await {
        Ok(created) => {
            info!(pcc = %pcc.name(), claim = %created.name(), device = %bd.name(), "Created block device claim");
            Ok(created)
        }
        Err(e) if e.is_already_exists() => {
            let existing = clients
                .block_device_claims
                .get_opt(claim.name())
                .await?
                .ok_or_else(|| {
                    Error::PreconditionFailed(format!(
                        "block device {} is claimed by another pool cluster claim",
                        bd.name()
                    ))
                })?;
            if existing.block_device() != bd.name() {
                return Err(Error::InvariantViolation(format!(
                    "claim {} binds {} instead of {}",
                    existing.name(),
                    existing.block_device(),
                    bd.name()
                )));
            }
            match predecessor {
                Some(old) if existing.predecessor() != Some(old) => {
                    set_predecessor(clients, &existing, Some(old)).await
                }
                _ => {
                    debug!(claim = %existing.name(), "Reusing block device claim");
                    Ok(existing)
                }
            }
        }
        Err(e) => Err(e),
    }
}

async fn set_predecessor(
    clients: &ClientSet,
    claim: &BlockDeviceClaim,
    predecessor: Option<&str>,
) -> Result<BlockDeviceClaim> {
    let body = serde_json::to_vec(&json!({
        "metadata": { "annotations": { PREDECESSOR_ANNOTATION: predecessor } }
    }))?;
    clients
        .block_device_claims
        .patch(claim.name(), PatchType::Merge, &body)
        .await
}

/// Drop the protection finalizer from `claim` and delete it
pub async fn release_claim(clients: &ClientSet, claim: &BlockDeviceClaim) -> Result<()> {
    if claim.has_finalizer() {
        let remaining: Vec<&String> = claim
            .metadata
            .finalizers
            .iter()
            .flatten()
            .filter(|f| f.as_str() != POOL_PROTECTION_FINALIZER)
            .collect();
        let body = serde_json::to_vec(&json!({ "metadata": { "finalizers": remaining } }))?;
        clients
            .block_device_claims
            .patch(claim.name(), PatchType::Merge, &body)
            .await?;
    }
    clients
        .block_device_claims
        .delete(claim.name(), &DeleteOptions::background())
        .await?;
    info!(claim = %claim.name(), device = %claim.block_device(), "Released block device claim");
    Ok(())
}

// =============================================================================
// Replacement and Expansion
// =============================================================================

/// Apply replacements and expansions of one manual pool spec to its pool.
/// Returns whether the pool spec was written.
pub async fn apply_pool_changes(
    clients: &ClientSet,
    pcc: &PoolClusterClaim,
    spec: &PoolSpec,
    pool: &Pool,
    index: &DeviceIndex,
) -> Result<bool> {
    let current: Vec<Vec<&str>> = pool
        .spec
        .raid_groups
        .iter()
        .map(|g| g.device_names().collect())
        .collect();
    let desired: Vec<Vec<&str>> = spec
        .raid_groups
        .iter()
        .map(|g| g.device_names().collect())
        .collect();
    let pairing = pair_groups(&current, &desired);

    if let Some(&ci) = pairing.removed.first() {
        return Err(Error::InvariantViolation(format!(
            "raid group {} of pool {} is missing from the claim: removing raid group from pool spec is invalid operation",
            pool.spec.raid_groups[ci].name,
            pool.name()
        )));
    }

    let used = index.used_devices();
    let mut next = pool.clone();
    let mut changed = false;

    for &(ci, di) in &pairing.matched {
        let group = &pool.spec.raid_groups[ci];
        let change = classify(group.r#type, &current[ci], &desired[di]).map_err(|reason| {
            Error::InvariantViolation(format!("pool {} {}: {}", pool.name(), group.name, reason))
        })?;
        match change {
            GroupChange::Unchanged => {}
            GroupChange::Replacement { old, new } => {
                let entry =
                    replace_device(clients, pcc, pool, group, &old, &new, index, &used).await?;
                if let Some(slot) = next.spec.raid_groups[ci]
                    .block_devices
                    .iter_mut()
                    .find(|d| d.block_device_name == old)
                {
                    *slot = entry;
                }
                changed = true;
            }
            GroupChange::Expansion { added } => {
                for device in &added {
                    let entry = claim_new_device(clients, pcc, pool, device, index, &used).await?;
                    next.spec.raid_groups[ci].block_devices.push(entry);
                }
                info!(pool = %pool.name(), group = %group.name, added = added.len(), "Expanding striped raid group");
                changed = true;
            }
        }
    }

    for (k, &di) in pairing.added.iter().enumerate() {
        let name = group_name(pool.spec.raid_groups.len() + k);
        let group = resolve_group(spec, &spec.raid_groups[di], &name, pool.node(), index)?;
        for device in group.device_names() {
            ensure_unused(device, pool, &used)?;
        }
        for device in group.device_names() {
            let bd = known_device(device, index)?;
            ensure_claim(clients, pcc, bd, None).await?;
        }
        info!(pool = %pool.name(), group = %name, raid_type = %group.r#type, "Adding raid group");
        next.spec.raid_groups.push(group);
        changed = true;
    }

    if changed {
        clients.pools.update(&next).await?;
    }
    Ok(changed)
}

#[allow(clippy::too_many_arguments)]
async fn replace_device(
    clients: &ClientSet,
    pcc: &PoolClusterClaim,
    pool: &Pool,
    group: &PoolRaidGroup,
    old: &str,
    new: &str,
    index: &DeviceIndex,
    used: &BTreeMap<String, usize>,
) -> Result<PoolBlockDevice> {
    // One replacement per group at a time
    for device in group.device_names().chain(std::iter::once(new)) {
        if let Some(claim) = index.claim_for_device(device) {
            match claim.predecessor() {
                Some(p) if device == new && p == old => {}
                Some(p) => {
                    return Err(Error::PreconditionFailed(format!(
                        "replacement is still in progress for bd {}",
                        p
                    )))
                }
                None => {}
            }
        }
    }

    ensure_unused(new, pool, used)?;
    let incoming = resolve_device(new, pool.node(), index)?;
    let outgoing = group
        .block_devices
        .iter()
        .find(|d| d.block_device_name == old)
        .map(|d| d.capacity)
        .unwrap_or_default();
    if incoming.capacity < outgoing {
        return Err(Error::PreconditionFailed(format!(
            "block device {} ({} bytes) is smaller than {} ({} bytes)",
            new, incoming.capacity, old, outgoing
        )));
    }

    let bd = known_device(new, index)?;
    ensure_claim(clients, pcc, bd, Some(old)).await?;
    info!(pool = %pool.name(), group = %group.name, old = %old, new = %new, "Replacing block device");
    Ok(incoming)
}

async fn claim_new_device(
    clients: &ClientSet,
    pcc: &PoolClusterClaim,
    pool: &Pool,
    device: &str,
    index: &DeviceIndex,
    used: &BTreeMap<String, usize>,
) -> Result<PoolBlockDevice> {
    ensure_unused(device, pool, used)?;
    let entry = resolve_device(device, pool.node(), index)?;
    let bd = known_device(device, index)?;
    ensure_claim(clients, pcc, bd, None).await?;
    Ok(entry)
}

fn ensure_unused(
    device: &str,
    pool: &Pool,
    used: &BTreeMap<String, usize>,
) -> Result<()> {
    if used.contains_key(device) {
        return Err(Error::PreconditionFailed(format!(
            "block device {} for pool {} is already a part of the current pool cluster claim",
            device,
            pool.name()
        )));
    }
    Ok(())
}

fn known_device<'a>(device: &str, index: &'a DeviceIndex) -> Result<&'a BlockDevice> {
    index.device(device).ok_or_else(|| Error::ResourceNotFound {
        kind: "BlockDevice".into(),
        name: device.to_string(),
    })
}

/// Finish replacements the node agent has completed: the incoming device is
/// reported Online, so its claim loses the predecessor annotation and the
/// outgoing device's claim is released. Returns the number of replacements
/// still running.
pub async fn complete_replacements(clients: &ClientSet, index: &DeviceIndex) -> Result<usize> {
    let mut running = 0;
    for claim in index.claims().values() {
        let Some(old) = claim.predecessor() else {
            continue;
        };
        let device = claim.block_device();
        let online = index
            .pools()
            .find_by(&[pool::contains_device(device)])
            .and_then(|p| p.device_state(device))
            == Some(PoolDeviceState::Online);
        if !online {
            running += 1;
            continue;
        }

        set_predecessor(clients, claim, None).await?;
        if let Some(outgoing) = index.claim_for_device(old) {
            release_claim(clients, outgoing).await?;
        }
        info!(pcc = %index.pcc(), old = %old, new = %device, "Replacement complete");
    }
    Ok(running)
}

// =============================================================================
// Scale Down
// =============================================================================

/// Pools the claim no longer asks for. In auto mode the youngest go first
/// (ties broken by name, last first); in manual mode every pool that no pool
/// spec pins is excess.
pub fn excess_pools<'a>(pcc: &PoolClusterClaim, index: &'a DeviceIndex) -> Vec<&'a Pool> {
    let pools = index.pools();
    if pcc.is_auto() {
        let surplus = pools.len().saturating_sub(pcc.desired_pool_count());
        let mut by_age: Vec<&Pool> = pools.iter().collect();
        by_age.sort_by(|a, b| {
            b.metadata
                .creation_timestamp
                .as_ref()
                .map(|t| t.0)
                .cmp(&a.metadata.creation_timestamp.as_ref().map(|t| t.0))
                .then_with(|| b.name().cmp(a.name()))
        });
        by_age.truncate(surplus);
        return by_age;
    }

    pools
        .iter()
        .filter(|pool| {
            !pcc.spec.pools.iter().any(|spec| {
                spec.node_selector == pool.spec.node_selector
                    || index.nodes_matching(&spec.node_selector) == [pool.node().to_string()]
            })
        })
        .collect()
}

/// Delete `pool` and release the claims of its devices
pub async fn remove_pool(clients: &ClientSet, pool: &Pool, index: &DeviceIndex) -> Result<()> {
    clients
        .pools
        .delete(pool.name(), &DeleteOptions::background())
        .await?;
    for device in pool.block_device_names() {
        if let Some(claim) = index.claim_for_device(device) {
            release_claim(clients, claim).await?;
        }
    }
    info!(pool = %pool.name(), node = %pool.node(), "Removed pool");
    Ok(())
}
