//! Changes to a pool spec that exists before and after an update
//!
//! Raid groups are paired by shared devices, then every pair is classified
//! with the rules the reconciler applies. A replacement is additionally
//! checked against the claims already recorded for the pool cluster claim.

use tracing::debug;

use crate::controller::operations::{classify, pair_groups, GroupChange};
use crate::crd::{PoolClusterClaim, PoolSpec, RaidGroup};
use crate::domain::predicate::claim;
use crate::domain::Filter;
use crate::error::{Error, Result};
use crate::topology::planner::{group_name, group_raid_type};
use crate::topology::DeviceIndex;

fn invalid<T>(message: impl Into<String>) -> Result<T> {
    Err(Error::Validation(message.into()))
}

fn device_lists(spec: &PoolSpec) -> Vec<Vec<&str>> {
    spec.raid_groups
        .iter()
        .map(|g| g.device_names().collect())
        .collect()
}

/// Validate the move from `old_spec` to `new_spec` of the claim `old`
pub fn validate_spec_change(
    old: &PoolClusterClaim,
    old_spec: &PoolSpec,
    new_spec: &PoolSpec,
    index: &DeviceIndex,
) -> Result<()> {
    let current = device_lists(old_spec);
    let desired = device_lists(new_spec);
    let pairing = pair_groups(&current, &desired);
    if !pairing.removed.is_empty() {
        return invalid("removing raid group from pool spec is invalid operation");
    }

    for (ci, di) in pairing.matched {
        let group = &old_spec.raid_groups[ci];
        let raid_type = group_raid_type(old_spec, group, &group_name(ci))
            .map_err(|e| Error::Validation(e.to_string()))?;
        let change = classify(raid_type, &current[ci], &desired[di]).map_err(Error::Validation)?;
        match change {
            GroupChange::Unchanged => {}
            GroupChange::Replacement { old: outgoing, new: incoming } => {
                validate_replacement(old, group, &outgoing, &incoming, index)?;
                debug!(pcc = %old.name(), old = %outgoing, new = %incoming, "Replacement accepted");
            }
            GroupChange::Expansion { added } => {
                for device in &added {
                    ensure_new_to_claim(old, device)?;
                }
            }
        }
    }

    for di in pairing.added {
        for device in &desired[di] {
            ensure_new_to_claim(old, device)?;
        }
    }
    Ok(())
}

fn ensure_new_to_claim(old: &PoolClusterClaim, device: &str) -> Result<()> {
    if old.block_device_names().contains(device) {
        return invalid(format!(
            "block device {} is already a part of the current pool cluster claim",
            device
        ));
    }
    Ok(())
}

/// Pre-checks for swapping `outgoing` for `incoming` inside `group`
pub fn validate_replacement(
    old: &PoolClusterClaim,
    group: &RaidGroup,
    outgoing: &str,
    incoming: &str,
    index: &DeviceIndex,
) -> Result<()> {
    if old.block_device_names().contains(incoming) {
        return invalid(
            "the new blockdevice intended to use for replacement is already a part of the current pool cluster claim",
        );
    }

    // One replacement per raid group at a time
    for device in group.device_names() {
        if let Some(predecessor) = index.claim_for_device(device).and_then(|c| c.predecessor()) {
            return invalid(format!(
                "cannot replace blockdevice {}: replacement is still in progress for bd {}",
                outgoing, predecessor
            ));
        }
    }

    if index.claims().any_match(&[claim::is_replacing(incoming)]) {
        return invalid(format!(
            "the new blockdevice {} intended to use for replacement is invalid: it is being replaced",
            incoming
        ));
    }
    if let Some(claim) = index.claim_for_device(incoming) {
        if !claim.is_owned_by(old.name()) {
            return invalid(format!(
                "the new blockdevice {} intended to use for replacement is invalid: claimed by {}",
                incoming,
                claim.name()
            ));
        }
    }

    let (Some(new_bd), Some(old_bd)) = (index.device(incoming), index.device(outgoing)) else {
        return Ok(());
    };
    if new_bd.spec.capacity < old_bd.spec.capacity {
        return invalid(format!(
            "capacity of replacing block device {}: {} should be greater than or equal to existing block device {}: {}",
            incoming, new_bd.spec.capacity, outgoing, old_bd.spec.capacity
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::RaidType;
    use crate::domain::{BlockDeviceClaimBuilder, PoolClusterClaimBuilder};
    use crate::fixtures::disk;

    fn claim(groups: &[&[&str]]) -> PoolClusterClaim {
        PoolClusterClaimBuilder::new()
            .with_name("c")
            .with_uid("uid-c")
            .with_pool_on_node("n1", RaidType::Mirrored, groups)
            .build()
            .unwrap()
    }

    fn index_for(pcc: &PoolClusterClaim, devices: &[(&str, u64)], predecessors: &[(&str, &str)]) -> DeviceIndex {
        let devices: Vec<_> = devices.iter().map(|(n, gib)| disk(n, "n1", *gib)).collect();
        let claims = devices
            .iter()
            .map(|bd| {
                let mut builder = BlockDeviceClaimBuilder::for_device(bd).with_owner(pcc);
                if let Some((_, old)) = predecessors.iter().find(|(new, _)| *new == bd.name()) {
                    builder = builder.with_predecessor(old);
                }
                builder.build().unwrap()
            })
            .collect();
        DeviceIndex::from_parts(pcc, vec![], devices, claims, vec![])
    }

    fn reason(result: Result<()>) -> String {
        match result {
            Err(Error::Validation(m)) => m,
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_single_replacement_accepted() {
        let old = claim(&[&["d1", "d2"]]);
        let new = claim(&[&["d1", "d3"]]);
        let index = index_for(&old, &[("d1", 10), ("d2", 10), ("d3", 10)], &[]);
        assert!(validate_spec_change(&old, &old.spec.pools[0], &new.spec.pools[0], &index).is_ok());
    }

    #[test]
    fn test_second_replacement_waits_for_first() {
        // d3 replaced d2 and is still resilvering
        let old = claim(&[&["d1", "d3"]]);
        let new = claim(&[&["d1", "d4"]]);
        let index = index_for(&old, &[("d1", 10), ("d3", 10), ("d4", 10)], &[("d3", "d2")]);
        let m = reason(validate_spec_change(&old, &old.spec.pools[0], &new.spec.pools[0], &index));
        assert!(m.contains("replacement is still in progress for bd d2"), "{}", m);
    }

    #[test]
    fn test_group_removal_and_mirror_growth_rejected() {
        let old = claim(&[&["d1", "d2"], &["d3", "d4"]]);
        let index = index_for(&old, &[("d1", 10), ("d2", 10), ("d3", 10), ("d4", 10)], &[]);

        let dropped = claim(&[&["d1", "d2"]]);
        let m = reason(validate_spec_change(&old, &old.spec.pools[0], &dropped.spec.pools[0], &index));
        assert_eq!(m, "removing raid group from pool spec is invalid operation");

        let single = claim(&[&["d1", "d2"]]);
        let swapped = claim(&[&["d1", "d2", "d9"]]);
        let m = reason(validate_spec_change(&single, &single.spec.pools[0], &swapped.spec.pools[0], &index));
        assert!(m.contains("adding block devices"));
    }

    #[test]
    fn test_smaller_device_rejected() {
        let old = claim(&[&["d1", "d2"]]);
        let new = claim(&[&["d1", "d3"]]);
        let index = index_for(&old, &[("d1", 10), ("d2", 10), ("d3", 5)], &[]);
        let m = reason(validate_spec_change(&old, &old.spec.pools[0], &new.spec.pools[0], &index));
        assert!(m.starts_with("capacity of replacing block device d3"));
    }

    #[test]
    fn test_incoming_device_must_be_new() {
        let old = claim(&[&["d1", "d2"], &["d3", "d4"]]);
        let index = index_for(&old, &[("d1", 10), ("d2", 10), ("d3", 10), ("d4", 10)], &[]);
        let group = &old.spec.pools[0].raid_groups[0];
        let m = reason(validate_replacement(&old, group, "d2", "d3", &index));
        assert!(m.contains("already a part of the current pool cluster claim"));
    }

    #[test]
    fn test_striped_expansion_and_new_group_accepted() {
        let spec = |groups: &[&[&str]]| {
            PoolClusterClaimBuilder::new()
                .with_name("c")
                .with_uid("uid-c")
                .with_pool_on_node("n1", RaidType::Striped, groups)
                .build()
                .unwrap()
        };
        let old = spec(&[&["d1"]]);
        let new = spec(&[&["d1", "d2"], &["d3"]]);
        let index = index_for(&old, &[("d1", 10), ("d2", 10), ("d3", 10)], &[]);
        assert!(validate_spec_change(&old, &old.spec.pools[0], &new.spec.pools[0], &index).is_ok());

        let stripe_swap = spec(&[&["d2"]]);
        let m = reason(validate_spec_change(&old, &old.spec.pools[0], &stripe_swap.spec.pools[0], &index));
        // d2 shares nothing with d1, so the old group is gone
        assert_eq!(m, "removing raid group from pool spec is invalid operation");
    }
}
