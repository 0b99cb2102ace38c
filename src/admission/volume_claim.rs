//! VolumeClaim admission rules
//!
//! Replica scaling is expressed by editing the spec pool list. Only one
//! pool may leave at a time, a pool may never be swapped for another, and a
//! new change waits until the status has caught up with the previous one.

use std::collections::BTreeSet;

use crate::client::{ClientSet, ListSelector};
use crate::crd::{VolumeClaim, VolumeClaimPhase};
use crate::error::{Error, Result};

fn invalid<T>(message: impl Into<String>) -> Result<T> {
    Err(Error::Validation(message.into()))
}

/// Validate an update of `old` to `new`. Checks run in order and the first
/// failure wins.
pub fn validate_update(old: &VolumeClaim, new: &VolumeClaim) -> Result<()> {
    validate_replica_count(old, new)?;
    validate_pool_list_changes(old, new)?;
    validate_scaling_in_progress(old, new)?;
    validate_status_pools(old, new)?;
    validate_phase(old, new)?;
    validate_unique_pools(new)
}

fn validate_replica_count(old: &VolumeClaim, new: &VolumeClaim) -> Result<()> {
    if old.spec.replica_count != new.spec.replica_count {
        return invalid(format!(
            "volume claim {} replicaCount got modified from {} to {}",
            new.name(),
            old.spec.replica_count,
            new.spec.replica_count
        ));
    }
    Ok(())
}

fn validate_pool_list_changes(old: &VolumeClaim, new: &VolumeClaim) -> Result<()> {
    let old_pools = old.spec_pool_names();
    let new_pools = new.spec_pool_names();
    let kept: BTreeSet<&str> = new_pools.iter().copied().collect();
    let removed: Vec<&str> = old_pools
        .iter()
        .copied()
        .filter(|p| !kept.contains(p))
        .collect();

    if new_pools.len() >= old_pools.len() {
        if !removed.is_empty() {
            return invalid(format!(
                "migration by rename is not supported: pools {:?} were replaced",
                removed
            ));
        }
    } else if removed.len() > 1 {
        return invalid(format!(
            "can't perform more than one replica scale down, requested scale down count {}",
            removed.len()
        ));
    }
    Ok(())
}

fn validate_scaling_in_progress(old: &VolumeClaim, new: &VolumeClaim) -> Result<()> {
    let old_spec = old.spec_pool_names().len();
    let old_status = old.status_pool_names().len();
    if old_spec != old_status && new.spec_pool_names().len() != old_spec {
        return invalid(format!(
            "scaling of volume claim {} is already in progress",
            new.name()
        ));
    }
    Ok(())
}

/// Every status pool must be a pool the claim asked for. While the claim is
/// still unprovisioned the new spec is the reference.
fn validate_status_pools(old: &VolumeClaim, new: &VolumeClaim) -> Result<()> {
    let old_spec = old.spec_pool_names();
    let reference: BTreeSet<&str> = if old_spec.is_empty() && old.status_pool_names().is_empty() {
        new.spec_pool_names().into_iter().collect()
    } else {
        old_spec.into_iter().collect()
    };
    let unknown: Vec<&str> = new
        .status_pool_names()
        .into_iter()
        .filter(|p| !reference.contains(p))
        .collect();
    if !unknown.is_empty() {
        return invalid(format!(
            "replica status pool names {:?} doesn't exist under spec pool list",
            unknown
        ));
    }
    Ok(())
}

fn validate_phase(old: &VolumeClaim, new: &VolumeClaim) -> Result<()> {
    let scaling = old.spec_pool_names().len() != new.spec_pool_names().len();
    let bound = old.phase() == VolumeClaimPhase::Bound || new.phase() == VolumeClaimPhase::Bound;
    if scaling && !bound {
        return invalid(format!(
            "volume claim {} is in {} phase, replicas can be scaled only when Bound",
            new.name(),
            old.phase()
        ));
    }
    Ok(())
}

fn validate_unique_pools(vc: &VolumeClaim) -> Result<()> {
    for (place, pools) in [("spec", vc.spec_pool_names()), ("status", vc.status_pool_names())] {
        let repeated = repeated(&pools);
        if !repeated.is_empty() {
            return invalid(format!(
                "repetition of pool names {:?} under {} of volume claim {}",
                repeated,
                place,
                vc.name()
            ));
        }
    }
    Ok(())
}

fn repeated<'a>(names: &[&'a str]) -> Vec<&'a str> {
    let mut seen = BTreeSet::new();
    let mut repeated = BTreeSet::new();
    for name in names {
        if !seen.insert(*name) {
            repeated.insert(*name);
        }
    }
    repeated.into_iter().collect()
}

/// Refuse deletion while any pool holds a clone sourced from the volume
pub async fn validate_delete(vc: &VolumeClaim, clients: &ClientSet) -> Result<()> {
    let volume = vc.volume_name();
    let pools = clients.pools.list(&ListSelector::everything()).await?;
    for pool in &pools {
        let clones: Vec<&str> = pool.clones_of(volume).map(|c| c.volume.as_str()).collect();
        if !clones.is_empty() {
            return Err(Error::Policy(format!(
                "volume {} has dependent clones {:?} on pool {}",
                volume,
                clones,
                pool.name()
            )));
        }
    }
    Ok(())
}
