//! PoolClusterClaim reconciler
//!
//! One cycle for one claim:
//!
//! 1. A claim being deleted loses its pools, then its block device claims,
//!    then its finalizer.
//! 2. The finalizer is added if missing.
//! 3. A fresh [`DeviceIndex`] is built and the [`Planner`] fills missing
//!    pool slots. Claims are created before the pool that uses them.
//! 4. Manual pools pick up replacements and expansions from their pool spec.
//! 5. Finished replacements are completed.
//! 6. Pools the claim no longer asks for are removed.
//! 7. Status counts and conditions are written when they changed.
//!
//! The work queue guarantees a claim is never reconciled by two workers at
//! once, so none of this needs locking.

use serde_json::json;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::client::{ClientFabricator, ClientSet, DeleteOptions, ListSelector, PatchType};
use crate::crd::{
    condition_type, Condition, Pool, PoolClusterClaim, PoolClusterClaimStatus, PoolPhase,
    PCC_NAME_LABEL, POOL_PROTECTION_FINALIZER,
};
use crate::domain::predicate::{claim, pool};
use crate::domain::{Filter, PoolBuilder};
use crate::error::{Error, Result};
use crate::topology::planner::resolve_node;
use crate::topology::{DeviceIndex, Plan, Planner};

use super::operations;

/// Requeue interval while the node agent works on a replacement
pub const REPLACEMENT_POLL: Duration = Duration::from_secs(30);

/// Requeue interval while a pool spec cannot be placed
pub const UNPLACED_POLL: Duration = Duration::from_secs(60);

/// Requeue interval while owned pools are still terminating
pub const TEARDOWN_POLL: Duration = Duration::from_secs(5);

/// What the worker should do after a successful cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing pending; wait for the next change
    AwaitChange,
    /// Check again after the delay
    Requeue(Duration),
}

/// Facts gathered during a cycle that end up in the status
#[derive(Debug, Default)]
struct CycleReport {
    plan: Plan,
    failure: Option<String>,
    replacements_running: usize,
}

/// Drives one PoolClusterClaim towards its spec
pub struct PoolClusterReconciler {
    clients: ClientFabricator,
    planner: Planner,
}

impl PoolClusterReconciler {
    pub fn new(clients: ClientFabricator) -> Self {
        Self {
            clients,
            planner: Planner::new(),
        }
    }

    /// Run one cycle for the claim named `name`
    pub async fn reconcile(&self, name: &str) -> Result<Action> {
        let clients = (self.clients)().scoped_to(name);
        let Some(pcc) = clients.pool_cluster_claims.get_opt(name).await? else {
            debug!(pcc = %name, "Pool cluster claim is gone");
            return Ok(Action::AwaitChange);
        };

        if pcc.is_deleting() {
            return self.teardown(&clients, &pcc).await;
        }
        let pcc = self.ensure_finalizer(&clients, pcc).await?;

        let mut report = CycleReport::default();
        if let Err(e) = self.converge(&clients, &pcc, &mut report).await {
            // Transient: leave the status alone and retry
            if !is_provisioning_failure(&e) {
                return Err(e);
            }
            report.failure = Some(e.to_string());
            self.write_status(&clients, &pcc, &mut report).await?;
            return Err(e);
        }
        self.write_status(&clients, &pcc, &mut report).await?;

        if report.replacements_running > 0 {
            Ok(Action::Requeue(REPLACEMENT_POLL))
        } else if !report.plan.skipped.is_empty() {
            Ok(Action::Requeue(UNPLACED_POLL))
        } else {
            Ok(Action::AwaitChange)
        }
    }

    /// Record a claim that keeps failing as not ready
    pub async fn report_failure(&self, name: &str, failure: &Error) -> Result<()> {
        let clients = (self.clients)();
        let Some(pcc) = clients.pool_cluster_claims.get_opt(name).await? else {
            return Ok(());
        };
        let mut status = pcc.status.clone().unwrap_or_default();
        status.set_condition(Condition::new(
            condition_type::READY,
            false,
            "ReconcileError",
            failure.to_string(),
        ));
        if Some(&status) != pcc.status.as_ref() {
            let mut next = pcc.clone();
            next.status = Some(status);
            clients.pool_cluster_claims.update_status(&next).await?;
            warn!(pcc = %name, error = %failure, "Pool cluster claim marked not ready");
        }
        Ok(())
    }

    async fn converge(
        &self,
        clients: &ClientSet,
        pcc: &PoolClusterClaim,
        report: &mut CycleReport,
    ) -> Result<()> {
        let index = DeviceIndex::build(clients, pcc).await?;
        let mut first_error = None;

        // Creation
        match self.planner.plan(pcc, &index) {
            Ok(plan) => {
                if let Err(e) = self.create_pools(clients, pcc, &plan, &index).await {
                    first_error.get_or_insert(e);
                }
                for skipped in &plan.skipped {
                    warn!(pcc = %pcc.name(), selector = %skipped.selector, reason = %skipped.reason, "Pool spec not placed");
                }
                report.plan = plan;
            }
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }

        // Replacement and expansion
        if !pcc.is_auto() {
            for spec in &pcc.spec.pools {
                let pool = match resolve_node(spec, &index) {
                    Ok(Some(node)) => index.pool_on_node(&node),
                    Ok(None) => index
                        .pools()
                        .iter()
                        .find(|p| p.spec.node_selector == spec.node_selector),
                    Err(_) => None,
                };
                let Some(pool) = pool else {
                    continue;
                };
                if let Err(e) = operations::apply_pool_changes(clients, pcc, spec, pool, &index).await {
                    if matches!(e, Error::InvariantViolation(_)) {
                        error!(pcc = %pcc.name(), pool = %pool.name(), error = %e, "Pool spec change refused");
                    }
                    first_error.get_or_insert(e);
                }
            }
        }

        // Completion
        if let Err(e) = operations::complete_replacements(clients, &index).await {
            first_error.get_or_insert(e);
        }

        // Scale down
        for pool in operations::excess_pools(pcc, &index) {
            if let Err(e) = operations::remove_pool(clients, pool, &index).await {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn create_pools(
        &self,
        clients: &ClientSet,
        pcc: &PoolClusterClaim,
        plan: &Plan,
        index: &DeviceIndex,
    ) -> Result<()> {
        for entry in &plan.entries {
            for device in entry.block_device_names() {
                let bd = index.device(device).ok_or_else(|| Error::ResourceNotFound {
                    kind: "BlockDevice".into(),
                    name: device.to_string(),
                })?;
                operations::ensure_claim(clients, pcc, bd, None).await?;
            }

            let pool = PoolBuilder::new()
                .with_name(&entry.pool_name)
                .with_owner(pcc)
                .with_host(&entry.node)
                .with_node_selector(entry.node_selector.clone())
                .with_pool_config(entry.pool_config.clone())
                .with_raid_groups(entry.raid_groups.clone())
                .build()?;
            match clients.pools.create(&pool).await {
                Ok(_) => info!(pcc = %pcc.name(), pool = %entry.pool_name, node = %entry.node, "Created pool"),
                Err(e) if e.is_already_exists() => {
                    debug!(pool = %entry.pool_name, "Pool already exists")
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn ensure_finalizer(
        &self,
        clients: &ClientSet,
        pcc: PoolClusterClaim,
    ) -> Result<PoolClusterClaim> {
        if pcc.has_finalizer() {
            return Ok(pcc);
        }
        let mut finalizers = pcc.metadata.finalizers.clone().unwrap_or_default();
        finalizers.push(POOL_PROTECTION_FINALIZER.to_string());
        let body = serde_json::to_vec(&json!({ "metadata": { "finalizers": finalizers } }))?;
        clients
            .pool_cluster_claims
            .patch(pcc.name(), PatchType::Merge, &body)
            .await
    }

    /// Delete pools, then claims, then drop the finalizer
    async fn teardown(&self, clients: &ClientSet, pcc: &PoolClusterClaim) -> Result<Action> {
        if !pcc.has_finalizer() {
            return Ok(Action::AwaitChange);
        }
        let owned = ListSelector::label(PCC_NAME_LABEL, pcc.name());

        for pool in clients.pools.list(&owned).await? {
            clients
                .pools
                .delete(pool.name(), &DeleteOptions::background())
                .await?;
        }
        let remaining = clients.pools.list(&owned).await?;
        if !remaining.is_empty() {
            debug!(pcc = %pcc.name(), pools = remaining.len(), "Waiting for pools to terminate");
            return Ok(Action::Requeue(TEARDOWN_POLL));
        }

        for claim in clients.block_device_claims.list(&owned).await? {
            operations::release_claim(clients, &claim).await?;
        }

        let finalizers: Vec<&String> = pcc
            .metadata
            .finalizers
            .iter()
            .flatten()
            .filter(|f| f.as_str() != POOL_PROTECTION_FINALIZER)
            .collect();
        let body = serde_json::to_vec(&json!({ "metadata": { "finalizers": finalizers } }))?;
        clients
            .pool_cluster_claims
            .patch(pcc.name(), PatchType::Merge, &body)
            .await?;
        info!(pcc = %pcc.name(), "Pool cluster claim released");
        Ok(Action::AwaitChange)
    }

    /// Observe what the cycle left behind and record it on the claim
    async fn write_status(
        &self,
        clients: &ClientSet,
        pcc: &PoolClusterClaim,
        report: &mut CycleReport,
    ) -> Result<()> {
        let owned = ListSelector::label(PCC_NAME_LABEL, pcc.name());
        let pools = clients.pools.list(&owned).await?;
        report.replacements_running = clients
            .block_device_claims
            .list(&owned)
            .await?
            .filter_by(&[claim::has_predecessor()])
            .len();
        let current = pcc.status.clone().unwrap_or_default();
        let status = next_status(&current, pcc, &pools, report);
        if status == current && pcc.status.is_some() {
            return Ok(());
        }

        let mut next = pcc.clone();
        next.status = Some(status);
        clients.pool_cluster_claims.update_status(&next).await?;
        Ok(())
    }
}

fn next_status(
    current: &PoolClusterClaimStatus,
    pcc: &PoolClusterClaim,
    pools: &[Pool],
    report: &CycleReport,
) -> PoolClusterClaimStatus {
    let mut status = current.clone();
    status.provisioned_pools = pools.len() as u32;
    status.desired_pools = pcc.desired_pool_count() as u32;
    status.healthy_pools = pools.filter_by(&[pool::is_status(PoolPhase::Healthy)]).len() as u32;
    let progress = format!(
        "{}/{} pools provisioned",
        status.provisioned_pools, status.desired_pools
    );

    let unplaced: Vec<&str> = report
        .plan
        .skipped
        .iter()
        .map(|s| s.selector.as_str())
        .collect();
    match (&report.failure, unplaced.is_empty()) {
        (Some(failure), _) => status.set_condition(Condition::new(
            condition_type::PROVISIONING_FAILED,
            true,
            "ReconcileFailed",
            failure.clone(),
        )),
        (None, false) => status.set_condition(Condition::new(
            condition_type::PROVISIONING_FAILED,
            true,
            "NodeSelectorUnmatched",
            format!("no node matches selector {}", unplaced.join(", ")),
        )),
        (None, true) => status.remove_condition(condition_type::PROVISIONING_FAILED),
    }

    let ready = report.failure.is_none()
        && unplaced.is_empty()
        && status.provisioned_pools >= status.desired_pools;
    status.set_condition(if ready {
        Condition::new(condition_type::READY, true, "Provisioned", progress)
    } else if report.failure.is_some() || !unplaced.is_empty() {
        Condition::new(condition_type::READY, false, "ProvisioningFailed", progress)
    } else {
        Condition::new(condition_type::READY, false, "Provisioning", progress)
    });

    if report.replacements_running > 0 {
        status.set_condition(Condition::new(
            condition_type::REPLACEMENT_IN_PROGRESS,
            true,
            "WaitingForResilver",
            format!(
                "{} block device replacement(s) in progress",
                report.replacements_running
            ),
        ));
    } else {
        status.remove_condition(condition_type::REPLACEMENT_IN_PROGRESS);
    }
    status
}

/// Failures that describe the claim or the cluster rather than the API
/// server; they are surfaced as a condition before the cycle is retried
fn is_provisioning_failure(e: &Error) -> bool {
    matches!(
        e,
        Error::NoCandidates { .. }
            | Error::InsufficientDevicesOnNode { .. }
            | Error::DeviceNotOnNode { .. }
            | Error::InvalidArity { .. }
            | Error::DeviceMissingId { .. }
            | Error::DeviceInactive { .. }
            | Error::NodeSelectorUnmatched { .. }
            | Error::PreconditionFailed(_)
            | Error::InvariantViolation(_)
            | Error::Validation(_)
            | Error::Builder { .. }
            | Error::ResourceNotFound { .. }
    )
}
