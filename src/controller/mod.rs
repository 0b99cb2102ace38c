//! Controller runtime
//!
//! Change events are reduced to PoolClusterClaim names and pushed into a
//! [`WorkQueue`]; a fixed pool of workers drains it through the
//! [`PoolClusterReconciler`]. Every claim is also re-enqueued on a resync
//! interval, so a missed event only delays convergence.

pub mod leader;
pub mod operations;
pub mod reconciler;
pub mod workqueue;

pub use leader::{LeaderElector, LeaseConfig};
pub use reconciler::{Action, PoolClusterReconciler};
pub use workqueue::{RateLimit, WorkQueue};

use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use kube::api::Api;
use kube::runtime::{watcher, WatchStreamExt};
use kube::ResourceExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::client::{kind_of, ClientFabricator, ListSelector, MemoryCluster, ObjectChange};
use crate::crd::{BlockDeviceClaim, Pool, PoolClusterClaim, PCC_NAME_LABEL};
use crate::error::{Error, ErrorAction, Result};
use crate::metrics::Metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Controller settings
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Concurrent reconcile workers
    pub workers: usize,
    /// Upper bound on one reconcile cycle
    pub reconcile_timeout: Duration,
    /// Consecutive failures after which the claim is marked not ready
    pub escalate_after: u32,
    /// Backoff for failed keys
    pub rate_limit: RateLimit,
    /// Re-enqueue every claim this often; `None` disables resync
    pub resync_interval: Option<Duration>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            reconcile_timeout: Duration::from_secs(30),
            escalate_after: 10,
            rate_limit: RateLimit::default(),
            resync_interval: Some(Duration::from_secs(300)),
        }
    }
}

// =============================================================================
// Controller
// =============================================================================

/// Work queue plus the workers draining it
pub struct Controller {
    clients: ClientFabricator,
    reconciler: PoolClusterReconciler,
    queue: Arc<WorkQueue>,
    metrics: Arc<Metrics>,
    config: ControllerConfig,
    /// Workers only take keys while this reads true
    leadership: watch::Receiver<bool>,
}

impl Controller {
    /// A controller that always leads
    pub fn new(clients: ClientFabricator, config: ControllerConfig, metrics: Arc<Metrics>) -> Arc<Self> {
        let (_, leading) = watch::channel(true);
        Self::with_leadership(clients, config, metrics, leading)
    }

    /// A controller whose workers pause while `leadership` reads false
    pub fn with_leadership(
        clients: ClientFabricator,
        config: ControllerConfig,
        metrics: Arc<Metrics>,
        leadership: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            reconciler: PoolClusterReconciler::new(clients.clone()),
            queue: WorkQueue::with_rate_limit(config.rate_limit),
            clients,
            metrics,
            config,
            leadership,
        })
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Run until `shutdown` fires. In-flight cycles finish before this
    /// returns.
    pub async fn run<S>(self: Arc<Self>, events: S, shutdown: CancellationToken) -> Result<()>
    where
        S: Stream<Item = String> + Send + 'static,
    {
        info!(workers = self.config.workers, "Starting pool cluster controller");
        self.enqueue_all().await?;

        let tracker = TaskTracker::new();

        let queue = self.queue.clone();
        let token = shutdown.clone();
        tracker.spawn(async move {
            let mut events = Box::pin(events);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    next = events.next() => match next {
                        Some(key) => queue.add(&key),
                        None => {
                            warn!("Event stream ended");
                            break;
                        }
                    },
                }
            }
        });

        if let Some(period) = self.config.resync_interval {
            let controller = self.clone();
            let token = shutdown.clone();
            tracker.spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = controller.enqueue_all().await {
                                warn!(error = %e, "Resync failed");
                            }
                        }
                    }
                }
            });
        }

        for id in 0..self.config.workers.max(1) {
            let controller = self.clone();
            let token = shutdown.clone();
            tracker.spawn(async move {
                debug!(worker = id, "Worker started");
                while let Some(key) = controller.next_key(&token).await {
                    controller.process(&key).await;
                }
                debug!(worker = id, "Worker stopped");
            });
        }

        shutdown.cancelled().await;
        info!("Stopping pool cluster controller");
        self.queue.shutdown();
        tracker.close();
        tracker.wait().await;
        Ok(())
    }

    /// Next key to work on, waiting while another replica leads. A key is
    /// never taken out of the queue after leadership is lost.
    async fn next_key(&self, shutdown: &CancellationToken) -> Option<String> {
        let mut leadership = self.leadership.clone();
        loop {
            if *leadership.borrow_and_update() {
                tokio::select! {
                    key = self.queue.get() => return key,
                    changed = leadership.changed() => {
                        if changed.is_err() {
                            // Leadership can no longer change
                            return self.queue.get().await;
                        }
                    }
                }
            } else {
                tokio::select! {
                    _ = shutdown.cancelled() => return None,
                    changed = leadership.changed() => {
                        if changed.is_err() {
                            warn!("Leader election stopped while not leading");
                            return None;
                        }
                    }
                }
            }
        }
    }

    async fn enqueue_all(&self) -> Result<()> {
        let claims = (self.clients)()
            .pool_cluster_claims
            .list(&ListSelector::everything())
            .await?;
        for pcc in &claims {
            self.queue.add(pcc.name());
        }
        self.metrics.workqueue_depth.set(self.queue.len() as i64);
        Ok(())
    }

    /// One cycle for `key`, then requeue according to the outcome
    pub async fn process(&self, key: &str) {
        let started = Instant::now();
        let timeout = self.config.reconcile_timeout;
        let result = match tokio::time::timeout(timeout, self.reconciler.reconcile(key)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(timeout)),
        };
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok(action) => {
                self.metrics.record_reconcile("success", elapsed);
                self.queue.forget(key);
                if let Action::Requeue(delay) = action {
                    debug!(pcc = %key, delay = ?delay, "Requeue");
                    self.queue.add_after(key, delay);
                }
            }
            Err(e) => {
                let result = if matches!(e, Error::Timeout(_)) { "timeout" } else { "error" };
                self.metrics.record_reconcile(result, elapsed);
                self.handle_error(key, &e).await;
            }
        }

        self.queue.done(key);
        self.metrics.workqueue_depth.set(self.queue.len() as i64);
    }

    async fn handle_error(&self, key: &str, e: &Error) {
        match e.action() {
            ErrorAction::RequeueWithBackoff => {
                let delay = self.queue.add_rate_limited(key);
                let failures = self.queue.num_requeues(key);
                if matches!(e, Error::InvariantViolation(_)) {
                    error!(pcc = %key, error = %e, failures, retry_in = ?delay, "Reconcile failed");
                } else {
                    warn!(pcc = %key, error = %e, failures, retry_in = ?delay, "Reconcile failed");
                }
                if failures >= self.config.escalate_after {
                    if let Err(report) = self.reconciler.report_failure(key, e).await {
                        warn!(pcc = %key, error = %report, "Could not record reconcile failure");
                    }
                }
            }
            ErrorAction::RequeueAfter(delay) => {
                warn!(pcc = %key, error = %e, retry_in = ?delay, "Reconcile blocked");
                self.queue.add_after(key, delay);
            }
            ErrorAction::NoRequeue => {
                warn!(pcc = %key, error = %e, "Reconcile failed, waiting for a change");
            }
        }
    }
}

// =============================================================================
// Event Sources
// =============================================================================

/// Claim to reconcile for a change, if any
fn key_for(change: &ObjectChange) -> Option<String> {
    if change.kind == kind_of::<PoolClusterClaim>() {
        return Some(change.name.clone());
    }
    if change.kind == kind_of::<Pool>() || change.kind == kind_of::<BlockDeviceClaim>() {
        return change.labels.get(PCC_NAME_LABEL).cloned();
    }
    None
}

/// Claim names for every change in an in-memory cluster
pub fn memory_events(cluster: &MemoryCluster) -> BoxStream<'static, String> {
    stream::unfold(cluster.subscribe(), |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(change) => {
                    if let Some(key) = key_for(&change) {
                        return Some((key, rx));
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Change feed lagged, resync will catch up");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

/// Claim names for every watched change in a live cluster. Pools and block
/// device claims map to the claim in their label.
pub fn kube_events(client: kube::Client) -> BoxStream<'static, String> {
    let owned = || watcher::Config::default().labels(PCC_NAME_LABEL);

    let claims = watcher(Api::<PoolClusterClaim>::all(client.clone()), watcher::Config::default())
        .default_backoff()
        .touched_objects()
        .filter_map(|event| async move {
            match event {
                Ok(pcc) => Some(pcc.name_any()),
                Err(e) => {
                    warn!(error = %e, "PoolClusterClaim watch error");
                    None
                }
            }
        });
    let pools = watcher(Api::<Pool>::all(client.clone()), owned())
        .default_backoff()
        .touched_objects()
        .filter_map(|event| async move { owner_of(event.map(|p| p.labels().clone())) });
    let block_device_claims = watcher(Api::<BlockDeviceClaim>::all(client), owned())
        .default_backoff()
        .touched_objects()
        .filter_map(|event| async move { owner_of(event.map(|c| c.labels().clone())) });

    stream::select_all(vec![claims.boxed(), pools.boxed(), block_device_claims.boxed()]).boxed()
}

fn owner_of(
    labels: std::result::Result<std::collections::BTreeMap<String, String>, watcher::Error>,
) -> Option<String> {
    match labels {
        Ok(labels) => labels.get(PCC_NAME_LABEL).cloned(),
        Err(e) => {
            warn!(error = %e, "Watch error");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{fabricator, ChangeKind};
    use crate::crd::{condition_type, RaidType};
    use crate::fixtures::{auto_pcc, cluster_with, disk, manual_pcc, sparse};
    use std::collections::BTreeMap;

    fn controller(cluster: &MemoryCluster, config: ControllerConfig) -> Arc<Controller> {
        Controller::new(
            fabricator(cluster.client_set()),
            config,
            Metrics::detached().unwrap(),
        )
    }

    #[test]
    fn test_key_for_change() {
        let change = |kind: &str, labels: &[(&str, &str)]| ObjectChange {
            kind: kind.to_string(),
            name: "obj".to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            change: ChangeKind::Updated,
        };
        assert_eq!(key_for(&change("PoolClusterClaim", &[])).as_deref(), Some("obj"));
        assert_eq!(
            key_for(&change("Pool", &[(PCC_NAME_LABEL, "p")])).as_deref(),
            Some("p")
        );
        assert_eq!(
            key_for(&change("BlockDeviceClaim", &[(PCC_NAME_LABEL, "p")])).as_deref(),
            Some("p")
        );
        assert_eq!(key_for(&change("Pool", &[])), None);
        assert_eq!(key_for(&change("Node", &[])), None);
    }

    #[tokio::test]
    async fn test_run_converges_and_stops() {
        let nodes = ["n1", "n2", "n3"];
        let devices = (1..=3)
            .map(|i| sparse(&format!("d{}", i), &format!("n{}", i)))
            .collect();
        let (cluster, clients) = cluster_with(&nodes, devices).await;
        clients
            .pool_cluster_claims
            .create(&auto_pcc("p", 2, RaidType::Striped))
            .await
            .unwrap();

        let controller = controller(&cluster, ControllerConfig::default());
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(
            controller
                .clone()
                .run(memory_events(&cluster), shutdown.clone()),
        );

        tokio::time::timeout(Duration::from_secs(5), async {
            while cluster.pools.len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // A deleted pool comes back through the event feed
        let victim = cluster.pools.snapshot()[0].name().to_string();
        clients
            .pools
            .delete(&victim, &crate::client::DeleteOptions::default())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while clients.pools.get_opt(&victim).await.unwrap().is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        handle.await.unwrap().unwrap();
        assert!(controller.queue().is_shutting_down());
    }

    #[tokio::test]
    async fn test_blocked_claim_is_requeued_later() {
        let (cluster, clients) = cluster_with(&["n1"], vec![]).await;
        clients
            .pool_cluster_claims
            .create(&auto_pcc("p", 1, RaidType::Striped))
            .await
            .unwrap();
        let controller = controller(&cluster, ControllerConfig::default());

        // No candidates: waits on a fixed delay, not on backoff
        controller.process("p").await;
        assert_eq!(controller.queue().num_requeues("p"), 0);
        let pcc = clients.pool_cluster_claims.get("p").await.unwrap();
        assert!(pcc
            .condition(condition_type::PROVISIONING_FAILED)
            .map(|c| c.is_true())
            .unwrap_or(false));
    }

    #[tokio::test]
    async fn test_repeated_failures_mark_claim_not_ready() {
        let devices = vec![disk("d1", "n1", 10), disk("d2", "n1", 10)];
        let (cluster, clients) = cluster_with(&["n1"], devices).await;
        clients
            .pool_cluster_claims
            .create(&manual_pcc("m", "n1", RaidType::Striped, &[&["d1"], &["d2"]]))
            .await
            .unwrap();
        let config = ControllerConfig {
            escalate_after: 2,
            ..Default::default()
        };
        let controller = controller(&cluster, config);
        controller.process("m").await;
        assert_eq!(controller.queue().num_requeues("m"), 0);

        // Dropping a raid group is refused on every cycle
        let mut pcc = clients.pool_cluster_claims.get("m").await.unwrap();
        pcc.spec.pools[0].raid_groups.pop();
        clients.pool_cluster_claims.update(&pcc).await.unwrap();

        controller.process("m").await;
        assert_eq!(controller.queue().num_requeues("m"), 1);
        controller.process("m").await;
        assert_eq!(controller.queue().num_requeues("m"), 2);

        let pcc = clients.pool_cluster_claims.get("m").await.unwrap();
        let ready = pcc.condition(condition_type::READY).unwrap();
        assert!(!ready.is_true());
        assert_eq!(ready.reason.as_deref(), Some("ReconcileError"));
        assert_eq!(cluster.pools.snapshot()[0].spec.raid_groups.len(), 2);
    }

    #[tokio::test]
    async fn test_workers_wait_for_leadership() {
        let (cluster, clients) = cluster_with(&["n1"], vec![sparse("d1", "n1")]).await;
        clients
            .pool_cluster_claims
            .create(&auto_pcc("p", 1, RaidType::Striped))
            .await
            .unwrap();

        let (leading, leadership) = watch::channel(false);
        let controller = Controller::with_leadership(
            fabricator(cluster.client_set()),
            ControllerConfig::default(),
            Metrics::detached().unwrap(),
            leadership,
        );
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(
            controller
                .clone()
                .run(memory_events(&cluster), shutdown.clone()),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cluster.pools.is_empty());
        assert_eq!(controller.queue().len(), 1);

        leading.send_replace(true);
        tokio::time::timeout(Duration::from_secs(5), async {
            while cluster.pools.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }
}
