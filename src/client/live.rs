//! Live cluster-store client
//!
//! Thin adapter from [`ResourceClient`] to `kube::Api`. Every API call has a
//! deadline. Idempotent calls are retried with exponential backoff on
//! transient failures (429, 5xx, network, deadline). Deleting an object that
//! is already gone counts as success.

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, PropagationPolicy};
use kube::Resource;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use super::{kind_of, ClusterObject, DeleteOptions, ListSelector, PatchType, Propagation, ResourceClient};
use crate::error::{Error, Result};

/// Field manager recorded on patches
pub const FIELD_MANAGER: &str = "pool-cluster-operator";

/// Retry budget for a single idempotent call
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub max_elapsed: Duration,
    /// Deadline of one API call
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(5),
            max_elapsed: Duration::from_secs(20),
            call_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        backoff::ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_max_elapsed_time(Some(self.max_elapsed))
            .build()
    }
}

/// [`ResourceClient`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeResourceClient<K: ClusterObject> {
    api: Api<K>,
    retry: RetryPolicy,
}

impl<K: ClusterObject> KubeResourceClient<K> {
    /// Client for a cluster-scoped kind (or all namespaces)
    pub fn cluster(client: kube::Client) -> Self {
        Self {
            api: Api::all(client),
            retry: RetryPolicy::default(),
        }
    }

    /// Client for a namespaced kind in one namespace
    pub fn namespaced(client: kube::Client, namespace: &str) -> Self
    where
        K: Resource<Scope = NamespaceResourceScope>,
    {
        Self {
            api: Api::namespaced(client, namespace),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Run `op`, retrying while it fails with a transient error
    async fn retrying<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        backoff::future::retry(self.retry.backoff(), || async {
            with_deadline(self.retry.call_timeout, op()).await.map_err(|e| {
                if e.is_transient() {
                    debug!("Retrying {} call after transient error: {}", kind_of::<K>(), e);
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await
    }
}

/// Fail `call` with [`Error::Timeout`] when it outlives `deadline`
async fn with_deadline<T>(deadline: Duration, call: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(deadline)),
    }
}

/// Translate API status codes into the crate's error variants
fn map_err<K: ClusterObject>(err: kube::Error, name: &str) -> Error {
    if let kube::Error::Api(resp) = &err {
        let kind = kind_of::<K>();
        let name = name.to_string();
        match (resp.code, resp.reason.as_str()) {
            (404, _) => return Error::ResourceNotFound { kind, name },
            (409, "AlreadyExists") => return Error::ResourceExists { kind, name },
            (409, _) => return Error::Conflict { kind, name },
            _ => {}
        }
    }
    Error::Kube(err)
}

fn list_params(selector: &ListSelector) -> ListParams {
    let mut lp = ListParams::default();
    if let Some(labels) = selector.label_string() {
        lp = lp.labels(&labels);
    }
    if let Some(fields) = selector.field_string() {
        lp = lp.fields(&fields);
    }
    lp
}

fn delete_params(opts: &DeleteOptions) -> DeleteParams {
    DeleteParams {
        propagation_policy: opts.propagation.map(|p| match p {
            Propagation::Foreground => PropagationPolicy::Foreground,
            Propagation::Background => PropagationPolicy::Background,
            Propagation::Orphan => PropagationPolicy::Orphan,
        }),
        grace_period_seconds: opts.grace_period_seconds,
        ..DeleteParams::default()
    }
}

fn name_of<K: ClusterObject>(obj: &K) -> Result<String> {
    obj.meta()
        .name
        .clone()
        .ok_or_else(|| Error::Internal(format!("{} without a name", kind_of::<K>())))
}

#[async_trait]
impl<K: ClusterObject> ResourceClient<K> for KubeResourceClient<K> {
    async fn get(&self, name: &str) -> Result<K> {
        self.retrying(|| async { self.api.get(name).await.map_err(|e| map_err::<K>(e, name)) })
            .await
    }

    async fn list(&self, selector: &ListSelector) -> Result<Vec<K>> {
        let lp = list_params(selector);
        self.retrying(|| async {
            self.api
                .list(&lp)
                .await
                .map(|list| list.items)
                .map_err(|e| map_err::<K>(e, ""))
        })
        .await
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let name = name_of(obj)?;
        let pp = PostParams::default();
        self.retrying(|| async {
            self.api
                .create(&pp, obj)
                .await
                .map_err(|e| map_err::<K>(e, &name))
        })
        .await
    }

    async fn update(&self, obj: &K) -> Result<K> {
        // Conflicts surface to the caller; the work queue retries the whole cycle.
        let name = name_of(obj)?;
        with_deadline(self.retry.call_timeout, async {
            self.api
                .replace(&name, &PostParams::default(), obj)
                .await
                .map_err(|e| map_err::<K>(e, &name))
        })
        .await
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        let name = name_of(obj)?;
        let data = serde_json::to_vec(obj)?;
        with_deadline(self.retry.call_timeout, async {
            self.api
                .replace_status(&name, &PostParams::default(), data)
                .await
                .map_err(|e| map_err::<K>(e, &name))
        })
        .await
    }

    async fn patch(&self, name: &str, patch_type: PatchType, body: &[u8]) -> Result<K> {
        let value: serde_json::Value = serde_json::from_slice(body)?;
        let pp = PatchParams::apply(FIELD_MANAGER);
        self.retrying(|| async {
            let patch = match patch_type {
                PatchType::Merge => Patch::Merge(&value),
                PatchType::Strategic => Patch::Strategic(&value),
            };
            self.api
                .patch(name, &pp, &patch)
                .await
                .map_err(|e| map_err::<K>(e, name))
        })
        .await
    }

    async fn delete(&self, name: &str, opts: &DeleteOptions) -> Result<()> {
        let dp = delete_params(opts);
        let result = self
            .retrying(|| async {
                self.api
                    .delete(name, &dp)
                    .await
                    .map(|_| ())
                    .map_err(|e| map_err::<K>(e, name))
            })
            .await;
        match result {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    async fn delete_collection(&self, selector: &ListSelector, opts: &DeleteOptions) -> Result<()> {
        let dp = delete_params(opts);
        let lp = list_params(selector);
        self.retrying(|| async {
            self.api
                .delete_collection(&dp, &lp)
                .await
                .map(|_| ())
                .map_err(|e| map_err::<K>(e, ""))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test(start_paused = true)]
    async fn test_call_deadline() {
        let deadline = Duration::from_secs(10);

        let stuck = with_deadline(deadline, std::future::pending::<Result<()>>()).await;
        assert_matches!(stuck, Err(Error::Timeout(d)) if d == deadline);
        assert!(stuck.unwrap_err().is_transient());

        let quick = with_deadline(deadline, async { Ok(7) }).await;
        assert_matches!(quick, Ok(7));

        let failed = with_deadline(deadline, async {
            Err::<(), _>(Error::ResourceNotFound {
                kind: "Pool".into(),
                name: "p".into(),
            })
        })
        .await;
        assert_matches!(failed, Err(Error::ResourceNotFound { .. }));
    }

    #[test]
    fn test_call_deadline_fits_inside_retry_budget() {
        let policy = RetryPolicy::default();
        assert!(policy.call_timeout < policy.max_elapsed);
    }
}
