//! Cluster API client abstraction
//!
//! Every resource kind is reached through the same narrow
//! [`ResourceClient`] surface. Three implementations exist:
//!
//! - [`KubeResourceClient`]: the live cluster store, with retries on
//!   transient failures
//! - [`PccScopedClient`]: a wrapper that only sees objects labelled with one
//!   PoolClusterClaim
//! - [`MemoryClient`]: an in-memory store with Kubernetes-like finalizer
//!   semantics, used by tests and standalone runs
//!
//! Callers receive a [`ClientSet`] from a [`ClientFabricator`], so tests can
//! substitute the in-memory store without touching the callers.

pub mod live;
pub mod memory;
pub mod scoped;

pub use live::KubeResourceClient;
pub use memory::{ChangeKind, MemoryClient, MemoryCluster, ObjectChange};
pub use scoped::PccScopedClient;

use async_trait::async_trait;
use k8s_openapi::api::admissionregistration::v1::ValidatingWebhookConfiguration;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Node, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use crate::crd::{
    BlockDevice, BlockDeviceClaim, Pool, PoolClusterClaim, VolumeClaim, VolumeReplica,
};
use crate::error::Result;

// =============================================================================
// Object Bound
// =============================================================================

/// Bound shared by every kind the clients handle
pub trait ClusterObject:
    kube::Resource<DynamicType = ()>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<T> ClusterObject for T where
    T: kube::Resource<DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Kind name of `K`, e.g. "BlockDeviceClaim"
pub fn kind_of<K: ClusterObject>() -> String {
    K::kind(&()).to_string()
}

// =============================================================================
// Selectors and Options
// =============================================================================

/// Equality label and field selector
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListSelector {
    pub labels: BTreeMap<String, String>,
    pub fields: BTreeMap<String, String>,
}

impl ListSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn label(key: &str, value: &str) -> Self {
        Self::default().with_label(key, value)
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_labels(mut self, labels: &BTreeMap<String, String>) -> Self {
        self.labels
            .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Only `metadata.name` is understood by the in-memory store
    pub fn with_field(mut self, key: &str, value: &str) -> Self {
        self.fields.insert(key.to_string(), value.to_string());
        self
    }

    pub fn label_string(&self) -> Option<String> {
        join_pairs(&self.labels)
    }

    pub fn field_string(&self) -> Option<String> {
        join_pairs(&self.fields)
    }

    /// Whether `meta` satisfies every requirement
    pub fn matches(&self, meta: &ObjectMeta) -> bool {
        let labels_ok = self.labels.iter().all(|(k, v)| {
            meta.labels
                .as_ref()
                .and_then(|l| l.get(k))
                .map(|actual| actual == v)
                .unwrap_or(false)
        });
        let fields_ok = self.fields.iter().all(|(k, v)| match k.as_str() {
            "metadata.name" => meta.name.as_deref() == Some(v.as_str()),
            _ => true,
        });
        labels_ok && fields_ok
    }
}

fn join_pairs(pairs: &BTreeMap<String, String>) -> Option<String> {
    if pairs.is_empty() {
        return None;
    }
    Some(
        pairs
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(","),
    )
}

/// Patch encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchType {
    /// RFC 7386 JSON merge patch
    Merge,
    /// Kubernetes strategic merge patch; the in-memory store treats it as a merge patch
    Strategic,
}

/// Garbage collection policy for dependents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    Foreground,
    Background,
    Orphan,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    pub propagation: Option<Propagation>,
    pub grace_period_seconds: Option<u32>,
}

impl DeleteOptions {
    pub fn background() -> Self {
        Self {
            propagation: Some(Propagation::Background),
            grace_period_seconds: None,
        }
    }
}

// =============================================================================
// Resource Client
// =============================================================================

/// CRUD surface over one resource kind. Implementations are safe to share
/// between tasks.
#[async_trait]
pub trait ResourceClient<K: ClusterObject>: Send + Sync {
    /// Fetch one object; `Error::ResourceNotFound` when absent
    async fn get(&self, name: &str) -> Result<K>;

    async fn list(&self, selector: &ListSelector) -> Result<Vec<K>>;

    /// Create; `Error::ResourceExists` when the name is taken
    async fn create(&self, obj: &K) -> Result<K>;

    /// Replace spec and metadata; status is left untouched
    async fn update(&self, obj: &K) -> Result<K>;

    /// Replace status only
    async fn update_status(&self, obj: &K) -> Result<K>;

    async fn patch(&self, name: &str, patch_type: PatchType, body: &[u8]) -> Result<K>;

    /// Delete; objects with finalizers are only marked for deletion
    async fn delete(&self, name: &str, opts: &DeleteOptions) -> Result<()>;

    async fn delete_collection(&self, selector: &ListSelector, opts: &DeleteOptions) -> Result<()>;

    /// `get` that maps not-found to `None`
    async fn get_opt(&self, name: &str) -> Result<Option<K>> {
        match self.get(name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

// =============================================================================
// Client Set
// =============================================================================

/// One client per resource kind the operator touches
#[derive(Clone)]
pub struct ClientSet {
    pub pool_cluster_claims: Arc<dyn ResourceClient<PoolClusterClaim>>,
    pub pools: Arc<dyn ResourceClient<Pool>>,
    pub block_devices: Arc<dyn ResourceClient<BlockDevice>>,
    pub block_device_claims: Arc<dyn ResourceClient<BlockDeviceClaim>>,
    pub volume_claims: Arc<dyn ResourceClient<VolumeClaim>>,
    pub volume_replicas: Arc<dyn ResourceClient<VolumeReplica>>,
    pub nodes: Arc<dyn ResourceClient<Node>>,
    pub secrets: Arc<dyn ResourceClient<Secret>>,
    pub services: Arc<dyn ResourceClient<Service>>,
    pub deployments: Arc<dyn ResourceClient<Deployment>>,
    pub webhook_configs: Arc<dyn ResourceClient<ValidatingWebhookConfiguration>>,
}

impl ClientSet {
    /// Live clients. Secrets, services and deployments are read in `namespace`.
    pub fn from_kube(client: kube::Client, namespace: &str) -> Self {
        Self {
            pool_cluster_claims: Arc::new(KubeResourceClient::cluster(client.clone())),
            pools: Arc::new(KubeResourceClient::cluster(client.clone())),
            block_devices: Arc::new(KubeResourceClient::cluster(client.clone())),
            block_device_claims: Arc::new(KubeResourceClient::cluster(client.clone())),
            volume_claims: Arc::new(KubeResourceClient::cluster(client.clone())),
            volume_replicas: Arc::new(KubeResourceClient::cluster(client.clone())),
            nodes: Arc::new(KubeResourceClient::cluster(client.clone())),
            secrets: Arc::new(KubeResourceClient::namespaced(client.clone(), namespace)),
            services: Arc::new(KubeResourceClient::namespaced(client.clone(), namespace)),
            deployments: Arc::new(KubeResourceClient::namespaced(client.clone(), namespace)),
            webhook_configs: Arc::new(KubeResourceClient::cluster(client)),
        }
    }

    /// Same clients, with pools and block device claims restricted to one
    /// PoolClusterClaim
    pub fn scoped_to(&self, pcc: &str) -> Self {
        Self {
            pools: Arc::new(PccScopedClient::new(self.pools.clone(), pcc)),
            block_device_claims: Arc::new(PccScopedClient::new(
                self.block_device_claims.clone(),
                pcc,
            )),
            ..self.clone()
        }
    }
}

/// Produces the client set a component works against
pub type ClientFabricator = Arc<dyn Fn() -> ClientSet + Send + Sync>;

/// Fabricator that always hands out clones of `set`
pub fn fabricator(set: ClientSet) -> ClientFabricator {
    Arc::new(move || set.clone())
}
