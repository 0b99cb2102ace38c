//! In-memory cluster store
//!
//! Behaves like the API server for the parts the operator relies on:
//! resource versions and optimistic concurrency, status kept apart from
//! spec, finalizers that hold a deleted object until they are cleared,
//! label selectors and merge patches. Every mutation is counted and
//! broadcast, so tests can assert that a reconcile wrote nothing and the
//! standalone controller can react to changes.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, SubsecRound, Utc};
use k8s_openapi::api::admissionregistration::v1::ValidatingWebhookConfiguration;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Node, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::{kind_of, ClientSet, ClusterObject, DeleteOptions, ListSelector, PatchType, ResourceClient};
use crate::crd::{
    BlockDevice, BlockDeviceClaim, Pool, PoolClusterClaim, VolumeClaim, VolumeReplica,
};
use crate::error::{Error, Result};

// =============================================================================
// Change Events
// =============================================================================

/// What happened to an object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// Notification emitted after every mutation
#[derive(Debug, Clone)]
pub struct ObjectChange {
    pub kind: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub change: ChangeKind,
}

// =============================================================================
// Shared Clock
// =============================================================================

/// Counters shared by every kind in one cluster
struct StoreClock {
    resource_version: AtomicU64,
    writes: AtomicU64,
    last_created: Mutex<DateTime<Utc>>,
    events: broadcast::Sender<ObjectChange>,
}

impl StoreClock {
    fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            resource_version: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            last_created: Mutex::new(Utc::now().trunc_subsecs(0) - ChronoDuration::seconds(1)),
            events,
        }
    }

    fn next_version(&self) -> String {
        (self.resource_version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    /// Strictly increasing creation timestamps, one second apart
    fn next_creation(&self) -> DateTime<Utc> {
        let mut last = self.last_created.lock();
        let now = Utc::now().trunc_subsecs(0);
        *last = if now > *last {
            now
        } else {
            *last + ChronoDuration::seconds(1)
        };
        *last
    }

    fn record<K: ClusterObject>(&self, obj: &K, change: ChangeKind) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let meta = obj.meta();
        let _ = self.events.send(ObjectChange {
            kind: kind_of::<K>(),
            name: meta.name.clone().unwrap_or_default(),
            labels: meta.labels.clone().unwrap_or_default(),
            change,
        });
    }
}

// =============================================================================
// Memory Client
// =============================================================================

/// [`ResourceClient`] over an in-memory map. Status and UID supplied on
/// create are stored as given, which lets tests seed observed state.
pub struct MemoryClient<K: ClusterObject> {
    objects: RwLock<BTreeMap<String, K>>,
    clock: Arc<StoreClock>,
}

impl<K: ClusterObject> Default for MemoryClient<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: ClusterObject> MemoryClient<K> {
    /// Standalone store with its own clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(StoreClock::new()))
    }

    fn with_clock(clock: Arc<StoreClock>) -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            clock,
        }
    }

    /// Number of stored objects, including ones pending deletion
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Snapshot of every stored object, ordered by name
    pub fn snapshot(&self) -> Vec<K> {
        self.objects.read().values().cloned().collect()
    }

    fn not_found(name: &str) -> Error {
        Error::ResourceNotFound {
            kind: kind_of::<K>(),
            name: name.to_string(),
        }
    }

    fn name_of(obj: &K) -> Result<String> {
        obj.meta()
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::Internal(format!("{} without a name", kind_of::<K>())))
    }

    fn check_version(stored: &K, incoming: &K, name: &str) -> Result<()> {
        match incoming.meta().resource_version.as_deref() {
            Some(rv) if !rv.is_empty() && Some(rv) != stored.meta().resource_version.as_deref() => {
                Err(Error::Conflict {
                    kind: kind_of::<K>(),
                    name: name.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Store `next` in place of the object named `name`, or drop it when a
    /// pending deletion has no finalizers left
    fn commit(&self, objects: &mut BTreeMap<String, K>, name: &str, mut next: K) -> K {
        let deleting = next.meta().deletion_timestamp.is_some();
        let finalized = next
            .meta()
            .finalizers
            .as_ref()
            .map(|f| f.is_empty())
            .unwrap_or(true);

        next.meta_mut().resource_version = Some(self.clock.next_version());
        if deleting && finalized {
            objects.remove(name);
            self.clock.record(&next, ChangeKind::Deleted);
        } else {
            objects.insert(name.to_string(), next.clone());
            self.clock.record(&next, ChangeKind::Updated);
        }
        next
    }
}

fn to_value<K: ClusterObject>(obj: &K) -> Result<Value> {
    Ok(serde_json::to_value(obj)?)
}

fn from_value<K: ClusterObject>(value: Value) -> Result<K> {
    Ok(serde_json::from_value(value)?)
}

/// RFC 7386 merge of `patch` into `target`
pub fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(entries) => {
            if !target.is_object() {
                *target = Value::Object(serde_json::Map::new());
            }
            if let Value::Object(fields) = target {
                for (key, value) in entries {
                    if value.is_null() {
                        fields.remove(key);
                    } else {
                        merge_patch(fields.entry(key.clone()).or_insert(Value::Null), value);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

/// Carry server-owned metadata from `stored` onto `next`
fn keep_server_fields<K: ClusterObject>(stored: &K, next: &mut K) {
    let (from, to) = (stored.meta(), next.meta_mut());
    to.uid = from.uid.clone();
    to.creation_timestamp = from.creation_timestamp.clone();
    to.deletion_timestamp = from.deletion_timestamp.clone();
    to.resource_version = from.resource_version.clone();
}

#[async_trait]
impl<K: ClusterObject> ResourceClient<K> for MemoryClient<K> {
    async fn get(&self, name: &str) -> Result<K> {
        self.objects
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Self::not_found(name))
    }

    async fn list(&self, selector: &ListSelector) -> Result<Vec<K>> {
        Ok(self
            .objects
            .read()
            .values()
            .filter(|obj| selector.matches(obj.meta()))
            .cloned()
            .collect())
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let name = Self::name_of(obj)?;
        let mut objects = self.objects.write();
        if objects.contains_key(&name) {
            return Err(Error::ResourceExists {
                kind: kind_of::<K>(),
                name,
            });
        }

        let mut created = obj.clone();
        let version = self.clock.next_version();
        let meta = created.meta_mut();
        if meta.uid.as_deref().map(str::is_empty).unwrap_or(true) {
            meta.uid = Some(format!("{}-{}", kind_of::<K>().to_lowercase(), version));
        }
        meta.resource_version = Some(version);
        meta.creation_timestamp = Some(Time(self.clock.next_creation()));
        meta.deletion_timestamp = None;
        meta.generation = Some(1);

        objects.insert(name, created.clone());
        self.clock.record(&created, ChangeKind::Created);
        Ok(created)
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let name = Self::name_of(obj)?;
        let mut objects = self.objects.write();
        let stored = objects.get(&name).cloned().ok_or_else(|| Self::not_found(&name))?;
        Self::check_version(&stored, obj, &name)?;

        let mut value = to_value(obj)?;
        let stored_value = to_value(&stored)?;
        match stored_value.get("status") {
            Some(status) => value["status"] = status.clone(),
            None => {
                if let Value::Object(fields) = &mut value {
                    fields.remove("status");
                }
            }
        }
        let mut next: K = from_value(value)?;
        keep_server_fields(&stored, &mut next);
        if to_value(&next)?.get("spec") != stored_value.get("spec") {
            next.meta_mut().generation = Some(stored.meta().generation.unwrap_or(1) + 1);
        }
        Ok(self.commit(&mut objects, &name, next))
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        let name = Self::name_of(obj)?;
        let mut objects = self.objects.write();
        let stored = objects.get(&name).cloned().ok_or_else(|| Self::not_found(&name))?;
        Self::check_version(&stored, obj, &name)?;

        let mut value = to_value(&stored)?;
        match to_value(obj)?.get("status") {
            Some(status) => value["status"] = status.clone(),
            None => {
                if let Value::Object(fields) = &mut value {
                    fields.remove("status");
                }
            }
        }
        let next: K = from_value(value)?;
        Ok(self.commit(&mut objects, &name, next))
    }

    async fn patch(&self, name: &str, _patch_type: PatchType, body: &[u8]) -> Result<K> {
        let mut patch: Value = serde_json::from_slice(body)?;
        if let Value::Object(fields) = &mut patch {
            fields.remove("status");
        }

        let mut objects = self.objects.write();
        let stored = objects.get(name).cloned().ok_or_else(|| Self::not_found(name))?;
        let mut value = to_value(&stored)?;
        merge_patch(&mut value, &patch);
        let mut next: K = from_value(value)?;
        keep_server_fields(&stored, &mut next);
        Ok(self.commit(&mut objects, name, next))
    }

    async fn delete(&self, name: &str, _opts: &DeleteOptions) -> Result<()> {
        let mut objects = self.objects.write();
        let Some(stored) = objects.get(name).cloned() else {
            return Ok(());
        };
        if stored.meta().deletion_timestamp.is_some() {
            return Ok(());
        }

        let mut next = stored;
        next.meta_mut().deletion_timestamp = Some(Time(Utc::now()));
        self.commit(&mut objects, name, next);
        Ok(())
    }

    async fn delete_collection(&self, selector: &ListSelector, opts: &DeleteOptions) -> Result<()> {
        let names: Vec<String> = self
            .objects
            .read()
            .iter()
            .filter(|(_, obj)| selector.matches(obj.meta()))
            .map(|(name, _)| name.clone())
            .collect();
        for name in names {
            self.delete(&name, opts).await?;
        }
        Ok(())
    }
}

// =============================================================================
// Memory Cluster
// =============================================================================

/// Every kind the operator uses, sharing one resource-version clock
pub struct MemoryCluster {
    clock: Arc<StoreClock>,
    pub pool_cluster_claims: Arc<MemoryClient<PoolClusterClaim>>,
    pub pools: Arc<MemoryClient<Pool>>,
    pub block_devices: Arc<MemoryClient<BlockDevice>>,
    pub block_device_claims: Arc<MemoryClient<BlockDeviceClaim>>,
    pub volume_claims: Arc<MemoryClient<VolumeClaim>>,
    pub volume_replicas: Arc<MemoryClient<VolumeReplica>>,
    pub nodes: Arc<MemoryClient<Node>>,
    pub secrets: Arc<MemoryClient<Secret>>,
    pub services: Arc<MemoryClient<Service>>,
    pub deployments: Arc<MemoryClient<Deployment>>,
    pub webhook_configs: Arc<MemoryClient<ValidatingWebhookConfiguration>>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        let clock = Arc::new(StoreClock::new());
        Self {
            pool_cluster_claims: Arc::new(MemoryClient::with_clock(clock.clone())),
            pools: Arc::new(MemoryClient::with_clock(clock.clone())),
            block_devices: Arc::new(MemoryClient::with_clock(clock.clone())),
            block_device_claims: Arc::new(MemoryClient::with_clock(clock.clone())),
            volume_claims: Arc::new(MemoryClient::with_clock(clock.clone())),
            volume_replicas: Arc::new(MemoryClient::with_clock(clock.clone())),
            nodes: Arc::new(MemoryClient::with_clock(clock.clone())),
            secrets: Arc::new(MemoryClient::with_clock(clock.clone())),
            services: Arc::new(MemoryClient::with_clock(clock.clone())),
            deployments: Arc::new(MemoryClient::with_clock(clock.clone())),
            webhook_configs: Arc::new(MemoryClient::with_clock(clock.clone())),
            clock,
        }
    }

    /// Clients over this cluster
    pub fn client_set(&self) -> ClientSet {
        ClientSet {
            pool_cluster_claims: self.pool_cluster_claims.clone(),
            pools: self.pools.clone(),
            block_devices: self.block_devices.clone(),
            block_device_claims: self.block_device_claims.clone(),
            volume_claims: self.volume_claims.clone(),
            volume_replicas: self.volume_replicas.clone(),
            nodes: self.nodes.clone(),
            secrets: self.secrets.clone(),
            services: self.services.clone(),
            deployments: self.deployments.clone(),
            webhook_configs: self.webhook_configs.clone(),
        }
    }

    /// Total mutations so far, across all kinds
    pub fn writes(&self) -> u64 {
        self.clock.writes.load(Ordering::SeqCst)
    }

    /// Receive a notification for every future mutation
    pub fn subscribe(&self) -> broadcast::Receiver<ObjectChange> {
        self.clock.events.subscribe()
    }
}
