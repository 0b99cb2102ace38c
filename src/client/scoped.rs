//! Client restricted to one PoolClusterClaim
//!
//! Reads only return objects carrying the claim's label, and writes refuse to
//! touch objects that belong to someone else. Objects created through the
//! scoped client are labelled automatically.

use async_trait::async_trait;
use std::sync::Arc;

use super::{kind_of, ClusterObject, DeleteOptions, ListSelector, PatchType, ResourceClient};
use crate::crd::PCC_NAME_LABEL;
use crate::error::{Error, Result};

/// Wraps a client so it only sees objects labelled with `pcc`
pub struct PccScopedClient<K: ClusterObject> {
    inner: Arc<dyn ResourceClient<K>>,
    pcc: String,
}

impl<K: ClusterObject> PccScopedClient<K> {
    pub fn new(inner: Arc<dyn ResourceClient<K>>, pcc: &str) -> Self {
        Self {
            inner,
            pcc: pcc.to_string(),
        }
    }

    pub fn pcc(&self) -> &str {
        &self.pcc
    }

    fn owns(&self, obj: &K) -> bool {
        obj.meta()
            .labels
            .as_ref()
            .and_then(|l| l.get(PCC_NAME_LABEL))
            .map(|v| v == &self.pcc)
            .unwrap_or(false)
    }

    fn not_found(&self, name: &str) -> Error {
        Error::ResourceNotFound {
            kind: kind_of::<K>(),
            name: name.to_string(),
        }
    }

    fn scoped(&self, selector: &ListSelector) -> ListSelector {
        selector.clone().with_label(PCC_NAME_LABEL, &self.pcc)
    }

    /// Confirm the stored object named `name` belongs to this claim
    async fn ensure_owned(&self, name: &str) -> Result<()> {
        let existing = self.inner.get(name).await?;
        if self.owns(&existing) {
            Ok(())
        } else {
            Err(self.not_found(name))
        }
    }
}

#[async_trait]
impl<K: ClusterObject> ResourceClient<K> for PccScopedClient<K> {
    async fn get(&self, name: &str) -> Result<K> {
        let obj = self.inner.get(name).await?;
        if self.owns(&obj) {
            Ok(obj)
        } else {
            Err(self.not_found(name))
        }
    }

    async fn list(&self, selector: &ListSelector) -> Result<Vec<K>> {
        self.inner.list(&self.scoped(selector)).await
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let mut obj = obj.clone();
        obj.meta_mut()
            .labels
            .get_or_insert_with(Default::default)
            .insert(PCC_NAME_LABEL.to_string(), self.pcc.clone());
        self.inner.create(&obj).await
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let name = obj.meta().name.clone().unwrap_or_default();
        self.ensure_owned(&name).await?;
        if !self.owns(obj) {
            return Err(Error::InvariantViolation(format!(
                "{} {} would lose its {} label",
                kind_of::<K>(),
                name,
                PCC_NAME_LABEL
            )));
        }
        self.inner.update(obj).await
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        let name = obj.meta().name.clone().unwrap_or_default();
        self.ensure_owned(&name).await?;
        self.inner.update_status(obj).await
    }

    async fn patch(&self, name: &str, patch_type: PatchType, body: &[u8]) -> Result<K> {
        self.ensure_owned(name).await?;
        self.inner.patch(name, patch_type, body).await
    }

    async fn delete(&self, name: &str, opts: &DeleteOptions) -> Result<()> {
        match self.ensure_owned(name).await {
            Ok(()) => self.inner.delete(name, opts).await,
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn delete_collection(&self, selector: &ListSelector, opts: &DeleteOptions) -> Result<()> {
        self.inner.delete_collection(&self.scoped(selector), opts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MemoryClient;
    use crate::crd::BlockDeviceClaim;
    use crate::domain::BlockDeviceClaimBuilder;
    use assert_matches::assert_matches;

    fn claim(name: &str, owner: Option<&str>) -> BlockDeviceClaim {
        let builder = BlockDeviceClaimBuilder::new()
            .with_name(name)
            .with_block_device(&format!("bd-{}", name));
        match owner {
            Some(pcc) => builder.with_owner_label(pcc),
            None => builder,
        }
        .build()
        .unwrap()
    }

    #[tokio::test]
    async fn test_scoped_reads_hide_foreign_objects() {
        let store = Arc::new(MemoryClient::<BlockDeviceClaim>::new());
        store.create(&claim("mine", Some("pcc-a"))).await.unwrap();
        store.create(&claim("theirs", Some("pcc-b"))).await.unwrap();
        store.create(&claim("loose", None)).await.unwrap();

        let scoped = PccScopedClient::new(store.clone(), "pcc-a");
        let listed = scoped.list(&ListSelector::everything()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name(), "mine");

        assert!(scoped.get("mine").await.is_ok());
        assert_matches!(scoped.get("theirs").await, Err(Error::ResourceNotFound { .. }));
        assert_eq!(scoped.get_opt("loose").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_scoped_create_labels_object() {
        let store = Arc::new(MemoryClient::<BlockDeviceClaim>::new());
        let scoped = PccScopedClient::new(store.clone(), "pcc-a");

        let created = scoped.create(&claim("new", None)).await.unwrap();
        assert!(created.is_owned_by("pcc-a"));
        assert!(store.get("new").await.unwrap().is_owned_by("pcc-a"));
    }

    #[tokio::test]
    async fn test_scoped_writes_refuse_foreign_objects() {
        let store = Arc::new(MemoryClient::<BlockDeviceClaim>::new());
        let foreign = store.create(&claim("theirs", Some("pcc-b"))).await.unwrap();
        let scoped = PccScopedClient::new(store.clone(), "pcc-a");

        assert!(scoped.update(&foreign).await.unwrap_err().is_not_found());
        assert!(scoped
            .patch("theirs", PatchType::Merge, br#"{"spec":{"capacity":1}}"#)
            .await
            .unwrap_err()
            .is_not_found());

        // Deleting something out of scope is a no-op
        scoped.delete("theirs", &DeleteOptions::default()).await.unwrap();
        assert!(store.get("theirs").await.is_ok());

        scoped
            .delete_collection(&ListSelector::everything(), &DeleteOptions::default())
            .await
            .unwrap();
        assert!(store.get("theirs").await.is_ok());
    }

    #[tokio::test]
    async fn test_scoped_update_keeps_label() {
        let store = Arc::new(MemoryClient::<BlockDeviceClaim>::new());
        let scoped = PccScopedClient::new(store.clone(), "pcc-a");
        let mut mine = scoped.create(&claim("mine", None)).await.unwrap();

        mine.spec.capacity = 42;
        let updated = scoped.update(&mine).await.unwrap();
        assert_eq!(updated.spec.capacity, 42);

        mine = updated;
        mine.metadata.labels = None;
        assert_matches!(scoped.update(&mine).await, Err(Error::InvariantViolation(_)));
    }
}
