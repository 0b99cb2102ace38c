//! Device index
//!
//! A per-cycle snapshot of everything placement needs to know about one
//! PoolClusterClaim: its pools, every block device, the claims it owns and
//! the cluster's nodes. It is rebuilt at the start of every reconcile and
//! never cached across cycles.

use k8s_openapi::api::core::v1::Node;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::client::{ClientSet, ListSelector};
use crate::crd::{
    BlockDevice, BlockDeviceClaim, DiskKind, Pool, PoolClusterClaim, PCC_NAME_LABEL,
};
use crate::domain::predicate::{block_device, claim, has_label, pool, Predicate};
use crate::domain::Filter;
use crate::error::Result;

/// Read-through view of devices, pools and nodes for one claim
#[derive(Debug, Clone)]
pub struct DeviceIndex {
    pcc: String,
    disk_kind: DiskKind,
    pools: Vec<Pool>,
    devices: BTreeMap<String, BlockDevice>,
    claims: BTreeMap<String, BlockDeviceClaim>,
    nodes: Vec<Node>,
}

impl DeviceIndex {
    /// Load the index for `pcc` through `clients`
    pub async fn build(clients: &ClientSet, pcc: &PoolClusterClaim) -> Result<Self> {
        let owned = ListSelector::label(PCC_NAME_LABEL, pcc.name());
        let pools = clients.pools.list(&owned).await?;
        let claims = clients.block_device_claims.list(&owned).await?;
        let devices = clients.block_devices.list(&ListSelector::everything()).await?;
        let nodes = clients.nodes.list(&ListSelector::everything()).await?;

        debug!(
            pcc = %pcc.name(),
            pools = pools.len(),
            claims = claims.len(),
            devices = devices.len(),
            nodes = nodes.len(),
            "Built device index"
        );
        Ok(Self::from_parts(pcc, pools, devices, claims, nodes))
    }

    /// Assemble an index from already fetched objects. Claims and pools not
    /// labelled with `pcc` are ignored.
    pub fn from_parts(
        pcc: &PoolClusterClaim,
        pools: Vec<Pool>,
        devices: Vec<BlockDevice>,
        claims: Vec<BlockDeviceClaim>,
        nodes: Vec<Node>,
    ) -> Self {
        let name = pcc.name().to_string();
        let mut pools = pools.filtered(&[has_label(PCC_NAME_LABEL, &name)]);
        pools.sort_by(|a, b| a.name().cmp(b.name()));
        let owned = claim::is_owned_by(&name);

        let mut nodes = nodes;
        nodes.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));

        Self {
            disk_kind: pcc.spec.disk_kind,
            devices: devices
                .into_iter()
                .map(|bd| (bd.name().to_string(), bd))
                .collect(),
            claims: claims
                .into_iter()
                .filter(|c| owned.matches(c))
                .map(|c| (c.name().to_string(), c))
                .collect(),
            pools,
            nodes,
            pcc: name,
        }
    }

    pub fn pcc(&self) -> &str {
        &self.pcc
    }

    /// Pools of this claim, ordered by name
    pub fn pools(&self) -> &[Pool] {
        &self.pools
    }

    pub fn pool_on_node(&self, node: &str) -> Option<&Pool> {
        self.pools.find_by(&[pool::is_on_node(node)])
    }

    pub fn device(&self, name: &str) -> Option<&BlockDevice> {
        self.devices.get(name)
    }

    /// Claims owned by this claim, keyed by claim name
    pub fn claims(&self) -> &BTreeMap<String, BlockDeviceClaim> {
        &self.claims
    }

    /// Owned claim binding `device`, if any
    pub fn claim_for_device(&self, device: &str) -> Option<&BlockDeviceClaim> {
        self.claims.find_by(&[claim::is_for_device(device)])
    }

    /// Device name to the number of this claim's pools referencing it
    pub fn used_devices(&self) -> BTreeMap<String, usize> {
        let mut used = BTreeMap::new();
        for device in self.pools.iter().flat_map(|p| p.block_device_names()) {
            *used.entry(device.to_string()).or_insert(0) += 1;
        }
        used
    }

    /// Nodes already hosting a pool of this claim
    pub fn used_nodes(&self) -> BTreeSet<String> {
        self.pools.iter().map(|p| p.node().to_string()).collect()
    }

    /// Whether `bd` is free or already bound to this claim
    pub fn is_claimable(&self, bd: &BlockDevice) -> bool {
        self.claimable().matches(bd)
    }

    fn claimable(&self) -> Predicate<BlockDevice> {
        let owned_claims: BTreeSet<String> = self.claims.keys().cloned().collect();
        let owned_devices: BTreeSet<String> = self
            .claims
            .values()
            .map(|c| c.block_device().to_string())
            .collect();
        let bound_here = Predicate::new("is_bound_to_owned_claim", move |bd: &BlockDevice| {
            owned_devices.contains(bd.name())
                || bd
                    .spec
                    .claim_ref
                    .as_ref()
                    .map(|r| owned_claims.contains(r))
                    .unwrap_or(false)
        });
        block_device::is_claimed().not().or(bound_here)
    }

    /// Usable devices of the claim's disk kind, grouped by node. Nodes that
    /// already host a pool of this claim are left out. Devices inside each
    /// list are ordered by name.
    pub fn candidate_nodes(&self) -> BTreeMap<String, Vec<BlockDevice>> {
        let devices: Vec<BlockDevice> = self.devices.values().cloned().collect();
        let usable = devices.filter_by(&[
            block_device::is_active(),
            block_device::is_type(self.disk_kind),
            block_device::has_no_filesystem(),
            block_device::is_unpartitioned(),
            block_device::is_usable(self.used_devices()),
            block_device::is_on_usable_node(self.used_nodes()),
            self.claimable(),
        ]);

        let mut by_node: BTreeMap<String, Vec<BlockDevice>> = BTreeMap::new();
        for bd in usable {
            by_node.entry(bd.node().to_string()).or_default().push(bd.clone());
        }
        by_node
    }

    /// Names of nodes whose labels satisfy `selector`, ordered
    pub fn nodes_matching(&self, selector: &BTreeMap<String, String>) -> Vec<String> {
        let selector = ListSelector::everything().with_labels(selector);
        self.nodes
            .iter()
            .filter(|n| selector.matches(&n.metadata))
            .filter_map(|n| n.metadata.name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{PoolRaidGroup, RaidType, HOSTNAME_LABEL};
    use crate::domain::{pool_block_device, BlockDeviceBuilder, BlockDeviceClaimBuilder, PoolBuilder};
    use crate::fixtures::{auto_pcc, node, sparse};

    fn pool_on(pcc: &PoolClusterClaim, node: &str, device: &BlockDevice) -> Pool {
        PoolBuilder::new()
            .with_name(&format!("{}-{}", pcc.name(), node))
            .with_owner(pcc)
            .with_host(node)
            .with_raid_group(PoolRaidGroup {
                name: "group0".into(),
                r#type: RaidType::Striped,
                block_devices: vec![pool_block_device(device)],
            })
            .build()
            .unwrap()
    }

    #[test]
    fn test_candidates_exclude_used_and_unusable() {
        let pcc = auto_pcc("p", 3, RaidType::Striped);
        let d1 = sparse("d1", "n1");
        let d2 = sparse("d2", "n2");
        let inactive = BlockDeviceBuilder::new()
            .with_name("d3")
            .with_node("n3")
            .with_kind(DiskKind::Sparse)
            .active(false)
            .build()
            .unwrap();
        let wrong_kind = BlockDeviceBuilder::new()
            .with_name("d4")
            .with_node("n4")
            .with_kind(DiskKind::Disk)
            .active(true)
            .build()
            .unwrap();
        let formatted = BlockDeviceBuilder::new()
            .with_name("d5")
            .with_node("n5")
            .with_kind(DiskKind::Sparse)
            .with_filesystem("ext4", "/data")
            .active(true)
            .build()
            .unwrap();
        let foreign = BlockDeviceBuilder::new()
            .with_name("d6")
            .with_node("n6")
            .with_kind(DiskKind::Sparse)
            .claimed_by("bdc-other")
            .active(true)
            .build()
            .unwrap();
        let d7 = sparse("d7", "n7");

        let index = DeviceIndex::from_parts(
            &pcc,
            vec![pool_on(&pcc, "n1", &d1)],
            vec![d1, d2, inactive, wrong_kind, formatted, foreign, d7],
            vec![],
            vec![],
        );

        assert_eq!(index.used_devices().get("d1"), Some(&1));
        assert!(index.used_nodes().contains("n1"));
        let candidates = index.candidate_nodes();
        assert_eq!(candidates.keys().collect::<Vec<_>>(), vec!["n2", "n7"]);
    }

    #[test]
    fn test_claimed_by_own_claim_is_candidate() {
        let pcc = auto_pcc("p", 1, RaidType::Striped);
        let bd = sparse("d1", "n1");
        let claim = BlockDeviceClaimBuilder::for_device(&bd)
            .with_owner(&pcc)
            .build()
            .unwrap();
        let mut claimed = bd.clone();
        claimed.spec.claim_ref = Some(claim.name().to_string());
        claimed.status.as_mut().unwrap().claim_state = crate::crd::ClaimState::Claimed;

        let index = DeviceIndex::from_parts(&pcc, vec![], vec![claimed.clone()], vec![claim], vec![]);
        assert!(index.is_claimable(&claimed));
        assert_eq!(index.candidate_nodes()["n1"].len(), 1);
    }

    #[test]
    fn test_candidate_devices_sorted_and_foreign_pools_ignored() {
        let pcc = auto_pcc("p", 1, RaidType::Mirrored);
        let other = auto_pcc("q", 1, RaidType::Striped);
        let b = sparse("b", "n1");
        let a = sparse("a", "n1");
        let c = sparse("c", "n2");

        let index = DeviceIndex::from_parts(
            &pcc,
            vec![pool_on(&other, "n2", &c)],
            vec![b, a, c],
            vec![],
            vec![node("n2"), node("n1")],
        );
        assert!(index.pools().is_empty());
        let candidates = index.candidate_nodes();
        let names: Vec<&str> = candidates["n1"].iter().map(|d| d.name()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(candidates.contains_key("n2"));
    }

    #[test]
    fn test_lookups_by_node_and_device() {
        let pcc = auto_pcc("p", 2, RaidType::Striped);
        let d1 = sparse("d1", "n1");
        let d2 = sparse("d2", "n2");
        let claim = BlockDeviceClaimBuilder::for_device(&d1)
            .with_owner(&pcc)
            .build()
            .unwrap();
        let foreign = BlockDeviceClaimBuilder::for_device(&d2)
            .with_owner_label("q")
            .build()
            .unwrap();

        let index = DeviceIndex::from_parts(
            &pcc,
            vec![pool_on(&pcc, "n1", &d1)],
            vec![d1, d2],
            vec![claim.clone(), foreign],
            vec![],
        );
        assert_eq!(index.pool_on_node("n1").map(|p| p.node()), Some("n1"));
        assert!(index.pool_on_node("n2").is_none());
        assert_eq!(index.claim_for_device("d1").map(|c| c.name()), Some(claim.name()));
        // Claims of other owners are not indexed
        assert!(index.claim_for_device("d2").is_none());
        assert_eq!(index.claims().len(), 1);
    }

    #[test]
    fn test_nodes_matching() {
        let pcc = auto_pcc("p", 1, RaidType::Striped);
        let index = DeviceIndex::from_parts(&pcc, vec![], vec![], vec![], vec![node("n1"), node("n2")]);

        let one = BTreeMap::from([(HOSTNAME_LABEL.to_string(), "n2".to_string())]);
        assert_eq!(index.nodes_matching(&one), vec!["n2".to_string()]);

        let none = BTreeMap::from([(HOSTNAME_LABEL.to_string(), "n9".to_string())]);
        assert!(index.nodes_matching(&none).is_empty());

        assert_eq!(index.nodes_matching(&BTreeMap::new()).len(), 2);
    }

    #[tokio::test]
    async fn test_build_from_memory_cluster() {
        let cluster = crate::client::MemoryCluster::new();
        let clients = cluster.client_set();
        let pcc = auto_pcc("p", 2, RaidType::Striped);
        clients.block_devices.create(&sparse("d1", "n1")).await.unwrap();
        clients.nodes.create(&node("n1")).await.unwrap();

        let index = DeviceIndex::build(&clients, &pcc).await.unwrap();
        assert_eq!(index.pcc(), "p");
        assert!(index.device("d1").is_some());
        assert_eq!(index.candidate_nodes().len(), 1);
    }
}
