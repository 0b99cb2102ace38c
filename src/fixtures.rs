//! Shared test fixtures

use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

use crate::client::{ClientSet, MemoryCluster};
use crate::crd::{BlockDevice, DiskKind, PoolClusterClaim, RaidType, HOSTNAME_LABEL};
use crate::domain::{BlockDeviceBuilder, PoolClusterClaimBuilder};

pub const GIB: u64 = 1 << 30;

pub fn node(name: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(BTreeMap::from([(HOSTNAME_LABEL.to_string(), name.to_string())])),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn device(name: &str, node: &str, kind: DiskKind, capacity: u64) -> BlockDevice {
    BlockDeviceBuilder::new()
        .with_name(name)
        .with_uid(&format!("uid-{}", name))
        .with_node(node)
        .with_kind(kind)
        .with_capacity(capacity)
        .with_dev_link("by-id", &format!("/dev/disk/by-id/{}", name))
        .active(true)
        .build()
        .unwrap()
}

/// Active, unclaimed sparse device of 10 GiB
pub fn sparse(name: &str, node: &str) -> BlockDevice {
    device(name, node, DiskKind::Sparse, 10 * GIB)
}

/// Active, unclaimed disk of `gib` GiB
pub fn disk(name: &str, node: &str, gib: u64) -> BlockDevice {
    device(name, node, DiskKind::Disk, gib * GIB)
}

pub fn auto_pcc(name: &str, max_pools: u32, raid: RaidType) -> PoolClusterClaim {
    PoolClusterClaimBuilder::new()
        .with_name(name)
        .with_uid(&format!("uid-{}", name))
        .with_disk_kind(DiskKind::Sparse)
        .with_auto(max_pools, raid)
        .build()
        .unwrap()
}

/// Manual claim with one pool on `node`
pub fn manual_pcc(name: &str, node: &str, raid: RaidType, groups: &[&[&str]]) -> PoolClusterClaim {
    PoolClusterClaimBuilder::new()
        .with_name(name)
        .with_pool_on_node(node, raid, groups)
        .build()
        .unwrap()
}

/// In-memory cluster seeded with nodes and devices
pub async fn cluster_with(nodes: &[&str], devices: Vec<BlockDevice>) -> (MemoryCluster, ClientSet) {
    let cluster = MemoryCluster::new();
    let clients = cluster.client_set();
    for name in nodes {
        clients.nodes.create(&node(name)).await.unwrap();
    }
    for bd in devices {
        clients.block_devices.create(&bd).await.unwrap();
    }
    (cluster, clients)
}
