//! Shared proptest strategies.

use common::NodeType;
use proptest::prelude::*;
use scheduler::node::NodeSnapshot;

/// A fleet of uniquely named node ids with the given prefix.
pub fn node_ids(prefix: &'static str, max: usize) -> impl Strategy<Value = Vec<String>> {
    (0..=max).prop_map(move |count| (0..count).map(|i| format!("{prefix}{i}")).collect())
}

/// An election ratio across the valid range.
pub fn ratio() -> impl Strategy<Value = f64> {
    0.0..=1.0f64
}

/// An edge node snapshot with bandwidth up to 100 MiB/s and realistic disk.
pub fn edge_snapshot(index: usize) -> impl Strategy<Value = NodeSnapshot> {
    (1u64..=100, 0u64..=(1 << 40)).prop_map(move |(bandwidth_mib, disk)| NodeSnapshot {
        node_id: format!("e{index}"),
        node_type: NodeType::Edge,
        bandwidth_up: bandwidth_mib << 20,
        available_disk_space: disk as f64,
        external_ip: "198.51.100.77".to_string(),
        tcp_port: 4321,
    })
}

/// A fleet of edge snapshots.
pub fn edge_fleet(max: usize) -> impl Strategy<Value = Vec<NodeSnapshot>> {
    (0..=max).prop_flat_map(|count| (0..count).map(edge_snapshot).collect::<Vec<_>>())
}
