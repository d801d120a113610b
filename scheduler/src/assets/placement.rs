//! Placement engine: stateless selectors over registry snapshots.
//!
//! Both choosers are pure functions over [`NodeSnapshot`] lists so the same
//! inputs always produce the same plan. Candidates are ranked by upload
//! bandwidth headroom; ties break on node id. When a selector cannot fully
//! satisfy its constraints it returns what it found together with a
//! diagnostic string, and the caller decides whether that is a failure.

use common::{DownloadSource, NodeId};
use tracing::debug;

use crate::node::{NodeManager, NodeSnapshot};

const MIB: f64 = (1u64 << 20) as f64;

/// Bytes per second to MiB/s, rounded up.
pub fn bytes_to_mib_ceil(bytes: u64) -> i64 {
    (bytes as f64 / MIB).ceil() as i64
}

/// Pick up to `need` candidate nodes not in `exclude`.
///
/// Returns fewer than `need` when the fleet cannot provide them; the
/// diagnostic describes the population the selector saw.
pub fn choose_candidate_nodes(
    candidates: &[NodeSnapshot],
    need: usize,
    exclude: &[NodeId],
) -> (Vec<NodeSnapshot>, String) {
    let mut eligible: Vec<&NodeSnapshot> = candidates
        .iter()
        .filter(|n| !exclude.contains(&n.node_id))
        .collect();
    sort_by_headroom(&mut eligible);

    let chosen: Vec<NodeSnapshot> = eligible.into_iter().take(need).cloned().collect();
    let diagnostic = format!(
        "candidates: {}, excluded: {}, need: {}, chosen: {}",
        candidates.len(),
        exclude.len(),
        need,
        chosen.len()
    );
    (chosen, diagnostic)
}

/// Pick edge nodes satisfying both the replica-count target and the residual
/// aggregate-bandwidth target.
///
/// Selection walks edges by descending upload bandwidth and stops as soon as
/// both constraints are met, so `need` may be exceeded while bandwidth is
/// still short, and vice versa. Nodes without room for `asset_size` bytes
/// are skipped.
pub fn choose_edge_nodes(
    edges: &[NodeSnapshot],
    need: i64,
    need_bandwidth_mib: i64,
    exclude: &[NodeId],
    asset_size: f64,
) -> (Vec<NodeSnapshot>, String) {
    let mut eligible: Vec<&NodeSnapshot> = edges
        .iter()
        .filter(|n| !exclude.contains(&n.node_id) && n.available_disk_space >= asset_size)
        .collect();
    sort_by_headroom(&mut eligible);

    let mut chosen = Vec::new();
    let mut bandwidth_bytes: u64 = 0;
    for node in eligible {
        if chosen.len() as i64 >= need && bytes_to_mib_ceil(bandwidth_bytes) >= need_bandwidth_mib {
            break;
        }
        bandwidth_bytes += node.bandwidth_up;
        chosen.push(node.clone());
    }

    let diagnostic = format!(
        "edges: {}, excluded: {}, need: {}, need_bandwidth: {} MiB/s, chosen: {}, bandwidth: {} MiB/s",
        edges.len(),
        exclude.len(),
        need,
        need_bandwidth_mib,
        chosen.len(),
        bytes_to_mib_ceil(bandwidth_bytes)
    );
    (chosen, diagnostic)
}

/// Current holders of `cid` that a new destination may pull from.
///
/// Empty when no candidate holds the asset yet, which forces the machine
/// through the seed path first.
pub fn get_download_sources(
    nodes: &NodeManager,
    cid: &str,
    succeeded_candidates: &[NodeId],
) -> Vec<DownloadSource> {
    let mut sources = Vec::with_capacity(succeeded_candidates.len());
    for node_id in succeeded_candidates {
        if let Some(node) = nodes.get_candidate_node(node_id) {
            sources.push(DownloadSource {
                node_id: node_id.clone(),
                address: node.download_address(),
            });
        }
    }
    debug!(cid, sources = sources.len(), "built download sources");
    sources
}

fn sort_by_headroom(nodes: &mut [&NodeSnapshot]) {
    nodes.sort_by(|a, b| {
        b.bandwidth_up
            .cmp(&a.bandwidth_up)
            .then_with(|| a.node_id.cmp(&b.node_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::NodeType;

    fn snapshot(node_id: &str, node_type: NodeType, bandwidth_mib: u64, disk: f64) -> NodeSnapshot {
        NodeSnapshot {
            node_id: node_id.to_string(),
            node_type,
            bandwidth_up: bandwidth_mib << 20,
            available_disk_space: disk,
            external_ip: "198.51.100.1".to_string(),
            tcp_port: 4321,
        }
    }

    fn edge_fleet(count: usize, bandwidth_mib: u64) -> Vec<NodeSnapshot> {
        (0..count)
            .map(|i| snapshot(&format!("e{i}"), NodeType::Edge, bandwidth_mib, 1e12))
            .collect()
    }

    #[test]
    fn test_choose_candidates_prefers_headroom() {
        let candidates = vec![
            snapshot("c1", NodeType::Candidate, 10, 1e12),
            snapshot("c2", NodeType::Candidate, 50, 1e12),
            snapshot("c3", NodeType::Candidate, 30, 1e12),
        ];

        let (chosen, _) = choose_candidate_nodes(&candidates, 2, &[]);
        assert_eq!(chosen.len(), 2);
        assert_eq!(chosen[0].node_id, "c2");
        assert_eq!(chosen[1].node_id, "c3");
    }

    #[test]
    fn test_choose_candidates_respects_exclusion() {
        let candidates = vec![
            snapshot("c1", NodeType::Candidate, 10, 1e12),
            snapshot("c2", NodeType::Candidate, 50, 1e12),
        ];

        let (chosen, diag) = choose_candidate_nodes(&candidates, 2, &["c2".to_string()]);
        assert_eq!(chosen.len(), 1);
        assert_eq!(chosen[0].node_id, "c1");
        assert!(diag.contains("excluded: 1"));
    }

    #[test]
    fn test_choose_candidates_short_fleet_returns_what_it_has() {
        let candidates = vec![snapshot("c1", NodeType::Candidate, 10, 1e12)];
        let (chosen, _) = choose_candidate_nodes(&candidates, 3, &[]);
        assert_eq!(chosen.len(), 1);
    }

    #[test]
    fn test_choose_edges_stops_when_both_constraints_met() {
        // 8 edges of 5 MiB/s; need 2 replicas and 10 MiB/s: two edges do it.
        let edges = edge_fleet(8, 5);
        let (chosen, _) = choose_edge_nodes(&edges, 2, 10, &[], 1024.0);
        assert_eq!(chosen.len(), 2);
    }

    #[test]
    fn test_choose_edges_keeps_going_for_bandwidth() {
        // Count satisfied after 1 node but bandwidth needs 3.
        let edges = edge_fleet(8, 5);
        let (chosen, _) = choose_edge_nodes(&edges, 1, 15, &[], 1024.0);
        assert_eq!(chosen.len(), 3);
    }

    #[test]
    fn test_choose_edges_keeps_going_for_count() {
        // Bandwidth satisfied by the first node but count needs 4.
        let edges = edge_fleet(8, 50);
        let (chosen, _) = choose_edge_nodes(&edges, 4, 10, &[], 1024.0);
        assert_eq!(chosen.len(), 4);
    }

    #[test]
    fn test_choose_edges_filters_by_disk_space() {
        let mut edges = edge_fleet(2, 5);
        edges[0].available_disk_space = 10.0;

        let (chosen, _) = choose_edge_nodes(&edges, 2, 0, &[], 1024.0);
        assert_eq!(chosen.len(), 1);
        assert_eq!(chosen[0].node_id, "e1");
    }

    #[test]
    fn test_choose_edges_exhausts_short_fleet() {
        let edges = edge_fleet(2, 5);
        let (chosen, diag) = choose_edge_nodes(&edges, 5, 100, &[], 1024.0);
        assert_eq!(chosen.len(), 2);
        assert!(diag.contains("chosen: 2"));
    }

    #[test]
    fn test_selection_is_deterministic_for_a_snapshot() {
        let candidates = vec![
            snapshot("c3", NodeType::Candidate, 30, 1e12),
            snapshot("c1", NodeType::Candidate, 30, 1e12),
            snapshot("c2", NodeType::Candidate, 50, 1e12),
        ];

        let (first, _) = choose_candidate_nodes(&candidates, 2, &[]);
        let (second, _) = choose_candidate_nodes(&candidates, 2, &[]);
        let first_ids: Vec<_> = first.iter().map(|n| n.node_id.clone()).collect();
        let second_ids: Vec<_> = second.iter().map(|n| n.node_id.clone()).collect();
        assert_eq!(first_ids, second_ids);
        // Equal bandwidth breaks ties on node id.
        assert_eq!(first_ids, vec!["c2".to_string(), "c1".to_string()]);
    }

    #[test]
    fn test_bytes_to_mib_ceil() {
        assert_eq!(bytes_to_mib_ceil(0), 0);
        assert_eq!(bytes_to_mib_ceil(1), 1);
        assert_eq!(bytes_to_mib_ceil(1 << 20), 1);
        assert_eq!(bytes_to_mib_ceil((1 << 20) + 1), 2);
    }
}
