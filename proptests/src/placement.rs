//! Property-based tests for the placement selectors.
//!
//! Invariants checked:
//! - Exclusion: excluded nodes are never chosen
//! - Disk filter: edges without room for the asset are never chosen
//! - Dual constraint: when the eligible fleet can satisfy both the count
//!   and the bandwidth target, the edge selection satisfies both
//! - No padding: the edge selection never keeps a node whose removal would
//!   still satisfy both constraints

#![allow(unused_imports)]
use crate::strategies::*;
use proptest::prelude::*;
use scheduler::assets::placement::{
    bytes_to_mib_ceil, choose_candidate_nodes, choose_edge_nodes,
};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    #[test]
    fn prop_candidate_selection_bounded_and_exclusive(
        fleet in edge_fleet(30),
        need in 0usize..10,
        exclude_count in 0usize..5,
    ) {
        let exclude: Vec<String> = fleet
            .iter()
            .take(exclude_count)
            .map(|n| n.node_id.clone())
            .collect();

        let (chosen, _) = choose_candidate_nodes(&fleet, need, &exclude);

        prop_assert!(chosen.len() <= need);
        for node in &chosen {
            prop_assert!(!exclude.contains(&node.node_id));
        }
    }

    #[test]
    fn prop_edge_selection_respects_filters(
        fleet in edge_fleet(30),
        need in 0i64..10,
        need_bandwidth in 0i64..200,
        asset_size in 0u64..(1 << 40),
    ) {
        let exclude: Vec<String> = fleet
            .iter()
            .skip(1)
            .take(2)
            .map(|n| n.node_id.clone())
            .collect();

        let (chosen, _) =
            choose_edge_nodes(&fleet, need, need_bandwidth, &exclude, asset_size as f64);

        for node in &chosen {
            prop_assert!(!exclude.contains(&node.node_id));
            prop_assert!(node.available_disk_space >= asset_size as f64);
        }
    }

    #[test]
    fn prop_edge_selection_meets_satisfiable_constraints(
        fleet in edge_fleet(30),
        need in 0i64..10,
        need_bandwidth in 0i64..200,
    ) {
        let (chosen, _) = choose_edge_nodes(&fleet, need, need_bandwidth, &[], 0.0);

        let eligible_count = fleet.len() as i64;
        let eligible_bandwidth =
            bytes_to_mib_ceil(fleet.iter().map(|n| n.bandwidth_up).sum());

        if eligible_count >= need && eligible_bandwidth >= need_bandwidth {
            let chosen_bandwidth =
                bytes_to_mib_ceil(chosen.iter().map(|n| n.bandwidth_up).sum());
            prop_assert!(chosen.len() as i64 >= need);
            prop_assert!(chosen_bandwidth >= need_bandwidth);
        }
    }

    #[test]
    fn prop_edge_selection_has_no_padding(
        fleet in edge_fleet(30),
        need in 0i64..10,
        need_bandwidth in 0i64..200,
    ) {
        let (chosen, _) = choose_edge_nodes(&fleet, need, need_bandwidth, &[], 0.0);

        if let Some(last) = chosen.last() {
            let without_last: u64 = chosen
                .iter()
                .take(chosen.len() - 1)
                .map(|n| n.bandwidth_up)
                .sum();
            let still_satisfied = (chosen.len() as i64 - 1) >= need
                && bytes_to_mib_ceil(without_last) >= need_bandwidth;
            prop_assert!(
                !still_satisfied,
                "node {} was selected after both constraints were already met",
                last.node_id
            );
        }
    }
}
