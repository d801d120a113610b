//! Property-based tests for the validator split.
//!
//! Invariants checked:
//! - Quota: `|validators| = min(ceil(ratio * n), n)`
//! - Disjointness: no candidate is both validator and validatable
//! - Coverage: every candidate lands in exactly one of the two lists
//! - Determinism: the same fleet, ratio, and seed produce the same split

#![allow(unused_imports)]
use crate::strategies::*;
use proptest::prelude::*;
use scheduler::validation::split_validators;
use std::collections::HashSet;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    #[test]
    fn prop_quota_matches_ceil_ratio(
        candidates in node_ids("c", 50),
        ratio in ratio(),
        seed in any::<u64>(),
    ) {
        let n = candidates.len();
        let (validators, validatables) = split_validators(candidates, ratio, seed);

        let expected = ((n as f64 * ratio).ceil() as usize).min(n);
        prop_assert_eq!(validators.len(), expected);
        prop_assert_eq!(validators.len() + validatables.len(), n);
    }

    #[test]
    fn prop_split_is_disjoint_and_covering(
        candidates in node_ids("c", 50),
        ratio in ratio(),
        seed in any::<u64>(),
    ) {
        let (validators, validatables) =
            split_validators(candidates.clone(), ratio, seed);

        let vs: HashSet<&String> = validators.iter().collect();
        let ts: HashSet<&String> = validatables.iter().collect();
        prop_assert!(vs.is_disjoint(&ts));

        let union: HashSet<&String> = vs.union(&ts).copied().collect();
        let all: HashSet<&String> = candidates.iter().collect();
        prop_assert_eq!(union, all);
    }

    #[test]
    fn prop_split_is_deterministic_per_seed(
        candidates in node_ids("c", 50),
        ratio in ratio(),
        seed in any::<u64>(),
    ) {
        let first = split_validators(candidates.clone(), ratio, seed);
        let second = split_validators(candidates, ratio, seed);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn prop_zero_ratio_elects_nobody(
        candidates in node_ids("c", 50),
        seed in any::<u64>(),
    ) {
        let n = candidates.len();
        let (validators, validatables) = split_validators(candidates, 0.0, seed);
        prop_assert!(validators.is_empty());
        prop_assert_eq!(validatables.len(), n);
    }

    #[test]
    fn prop_full_ratio_elects_everybody(
        candidates in node_ids("c", 50),
        seed in any::<u64>(),
    ) {
        let n = candidates.len();
        let (validators, validatables) = split_validators(candidates, 1.0, seed);
        prop_assert_eq!(validators.len(), n);
        prop_assert!(validatables.is_empty());
    }
}
