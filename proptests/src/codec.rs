//! Property-based tests for the wire codecs.

#![allow(unused_imports)]
use common::{NodeWorkloadReport, ValidationResult, Workload};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_report_envelope_round_trips(
        cipher_text in prop::collection::vec(any::<u8>(), 0..4096),
        sign in prop::collection::vec(any::<u8>(), 0..512),
    ) {
        let report = NodeWorkloadReport { cipher_text, sign };
        let bytes = report.to_bytes().expect("encode");
        let decoded = NodeWorkloadReport::from_bytes(&bytes).expect("decode");

        prop_assert_eq!(decoded.cipher_text, report.cipher_text);
        prop_assert_eq!(decoded.sign, report.sign);
    }

    #[test]
    fn prop_validation_result_round_trips(
        validator in "[a-z0-9]{1,16}",
        node_id in "[a-z0-9]{1,16}",
        cid in "[a-zA-Z0-9]{1,46}",
        bandwidth in any::<i64>(),
        cost_time_ms in any::<i64>(),
        validated_at in any::<u64>(),
    ) {
        let result = ValidationResult {
            validator,
            node_id,
            cid,
            bandwidth,
            cost_time_ms,
            validated_at,
        };
        let bytes = result.to_bytes().expect("encode");
        let decoded = ValidationResult::from_bytes(&bytes).expect("decode");

        prop_assert_eq!(decoded.node_id, result.node_id);
        prop_assert_eq!(decoded.bandwidth, result.bandwidth);
        prop_assert_eq!(decoded.validated_at, result.validated_at);
    }

    #[test]
    fn prop_workload_list_round_trips(
        entries in prop::collection::vec(
            ("[a-f0-9]{32}", any::<i64>(), any::<u64>(), any::<u64>()),
            0..32,
        ),
    ) {
        let workloads: Vec<Workload> = entries
            .into_iter()
            .map(|(token_id, download_size, start_time, end_time)| Workload {
                token_id,
                download_size,
                start_time,
                end_time,
            })
            .collect();

        let bytes = bincode::serialize(&workloads).expect("encode");
        let decoded: Vec<Workload> = bincode::deserialize(&bytes).expect("decode");

        prop_assert_eq!(decoded.len(), workloads.len());
        for (a, b) in decoded.iter().zip(workloads.iter()) {
            prop_assert_eq!(&a.token_id, &b.token_id);
            prop_assert_eq!(a.download_size, b.download_size);
        }
    }
}
