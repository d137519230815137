//! Property tests for the aggregate transform

use std::collections::BTreeMap;

use flowline_common::types::DataRecord;
use flowline_engine::transform::aggregate::{aggregate_records, AggregateFunction, Aggregation};
use proptest::prelude::*;
use serde_json::json;

fn sum_of(field: &str) -> Aggregation {
    Aggregation {
        output: "total".into(),
        function: AggregateFunction::Sum,
        field: Some(field.into()),
    }
}

fn count() -> Aggregation {
    Aggregation {
        output: "n".into(),
        function: AggregateFunction::Count,
        field: None,
    }
}

proptest! {
    #[test]
    fn integer_sums_are_exact_per_group(
        rows in prop::collection::vec((0u8..4, -1_000_000_000i64..1_000_000_000), 0..64)
    ) {
        let records: Vec<DataRecord> = rows
            .iter()
            .map(|(group, amount)| {
                DataRecord::from_json("orders", json!({"group": group, "amount": amount}))
            })
            .collect();

        let mut expected: BTreeMap<String, (i64, u64)> = BTreeMap::new();
        for (group, amount) in &rows {
            let entry = expected.entry(group.to_string()).or_default();
            entry.0 += amount;
            entry.1 += 1;
        }

        let group_by = ["group".to_string()];
        let output = aggregate_records(&records, &group_by, &[sum_of("amount"), count()]);
        prop_assert_eq!(output.len(), expected.len());
        for record in &output {
            let group = record.get("group").and_then(|g| g.as_u64()).unwrap().to_string();
            let (total, n) = expected[&group];
            prop_assert_eq!(record.get("total"), Some(&json!(total)));
            prop_assert_eq!(record.get("n"), Some(&json!(n)));
        }
    }

    #[test]
    fn groups_keep_first_seen_order(groups in prop::collection::vec(0u8..6, 1..40)) {
        let records: Vec<DataRecord> = groups
            .iter()
            .map(|g| DataRecord::from_json("s", json!({"g": g})))
            .collect();

        let mut seen = Vec::new();
        for g in &groups {
            if !seen.contains(g) {
                seen.push(*g);
            }
        }

        let output = aggregate_records(&records, &["g".to_string()], &[count()]);
        let order: Vec<u8> = output
            .iter()
            .map(|r| r.get("g").and_then(|g| g.as_u64()).unwrap() as u8)
            .collect();
        prop_assert_eq!(order, seen);
    }
}

#[test]
fn test_fractional_sum_falls_back_to_float() {
    let records = vec![
        DataRecord::from_json("s", json!({"amount": 1})),
        DataRecord::from_json("s", json!({"amount": 0.5})),
    ];
    let output = aggregate_records(&records, &[], &[sum_of("amount")]);
    assert_eq!(output.len(), 1);
    assert_eq!(output[0].get("total").and_then(|v| v.as_f64()), Some(1.5));
}
