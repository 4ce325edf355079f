//! Fuzz target for scan checkpoint parsing.
//!
//! Persisted checkpoints are plain text in the control store and may be
//! edited by hand, so parsing must never panic whatever the identity kind.

#![no_main]

use index_replicator::source::{compare_ids, parse_checkpoint};
use index_replicator::{ObjectId, Value};
use libfuzzer_sys::fuzz_target;
use std::cmp::Ordering;

fuzz_target!(|data: &str| {
    let samples = [
        None,
        Some(Value::Int64(1)),
        Some(Value::String("k".to_string())),
        Some(Value::ObjectId(ObjectId::from_bytes([0; 12]))),
    ];

    for sample in &samples {
        if let Ok(bound) = parse_checkpoint(data, sample.as_ref()) {
            // Reflexivity holds for every parsed bound
            assert_eq!(compare_ids(&bound, &bound), Ordering::Equal);
        }
    }
});
