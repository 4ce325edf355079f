//! Fuzz target for projection spec parsing and application.
//!
//! Arbitrary spec text must parse without panicking, and projecting a
//! fixed document through it must be idempotent.

#![no_main]

use index_replicator::projection::{self, ProjectionSpec};
use index_replicator::{Document, ObjectId, Value};
use libfuzzer_sys::fuzz_target;

fn sample() -> Document {
    Document::new()
        .with("_id", ObjectId::from_bytes([1; 12]))
        .with("a", 1i32)
        .with("b", Document::new().with("c", "x").with("_id", 2i64))
        .with(
            "d",
            vec![Value::Document(Document::new().with("e", true)), Value::from("f")],
        )
}

fuzz_target!(|data: &str| {
    let spec = ProjectionSpec::parse(data);

    let doc = sample();
    let once = projection::project(&doc, &spec);
    let twice = projection::project(&once, &spec);
    assert_eq!(once, twice);

    // Literal matching must never panic either
    let removed: Vec<String> = data.split(',').map(str::to_string).collect();
    let resolved = projection::resolve_removed_fields(&removed, &spec);
    assert!(resolved.len() <= removed.len());
});
