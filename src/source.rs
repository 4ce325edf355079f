// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Source store contract.
//!
//! Workers need two capabilities from the source document store:
//!
//! - **Paginated read**: documents of one collection in ascending `_id`
//!   order, optionally filtered to identities greater than (or equal to) a
//!   value. The scan worker pages through a collection with it; the tail
//!   worker uses it to look up link-field values.
//! - **Change feed**: a resumable stream of row-level mutations addressed by
//!   a [`FeedPosition`]. The tail worker consumes it one entry at a time.
//!
//! Implementations own their connection; the [`Connector`](crate::connector::Connector)
//! opens one per worker.
//!
//! # Checkpoints
//!
//! The scan checkpoint is persisted as text (`Value::to_id_string()`).
//! [`parse_checkpoint()`] turns it back into an identity using a sample
//! document's `_id` to learn the collection's identity kind.

use crate::document::{Document, ObjectId, Value};
use crate::error::Result;
use crate::node::FeedPosition;
use futures::Stream;
use std::cmp::Ordering;
use std::future::Future;
use std::pin::Pin;

/// Type alias for boxed async futures (keeps the contracts object-safe).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// A live change-feed cursor.
pub type ChangeFeed = Pin<Box<dyn Stream<Item = Result<FeedEntry>> + Send>>;

/// Change-feed operation kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedOp {
    Insert,
    Update,
    Delete,
    /// Commands, no-ops and anything else the feed carries.
    Other(String),
}

impl FeedOp {
    /// Parse the feed's short or long operation code.
    pub fn parse(s: &str) -> Self {
        match s {
            "i" | "insert" => FeedOp::Insert,
            "u" | "update" => FeedOp::Update,
            "d" | "delete" => FeedOp::Delete,
            other => FeedOp::Other(other.to_string()),
        }
    }

    /// True for the three operations the tail worker replicates.
    pub fn is_replicated(&self) -> bool {
        !matches!(self, FeedOp::Other(_))
    }
}

/// One change-feed entry.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedEntry {
    /// `database.collection` the entry applies to.
    pub namespace: String,
    pub op: FeedOp,
    /// Inserted document, update modifier, or deleted document's key.
    pub document: Document,
    /// Identity of the updated document (updates only).
    pub target: Option<Value>,
    pub position: FeedPosition,
}

impl FeedEntry {
    /// Native identity affected by the entry.
    ///
    /// Updates carry it separately from their modifier; inserts and deletes
    /// carry it in the document.
    pub fn identity(&self) -> Option<&Value> {
        match self.op {
            FeedOp::Update => self.target.as_ref(),
            _ => self.document.get(crate::projection::IDENTITY_FIELD),
        }
    }
}

/// Filter applied to a paginated read.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanFilter {
    All,
    IdGreaterThan(Value),
    IdEquals(Value),
}

impl ScanFilter {
    /// Check an identity against the filter.
    pub fn matches(&self, id: &Value) -> bool {
        match self {
            ScanFilter::All => true,
            ScanFilter::IdGreaterThan(bound) => compare_ids(id, bound) == Ordering::Greater,
            ScanFilter::IdEquals(target) => compare_ids(id, target) == Ordering::Equal,
        }
    }
}

/// Source store capabilities required by the workers.
pub trait DocumentSource: Send + Sync + 'static {
    /// Read up to `limit` documents ordered by `_id` ascending.
    fn find<'a>(
        &'a self,
        database: &'a str,
        collection: &'a str,
        filter: ScanFilter,
        limit: usize,
    ) -> BoxFuture<'a, Vec<Document>>;

    /// Document with the highest `_id`, if any.
    fn latest_document<'a>(
        &'a self,
        database: &'a str,
        collection: &'a str,
    ) -> BoxFuture<'a, Option<Document>>;

    /// Position of the newest change-feed entry, `None` on an empty feed.
    fn latest_position(&self) -> BoxFuture<'_, Option<FeedPosition>>;

    /// Open a change feed yielding entries strictly after `start`.
    fn tail<'a>(&'a self, namespace: &'a str, start: FeedPosition) -> BoxFuture<'a, ChangeFeed>;
}

/// Total order over identity values.
///
/// Numbers compare numerically across widths; other kinds compare within
/// their kind, and different kinds order by a fixed rank.
pub fn compare_ids(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Int32(_) | Value::Int64(_) | Value::Double(_) => 1,
            Value::String(_) => 2,
            Value::Document(_) => 3,
            Value::Array(_) => 4,
            Value::ObjectId(_) => 5,
            Value::Bool(_) => 6,
            Value::DateTime(_) => 7,
        }
    }

    fn as_f64(v: &Value) -> Option<f64> {
        match v {
            Value::Int32(n) => Some(f64::from(*n)),
            Value::Int64(n) => Some(*n as f64),
            Value::Double(n) => Some(*n),
            _ => None,
        }
    }

    match (a, b) {
        (Value::Int32(x), Value::Int32(y)) => x.cmp(y),
        (Value::Int64(x), Value::Int64(y)) => x.cmp(y),
        (Value::Int32(x), Value::Int64(y)) => i64::from(*x).cmp(y),
        (Value::Int64(x), Value::Int32(y)) => x.cmp(&i64::from(*y)),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::ObjectId(x), Value::ObjectId(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::DateTime(x), Value::DateTime(y)) => x.cmp(y),
        _ => match (as_f64(a), as_f64(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => rank(a).cmp(&rank(b)).then_with(|| a.to_id_string().cmp(&b.to_id_string())),
        },
    }
}

/// Turn a persisted scan checkpoint back into an identity value.
///
/// `sample` is any document identity from the collection. An object-id
/// sample reads the checkpoint as hex (malformed text is an error); a string
/// sample keeps it verbatim. Otherwise the text is read as an integer, then a
/// float, then falls back to a string.
pub fn parse_checkpoint(checkpoint: &str, sample: Option<&Value>) -> Result<Value> {
    match sample {
        Some(Value::ObjectId(_)) => return Ok(Value::ObjectId(ObjectId::parse_str(checkpoint)?)),
        Some(Value::String(_)) => return Ok(Value::String(checkpoint.to_string())),
        _ => {}
    }

    let text = checkpoint.trim();
    if let Ok(n) = text.parse::<i64>() {
        return Ok(Value::Int64(n));
    }
    if let Ok(f) = text.parse::<f64>() {
        if f.is_finite() {
            return Ok(Value::Double(f));
        }
    }
    Ok(Value::String(checkpoint.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReplicationError;

    #[test]
    fn test_feed_op_parse() {
        assert_eq!(FeedOp::parse("i"), FeedOp::Insert);
        assert_eq!(FeedOp::parse("update"), FeedOp::Update);
        assert_eq!(FeedOp::parse("d"), FeedOp::Delete);
        assert_eq!(FeedOp::parse("n"), FeedOp::Other("n".to_string()));
        assert!(!FeedOp::parse("c").is_replicated());
        assert!(FeedOp::Insert.is_replicated());
    }

    #[test]
    fn test_entry_identity() {
        let insert = FeedEntry {
            namespace: "db.c".to_string(),
            op: FeedOp::Insert,
            document: Document::new().with("_id", 5),
            target: None,
            position: FeedPosition::new(1, 1),
        };
        assert_eq!(insert.identity(), Some(&Value::Int32(5)));

        let update = FeedEntry {
            op: FeedOp::Update,
            document: Document::new().with("$set", Document::new().with("a", 1)),
            target: Some(Value::Int32(7)),
            ..insert
        };
        assert_eq!(update.identity(), Some(&Value::Int32(7)));
    }

    #[test]
    fn test_compare_ids_numeric_across_widths() {
        assert_eq!(compare_ids(&Value::Int32(5), &Value::Int64(5)), Ordering::Equal);
        assert_eq!(compare_ids(&Value::Int64(1000), &Value::Int32(999)), Ordering::Greater);
        assert_eq!(compare_ids(&Value::Double(2.5), &Value::Int64(2)), Ordering::Greater);
    }

    #[test]
    fn test_compare_ids_object_ids() {
        let a = ObjectId::from_bytes([1; 12]);
        let b = ObjectId::from_bytes([2; 12]);
        assert_eq!(compare_ids(&Value::ObjectId(a), &Value::ObjectId(b)), Ordering::Less);
    }

    #[test]
    fn test_compare_ids_cross_kind_rank() {
        assert_eq!(compare_ids(&Value::Int64(99), &Value::from("a")), Ordering::Less);
        let oid = Value::ObjectId(ObjectId::from_bytes([0; 12]));
        assert_eq!(compare_ids(&Value::from("zzz"), &oid), Ordering::Less);
    }

    #[test]
    fn test_scan_filter_matches() {
        let gt = ScanFilter::IdGreaterThan(Value::Int64(1000));
        assert!(gt.matches(&Value::Int32(1001)));
        assert!(!gt.matches(&Value::Int32(1000)));
        assert!(ScanFilter::IdEquals(Value::Int64(3)).matches(&Value::Int32(3)));
        assert!(ScanFilter::All.matches(&Value::Null));
    }

    #[test]
    fn test_parse_checkpoint_object_id() {
        let sample = Value::ObjectId(ObjectId::from_bytes([0; 12]));
        let parsed = parse_checkpoint("5f1d7a3e9b1e8a0012345678", Some(&sample)).unwrap();
        assert_eq!(
            parsed,
            Value::ObjectId(ObjectId::parse_str("5f1d7a3e9b1e8a0012345678").unwrap())
        );
    }

    #[test]
    fn test_parse_checkpoint_bad_object_id() {
        let sample = Value::ObjectId(ObjectId::from_bytes([0; 12]));
        let err = parse_checkpoint("2500", Some(&sample)).unwrap_err();
        assert!(matches!(err, ReplicationError::InvalidCheckpoint(_)));
    }

    #[test]
    fn test_parse_checkpoint_numeric() {
        assert_eq!(parse_checkpoint("2500", Some(&Value::Int32(1))).unwrap(), Value::Int64(2500));
        assert_eq!(parse_checkpoint("2.5", None).unwrap(), Value::Double(2.5));
        assert_eq!(parse_checkpoint("abc", None).unwrap(), Value::from("abc"));
    }

    #[test]
    fn test_parse_checkpoint_string_sample_stays_text() {
        assert_eq!(
            parse_checkpoint("123", Some(&Value::from("100"))).unwrap(),
            Value::from("123")
        );
    }
}
