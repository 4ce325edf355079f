//! In-memory DocumentSource for testing.
//!
//! Collections are kept sorted by `_id`. The change feed is an append-only
//! log: every opened feed yields the entries after its start position and
//! then waits for more, like a tailable cursor. Read failures can be
//! injected to exercise reconnects.

use futures::stream;
use index_replicator::source::{
    compare_ids, BoxFuture, ChangeFeed, DocumentSource, FeedEntry, FeedOp, ScanFilter,
};
use index_replicator::{Document, FeedPosition, ReplicationError, SourceErrorKind, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Shared change-feed log.
#[derive(Default)]
struct FeedLog {
    entries: Mutex<Vec<FeedEntry>>,
    failures: Mutex<VecDeque<SourceErrorKind>>,
    notify: Notify,
}

/// A recorded find() call.
#[derive(Debug, Clone, PartialEq)]
pub struct FindCall {
    pub namespace: String,
    pub filter: ScanFilter,
    pub limit: usize,
}

/// In-memory document store with a scripted change feed.
#[derive(Default)]
pub struct MemorySource {
    collections: Mutex<HashMap<String, Vec<Document>>>,
    feed: Arc<FeedLog>,
    finds: Mutex<Vec<FindCall>>,
    tail_opens: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add documents to `database.collection`, keeping `_id` order.
    pub fn insert_documents(&self, database: &str, collection: &str, docs: Vec<Document>) {
        let mut collections = self.collections.lock().unwrap();
        let coll = collections.entry(format!("{}.{}", database, collection)).or_default();
        coll.extend(docs);
        coll.sort_by(|a, b| compare_ids(id_of(a), id_of(b)));
    }

    /// Append a change-feed entry and wake the open feed.
    pub fn push_entry(&self, entry: FeedEntry) {
        self.feed.entries.lock().unwrap().push(entry);
        self.feed.notify.notify_one();
    }

    /// Make the next read from the open feed fail once.
    pub fn fail_next_read(&self, kind: SourceErrorKind) {
        self.feed.failures.lock().unwrap().push_back(kind);
        self.feed.notify.notify_one();
    }

    pub fn find_calls(&self) -> Vec<FindCall> {
        self.finds.lock().unwrap().clone()
    }

    pub fn tail_opens(&self) -> usize {
        self.tail_opens.load(Ordering::SeqCst)
    }
}

static NO_ID: Value = Value::Null;

fn id_of(doc: &Document) -> &Value {
    doc.get("_id").unwrap_or(&NO_ID)
}

impl DocumentSource for MemorySource {
    fn find<'a>(
        &'a self,
        database: &'a str,
        collection: &'a str,
        filter: ScanFilter,
        limit: usize,
    ) -> BoxFuture<'a, Vec<Document>> {
        let namespace = format!("{}.{}", database, collection);
        let docs: Vec<Document> = self
            .collections
            .lock()
            .unwrap()
            .get(&namespace)
            .map(|coll| {
                coll.iter()
                    .filter(|doc| filter.matches(id_of(doc)))
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        self.finds.lock().unwrap().push(FindCall {
            namespace,
            filter,
            limit,
        });
        Box::pin(async move { Ok(docs) })
    }

    fn latest_document<'a>(
        &'a self,
        database: &'a str,
        collection: &'a str,
    ) -> BoxFuture<'a, Option<Document>> {
        let doc = self
            .collections
            .lock()
            .unwrap()
            .get(&format!("{}.{}", database, collection))
            .and_then(|coll| coll.last().cloned());
        Box::pin(async move { Ok(doc) })
    }

    fn latest_position(&self) -> BoxFuture<'_, Option<FeedPosition>> {
        let position = self.feed.entries.lock().unwrap().last().map(|e| e.position);
        Box::pin(async move { Ok(position) })
    }

    fn tail<'a>(&'a self, _namespace: &'a str, start: FeedPosition) -> BoxFuture<'a, ChangeFeed> {
        self.tail_opens.fetch_add(1, Ordering::SeqCst);
        let log = Arc::clone(&self.feed);

        let feed = stream::unfold((log, start), |(log, after)| async move {
            loop {
                let failure = log.failures.lock().unwrap().pop_front();
                if let Some(kind) = failure {
                    let err = ReplicationError::source("tail", kind, "injected read failure");
                    return Some((Err(err), (log, after)));
                }

                let next = log
                    .entries
                    .lock()
                    .unwrap()
                    .iter()
                    .find(|e| e.position > after)
                    .cloned();
                if let Some(entry) = next {
                    let position = entry.position;
                    return Some((Ok(entry), (log, position)));
                }

                log.notify.notified().await;
            }
        });

        Box::pin(async move { Ok(Box::pin(feed) as ChangeFeed) })
    }
}

// =============================================================================
// Feed entry helpers
// =============================================================================

pub fn insert_entry(namespace: &str, position: FeedPosition, doc: Document) -> FeedEntry {
    FeedEntry {
        namespace: namespace.to_string(),
        op: FeedOp::Insert,
        document: doc,
        target: None,
        position,
    }
}

pub fn update_entry(
    namespace: &str,
    position: FeedPosition,
    target: impl Into<Value>,
    modifier: Document,
) -> FeedEntry {
    FeedEntry {
        namespace: namespace.to_string(),
        op: FeedOp::Update,
        document: modifier,
        target: Some(target.into()),
        position,
    }
}

pub fn delete_entry(namespace: &str, position: FeedPosition, id: impl Into<Value>) -> FeedEntry {
    FeedEntry {
        namespace: namespace.to_string(),
        op: FeedOp::Delete,
        document: Document::new().with("_id", id),
        target: None,
        position,
    }
}

/// A no-op entry, used to make a worker pass a stop check.
pub fn noop_entry(namespace: &str, position: FeedPosition) -> FeedEntry {
    FeedEntry {
        namespace: namespace.to_string(),
        op: FeedOp::parse("n"),
        document: Document::new(),
        target: None,
        position,
    }
}
