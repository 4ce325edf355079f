//! Shared test utilities for integration tests.
//!
//! This module provides:
//! - In-memory source and sink implementations
//! - A connector that counts connection opens
//! - Node and document helpers

#![allow(dead_code)]

pub mod sink;
pub mod source;

pub use sink::*;
pub use source::*;

use index_replicator::connector::Connector;
use index_replicator::control::{ControlStore, MemoryControlStore};
use index_replicator::coordinator::{LiveNodes, Phase, WorkerContext};
use index_replicator::sink::IndexSink;
use index_replicator::source::{BoxFuture, DocumentSource};
use index_replicator::{Document, FeedPosition, NodeUpdate, SyncNode, SyncStatus};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const DATABASE: &str = "shop";
pub const COLLECTION: &str = "users";
pub const NAMESPACE: &str = "shop.users";
pub const INDEX: &str = "users";

/// Connector handing out shared in-memory handles, counting opens.
pub struct TestConnector {
    pub source: Arc<MemorySource>,
    pub sink: Arc<MemorySink>,
    source_opens: AtomicUsize,
}

impl TestConnector {
    pub fn new(source: Arc<MemorySource>, sink: Arc<MemorySink>) -> Self {
        Self {
            source,
            sink,
            source_opens: AtomicUsize::new(0),
        }
    }

    pub fn source_opens(&self) -> usize {
        self.source_opens.load(Ordering::SeqCst)
    }
}

impl Connector for TestConnector {
    fn source<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, Arc<dyn DocumentSource>> {
        self.source_opens.fetch_add(1, Ordering::SeqCst);
        let source: Arc<dyn DocumentSource> = self.source.clone();
        Box::pin(async move { Ok(source) })
    }

    fn sink<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, Arc<dyn IndexSink>> {
        let sink: Arc<dyn IndexSink> = self.sink.clone();
        Box::pin(async move { Ok(sink) })
    }
}

/// Control store recording every partial update, in order.
#[derive(Default)]
pub struct RecordingStore {
    inner: MemoryControlStore,
    updates: Mutex<Vec<(String, NodeUpdate)>>,
}

impl RecordingStore {
    pub fn with_nodes(nodes: impl IntoIterator<Item = SyncNode>) -> Self {
        Self {
            inner: MemoryControlStore::with_nodes(nodes),
            updates: Mutex::new(Vec::new()),
        }
    }

    pub fn snapshot(&self, id: &str) -> Option<SyncNode> {
        self.inner.snapshot(id)
    }

    pub fn updates(&self) -> Vec<NodeUpdate> {
        self.updates.lock().unwrap().iter().map(|(_, u)| u.clone()).collect()
    }

    /// Scan checkpoints in the order they were persisted.
    pub fn scan_checkpoints(&self) -> Vec<String> {
        self.updates().into_iter().filter_map(|u| u.scan_checkpoint).collect()
    }

    /// Tail checkpoints in the order they were persisted.
    pub fn tail_checkpoints(&self) -> Vec<FeedPosition> {
        self.updates().into_iter().filter_map(|u| u.tail_checkpoint).collect()
    }
}

impl ControlStore for RecordingStore {
    fn list_nodes(&self) -> BoxFuture<'_, Vec<SyncNode>> {
        self.inner.list_nodes()
    }

    fn get_node<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Option<SyncNode>> {
        self.inner.get_node(id)
    }

    fn update_node<'a>(&'a self, id: &'a str, update: NodeUpdate) -> BoxFuture<'a, ()> {
        self.updates.lock().unwrap().push((id.to_string(), update.clone()));
        self.inner.update_node(id, update)
    }

    fn insert_node(&self, node: SyncNode) -> BoxFuture<'_, ()> {
        self.inner.insert_node(node)
    }
}

/// Everything one worker test needs.
pub struct Harness {
    pub source: Arc<MemorySource>,
    pub sink: Arc<MemorySink>,
    pub connector: Arc<TestConnector>,
    pub store: Arc<RecordingStore>,
    pub live: LiveNodes,
}

impl Harness {
    /// Seed the control store and the phase's live map with `node`.
    pub fn new(node: &SyncNode, phase: Phase) -> Self {
        let source = Arc::new(MemorySource::new());
        let sink = Arc::new(MemorySink::new());
        let connector = Arc::new(TestConnector::new(source.clone(), sink.clone()));
        let store = Arc::new(RecordingStore::with_nodes([node.clone()]));
        let live = LiveNodes::new(phase);
        live.insert(node.clone());

        Self {
            source,
            sink,
            connector,
            store,
            live,
        }
    }

    pub fn context(&self, node: &SyncNode) -> WorkerContext {
        WorkerContext::new(
            node.clone(),
            self.store.clone(),
            self.connector.clone(),
            self.live.clone(),
        )
    }

    /// Persisted copy of the node.
    pub fn persisted(&self, id: &str) -> SyncNode {
        self.store.snapshot(id).expect("node persisted")
    }

    /// Make the worker see an operator stop request at its next boundary.
    pub fn request_stop(&self, id: &str) {
        if let Some(mut node) = self.live.get(id) {
            node.switch = index_replicator::SyncSwitch::Stoping;
            self.live.insert(node);
        }
    }
}

/// A node replicating `shop.users` into `users`.
pub fn test_node(id: &str) -> SyncNode {
    let mut node = SyncNode::new(id, DATABASE, COLLECTION, INDEX);
    node.source_url = "memory://source".to_string();
    node.sink_url = "memory://sink".to_string();
    node.mapping = r#"{"properties":{}}"#.to_string();
    node
}

/// A node already handed to the tail phase.
pub fn tail_node(id: &str) -> SyncNode {
    let mut node = test_node(id);
    node.status = SyncStatus::WaitForTail;
    node
}

/// Documents with integer ids `range`, each with a `name` field.
pub fn numbered_documents(range: std::ops::RangeInclusive<i64>) -> Vec<Document> {
    range
        .map(|i| Document::new().with("_id", i).with("name", format!("user-{}", i)))
        .collect()
}

/// Poll `cond` every 10ms (virtual time under a paused clock) until it holds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
