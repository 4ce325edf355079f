//! Registry state types.
//!
//! # State Transitions
//!
//! ```text
//!           start()                shutdown()
//! Created ──────────→ Running ──────────────→ ShuttingDown ──→ Stopped
//!    │                                                            ↑
//!    └────────────────────────── shutdown() ──────────────────────┘
//! ```
//!
//! # Live maps
//!
//! One [`LiveNodes`] map per phase holds the last node record the registry
//! fetched for every node with a running worker. The registry is the only
//! writer. Workers read their own entry once per unit of work (a scan page,
//! a change-feed entry) through [`LiveNodes::check_stop()`].

use crate::connector::Connector;
use crate::control::ControlStore;
use crate::error::ReplicationError;
use crate::metrics;
use crate::node::{NodeUpdate, SyncNode, SyncStatus, SyncSwitch};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// State of the node registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Registry created but not started.
    ///
    /// Call [`start()`](super::NodeRegistry::start) to begin polling.
    Created,

    /// Poll loop running.
    Running,

    /// `shutdown()` called, waiting for the poll loop to exit.
    ///
    /// Workers are not cancelled; they finish through their switch.
    ShuttingDown,

    /// Poll loop stopped.
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Replication phase a worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Scan,
    Tail,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Scan => "scan",
            Phase::Tail => "tail",
        }
    }

    /// Whether a node belongs to this phase's live map.
    pub fn is_eligible(&self, node: &SyncNode) -> bool {
        match self {
            Phase::Scan => node.is_scan_eligible(),
            Phase::Tail => node.is_tail_eligible(),
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a worker should do at a unit-of-work boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCheck {
    /// Keep going.
    Continue,
    /// The operator set `Switch = Stoping`; acknowledge with `Stop` and exit.
    StopRequested,
    /// The registry dropped the entry because the node left this phase.
    /// Exit without touching the persisted record.
    Missing,
}

/// How a worker ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// Scan copied everything and handed the node to the tail phase.
    Completed { documents: usize },
    /// Stop request acknowledged.
    Stopped,
    /// Live entry vanished; nothing persisted.
    Detached,
    /// Node parked in its phase's exception status.
    Failed(String),
}

/// Concurrent map of node id to last-fetched record for one phase.
///
/// Clones share the same map.
#[derive(Debug, Clone)]
pub struct LiveNodes {
    phase: Phase,
    nodes: Arc<DashMap<String, SyncNode>>,
}

impl LiveNodes {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            nodes: Arc::new(DashMap::new()),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn get(&self, id: &str) -> Option<SyncNode> {
        self.nodes.get(id).map(|n| n.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Insert or overwrite an entry, returning the previous record.
    pub fn insert(&self, node: SyncNode) -> Option<SyncNode> {
        self.nodes.insert(node.id.clone(), node)
    }

    /// Insert only when absent. Returns true if the entry was added.
    pub fn insert_if_absent(&self, node: &SyncNode) -> bool {
        match self.nodes.entry(node.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(node.clone());
                true
            }
        }
    }

    pub fn remove(&self, id: &str) -> Option<SyncNode> {
        self.nodes.remove(id).map(|(_, node)| node)
    }

    /// Drop every entry whose id fails the predicate, returning the removed ids.
    pub fn retain_ids(&self, mut keep: impl FnMut(&str) -> bool) -> Vec<String> {
        let stale: Vec<String> = self
            .nodes
            .iter()
            .filter(|e| !keep(e.key()))
            .map(|e| e.key().clone())
            .collect();
        for id in &stale {
            self.nodes.remove(id);
        }
        stale
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.nodes.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Read a worker's own entry at a unit-of-work boundary.
    pub fn check_stop(&self, id: &str) -> StopCheck {
        match self.nodes.get(id) {
            Some(node) if node.switch == SyncSwitch::Stoping => StopCheck::StopRequested,
            Some(_) => StopCheck::Continue,
            None => StopCheck::Missing,
        }
    }
}

/// Everything a worker needs besides its phase config.
#[derive(Clone)]
pub struct WorkerContext {
    /// Node record as fetched when the worker was dispatched.
    pub node: SyncNode,
    pub control: Arc<dyn ControlStore>,
    pub connector: Arc<dyn Connector>,
    /// The live map of the worker's phase.
    pub live: LiveNodes,
}

impl WorkerContext {
    pub fn new(
        node: SyncNode,
        control: Arc<dyn ControlStore>,
        connector: Arc<dyn Connector>,
        live: LiveNodes,
    ) -> Self {
        Self {
            node,
            control,
            connector,
            live,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node.id
    }

    pub fn phase(&self) -> Phase {
        self.live.phase()
    }

    /// Persist a partial update of this worker's node.
    pub async fn persist(&self, update: NodeUpdate) -> crate::Result<()> {
        self.control.update_node(&self.node.id, update).await
    }

    /// Acknowledge a stop request with `Switch = Stop`.
    pub async fn acknowledge_stop(&self) -> crate::Result<WorkerExit> {
        self.persist(NodeUpdate::switch(SyncSwitch::Stop)).await?;
        metrics::record_worker_stopped(&self.node.id, self.phase().as_str());
        info!("Stop requested, worker exiting");
        Ok(WorkerExit::Stopped)
    }

    /// Park the node in `status` with `Switch = Stop` after a terminal error.
    pub async fn park(&self, status: SyncStatus, err: &ReplicationError) -> WorkerExit {
        error!(error = %err, status = %status, "Worker failed, parking node");
        metrics::record_worker_failure(&self.node.id, self.phase().as_str(), error_type(err));

        if let Err(e) = self.persist(NodeUpdate::failed(status)).await {
            warn!(error = %e, "Failed to persist exception status");
        }
        WorkerExit::Failed(err.to_string())
    }
}

/// Metric label for an error.
fn error_type(err: &ReplicationError) -> &'static str {
    match err {
        ReplicationError::Source { .. } => "source",
        ReplicationError::Sink { .. } => "sink",
        ReplicationError::Setup { .. } => "setup",
        ReplicationError::BulkRejected { .. } => "bulk_rejected",
        ReplicationError::ControlStore(_) | ReplicationError::NodeNotFound(_) => "control_store",
        ReplicationError::InvalidCheckpoint(_) => "checkpoint",
        ReplicationError::Serialization(_) => "serialization",
        ReplicationError::Config(_)
        | ReplicationError::InvalidState { .. }
        | ReplicationError::Internal(_) => "internal",
    }
}
