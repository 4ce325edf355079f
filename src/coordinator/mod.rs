// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Node registry and workers.
//!
//! The registry is the orchestrator that ties together:
//! - Node records in the [`ControlStore`]
//! - One scan worker per node in the scan phase ([`scan::run_scan`])
//! - One tail worker per node in the tail phase ([`tail::run_tail`])
//! - The per-phase [`LiveNodes`] maps workers read their stop signal from
//!
//! # Architecture
//!
//! Every poll interval the registry:
//! 1. Fetches all node records
//! 2. Dispatches a worker for every eligible node missing from its phase map
//! 3. Overwrites cached records that changed (how workers observe `Stoping`)
//! 4. Drops entries whose node is no longer eligible
//!
//! Workers are fire-and-forget. The registry never cancels or awaits them;
//! their outcome is only visible through the persisted status and switch.

mod types;
pub mod scan;
pub mod tail;

pub use types::{EngineState, LiveNodes, Phase, StopCheck, WorkerContext, WorkerExit};

use crate::config::{EngineConfig, ScanConfig, TailConfig};
use crate::connector::Connector;
use crate::control::ControlStore;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::node::SyncNode;
use crate::resilience::RetryConfig;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

/// Outcome of one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Node records fetched.
    pub nodes: usize,
    /// Nodes handed to a new scan worker.
    pub scan_dispatched: Vec<String>,
    /// Nodes handed to a new tail worker.
    pub tail_dispatched: Vec<String>,
    /// Cached records overwritten with a changed record.
    pub refreshed: usize,
    /// Entries dropped because their node left the phase.
    pub removed: usize,
}

/// Poll-cycle logic, shared between the registry and its poll task.
#[derive(Clone)]
struct Dispatcher {
    scan: ScanConfig,
    tail: TailConfig,
    reconnect: RetryConfig,
    control: Arc<dyn ControlStore>,
    connector: Arc<dyn Connector>,
    scan_nodes: LiveNodes,
    tail_nodes: LiveNodes,
}

impl Dispatcher {
    async fn tick(&self) -> Result<TickSummary> {
        let started = Instant::now();
        let nodes = match self.control.list_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                metrics::record_registry_poll_failure();
                return Err(e);
            }
        };

        let mut summary = TickSummary {
            nodes: nodes.len(),
            ..Default::default()
        };

        for live in [&self.scan_nodes, &self.tail_nodes] {
            let phase = live.phase();
            let eligible: Vec<&SyncNode> = nodes.iter().filter(|n| phase.is_eligible(n)).collect();

            for node in &eligible {
                match live.get(&node.id) {
                    None => {
                        // Entry goes in before the worker exists, so it never sees Missing.
                        live.insert((*node).clone());
                        self.dispatch(live, (*node).clone());
                        match phase {
                            Phase::Scan => summary.scan_dispatched.push(node.id.clone()),
                            Phase::Tail => summary.tail_dispatched.push(node.id.clone()),
                        }
                    }
                    Some(cached) if cached != **node => {
                        debug!(node_id = %node.id, phase = %phase, "Refreshing live entry");
                        live.insert((*node).clone());
                        summary.refreshed += 1;
                    }
                    Some(_) => {}
                }
            }

            let removed = live.retain_ids(|id| eligible.iter().any(|n| n.id == id));
            for id in &removed {
                debug!(node_id = %id, phase = %phase, "Node left phase, dropping live entry");
            }
            summary.removed += removed.len();
            metrics::set_live_nodes(phase.as_str(), live.len());
        }

        metrics::record_registry_poll(summary.nodes, started.elapsed());
        Ok(summary)
    }

    fn dispatch(&self, live: &LiveNodes, node: SyncNode) {
        let phase = live.phase();
        let node_id = node.id.clone();
        let ctx = WorkerContext::new(
            node,
            Arc::clone(&self.control),
            Arc::clone(&self.connector),
            live.clone(),
        );

        metrics::record_node_dispatched(phase.as_str());
        info!(node_id = %node_id, phase = %phase, "Dispatching worker");

        match phase {
            Phase::Scan => {
                let config = self.scan.clone();
                tokio::spawn(async move {
                    let exit = scan::run_scan(ctx, config).await;
                    debug!(node_id = %node_id, exit = ?exit, "Scan worker exited");
                });
            }
            Phase::Tail => {
                let config = self.tail.clone();
                let reconnect = self.reconnect.clone();
                tokio::spawn(async move {
                    let exit = tail::run_tail(ctx, config, reconnect).await;
                    debug!(node_id = %node_id, exit = ?exit, "Tail worker exited");
                });
            }
        }
    }
}

/// The node registry.
///
/// Polls the control store and keeps exactly one worker per (node, phase)
/// running while the node is eligible for that phase.
pub struct NodeRegistry {
    config: EngineConfig,

    dispatcher: Dispatcher,

    /// Registry state (broadcast to watchers)
    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    /// Poll loop task handle
    poll_handle: RwLock<Option<JoinHandle<()>>>,
}

impl NodeRegistry {
    /// Create a registry over an existing control store.
    ///
    /// The registry starts in `Created` state. Call [`start()`](Self::start)
    /// to begin polling.
    pub fn new(
        config: EngineConfig,
        control: Arc<dyn ControlStore>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let dispatcher = Dispatcher {
            scan: config.scan.clone(),
            tail: config.tail.clone(),
            reconnect: RetryConfig::reconnect(),
            control,
            connector,
            scan_nodes: LiveNodes::new(Phase::Scan),
            tail_nodes: LiveNodes::new(Phase::Tail),
        };

        Self {
            config,
            dispatcher,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            poll_handle: RwLock::new(None),
        }
    }

    /// Create a registry over the SQLite control store named in `config`.
    pub async fn open(config: EngineConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        let store = config.control.open().await?;
        info!(path = %store.path(), "Control store opened");
        Ok(Self::new(config, Arc::new(store), connector))
    }

    /// Override the backoff tail workers use to reopen their source.
    pub fn with_reconnect(mut self, reconnect: RetryConfig) -> Self {
        self.dispatcher.reconnect = reconnect;
        self
    }

    /// Get current registry state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    /// Live map of the scan phase.
    pub fn scan_nodes(&self) -> &LiveNodes {
        &self.dispatcher.scan_nodes
    }

    /// Live map of the tail phase.
    pub fn tail_nodes(&self) -> &LiveNodes {
        &self.dispatcher.tail_nodes
    }

    pub fn control(&self) -> &Arc<dyn ControlStore> {
        &self.dispatcher.control
    }

    /// Run one poll cycle now.
    pub async fn tick(&self) -> Result<TickSummary> {
        self.dispatcher.tick().await
    }

    /// Start the poll loop.
    ///
    /// The first poll happens immediately, then every `registry.poll_interval`.
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(ReplicationError::InvalidState {
                expected: "Created".to_string(),
                actual: format!("{:?}", self.state()),
            });
        }

        let interval = self.config.registry.poll_interval_duration();
        info!(poll_interval_ms = interval.as_millis() as u64, "Starting node registry");

        let dispatcher = self.dispatcher.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(
            async move {
                // Mark initial shutdown value as seen so changed() only fires on actual changes
                let _ = shutdown_rx.borrow_and_update();

                let mut timer = tokio::time::interval(interval);
                timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        _ = timer.tick() => {
                            match dispatcher.tick().await {
                                Ok(summary) => {
                                    if !summary.scan_dispatched.is_empty() || !summary.tail_dispatched.is_empty() {
                                        info!(
                                            scan = summary.scan_dispatched.len(),
                                            tail = summary.tail_dispatched.len(),
                                            "Dispatched workers"
                                        );
                                    }
                                }
                                Err(e) => {
                                    warn!(error = %e, "Registry poll failed");
                                }
                            }
                        }
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                debug!("Registry poll loop stopping");
                                break;
                            }
                        }
                    }
                }
            }
            .instrument(info_span!("registry")),
        );

        *self.poll_handle.write().await = Some(handle);

        let _ = self.state_tx.send(EngineState::Running);
        metrics::set_engine_state("Running");
        info!("Node registry running");
        Ok(())
    }

    /// Stop the poll loop.
    ///
    /// Running workers are left alone; they stop through their switch.
    pub async fn shutdown(&mut self) {
        info!("Shutting down node registry");
        let _ = self.state_tx.send(EngineState::ShuttingDown);
        metrics::set_engine_state("ShuttingDown");

        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.poll_handle.write().await.take() {
            match tokio::time::timeout(Duration::from_secs(10), handle).await {
                Ok(Ok(())) => debug!("Poll loop completed"),
                Ok(Err(e)) => warn!(error = %e, "Poll loop panicked during shutdown"),
                Err(_) => warn!("Poll loop timed out during shutdown"),
            }
        }

        let _ = self.state_tx.send(EngineState::Stopped);
        metrics::set_engine_state("Stopped");
        info!("Node registry stopped");
    }
}
