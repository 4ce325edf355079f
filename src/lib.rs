//! # Index Replicator
//!
//! Replicates document-store collections into a search index: a full initial
//! copy ("scan") followed by continuous, resumable replication from the
//! source's change feed ("tail"), per independently configured sync node.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                            index-replicator                               │
//! │                                                                           │
//! │  ┌──────────────┐  poll   ┌──────────────┐  dispatch  ┌────────────────┐  │
//! │  │ ControlStore │────────►│ NodeRegistry │───────────►│ scan / tail    │  │
//! │  │ (SQLite)     │◄────┐   │ (live maps)  │◄───────────│ worker (1/node)│  │
//! │  └──────────────┘     │   └──────────────┘  Stoping?  └────────────────┘  │
//! │                       │                                 │          │      │
//! │                       │  status, checkpoints            ▼          ▼      │
//! │                       └─────────────────────── DocumentSource  IndexSink  │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Two-Phase Replication
//!
//! 1. **Scan**: pages through the collection by ascending `_id`, one bulk
//!    write per page, checkpointing the last written identity.
//! 2. **Tail**: follows the change feed from the position captured before the
//!    scan, switching between per-entry and batched writes as traffic demands.
//!
//! Delivery is at-least-once: checkpoints are written only after the sink
//! accepted a write, and every bulk action is idempotent on replay.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use index_replicator::{EngineConfig, NodeRegistry, StaticConnector};
//! use std::sync::Arc;
//!
//! # async fn run(source: Arc<dyn index_replicator::DocumentSource>,
//! #              sink: Arc<dyn index_replicator::IndexSink>) -> index_replicator::Result<()> {
//! let connector = Arc::new(StaticConnector::new(source, sink));
//! let mut registry = NodeRegistry::open(EngineConfig::default(), connector).await?;
//! registry.start().await?;
//!
//! // Registry polls until shutdown
//! registry.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod bulk;
pub mod config;
pub mod connector;
pub mod control;
pub mod coordinator;
pub mod document;
pub mod error;
pub mod mapping;
pub mod metrics;
pub mod node;
pub mod projection;
pub mod resilience;
pub mod sink;
pub mod source;

// Re-exports for convenience
pub use batch::{AdaptiveBatcher, FlushDecision, StagedOperation};
pub use bulk::BulkAction;
pub use config::{ControlConfig, EngineConfig, RegistryConfig, ScanConfig, TailConfig};
pub use connector::{Connector, StaticConnector};
pub use control::{ControlStore, MemoryControlStore, SqliteControlStore};
pub use coordinator::{EngineState, LiveNodes, NodeRegistry, Phase, TickSummary, WorkerExit};
pub use document::{Document, ObjectId, Value};
pub use error::{ReplicationError, Result, SourceErrorKind};
pub use node::{FeedPosition, NodeUpdate, SyncNode, SyncStatus, SyncSwitch};
pub use projection::ProjectionSpec;
pub use sink::{BulkResponse, IndexSettings, IndexSink};
pub use source::{BoxFuture, ChangeFeed, DocumentSource, FeedEntry, FeedOp, ScanFilter};
