// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replicator.
//!
//! Errors are categorized by the collaborator they came from (source store,
//! index sink, control store) and carry enough context to be logged once at
//! the worker boundary.
//!
//! # Error Categories
//!
//! | Error Type | Recoverable | Description |
//! |------------|-------------|-------------|
//! | `Source` (Timeout / CommandRejected) | Yes | Change-feed read hiccup, reopen and resume |
//! | `Source` (other kinds) | No | Source unreachable or query failed |
//! | `Sink` | No | Index engine call failed |
//! | `Setup` | No | Index or mapping creation failed, nothing copied |
//! | `BulkRejected` | No | Bulk write reported failure, checkpoint cannot advance |
//! | `ControlStore` | No | Local SQLite errors (needs operator attention) |
//! | `NodeNotFound` | No | Partial update addressed an unknown node |
//! | `InvalidCheckpoint` | No | Persisted scan checkpoint cannot be read back |
//! | `Config` | No | Configuration invalid |
//! | `Serialization` | No | Bulk payload could not be rendered |
//! | `InvalidState` | No | Engine state machine violation |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Recovery Behavior
//!
//! Only the tail worker consults [`ReplicationError::is_recoverable()`]: a
//! recoverable read error reopens the source connection and resumes from the
//! last persisted checkpoint. Every other error parks the node in its phase's
//! exception status with `Switch = Stop`.

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Classification of a source-store failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceErrorKind {
    /// The server gave up on a long-running cursor read.
    Timeout,
    /// The server rejected the command (e.g. cursor killed, stale position).
    CommandRejected,
    /// Connection could not be established or dropped.
    Connection,
    /// Anything else.
    Other,
}

impl std::fmt::Display for SourceErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::CommandRejected => write!(f, "command rejected"),
            Self::Connection => write!(f, "connection"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Source store read failed.
    #[error("Source error ({operation}, {kind}): {message}")]
    Source {
        operation: String,
        kind: SourceErrorKind,
        message: String,
    },

    /// Index sink call failed.
    #[error("Sink error ({operation}): {message}")]
    Sink { operation: String, message: String },

    /// Index or mapping creation failed before any data moved.
    #[error("Index setup failed for {index}: {message}")]
    Setup { index: String, message: String },

    /// The sink reported a failed bulk write.
    #[error("Bulk write to {index} rejected ({count} operations)")]
    BulkRejected { index: String, count: usize },

    /// SQLite error in the control store.
    #[error("Control store error: {0}")]
    ControlStore(#[from] sqlx::Error),

    /// A partial update addressed a node the control store does not know.
    #[error("Sync node not found: {0}")]
    NodeNotFound(String),

    /// Persisted scan checkpoint could not be converted back to an identity.
    #[error("Invalid scan checkpoint: {0}")]
    InvalidCheckpoint(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Bulk payload rendering failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Engine state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a source error.
    pub fn source(
        operation: impl Into<String>,
        kind: SourceErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self::Source {
            operation: operation.into(),
            kind,
            message: message.into(),
        }
    }

    /// Create a sink error.
    pub fn sink(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Sink {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a setup error for an index.
    pub fn setup(index: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Setup {
            index: index.into(),
            message: message.into(),
        }
    }

    /// Check if the tail worker may reopen its connection and carry on.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Source { kind, .. } => {
                matches!(kind, SourceErrorKind::Timeout | SourceErrorKind::CommandRejected)
            }
            Self::Sink { .. } => false,
            Self::Setup { .. } => false,
            Self::BulkRejected { .. } => false, // Checkpoint state unknown
            Self::ControlStore(_) => false,
            Self::NodeNotFound(_) => false,
            Self::InvalidCheckpoint(_) => false,
            Self::Config(_) => false,
            Self::Serialization(_) => false,
            Self::InvalidState { .. } => false,
            Self::Internal(_) => false,
        }
    }
}
