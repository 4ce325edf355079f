//! Sync node control-plane model.
//!
//! A [`SyncNode`] is one configured replication: a source collection mirrored
//! into a sink index. Its `status` tracks the phase, its `switch` carries
//! operator stop requests:
//!
//! ```text
//!  WaitForScan ──▶ ProcessScan ──▶ WaitForTail ──▶ ProcessTail
//!       │               │                              │
//!       └──────┬────────┘                              ▼
//!              ▼                                 TailException
//!        ScanException
//!
//!  Switch:  Run ──(operator)──▶ Stoping ──(worker ack)──▶ Stop
//! ```

use crate::error::{ReplicationError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Replication phase of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncStatus {
    WaitForScan,
    ProcessScan,
    ScanException,
    WaitForTail,
    ProcessTail,
    TailException,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WaitForScan => "WaitForScan",
            Self::ProcessScan => "ProcessScan",
            Self::ScanException => "ScanException",
            Self::WaitForTail => "WaitForTail",
            Self::ProcessTail => "ProcessTail",
            Self::TailException => "TailException",
        }
    }

    /// True for the two terminal error states.
    pub fn is_exception(&self) -> bool {
        matches!(self, Self::ScanException | Self::TailException)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "WaitForScan" => Ok(Self::WaitForScan),
            "ProcessScan" => Ok(Self::ProcessScan),
            "ScanException" => Ok(Self::ScanException),
            "WaitForTail" => Ok(Self::WaitForTail),
            "ProcessTail" => Ok(Self::ProcessTail),
            "TailException" => Ok(Self::TailException),
            other => Err(ReplicationError::Internal(format!("unknown sync status {:?}", other))),
        }
    }
}

/// Operator run switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncSwitch {
    Run,
    /// Stop requested, not yet acknowledged by the worker.
    Stoping,
    Stop,
}

impl SyncSwitch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "Run",
            Self::Stoping => "Stoping",
            Self::Stop => "Stop",
        }
    }
}

impl fmt::Display for SyncSwitch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncSwitch {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Run" => Ok(Self::Run),
            "Stoping" => Ok(Self::Stoping),
            "Stop" => Ok(Self::Stop),
            other => Err(ReplicationError::Internal(format!("unknown sync switch {:?}", other))),
        }
    }
}

/// Change-feed position: seconds timestamp plus ordinal within that second.
///
/// Ordered by timestamp, then ordinal.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct FeedPosition {
    pub timestamp: u32,
    pub ordinal: u32,
}

impl FeedPosition {
    pub const fn new(timestamp: u32, ordinal: u32) -> Self {
        Self { timestamp, ordinal }
    }
}

impl fmt::Display for FeedPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.timestamp, self.ordinal)
    }
}

/// One replication node as persisted in the control store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncNode {
    pub id: String,
    pub name: String,
    /// Source store connection string.
    pub source_url: String,
    /// Index sink connection string.
    pub sink_url: String,
    pub database: String,
    pub collection: String,
    pub index: String,
    pub type_name: String,
    /// Mapping payload sent to the sink before the scan (JSON text).
    pub mapping: String,
    /// Comma-separated projection paths; empty selects everything.
    #[serde(default)]
    pub projection: String,
    /// Alternate identity field for sink documents.
    #[serde(default)]
    pub link_field: Option<String>,
    #[serde(default)]
    pub log_replay: bool,
    /// Last scanned primary key, as text.
    #[serde(default)]
    pub scan_checkpoint: Option<String>,
    #[serde(default)]
    pub tail_checkpoint: FeedPosition,
    pub status: SyncStatus,
    pub switch: SyncSwitch,
}

impl SyncNode {
    /// A fresh node in `WaitForScan` / `Run`.
    pub fn new(
        id: impl Into<String>,
        database: impl Into<String>,
        collection: impl Into<String>,
        index: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            source_url: String::new(),
            sink_url: String::new(),
            database: database.into(),
            collection: collection.into(),
            index: index.into(),
            type_name: "_doc".to_string(),
            mapping: "{}".to_string(),
            projection: String::new(),
            link_field: None,
            log_replay: false,
            scan_checkpoint: None,
            tail_checkpoint: FeedPosition::default(),
            status: SyncStatus::WaitForScan,
            switch: SyncSwitch::Run,
        }
    }

    /// Change-feed namespace (`database.collection`).
    pub fn namespace(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }

    /// Configured link field, treating blank as absent.
    pub fn link_field(&self) -> Option<&str> {
        self.link_field
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty())
    }

    /// Eligible for a scan worker.
    pub fn is_scan_eligible(&self) -> bool {
        matches!(self.status, SyncStatus::WaitForScan | SyncStatus::ProcessScan)
            && self.switch != SyncSwitch::Stop
    }

    /// Eligible for a tail worker.
    pub fn is_tail_eligible(&self) -> bool {
        matches!(self.status, SyncStatus::WaitForTail | SyncStatus::ProcessTail)
            && self.switch != SyncSwitch::Stop
    }
}

/// Partial update of a node. Only `Some` fields are written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeUpdate {
    pub status: Option<SyncStatus>,
    pub switch: Option<SyncSwitch>,
    pub scan_checkpoint: Option<String>,
    pub tail_checkpoint: Option<FeedPosition>,
}

impl NodeUpdate {
    pub fn status(status: SyncStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn switch(switch: SyncSwitch) -> Self {
        Self {
            switch: Some(switch),
            ..Default::default()
        }
    }

    /// Phase exception with `Switch = Stop`.
    pub fn failed(status: SyncStatus) -> Self {
        Self {
            status: Some(status),
            switch: Some(SyncSwitch::Stop),
            ..Default::default()
        }
    }

    /// Scan page written: `ProcessScan` plus the new checkpoint.
    pub fn scan_progress(checkpoint: impl Into<String>) -> Self {
        Self {
            status: Some(SyncStatus::ProcessScan),
            scan_checkpoint: Some(checkpoint.into()),
            ..Default::default()
        }
    }

    pub fn tail_checkpoint(position: FeedPosition) -> Self {
        Self {
            tail_checkpoint: Some(position),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.switch.is_none()
            && self.scan_checkpoint.is_none()
            && self.tail_checkpoint.is_none()
    }

    /// Apply to an in-memory copy.
    pub fn apply_to(&self, node: &mut SyncNode) {
        if let Some(status) = self.status {
            node.status = status;
        }
        if let Some(switch) = self.switch {
            node.switch = switch;
        }
        if let Some(checkpoint) = &self.scan_checkpoint {
            node.scan_checkpoint = Some(checkpoint.clone());
        }
        if let Some(position) = self.tail_checkpoint {
            node.tail_checkpoint = position;
        }
    }
}
