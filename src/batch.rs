//! Staging buffer and adaptive flush policy for the tail worker.
//!
//! Change-feed entries are classified into [`StagedOperation`]s and buffered
//! here. After each entry the [`AdaptiveBatcher`] decides whether the buffer
//! is written now or keeps accumulating.
//!
//! # Design
//!
//! ```text
//!                 ┌──────────── single mode ────────────┐
//! entry ──stage──▶│ flush every entry                   │
//!                 │ gap since last flush <= min_gap ──┐ │
//!                 └───────────────────────────────────┼─┘
//!                                                     ▼ arm
//!                 ┌──────────── bulk mode ──────────────┐
//!                 │ size >= max_batch  → flush (stay)   │
//!                 │ oldest >= max_age  → flush, disarm  │
//!                 │ otherwise          → accumulate     │
//!                 └─────────────────────────────────────┘
//! ```
//!
//! Steady low-rate traffic is written per entry; bursts switch into
//! accumulation until the batch fills up or the oldest buffered operation
//! has waited `max_age`.
//!
//! Time is read from `tokio::time::Instant` so tests can drive it with a
//! paused clock.

use crate::bulk::BulkAction;
use crate::config::TailConfig;
use crate::node::FeedPosition;
use std::time::Duration;
use tokio::time::Instant;

/// One buffered write, owned by the tail worker that staged it.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedOperation {
    pub action: BulkAction,
    /// Feed position of the entry that produced the operation.
    pub position: FeedPosition,
    /// Arrival time of that entry.
    pub staged_at: Instant,
}

/// Outcome of a flush evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushDecision {
    /// Keep accumulating.
    Hold,
    /// Write the buffer now.
    Flush,
}

/// Staging buffer plus the single/bulk mode state machine.
#[derive(Debug)]
pub struct AdaptiveBatcher {
    buffer: Vec<StagedOperation>,
    bulk_mode: bool,
    last_flush_at: Instant,
    max_batch: usize,
    min_gap: Duration,
    max_age: Duration,
}

impl AdaptiveBatcher {
    /// Create a batcher in single mode; `now` counts as the last flush.
    pub fn new(config: &TailConfig, now: Instant) -> Self {
        Self {
            buffer: Vec::new(),
            bulk_mode: false,
            last_flush_at: now,
            max_batch: config.max_batch.max(1),
            min_gap: config.min_gap(),
            max_age: config.max_age(),
        }
    }

    /// Buffer one operation.
    pub fn stage(&mut self, action: BulkAction, position: FeedPosition, now: Instant) {
        self.buffer.push(StagedOperation {
            action,
            position,
            staged_at: now,
        });
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn is_bulk_mode(&self) -> bool {
        self.bulk_mode
    }

    /// Buffered operations in staging order.
    pub fn pending(&self) -> &[StagedOperation] {
        &self.buffer
    }

    /// Feed position of the most recently staged operation.
    pub fn last_position(&self) -> Option<FeedPosition> {
        self.buffer.last().map(|op| op.position)
    }

    /// Age of the oldest buffered operation.
    pub fn oldest_age(&self, now: Instant) -> Option<Duration> {
        self.buffer
            .first()
            .map(|op| now.saturating_duration_since(op.staged_at))
    }

    /// Evaluate the flush rule after an entry was processed.
    ///
    /// May arm or disarm bulk mode as a side effect. An empty buffer never
    /// flushes.
    pub fn decide(&mut self, now: Instant) -> FlushDecision {
        if self.buffer.is_empty() {
            return FlushDecision::Hold;
        }

        if self.bulk_mode {
            if self.buffer.len() >= self.max_batch {
                return FlushDecision::Flush;
            }
            if self.oldest_age(now).is_some_and(|age| age >= self.max_age) {
                self.bulk_mode = false;
                return FlushDecision::Flush;
            }
            return FlushDecision::Hold;
        }

        if now.saturating_duration_since(self.last_flush_at) <= self.min_gap {
            self.bulk_mode = true;
        }
        FlushDecision::Flush
    }

    /// Deadline at which an idle bulk-mode buffer must be written.
    pub fn idle_deadline(&self) -> Option<Instant> {
        if !self.bulk_mode {
            return None;
        }
        self.buffer.first().map(|op| op.staged_at + self.max_age)
    }

    /// Evaluate the flush rule while the feed is quiet: a bulk-mode buffer
    /// that reached `max_age` is downgraded and flushed.
    pub fn decide_idle(&mut self, now: Instant) -> FlushDecision {
        if self.bulk_mode && self.oldest_age(now).is_some_and(|age| age >= self.max_age) {
            self.bulk_mode = false;
            return FlushDecision::Flush;
        }
        FlushDecision::Hold
    }

    /// Drain the buffer for writing and record the flush time.
    pub fn take_batch(&mut self, now: Instant) -> Vec<StagedOperation> {
        self.last_flush_at = now;
        std::mem::take(&mut self.buffer)
    }

    /// Drop everything buffered (the feed is being reopened from the last
    /// persisted checkpoint and will redeliver these entries).
    pub fn discard(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer.clear();
        dropped
    }
}
