//! Tail worker: continuous replication from the change feed.
//!
//! Each node in the tail phase has a dedicated worker that:
//! 1. Opens the change feed at the node's tail checkpoint
//! 2. Checks its live-map entry before every entry (cooperative stop)
//! 3. Classifies each entry into zero, one or two bulk actions
//! 4. Lets the [`AdaptiveBatcher`] decide between per-entry and batched writes
//! 5. Persists the checkpoint only after the sink accepted the batch
//!
//! # Recoverable errors
//!
//! A change-feed read failing with a timeout or a rejected command reopens
//! the source connection and the feed from the last persisted checkpoint.
//! Anything buffered but not yet written is dropped and redelivered by the
//! reopened feed. Every other error parks the node in `TailException`.

use super::types::{StopCheck, WorkerContext, WorkerExit};
use crate::batch::{AdaptiveBatcher, FlushDecision};
use crate::bulk::{render_lines, BulkAction};
use crate::config::TailConfig;
use crate::connector::reopen_source;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::node::{FeedPosition, NodeUpdate, SyncStatus};
use crate::projection::{self, ProjectionSpec, IDENTITY_FIELD};
use crate::resilience::RetryConfig;
use crate::sink::IndexSink;
use crate::source::{DocumentSource, FeedEntry, FeedOp, ScanFilter};
use futures::StreamExt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

/// Pause before reopening a feed that ended on its own.
const FEED_REOPEN_DELAY: Duration = Duration::from_secs(1);

/// Run the tail worker for a single node until it stops or fails.
///
/// `reconnect` bounds the attempts to reopen the source after a
/// recoverable feed error; exhausting it is terminal.
pub async fn run_tail(ctx: WorkerContext, config: TailConfig, reconnect: RetryConfig) -> WorkerExit {
    let span = info_span!("tail", node_id = %ctx.node_id());

    async move {
        info!(
            namespace = %ctx.node.namespace(),
            index = %ctx.node.index,
            checkpoint = %ctx.node.tail_checkpoint,
            log_replay = ctx.node.log_replay,
            "Starting tail worker"
        );

        let mut tailer = Tailer::new(&ctx, &config);
        match tailer.replicate(&reconnect).await {
            Ok(exit) => exit,
            Err(e) => ctx.park(SyncStatus::TailException, &e).await,
        }
    }
    .instrument(span)
    .await
}

/// Per-worker replication state.
struct Tailer<'a> {
    ctx: &'a WorkerContext,
    config: &'a TailConfig,
    namespace: String,
    spec: ProjectionSpec,
    batcher: AdaptiveBatcher,
    /// Last checkpoint persisted by this worker.
    checkpoint: FeedPosition,
}

impl<'a> Tailer<'a> {
    fn new(ctx: &'a WorkerContext, config: &'a TailConfig) -> Self {
        Self {
            ctx,
            config,
            namespace: ctx.node.namespace(),
            spec: ProjectionSpec::parse(&ctx.node.projection),
            batcher: AdaptiveBatcher::new(config, Instant::now()),
            checkpoint: ctx.node.tail_checkpoint,
        }
    }

    async fn replicate(&mut self, reconnect: &RetryConfig) -> Result<WorkerExit> {
        let ctx = self.ctx;
        let node = &ctx.node;
        let mut source = ctx.connector.source(&node.source_url).await?;
        let sink = ctx.connector.sink(&node.sink_url).await?;

        ctx.persist(NodeUpdate::status(SyncStatus::ProcessTail)).await?;

        loop {
            match self.follow(source.as_ref(), sink.as_ref()).await {
                Ok(Some(exit)) => return Ok(exit),
                Ok(None) => {
                    debug!("Change feed ended, reopening");
                    tokio::time::sleep(FEED_REOPEN_DELAY).await;
                }
                Err(e) if e.is_recoverable() => {
                    warn!(error = %e, checkpoint = %self.checkpoint, "Change feed read failed, reconnecting");
                    metrics::record_reconnect(&node.id);

                    let dropped = self.batcher.discard();
                    if dropped > 0 {
                        debug!(dropped, "Dropped unwritten operations, feed will redeliver");
                    }
                    source = reopen_source(ctx.connector.as_ref(), &node.source_url, reconnect).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Consume one feed until it ends (`Ok(None)`) or the worker exits.
    async fn follow(
        &mut self,
        source: &dyn DocumentSource,
        sink: &dyn IndexSink,
    ) -> Result<Option<WorkerExit>> {
        let mut feed = source.tail(&self.namespace, self.checkpoint).await?;
        debug!(position = %self.checkpoint, "Change feed opened");

        loop {
            let deadline = self.batcher.idle_deadline().filter(|_| self.config.idle_flush);
            let next = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, feed.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        self.flush_idle(sink).await?;
                        continue;
                    }
                },
                None => feed.next().await,
            };

            let Some(entry) = next else {
                return Ok(None);
            };
            let entry = entry?;

            match self.ctx.live.check_stop(&self.ctx.node.id) {
                StopCheck::Continue => {}
                StopCheck::StopRequested => return self.ctx.acknowledge_stop().await.map(Some),
                StopCheck::Missing => {
                    info!("Node left the tail phase, worker exiting");
                    return Ok(Some(WorkerExit::Detached));
                }
            }

            if entry.namespace != self.namespace {
                metrics::record_tail_skipped(&self.ctx.node.id, "namespace");
                continue;
            }
            if !entry.op.is_replicated() {
                metrics::record_tail_skipped(&self.ctx.node.id, "operation");
                continue;
            }

            let now = Instant::now();
            for action in self.classify(source, &entry).await {
                self.batcher.stage(action, entry.position, now);
            }

            if self.batcher.decide(now) == FlushDecision::Flush {
                self.flush(sink, entry.position).await?;
            }
        }
    }

    /// Map one replicated entry to the bulk actions it implies.
    ///
    /// An insert always reaches the sink with its remapped identity, even
    /// when the projection keeps no other field. A linked insert carries no
    /// identity of its own and is dropped when its body projects to nothing.
    async fn classify(&self, source: &dyn DocumentSource, entry: &FeedEntry) -> Vec<BulkAction> {
        let link_field = self.ctx.node.link_field();
        let mut actions = Vec::new();

        match entry.op {
            FeedOp::Insert => {
                let doc = &entry.document;
                match link_field {
                    None => {
                        let Some(id) = doc.get(IDENTITY_FIELD) else {
                            warn!(position = %entry.position, "Insert without identity, skipping");
                            return actions;
                        };
                        actions.push(BulkAction::Insert {
                            id: id.to_id_string(),
                            doc: projection::project_root(doc, &self.spec),
                        });
                    }
                    Some(link) => {
                        let Some(target) = doc.get(link) else {
                            warn!(link_field = %link, position = %entry.position, "Insert without link field, skipping");
                            return actions;
                        };
                        let body = projection::project_linked(doc, &self.spec, link);
                        if body.is_empty() {
                            debug!(position = %entry.position, "Linked insert projects to nothing, skipping");
                        } else {
                            actions.push(BulkAction::Update {
                                id: target.to_id_string(),
                                doc: body,
                            });
                        }
                    }
                }
            }
            FeedOp::Update => {
                let Some(native) = entry.identity() else {
                    warn!(position = %entry.position, "Update without target identity, skipping");
                    return actions;
                };
                let id = match link_field {
                    None => native.to_id_string(),
                    Some(link) => match self.linked_identity(source, native, link).await {
                        Some(id) => id,
                        None => return actions,
                    },
                };

                let removed = projection::removed_field_names(&entry.document);
                if !removed.is_empty() {
                    let fields = projection::resolve_removed_fields(&removed, &self.spec);
                    if !fields.is_empty() {
                        actions.push(BulkAction::DeleteFields {
                            id: id.clone(),
                            fields,
                        });
                    }
                }

                let payload = projection::update_payload(&entry.document);
                let doc = projection::project(&payload, &self.spec);
                if !doc.is_empty() {
                    actions.push(BulkAction::Update { id, doc });
                }
            }
            FeedOp::Delete => {
                // Linked sink documents are derived and outlive their source row.
                if link_field.is_some() {
                    return actions;
                }
                match entry.identity() {
                    Some(id) => actions.push(BulkAction::Delete {
                        id: id.to_id_string(),
                    }),
                    None => warn!(position = %entry.position, "Delete without identity, skipping"),
                }
            }
            FeedOp::Other(_) => {}
        }

        actions
    }

    /// Look up the link-field value of the document an update targets.
    async fn linked_identity(
        &self,
        source: &dyn DocumentSource,
        native: &crate::document::Value,
        link: &str,
    ) -> Option<String> {
        let node = &self.ctx.node;
        let docs = match source
            .find(&node.database, &node.collection, ScanFilter::IdEquals(native.clone()), 1)
            .await
        {
            Ok(docs) => docs,
            Err(e) => {
                warn!(error = %e, id = %native.to_id_string(), "Link lookup failed, skipping update");
                return None;
            }
        };

        let value = docs.first().and_then(|doc| doc.get(link));
        if value.is_none() {
            warn!(link_field = %link, id = %native.to_id_string(), "Linked document or field missing, skipping update");
        }
        value.map(|v| v.to_id_string())
    }

    async fn flush_idle(&mut self, sink: &dyn IndexSink) -> Result<()> {
        if self.batcher.decide_idle(Instant::now()) != FlushDecision::Flush {
            return Ok(());
        }
        match self.batcher.last_position() {
            Some(position) => {
                debug!(pending = self.batcher.len(), "Feed idle, flushing buffered operations");
                self.flush(sink, position).await
            }
            None => Ok(()),
        }
    }

    /// Write the buffer as one bulk call, then persist `position`.
    async fn flush(&mut self, sink: &dyn IndexSink, position: FeedPosition) -> Result<()> {
        let ctx = self.ctx;
        let node = &ctx.node;
        let now = Instant::now();
        let bulk_mode = self.batcher.is_bulk_mode();
        let actions: Vec<BulkAction> = self
            .batcher
            .take_batch(now)
            .into_iter()
            .map(|op| op.action)
            .collect();
        let count = actions.len();

        let lines = render_lines(&actions)?;
        let response = sink.bulk(&node.index, &node.type_name, lines).await?;
        if !response.is_success() {
            return Err(ReplicationError::BulkRejected {
                index: node.index.clone(),
                count,
            });
        }

        ctx.persist(NodeUpdate::tail_checkpoint(position)).await?;
        self.checkpoint = position;

        metrics::record_tail_flush(&node.id, count, bulk_mode, now.elapsed());
        metrics::set_bulk_mode(&node.id, bulk_mode);
        debug!(count, bulk_mode, position = %position, "Flushed operations");
        Ok(())
    }
}
