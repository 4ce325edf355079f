// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Scan worker: full initial copy of one collection into its index.
//!
//! # Algorithm
//!
//! 1. Ensure the target index exists and upsert its mapping
//! 2. Relax refresh/replicas when starting a fresh copy
//! 3. Capture the change-feed head as the tail checkpoint (before any read)
//! 4. Page through the collection by ascending `_id`, one bulk write per page
//! 5. After each write persist the scan checkpoint, then check for a stop
//! 6. On an empty page restore index settings and hand over to the tail phase
//!
//! Any error parks the node in `ScanException` with `Switch = Stop`.

use super::types::{StopCheck, WorkerContext, WorkerExit};
use crate::bulk::{render_lines, scan_page_actions};
use crate::config::ScanConfig;
use crate::document::Value;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::node::{NodeUpdate, SyncStatus};
use crate::projection::{ProjectionSpec, IDENTITY_FIELD};
use crate::sink::IndexSink;
use crate::source::{parse_checkpoint, DocumentSource, ScanFilter};
use std::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

/// Run the scan worker for a single node until it completes, stops or fails.
pub async fn run_scan(ctx: WorkerContext, config: ScanConfig) -> WorkerExit {
    let span = info_span!("scan", node_id = %ctx.node_id());

    async move {
        info!(
            namespace = %ctx.node.namespace(),
            index = %ctx.node.index,
            checkpoint = ?ctx.node.scan_checkpoint,
            "Starting scan worker"
        );

        match copy_collection(&ctx, &config).await {
            Ok(exit) => exit,
            Err(e) => ctx.park(SyncStatus::ScanException, &e).await,
        }
    }
    .instrument(span)
    .await
}

async fn copy_collection(ctx: &WorkerContext, config: &ScanConfig) -> Result<WorkerExit> {
    let node = &ctx.node;
    let source = ctx.connector.source(&node.source_url).await?;
    let sink = ctx.connector.sink(&node.sink_url).await?;

    prepare_index(sink.as_ref(), &node.index, &node.type_name, &node.mapping).await?;

    let fresh = node.scan_checkpoint.is_none();
    if fresh && config.relax_index_settings {
        let settings = config.bulk_settings();
        if let Err(e) = sink.update_index_settings(&node.index, settings).await {
            warn!(error = %e, "Failed to relax index settings for bulk load");
        }
    }

    // The tail phase resumes from here, so it must be captured before the first read.
    let position = source.latest_position().await?.unwrap_or_default();
    ctx.persist(NodeUpdate::tail_checkpoint(position)).await?;
    debug!(position = %position, "Captured change-feed position");

    let mut filter = match &node.scan_checkpoint {
        Some(checkpoint) => {
            resume_filter(source.as_ref(), &node.database, &node.collection, checkpoint).await?
        }
        None => ScanFilter::All,
    };

    let spec = ProjectionSpec::parse(&node.projection);
    let link_field = node.link_field();
    let mut documents = 0usize;

    loop {
        let started = Instant::now();
        let page = source
            .find(&node.database, &node.collection, filter.clone(), config.page_size)
            .await?;

        let Some(last_id) = last_identity(&page)? else {
            break;
        };

        let actions = scan_page_actions(&page, &spec, link_field);
        if !actions.is_empty() {
            let count = actions.len();
            let lines = render_lines(&actions)?;
            let response = sink.bulk(&node.index, &node.type_name, lines).await?;
            if !response.is_success() {
                return Err(ReplicationError::BulkRejected {
                    index: node.index.clone(),
                    count,
                });
            }
        }

        let checkpoint = last_id.to_id_string();
        ctx.persist(NodeUpdate::scan_progress(checkpoint.clone())).await?;

        documents += page.len();
        metrics::record_scan_page(&node.id, page.len(), started.elapsed());
        debug!(page = page.len(), checkpoint = %checkpoint, "Scan page written");

        match ctx.live.check_stop(&node.id) {
            StopCheck::Continue => {}
            StopCheck::StopRequested => return ctx.acknowledge_stop().await,
            StopCheck::Missing => {
                info!("Node left the scan phase, worker exiting");
                return Ok(WorkerExit::Detached);
            }
        }

        filter = ScanFilter::IdGreaterThan(last_id);
    }

    if config.relax_index_settings {
        if let Err(e) = sink
            .update_index_settings(&node.index, config.normal_settings())
            .await
        {
            warn!(error = %e, "Failed to restore index settings, restore manually");
        }
    }

    ctx.persist(NodeUpdate::status(SyncStatus::WaitForTail)).await?;
    info!(documents, "Scan complete, handing over to tail");
    Ok(WorkerExit::Completed { documents })
}

/// Create the index if needed and upsert its mapping.
async fn prepare_index(
    sink: &dyn IndexSink,
    index: &str,
    type_name: &str,
    mapping: &str,
) -> Result<()> {
    let exists = sink
        .index_exists(index)
        .await
        .map_err(|e| ReplicationError::setup(index, e.to_string()))?;

    if !exists {
        sink.create_index(index)
            .await
            .map_err(|e| ReplicationError::setup(index, e.to_string()))?;
        info!(index, "Created index");
    }

    sink.put_mapping(index, type_name, mapping)
        .await
        .map_err(|e| ReplicationError::setup(index, format!("mapping: {}", e)))
}

/// Filter resuming after a persisted checkpoint.
///
/// One document is peeked to learn the collection's identity kind.
async fn resume_filter(
    source: &dyn DocumentSource,
    database: &str,
    collection: &str,
    checkpoint: &str,
) -> Result<ScanFilter> {
    let sample = source.find(database, collection, ScanFilter::All, 1).await?;
    let sample_id = sample.first().and_then(|doc| doc.get(IDENTITY_FIELD));
    let bound = parse_checkpoint(checkpoint, sample_id)?;
    info!(checkpoint, "Resuming scan");
    Ok(ScanFilter::IdGreaterThan(bound))
}

/// Identity of the last document of a page, `None` for an empty page.
fn last_identity(page: &[crate::document::Document]) -> Result<Option<Value>> {
    match page.last() {
        None => Ok(None),
        Some(doc) => doc
            .get(IDENTITY_FIELD)
            .cloned()
            .map(Some)
            .ok_or_else(|| ReplicationError::Internal("scanned document without _id".to_string())),
    }
}
