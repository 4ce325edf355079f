//! Offline mapping inference.
//!
//! Operators configuring a node need a mapping payload for the target index.
//! [`infer_mapping()`] derives one from the sink's dynamic mapping: the newest
//! source document is projected exactly as the scan would project it, written
//! into a throwaway index, and the mapping the sink generated is read back.
//!
//! Not used on the replication path.

use crate::bulk::{render_lines, BulkAction};
use crate::error::{ReplicationError, Result};
use crate::projection::{self, ProjectionSpec, IDENTITY_FIELD};
use crate::sink::IndexSink;
use crate::source::DocumentSource;
use chrono::Utc;
use tracing::{info, warn};

/// Name of a temporary index created at the current time.
pub fn temp_index_name() -> String {
    format!("temp{}", Utc::now().format("%Y%m%d%H%M%S"))
}

/// Infer a mapping for `database.collection` under a projection.
///
/// Returns an empty string when the collection is empty. A temporary index
/// that cannot be deleted is reported by appending a note to the returned
/// text instead of failing.
pub async fn infer_mapping(
    source: &dyn DocumentSource,
    sink: &dyn IndexSink,
    database: &str,
    collection: &str,
    spec: &ProjectionSpec,
    link_field: Option<&str>,
) -> Result<String> {
    let index = temp_index_name();
    if sink.index_exists(&index).await? {
        return Err(ReplicationError::setup(&index, "temporary index already exists"));
    }
    sink.create_index(&index).await?;
    info!(index = %index, database, collection, "Inferring mapping");

    let mut mapping = match sample_into(source, sink, &index, database, collection, spec, link_field).await {
        Ok(mapping) => mapping,
        Err(e) => {
            if let Err(cleanup) = sink.delete_index(&index).await {
                warn!(index = %index, error = %cleanup, "Failed to delete temporary index");
            }
            return Err(e);
        }
    };

    if let Err(e) = sink.delete_index(&index).await {
        warn!(index = %index, error = %e, "Failed to delete temporary index");
        mapping.push_str(&format!(" (temporary index {} could not be deleted, remove it manually)", index));
    }

    Ok(mapping)
}

async fn sample_into(
    source: &dyn DocumentSource,
    sink: &dyn IndexSink,
    index: &str,
    database: &str,
    collection: &str,
    spec: &ProjectionSpec,
    link_field: Option<&str>,
) -> Result<String> {
    let Some(doc) = source.latest_document(database, collection).await? else {
        return Ok(String::new());
    };

    let id = doc
        .get(IDENTITY_FIELD)
        .map(|v| v.to_id_string())
        .unwrap_or_else(|| "sample".to_string());
    let body = match link_field {
        Some(link) => projection::project_linked(&doc, spec, link),
        None => projection::project_root(&doc, spec),
    };

    let lines = render_lines(&[BulkAction::Insert { id, doc: body }])?;
    let response = sink.bulk(index, index, lines).await?;
    if response.errors {
        return Err(ReplicationError::BulkRejected {
            index: index.to_string(),
            count: 1,
        });
    }

    sink.get_mapping(index).await
}
