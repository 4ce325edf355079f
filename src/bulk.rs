//! Bulk request building.
//!
//! Every write to the index sink goes through one bulk call made of
//! newline-delimited action lines. A [`BulkAction`] is the typed form of one
//! action; it renders to a header line and, except for deletes, a body line:
//!
//! ```text
//! Insert       {"index":{"_id":"42"}}
//!              {"ID":42,"name":"ada"}
//! Update       {"update":{"_id":"42"}}
//!              {"doc":{"name":"ada"}}
//! DeleteFields {"update":{"_id":"42"}}
//!              {"script":"ctx._source.remove(\"a\");ctx._source.remove(\"b\")"}
//! Delete       {"delete":{"_id":"42"}}
//! ```
//!
//! Rendering preserves the input order exactly: the sink applies actions in
//! request order, so a later operation on the same identity must follow the
//! earlier one.

use crate::document::{Document, Value};
use crate::error::Result;
use crate::projection::{self, ProjectionSpec, IDENTITY_FIELD};
use serde_json::json;
use tracing::debug;

/// One typed bulk action.
#[derive(Debug, Clone, PartialEq)]
pub enum BulkAction {
    /// Full document write (create or replace).
    Insert { id: String, doc: Document },
    /// Partial merge into an existing document.
    Update { id: String, doc: Document },
    /// Remove the named fields from an existing document.
    DeleteFields { id: String, fields: Vec<String> },
    /// Remove the document.
    Delete { id: String },
}

impl BulkAction {
    /// Target document id.
    pub fn id(&self) -> &str {
        match self {
            BulkAction::Insert { id, .. }
            | BulkAction::Update { id, .. }
            | BulkAction::DeleteFields { id, .. }
            | BulkAction::Delete { id } => id,
        }
    }

    /// Short operation name (used for logs and metric labels).
    pub fn kind(&self) -> &'static str {
        match self {
            BulkAction::Insert { .. } => "insert",
            BulkAction::Update { .. } => "update",
            BulkAction::DeleteFields { .. } => "delete_fields",
            BulkAction::Delete { .. } => "delete",
        }
    }

    /// Append this action's header and body lines.
    pub fn render_into(&self, lines: &mut Vec<String>) -> Result<()> {
        match self {
            BulkAction::Insert { id, doc } => {
                lines.push(serde_json::to_string(&json!({ "index": { "_id": id } }))?);
                lines.push(serde_json::to_string(&doc.to_json())?);
            }
            BulkAction::Update { id, doc } => {
                lines.push(serde_json::to_string(&json!({ "update": { "_id": id } }))?);
                lines.push(serde_json::to_string(&json!({ "doc": doc.to_json() }))?);
            }
            BulkAction::DeleteFields { id, fields } => {
                lines.push(serde_json::to_string(&json!({ "update": { "_id": id } }))?);
                lines.push(serde_json::to_string(&json!({ "script": removal_script(fields) }))?);
            }
            BulkAction::Delete { id } => {
                lines.push(serde_json::to_string(&json!({ "delete": { "_id": id } }))?);
            }
        }
        Ok(())
    }
}

/// Script removing each named field from the stored source.
pub fn removal_script(fields: &[String]) -> String {
    fields
        .iter()
        .map(|f| format!("ctx._source.remove({})", serde_json::Value::String(f.clone())))
        .collect::<Vec<_>>()
        .join(";")
}

/// Render actions to bulk lines, in order.
pub fn render_lines(actions: &[BulkAction]) -> Result<Vec<String>> {
    let mut lines = Vec::with_capacity(actions.len() * 2);
    for action in actions {
        action.render_into(&mut lines)?;
    }
    Ok(lines)
}

/// Build the actions for one scan page.
///
/// Without a link field every document becomes an `Insert` keyed by its
/// native identity. With a link field every document becomes an `Update`
/// keyed by the link value; documents missing the link field are skipped.
pub fn scan_page_actions(
    docs: &[Document],
    spec: &ProjectionSpec,
    link_field: Option<&str>,
) -> Vec<BulkAction> {
    let mut actions = Vec::with_capacity(docs.len());
    for doc in docs {
        match link_field {
            None => {
                let Some(id) = doc.get(IDENTITY_FIELD) else {
                    debug!("Skipping scan document without identity");
                    continue;
                };
                actions.push(BulkAction::Insert {
                    id: id.to_id_string(),
                    doc: projection::project_root(doc, spec),
                });
            }
            Some(link) => {
                let Some(target) = doc.get(link).filter(|v| !matches!(v, Value::Null)) else {
                    debug!(link_field = %link, "Skipping scan document without link field");
                    continue;
                };
                actions.push(BulkAction::Update {
                    id: target.to_id_string(),
                    doc: projection::project_linked(doc, spec, link),
                });
            }
        }
    }
    actions
}
