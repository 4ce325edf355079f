//! Field projection and document shaping.
//!
//! A projection spec is a comma-separated list of dot-paths (`"name,address.city"`).
//! It is parsed once into a [`ProjectionSpec`] tree and then applied
//! recursively to source documents:
//!
//! ```text
//! "name, address.city, tags.label"
//!
//!   root
//!   ├── name      → All
//!   ├── address   → { city → All }
//!   └── tags      → { label → All }
//! ```
//!
//! # Rules
//!
//! - A blank spec selects every top-level field except the native identity
//!   (`_id`). Nested documents reached through an `All` selection keep every
//!   key, including their own `_id`.
//! - Nested documents, and arrays of nested documents, recurse with the
//!   sub-selection for their key.
//! - A bare path selects the whole subtree even when deeper paths under the
//!   same key are also listed (`"a,a.b"` keeps all of `a`).
//! - Date/time scalars render to their canonical text, and generated object
//!   ids render to hex, wherever they appear. Other scalars pass through.
//!
//! The identity remap (`_id` → `ID`) is applied only at the document root by
//! [`project_root()`]; [`project()`] never emits it, which keeps projection
//! idempotent: `project(project(d, p), p) == project(d, p)`.

use crate::document::{Document, Value};

/// Native identity field of source documents.
pub const IDENTITY_FIELD: &str = "_id";

/// Name the identity is written under in sink documents.
pub const IDENTITY_OUTPUT_FIELD: &str = "ID";

/// Field-removal clause of an update modifier.
const UNSET_OPERATOR: &str = "$unset";

/// Field-assignment clause of an update modifier.
const SET_OPERATOR: &str = "$set";

#[derive(Debug, Clone, PartialEq)]
enum Selection {
    All,
    Fields(Vec<(String, Selection)>),
}

impl Selection {
    fn child(&self, key: &str) -> Option<&Selection> {
        match self {
            Selection::All => Some(&Selection::All),
            Selection::Fields(fields) => fields.iter().find(|(k, _)| k == key).map(|(_, s)| s),
        }
    }

    fn insert(&mut self, segments: &[&str]) {
        let Some((head, rest)) = segments.split_first() else {
            return;
        };
        let Selection::Fields(fields) = self else {
            // Whole subtree already selected
            return;
        };

        let pos = match fields.iter().position(|(k, _)| k == head) {
            Some(pos) => pos,
            None => {
                let initial = if rest.is_empty() {
                    Selection::All
                } else {
                    Selection::Fields(Vec::new())
                };
                fields.push((head.to_string(), initial));
                fields.len() - 1
            }
        };

        if rest.is_empty() {
            fields[pos].1 = Selection::All;
        } else {
            fields[pos].1.insert(rest);
        }
    }
}

/// Parsed projection spec.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionSpec {
    root: Selection,
    /// Trimmed, non-empty entries exactly as listed (used for removed-field matching).
    literals: Vec<String>,
}

impl Default for ProjectionSpec {
    fn default() -> Self {
        Self {
            root: Selection::All,
            literals: Vec::new(),
        }
    }
}

impl ProjectionSpec {
    /// Parse a comma-separated dot-path list. Blank input selects everything.
    pub fn parse(spec: &str) -> Self {
        let mut root = Selection::Fields(Vec::new());
        let mut literals = Vec::new();

        for entry in spec.split(',') {
            let entry = entry.trim();
            let segments: Vec<&str> = entry
                .split('.')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect();
            if segments.is_empty() {
                continue;
            }
            literals.push(entry.to_string());
            root.insert(&segments);
        }

        if literals.is_empty() {
            return Self::default();
        }

        Self { root, literals }
    }

    /// True when the spec selects every field.
    pub fn is_empty(&self) -> bool {
        self.literals.is_empty()
    }

    /// Entries as listed in the spec.
    pub fn literals(&self) -> &[String] {
        &self.literals
    }

    /// Check whether a top-level key is selected.
    pub fn selects(&self, key: &str) -> bool {
        match &self.root {
            Selection::All => key != IDENTITY_FIELD,
            fields => fields.child(key).is_some(),
        }
    }
}

impl From<&str> for ProjectionSpec {
    fn from(spec: &str) -> Self {
        Self::parse(spec)
    }
}

/// Project a document through a spec (no identity remap).
pub fn project(doc: &Document, spec: &ProjectionSpec) -> Document {
    project_document(doc, &spec.root, true)
}

/// Project a top-level scan/insert document: identity remapped to
/// [`IDENTITY_OUTPUT_FIELD`], followed by the projected fields.
pub fn project_root(doc: &Document, spec: &ProjectionSpec) -> Document {
    let mut out = Document::new();
    if let Some(id) = doc.get(IDENTITY_FIELD) {
        out.insert(IDENTITY_OUTPUT_FIELD, render_scalar(id));
    }
    for (key, value) in project(doc, spec) {
        out.insert(key, value);
    }
    out
}

/// Project a document whose sink identity comes from a link field.
///
/// The sink document is keyed by the link value, so neither the native
/// identity nor the link field itself is written into the body.
pub fn project_linked(doc: &Document, spec: &ProjectionSpec, link_field: &str) -> Document {
    let mut out = project(doc, spec);
    out.remove(IDENTITY_OUTPUT_FIELD);
    out.remove(link_field);
    out
}

/// Field names removed by an update that are visible under the spec.
///
/// Blank spec: every removed name verbatim. Otherwise the intersection with
/// the spec's literal entries, in removal order.
pub fn resolve_removed_fields(removed: &[String], spec: &ProjectionSpec) -> Vec<String> {
    if spec.is_empty() {
        return removed.to_vec();
    }
    removed
        .iter()
        .filter(|name| spec.literals.iter().any(|lit| lit == *name))
        .cloned()
        .collect()
}

/// Names listed in an update modifier's field-removal clause.
pub fn removed_field_names(modifier: &Document) -> Vec<String> {
    match modifier.get(UNSET_OPERATOR) {
        Some(Value::Document(unset)) => unset.keys().map(str::to_string).collect(),
        _ => Vec::new(),
    }
}

/// Replacement payload of an update: the `$set` sub-document, or the
/// modifier without operator keys for whole-document replacements.
pub fn update_payload(modifier: &Document) -> Document {
    if let Some(Value::Document(set)) = modifier.get(SET_OPERATOR) {
        return set.clone();
    }
    modifier
        .iter()
        .filter(|(k, _)| !k.starts_with('$'))
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn project_document(doc: &Document, selection: &Selection, root: bool) -> Document {
    let mut out = Document::new();
    for (key, value) in doc.iter() {
        if root && matches!(selection, Selection::All) && key == IDENTITY_FIELD {
            continue;
        }
        if let Some(sub) = selection.child(key) {
            out.insert(key, project_value(value, sub));
        }
    }
    out
}

fn project_value(value: &Value, selection: &Selection) -> Value {
    match value {
        Value::Document(doc) => Value::Document(project_document(doc, selection, false)),
        Value::Array(items) => Value::Array(items.iter().map(|v| project_value(v, selection)).collect()),
        scalar => render_scalar(scalar),
    }
}

fn render_scalar(value: &Value) -> Value {
    match value {
        Value::DateTime(dt) => Value::String(Value::render_datetime(dt)),
        Value::ObjectId(oid) => Value::String(oid.to_hex()),
        other => other.clone(),
    }
}
