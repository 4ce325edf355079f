//! In-memory IndexSink for testing.
//!
//! Applies bulk action lines the way a search engine would, in request
//! order, so replay and ordering semantics can be asserted on the stored
//! documents. Records every bulk call and settings change.

use index_replicator::sink::{BulkResponse, IndexSettings, IndexSink};
use index_replicator::{BoxFuture, ReplicationError};
use serde_json::{Map, Value as Json};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

type StoredDoc = Map<String, Json>;

#[derive(Debug, Default, Clone)]
struct IndexState {
    docs: BTreeMap<String, StoredDoc>,
    mapping: Option<String>,
    settings: IndexSettings,
}

/// A recorded bulk() call.
#[derive(Debug, Clone)]
pub struct BulkCall {
    pub index: String,
    pub lines: Vec<String>,
}

impl BulkCall {
    /// Number of actions (header lines) in the request.
    pub fn action_count(&self) -> usize {
        self.lines
            .iter()
            .filter(|line| {
                serde_json::from_str::<Json>(line)
                    .ok()
                    .and_then(|v| v.as_object().map(is_header))
                    .unwrap_or(false)
            })
            .count()
    }
}

fn is_header(obj: &StoredDoc) -> bool {
    obj.len() == 1
        && ["index", "update", "delete"]
            .iter()
            .any(|k| obj.get(*k).is_some_and(|v| v.get("_id").is_some()))
}

/// Hook run after each accepted bulk call, with the 1-based call number.
pub type BulkHook = Box<dyn Fn(usize) + Send + Sync>;

/// In-memory search index.
#[derive(Default)]
pub struct MemorySink {
    indices: Mutex<HashMap<String, IndexState>>,
    bulk_calls: Mutex<Vec<BulkCall>>,
    settings_updates: Mutex<Vec<(String, IndexSettings)>>,
    /// Bulk calls from this number on report errors (0 = never).
    fail_bulk_from: AtomicUsize,
    fail_create_index: AtomicBool,
    after_bulk: Mutex<Option<BulkHook>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `errors: true` for bulk call `n` (1-based) and every later one.
    pub fn fail_bulk_from(&self, n: usize) {
        self.fail_bulk_from.store(n, Ordering::SeqCst);
    }

    pub fn fail_create_index(&self) {
        self.fail_create_index.store(true, Ordering::SeqCst);
    }

    pub fn on_bulk(&self, hook: BulkHook) {
        *self.after_bulk.lock().unwrap() = Some(hook);
    }

    pub fn bulk_calls(&self) -> Vec<BulkCall> {
        self.bulk_calls.lock().unwrap().clone()
    }

    /// Action count of each bulk call, in order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.bulk_calls().iter().map(BulkCall::action_count).collect()
    }

    pub fn settings_updates(&self) -> Vec<(String, IndexSettings)> {
        self.settings_updates.lock().unwrap().clone()
    }

    pub fn has_index(&self, index: &str) -> bool {
        self.indices.lock().unwrap().contains_key(index)
    }

    pub fn mapping(&self, index: &str) -> Option<String> {
        self.indices.lock().unwrap().get(index).and_then(|i| i.mapping.clone())
    }

    pub fn document(&self, index: &str, id: &str) -> Option<StoredDoc> {
        self.indices
            .lock()
            .unwrap()
            .get(index)
            .and_then(|i| i.docs.get(id).cloned())
    }

    pub fn document_ids(&self, index: &str) -> Vec<String> {
        self.indices
            .lock()
            .unwrap()
            .get(index)
            .map(|i| i.docs.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn document_count(&self, index: &str) -> usize {
        self.document_ids(index).len()
    }

    /// Apply action lines to an index. Returns true if any action failed.
    fn apply(&self, index: &str, lines: &[String]) -> Result<bool, ReplicationError> {
        let mut indices = self.indices.lock().unwrap();
        let state = indices.entry(index.to_string()).or_default();
        let mut errors = false;
        let mut iter = lines.iter();

        while let Some(header) = iter.next() {
            let header: StoredDoc = serde_json::from_str(header)?;
            let (action, meta) = header
                .into_iter()
                .next()
                .ok_or_else(|| ReplicationError::sink("bulk", "empty action header"))?;
            let id = meta
                .get("_id")
                .and_then(Json::as_str)
                .ok_or_else(|| ReplicationError::sink("bulk", "action without _id"))?
                .to_string();

            match action.as_str() {
                "index" => {
                    let body = next_body(&mut iter)?;
                    state.docs.insert(id, body);
                }
                "update" => {
                    let body = next_body(&mut iter)?;
                    let Some(existing) = state.docs.get_mut(&id) else {
                        // document_missing_exception
                        errors = true;
                        continue;
                    };
                    if let Some(Json::Object(partial)) = body.get("doc") {
                        for (k, v) in partial {
                            existing.insert(k.clone(), v.clone());
                        }
                    } else if let Some(Json::String(script)) = body.get("script") {
                        for field in removed_fields(script)? {
                            existing.remove(&field);
                        }
                    } else {
                        errors = true;
                    }
                }
                "delete" => {
                    state.docs.remove(&id);
                }
                other => {
                    return Err(ReplicationError::sink("bulk", format!("unknown action {}", other)));
                }
            }
        }

        Ok(errors)
    }
}

fn next_body<'a>(iter: &mut impl Iterator<Item = &'a String>) -> Result<StoredDoc, ReplicationError> {
    let line = iter
        .next()
        .ok_or_else(|| ReplicationError::sink("bulk", "missing body line"))?;
    Ok(serde_json::from_str(line)?)
}

/// Field names from `ctx._source.remove("a");ctx._source.remove("b")`.
fn removed_fields(script: &str) -> Result<Vec<String>, ReplicationError> {
    script
        .split(';')
        .map(|stmt| -> Result<String, ReplicationError> {
            let arg = stmt
                .trim()
                .strip_prefix("ctx._source.remove(")
                .and_then(|rest| rest.strip_suffix(')'))
                .ok_or_else(|| ReplicationError::sink("bulk", format!("bad script {}", stmt)))?;
            Ok(serde_json::from_str::<String>(arg)?)
        })
        .collect()
}

fn field_type(value: &Json) -> &'static str {
    match value {
        Json::Bool(_) => "boolean",
        Json::Number(n) if n.is_f64() => "float",
        Json::Number(_) => "long",
        Json::Object(_) => "object",
        _ => "text",
    }
}

impl IndexSink for MemorySink {
    fn index_exists<'a>(&'a self, index: &'a str) -> BoxFuture<'a, bool> {
        let exists = self.has_index(index);
        Box::pin(async move { Ok(exists) })
    }

    fn create_index<'a>(&'a self, index: &'a str) -> BoxFuture<'a, ()> {
        let result = if self.fail_create_index.load(Ordering::SeqCst) {
            Err(ReplicationError::sink("create_index", "injected failure"))
        } else {
            self.indices
                .lock()
                .unwrap()
                .insert(index.to_string(), IndexState::default());
            Ok(())
        };
        Box::pin(async move { result })
    }

    fn put_mapping<'a>(
        &'a self,
        index: &'a str,
        _type_name: &'a str,
        mapping: &'a str,
    ) -> BoxFuture<'a, ()> {
        let result = match self.indices.lock().unwrap().get_mut(index) {
            Some(state) => {
                state.mapping = Some(mapping.to_string());
                Ok(())
            }
            None => Err(ReplicationError::sink("put_mapping", format!("no such index {}", index))),
        };
        Box::pin(async move { result })
    }

    fn bulk<'a>(
        &'a self,
        index: &'a str,
        _type_name: &'a str,
        lines: Vec<String>,
    ) -> BoxFuture<'a, BulkResponse> {
        let call_number = {
            let mut calls = self.bulk_calls.lock().unwrap();
            calls.push(BulkCall {
                index: index.to_string(),
                lines: lines.clone(),
            });
            calls.len()
        };

        let fail_from = self.fail_bulk_from.load(Ordering::SeqCst);
        let result = if fail_from != 0 && call_number >= fail_from {
            Ok(BulkResponse {
                errors: true,
                took_ms: 1,
            })
        } else {
            self.apply(index, &lines).map(|errors| BulkResponse { errors, took_ms: 1 })
        };

        if matches!(result, Ok(BulkResponse { errors: false, .. })) {
            if let Some(hook) = self.after_bulk.lock().unwrap().as_ref() {
                hook(call_number);
            }
        }
        Box::pin(async move { result })
    }

    fn index_settings<'a>(&'a self, index: &'a str) -> BoxFuture<'a, IndexSettings> {
        let settings = self
            .indices
            .lock()
            .unwrap()
            .get(index)
            .map(|i| i.settings.clone())
            .unwrap_or_default();
        Box::pin(async move { Ok(settings) })
    }

    fn update_index_settings<'a>(
        &'a self,
        index: &'a str,
        settings: IndexSettings,
    ) -> BoxFuture<'a, ()> {
        self.settings_updates
            .lock()
            .unwrap()
            .push((index.to_string(), settings.clone()));
        if let Some(state) = self.indices.lock().unwrap().get_mut(index) {
            state.settings = settings;
        }
        Box::pin(async { Ok(()) })
    }

    fn get_mapping<'a>(&'a self, index: &'a str) -> BoxFuture<'a, String> {
        let mut properties = BTreeMap::new();
        if let Some(state) = self.indices.lock().unwrap().get(index) {
            for doc in state.docs.values() {
                for (field, value) in doc {
                    properties
                        .entry(field.clone())
                        .or_insert_with(|| serde_json::json!({ "type": field_type(value) }));
                }
            }
        }
        let mapping = serde_json::json!({ index: { "properties": properties } }).to_string();
        Box::pin(async move { Ok(mapping) })
    }

    fn delete_index<'a>(&'a self, index: &'a str) -> BoxFuture<'a, ()> {
        self.indices.lock().unwrap().remove(index);
        Box::pin(async { Ok(()) })
    }
}
