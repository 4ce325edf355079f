// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Index sink contract.
//!
//! Defines what the workers need from the search/index engine. The scan
//! worker prepares the index (existence check, creation, mapping upsert,
//! bulk-load settings) and both workers write through [`IndexSink::bulk()`].
//!
//! # Example
//!
//! ```rust,no_run
//! use index_replicator::sink::{BulkResponse, IndexSettings, IndexSink};
//! use index_replicator::BoxFuture;
//!
//! struct NullSink;
//!
//! impl IndexSink for NullSink {
//!     fn index_exists<'a>(&'a self, _index: &'a str) -> BoxFuture<'a, bool> {
//!         Box::pin(async { Ok(true) })
//!     }
//!     fn create_index<'a>(&'a self, _index: &'a str) -> BoxFuture<'a, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//!     fn put_mapping<'a>(&'a self, _index: &'a str, _type_name: &'a str, _mapping: &'a str) -> BoxFuture<'a, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//!     fn bulk<'a>(&'a self, _index: &'a str, _type_name: &'a str, _lines: Vec<String>) -> BoxFuture<'a, BulkResponse> {
//!         Box::pin(async { Ok(BulkResponse::default()) })
//!     }
//!     fn index_settings<'a>(&'a self, _index: &'a str) -> BoxFuture<'a, IndexSettings> {
//!         Box::pin(async { Ok(IndexSettings::default()) })
//!     }
//!     fn update_index_settings<'a>(&'a self, _index: &'a str, _settings: IndexSettings) -> BoxFuture<'a, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//!     fn get_mapping<'a>(&'a self, _index: &'a str) -> BoxFuture<'a, String> {
//!         Box::pin(async { Ok("{}".to_string()) })
//!     }
//!     fn delete_index<'a>(&'a self, _index: &'a str) -> BoxFuture<'a, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//! }
//! ```

use crate::source::BoxFuture;
use serde::{Deserialize, Serialize};

/// Refresh interval and replica count of an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSettings {
    /// Refresh interval as the sink expresses it (`"1s"`, `"-1"` to disable).
    pub refresh_interval: String,
    pub replicas: u32,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            refresh_interval: "1s".to_string(),
            replicas: 1,
        }
    }
}

impl IndexSettings {
    pub fn new(refresh_interval: impl Into<String>, replicas: u32) -> Self {
        Self {
            refresh_interval: refresh_interval.into(),
            replicas,
        }
    }
}

/// Outcome of one bulk call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkResponse {
    /// True when any action in the request failed.
    pub errors: bool,
    pub took_ms: u64,
}

impl BulkResponse {
    pub fn is_success(&self) -> bool {
        !self.errors
    }
}

/// Index sink capabilities required by the workers.
///
/// Implementations must execute bulk actions in request order.
pub trait IndexSink: Send + Sync + 'static {
    fn index_exists<'a>(&'a self, index: &'a str) -> BoxFuture<'a, bool>;

    fn create_index<'a>(&'a self, index: &'a str) -> BoxFuture<'a, ()>;

    /// Create or update the mapping of `type_name` in `index`.
    fn put_mapping<'a>(
        &'a self,
        index: &'a str,
        type_name: &'a str,
        mapping: &'a str,
    ) -> BoxFuture<'a, ()>;

    /// Submit newline-delimited action lines as one request.
    fn bulk<'a>(
        &'a self,
        index: &'a str,
        type_name: &'a str,
        lines: Vec<String>,
    ) -> BoxFuture<'a, BulkResponse>;

    fn index_settings<'a>(&'a self, index: &'a str) -> BoxFuture<'a, IndexSettings>;

    fn update_index_settings<'a>(
        &'a self,
        index: &'a str,
        settings: IndexSettings,
    ) -> BoxFuture<'a, ()>;

    /// Current mapping of `index` as JSON text.
    fn get_mapping<'a>(&'a self, index: &'a str) -> BoxFuture<'a, String>;

    fn delete_index<'a>(&'a self, index: &'a str) -> BoxFuture<'a, ()>;
}
