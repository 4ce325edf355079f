//! Opening source and sink connections.
//!
//! Every worker owns independent connections, opened from the node's
//! connection strings when the worker starts. The tail worker opens a fresh
//! source connection after a recoverable change-feed error.
//!
//! Client libraries for a concrete document store or search engine plug in
//! by implementing [`Connector`]. [`StaticConnector`] hands out pre-built
//! handles regardless of URL, for embedding and tests.

use crate::error::{ReplicationError, Result};
use crate::resilience::{retry_with_backoff, RetryConfig};
use crate::sink::IndexSink;
use crate::source::{BoxFuture, DocumentSource};
use std::sync::Arc;
use tracing::info;

/// Opens connections from node connection strings.
pub trait Connector: Send + Sync + 'static {
    fn source<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Arc<dyn DocumentSource>>;

    fn sink<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Arc<dyn IndexSink>>;
}

/// Reopen a source connection with backoff.
pub async fn reopen_source(
    connector: &dyn Connector,
    url: &str,
    retry: &RetryConfig,
) -> Result<Arc<dyn DocumentSource>> {
    let source = retry_with_backoff(retry, "reopen_source", || connector.source(url)).await?;
    info!("Source connection reopened");
    Ok(source)
}

/// Connector returning the same handles for every URL.
#[derive(Clone)]
pub struct StaticConnector {
    source: Option<Arc<dyn DocumentSource>>,
    sink: Option<Arc<dyn IndexSink>>,
}

impl StaticConnector {
    pub fn new(source: Arc<dyn DocumentSource>, sink: Arc<dyn IndexSink>) -> Self {
        Self {
            source: Some(source),
            sink: Some(sink),
        }
    }

    /// A connector that fails every open (for registries whose workers must
    /// never get past connecting).
    pub fn unavailable() -> Self {
        Self {
            source: None,
            sink: None,
        }
    }
}

impl Connector for StaticConnector {
    fn source<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Arc<dyn DocumentSource>> {
        let result = self.source.clone().ok_or_else(|| {
            ReplicationError::source(
                "connect",
                crate::error::SourceErrorKind::Connection,
                format!("no source available for {}", url),
            )
        });
        Box::pin(async move { result })
    }

    fn sink<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Arc<dyn IndexSink>> {
        let result = self
            .sink
            .clone()
            .ok_or_else(|| ReplicationError::sink("connect", format!("no sink available for {}", url)));
        Box::pin(async move { result })
    }
}
