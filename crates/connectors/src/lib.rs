//! The adapter port: the contract every backend connector satisfies, and
//! the factory through which the executor obtains shared adapter handles.
//!
//! Concrete connectors (postgres, mongodb, vector stores, messaging and
//! commerce APIs) are provided by collaborating crates; the core talks
//! only to [`Adapter`]. Stub connectors for tests live in [`stub`].

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use models::{DataSource, OpSpec, SourceKind};

pub mod stub;

pub use models::Row;

/// Error raised by adapter calls. `retryable()` drives executor retry.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("query is malformed: {0}")]
    Syntax(String),
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("backend call timed out")]
    Timeout,
    #[error("backend error: {message}")]
    Backend { message: String, retryable: bool },
    #[error("no adapter is registered for kind {0}")]
    UnknownKind(SourceKind),
}

impl AdapterError {
    /// Whether the executor may retry the call with backoff. Syntax and
    /// permission errors never succeed on retry; connection failures and
    /// transient backend errors may.
    pub fn retryable(&self) -> bool {
        match self {
            AdapterError::Connection(_) | AdapterError::Timeout => true,
            AdapterError::Backend { retryable, .. } => *retryable,
            AdapterError::Syntax(_)
            | AdapterError::Permission(_)
            | AdapterError::UnknownKind(_) => false,
        }
    }

    /// Stable kind label used in per-operation error reporting.
    pub fn kind_label(&self) -> &'static str {
        match self {
            AdapterError::Connection(_) => "adapter_connection",
            AdapterError::Syntax(_) => "adapter_syntax",
            AdapterError::Permission(_) => "permission_denied",
            AdapterError::Timeout => "timeout",
            AdapterError::Backend { .. } => "backend",
            AdapterError::UnknownKind(_) => "unknown_kind",
        }
    }
}

/// Adapter is the abstract contract each backend connector satisfies.
///
/// Implementations are shared across concurrent operations targeting the
/// same source, and manage their own connection pooling. Calls must be
/// cancellation-safe: dropping the returned future aborts the work.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Probes connectivity without running a query.
    async fn test_connection(&self) -> Result<bool, AdapterError>;

    /// Executes one operation payload, returning its rows.
    async fn execute(&self, spec: &OpSpec) -> Result<Vec<Row>, AdapterError>;

    /// Introspects the backend's queryable objects as raw descriptor
    /// documents.
    async fn introspect_schema(&self) -> Result<Vec<Value>, AdapterError>;
}

/// Builds an adapter for a source of one backend kind.
pub trait AdapterBuilder: Send + Sync {
    fn build(&self, source: &DataSource) -> Result<Arc<dyn Adapter>, AdapterError>;
}

impl<F> AdapterBuilder for F
where
    F: Fn(&DataSource) -> Result<Arc<dyn Adapter>, AdapterError> + Send + Sync,
{
    fn build(&self, source: &DataSource) -> Result<Arc<dyn Adapter>, AdapterError> {
        self(source)
    }
}

/// AdapterFactory hands out adapters keyed by source id, caching them so
/// connections are reused across operations and plans.
pub struct AdapterFactory {
    builders: BTreeMap<SourceKind, Arc<dyn AdapterBuilder>>,
    cache: tokio::sync::Mutex<BTreeMap<String, Arc<dyn Adapter>>>,
}

impl Default for AdapterFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterFactory {
    pub fn new() -> Self {
        Self {
            builders: BTreeMap::new(),
            cache: tokio::sync::Mutex::new(BTreeMap::new()),
        }
    }

    pub fn register(
        mut self,
        kind: SourceKind,
        builder: impl AdapterBuilder + 'static,
    ) -> Self {
        self.builders.insert(kind, Arc::new(builder));
        self
    }

    pub fn supports(&self, kind: SourceKind) -> bool {
        self.builders.contains_key(&kind)
    }

    /// The adapter for `source`, building and caching it on first use.
    pub async fn adapter(&self, source: &DataSource) -> Result<Arc<dyn Adapter>, AdapterError> {
        let mut cache = self.cache.lock().await;
        if let Some(adapter) = cache.get(&source.id) {
            return Ok(adapter.clone());
        }
        let builder = self
            .builders
            .get(&source.kind)
            .ok_or(AdapterError::UnknownKind(source.kind))?;
        let adapter = builder.build(source)?;
        tracing::debug!(source = %source.id, kind = %source.kind, "built adapter");
        cache.insert(source.id.clone(), adapter.clone());
        Ok(adapter)
    }

    /// Drops all cached adapters, closing their connections on drop.
    pub async fn reset(&self) {
        self.cache.lock().await.clear();
    }
}

#[cfg(test)]
mod test {
    use super::stub::StubAdapter;
    use super::*;

    fn source(id: &str, kind: SourceKind) -> DataSource {
        DataSource {
            id: id.to_string(),
            kind,
            connection_uri: None,
        }
    }

    #[tokio::test]
    async fn factory_caches_by_source_id() {
        let factory = AdapterFactory::new().register(SourceKind::Postgres, |s: &DataSource| {
            Ok(Arc::new(StubAdapter::named(&s.id)) as Arc<dyn Adapter>)
        });

        let src = source("postgres_main", SourceKind::Postgres);
        let first = factory.adapter(&src).await.unwrap();
        let second = factory.adapter(&src).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        factory.reset().await;
        let third = factory.adapter(&src).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[tokio::test]
    async fn unknown_kinds_are_rejected() {
        let factory = AdapterFactory::new();
        let err = match factory
            .adapter(&source("qdrant_main", SourceKind::Qdrant))
            .await
        {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(matches!(err, AdapterError::UnknownKind(SourceKind::Qdrant)));
        assert!(!err.retryable());
    }

    #[test]
    fn retryability_follows_the_taxonomy() {
        assert!(AdapterError::Connection("refused".into()).retryable());
        assert!(AdapterError::Timeout.retryable());
        assert!(AdapterError::Backend {
            message: "503".into(),
            retryable: true
        }
        .retryable());
        assert!(!AdapterError::Syntax("bad token".into()).retryable());
        assert!(!AdapterError::Permission("denied".into()).retryable());
        assert!(!AdapterError::Backend {
            message: "constraint violation".into(),
            retryable: false
        }
        .retryable());
    }
}
