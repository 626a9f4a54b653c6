//! The schema-registry port: read-only lookup of sources, tables, and
//! fields, structural validators per backend kind, rule-based source
//! recommendation, and schema search for planning context.
//!
//! All capabilities except [`SchemaRegistry::schema_search`] are local
//! cache reads and safe for concurrent callers; `schema_search` is async
//! because production deployments back it with a remote vector index.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use models::{
    CatalogError, DataSource, ResolvedSource, SourceCatalog, SourceKind, TableDescriptor,
};

mod keywords;
mod memory;
mod sql;

pub use memory::{MemoryRegistry, RegistrySeed, SchemaDocument};
pub use sql::referenced_tables;

/// Error raised by registry lookups.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown source {0:?}")]
    UnknownSource(String),
    #[error("schema search failed: {0}")]
    Search(String),
}

/// Outcome of structural SQL validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlCheck {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// One schema-search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaHit {
    pub score: f64,
    pub content: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl SchemaHit {
    pub fn kind(&self) -> Option<SourceKind> {
        self.metadata
            .get("db_type")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
    }
}

/// SchemaRegistry is the read-only capability surface the core consumes.
#[async_trait]
pub trait SchemaRegistry: SourceCatalog {
    fn list_sources(&self) -> Vec<DataSource>;

    fn get_source(&self, id: &str) -> Option<DataSource>;

    fn list_tables(&self, source_id: &str) -> Result<Vec<String>, RegistryError>;

    fn get_table(&self, source_id: &str, name: &str) -> Option<TableDescriptor>;

    /// Structural validation of a SQL statement: referenced objects must
    /// exist. This deliberately stops short of parsing SQL.
    fn validate_sql(&self, source_id: &str, sql: &str) -> Result<SqlCheck, RegistryError>;

    fn validate_collection(&self, source_id: &str, name: &str) -> Result<bool, RegistryError>;

    /// Rule-based recommendation of sources relevant to a question:
    /// keyword hits per kind, direct table mentions, and explicit kind
    /// mentions.
    fn recommend_sources(&self, question: &str) -> BTreeSet<String>;

    /// Relevance-ranked schema context for a question, optionally scoped
    /// to one backend kind.
    async fn schema_search(
        &self,
        question: &str,
        kind: Option<SourceKind>,
        top_k: usize,
    ) -> Result<Vec<SchemaHit>, RegistryError>;

    /// This registry viewed as the narrow catalog plan validation needs.
    fn as_catalog(&self) -> &dyn SourceCatalog;
}

/// Normalizes a raw source reference to its canonical registry id.
///
/// Accepted forms: a canonical id (`postgres_main`), a bare kind
/// (`postgres`), or a compound reference (`mongodb:collection:orders`).
/// Bare and compound forms resolve to the kind's `{kind}_main` source, or
/// its sole registered source when `{kind}_main` is absent.
pub fn normalize_source_id(
    raw: &str,
    sources: &BTreeMap<String, DataSource>,
) -> Result<ResolvedSource, CatalogError> {
    if let Some(source) = sources.get(raw) {
        return Ok(ResolvedSource {
            canonical_id: source.id.clone(),
            kind: source.kind,
        });
    }

    let kind_token = raw.split(':').next().unwrap_or(raw);
    let Ok(kind) = kind_token.parse::<SourceKind>() else {
        return Err(CatalogError::UnknownSource(raw.to_string()));
    };

    let default_id = kind.default_source_id();
    if let Some(source) = sources.get(&default_id) {
        return Ok(ResolvedSource {
            canonical_id: source.id.clone(),
            kind: source.kind,
        });
    }
    let mut of_kind = sources.values().filter(|s| s.kind == kind);
    match (of_kind.next(), of_kind.next()) {
        (Some(source), None) => Ok(ResolvedSource {
            canonical_id: source.id.clone(),
            kind: source.kind,
        }),
        // Zero or several candidates: the reference cannot be resolved
        // unambiguously.
        _ => Err(CatalogError::Unresolvable(raw.to_string())),
    }
}
