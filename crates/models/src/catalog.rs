use crate::SourceKind;

/// Error raised by catalog lookups during plan validation.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CatalogError {
    #[error("unknown source {0:?}")]
    UnknownSource(String),
    #[error("source id {0:?} could not be normalized")]
    Unresolvable(String),
}

/// A source id resolved to its canonical registry form.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSource {
    pub canonical_id: String,
    pub kind: SourceKind,
}

/// SourceCatalog is the narrow registry surface plan validation needs:
/// resolving (possibly compound) source ids and structurally checking
/// queries against known objects. The full registry port implements it.
pub trait SourceCatalog: Send + Sync {
    /// Resolves a raw source id (canonical `postgres_main`, bare kind
    /// `postgres`, or compound `mongodb:collection:orders`) to its
    /// canonical form. Failure to resolve is a validation error.
    fn resolve_source(&self, source_id: &str) -> Result<ResolvedSource, CatalogError>;

    /// Whether `collection` is a known object of the source.
    fn check_collection(&self, source_id: &str, collection: &str) -> Result<bool, CatalogError>;

    /// Structural SQL validation: returns human-readable errors, empty
    /// when the statement references only known tables. This is not a SQL
    /// parser; it checks object references only.
    fn check_sql(&self, source_id: &str, sql: &str) -> Result<Vec<String>, CatalogError>;
}
