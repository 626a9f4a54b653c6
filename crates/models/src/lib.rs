mod catalog;
mod dag;
mod envelope;
mod operation;
mod plan;
mod source;
mod wire;

pub use catalog::{CatalogError, ResolvedSource, SourceCatalog};
pub use dag::{DagError, OperationDag};
pub use envelope::{
    ExecutionEnvelope, ExecutionReport, ExecutionSummary, OperationDetail, ValidationReport,
};
pub use operation::{
    Complexity, OpMetadata, OpSpec, Operation, OperationStatus, COMPUTE_OPERATION_TYPES,
};
pub use plan::{PlanMetadata, QueryPlan};
pub use source::{DataSource, FieldMeta, SourceKind, TableDescriptor};

/// One result row: a flat map of column/field name to JSON value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Error raised while constructing or checking plan model types.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("unknown backend kind {0:?}")]
    UnknownKind(String),
    #[error("operation {id}: {reason}")]
    InvalidOperation { id: String, reason: String },
    #[error("failed to decode plan document")]
    Decode(#[source] serde_json::Error),
}
