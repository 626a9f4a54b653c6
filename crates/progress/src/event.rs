use serde::{Deserialize, Serialize};
use serde_json::Value;

use models::SourceKind;

/// The closed set of progress event variants. The wire tag is `type`,
/// snake_cased; kind-specific fields sit beside the common header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Classification of relevant backends has begun.
    Classifying { message: String },
    /// Backends were selected for the question.
    DatabasesSelected {
        databases: Vec<SourceKind>,
        reasoning: String,
        is_cross_database: bool,
    },
    /// Plan synthesis has begun.
    Planning { question: String },
    /// The synthesized plan was validated.
    PlanValidated {
        valid: bool,
        errors: Vec<String>,
        operations: usize,
    },
    /// Schema context retrieval for one backend kind.
    SchemaLoading { database: SourceKind, progress: f64 },
    /// Schema context chunks retrieved for one backend kind.
    SchemaChunks { database: SourceKind, chunks: usize },
    /// A backend query is being generated.
    QueryGenerating { database: SourceKind },
    /// A backend query is being validated.
    QueryValidating { operation_id: String },
    /// A backend query has been dispatched.
    QueryExecuting {
        operation_id: String,
        source_id: Option<String>,
    },
    OperationStarted {
        operation_id: String,
        source_id: Option<String>,
        attempt: u32,
    },
    OperationCompleted {
        operation_id: String,
        rows: usize,
        execution_time: f64,
    },
    OperationFailed {
        operation_id: String,
        error: String,
        error_kind: String,
    },
    /// A chunk of rows arrived before the operation finished.
    PartialResults {
        operation_id: String,
        rows_count: usize,
        chunk_index: usize,
        is_complete: bool,
    },
    /// Periodic executor state snapshot.
    BatchSnapshot {
        pending: usize,
        active: usize,
        completed: usize,
        failed: usize,
    },
    /// Result aggregation has begun.
    Aggregating {
        strategy: String,
        sources: Vec<String>,
    },
    /// Result aggregation finished, with its metrics.
    AggregationComplete {
        rows: usize,
        duration_seconds: f64,
        rows_per_second: f64,
        /// High-water estimate of the in-memory build indexes held during
        /// a join; zero for merges and group-bys, which index nothing.
        memory_bytes: usize,
    },
    /// The executor drained its plan.
    ExecutorComplete {
        successful: usize,
        failed: usize,
        duration_seconds: f64,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<Value>,
    },
    /// The end-to-end request finished.
    Complete { success: bool },
}
