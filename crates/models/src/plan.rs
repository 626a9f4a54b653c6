use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::{OperationDag, Operation, SourceCatalog, ValidationReport};

/// Plan-level metadata. `created_at` renders as ISO-8601 on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanMetadata {
    pub created_at: DateTime<Utc>,
    pub version: String,
    pub question: Option<String>,
    /// When set, this operation's result is the plan's final result.
    pub output_operation_id: Option<String>,
    pub optimization_notes: Option<String>,
    pub extra: BTreeMap<String, Value>,
}

impl Default for PlanMetadata {
    fn default() -> Self {
        Self {
            created_at: Utc::now(),
            version: "1.0".to_string(),
            question: None,
            output_operation_id: None,
            optimization_notes: None,
            extra: BTreeMap::new(),
        }
    }
}

/// QueryPlan is an ordered collection of operations forming a DAG through
/// their `depends_on` references. Its structure is immutable during
/// execution; only per-operation status, result, and timing mutate.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub id: String,
    pub metadata: PlanMetadata,
    pub operations: Vec<Operation>,
}

impl QueryPlan {
    pub fn new(operations: Vec<Operation>, metadata: PlanMetadata) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            metadata,
            operations,
        }
    }

    /// An empty plan annotated with an error, used where planning could
    /// not produce operations but must still return a plan document.
    pub fn empty_with_error(error: impl Into<String>) -> Self {
        let mut metadata = PlanMetadata::default();
        metadata
            .extra
            .insert("error".to_string(), Value::String(error.into()));
        Self::new(Vec::new(), metadata)
    }

    pub fn get_operation(&self, id: &str) -> Option<&Operation> {
        self.operations.iter().find(|op| op.id == id)
    }

    pub fn get_operation_mut(&mut self, id: &str) -> Option<&mut Operation> {
        self.operations.iter_mut().find(|op| op.id == id)
    }

    /// Operations no other operation depends on.
    pub fn leaf_operations(&self) -> Vec<&Operation> {
        self.operations
            .iter()
            .filter(|op| {
                !self
                    .operations
                    .iter()
                    .any(|other| other.depends_on.iter().any(|d| d == &op.id))
            })
            .collect()
    }

    pub fn output_operation(&self) -> Option<&Operation> {
        self.metadata
            .output_operation_id
            .as_deref()
            .and_then(|id| self.get_operation(id))
    }

    /// Validates the plan: non-empty, structurally valid operations,
    /// unique ids, intact `depends_on` references, an acyclic dependency
    /// graph, and source ids which resolve through the catalog.
    pub fn validate(&self, catalog: &dyn SourceCatalog) -> ValidationReport {
        let mut report = ValidationReport::default();

        if self.operations.is_empty() {
            report.push_error("plan has no operations");
            return report;
        }

        for id in self
            .operations
            .iter()
            .map(|op| op.id.as_str())
            .duplicates()
        {
            report.push_error(format!("duplicate operation id {id:?}"));
        }

        for op in &self.operations {
            for error in op.check() {
                report.push_error(error);
            }
            self.validate_sources(op, catalog, &mut report);
        }

        match OperationDag::build(self) {
            Ok(dag) => {
                if let Some(path) = dag.find_cycle() {
                    tracing::warn!(plan = %self.id, path = ?path, "plan has cyclic dependencies");
                    report.push_error(format!("cycle: {}", path.join(" -> ")));
                }
            }
            Err(err) => report.push_error(err.to_string()),
        }

        if let Some(output) = self.metadata.output_operation_id.as_deref() {
            if self.get_operation(output).is_none() {
                report.push_error(format!(
                    "output_operation_id {output:?} does not reference an operation in the plan"
                ));
            }
        }

        report
    }

    fn validate_sources(
        &self,
        op: &Operation,
        catalog: &dyn SourceCatalog,
        report: &mut ValidationReport,
    ) {
        use crate::OpSpec;

        let Some(source_id) = op.source_id.as_deref() else {
            return;
        };
        let resolved = match catalog.resolve_source(source_id) {
            Ok(resolved) => resolved,
            Err(err) => {
                report.push_error(format!("operation {}: {err}", op.id));
                return;
            }
        };
        if let Some(kind) = op.kind {
            if kind != resolved.kind {
                report.push_error(format!(
                    "operation {}: targets a {} source but {} is {}",
                    op.id, kind, resolved.canonical_id, resolved.kind
                ));
                return;
            }
        }

        match &op.spec {
            OpSpec::Sql { query, .. } => {
                match catalog.check_sql(&resolved.canonical_id, query) {
                    Ok(errors) => {
                        for error in errors {
                            report.push_error(format!("operation {}: {error}", op.id));
                        }
                    }
                    Err(err) => report.push_warning(format!("operation {}: {err}", op.id)),
                }
            }
            OpSpec::Mongo { collection, .. } | OpSpec::Vector { collection, .. } => {
                match catalog.check_collection(&resolved.canonical_id, collection) {
                    Ok(true) => {}
                    Ok(false) => report.push_error(format!(
                        "operation {}: collection {collection:?} is not known to source {}",
                        op.id, resolved.canonical_id
                    )),
                    Err(err) => report.push_warning(format!("operation {}: {err}", op.id)),
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{CatalogError, OpSpec, ResolvedSource, SourceKind};
    use serde_json::Map;

    /// A catalog which resolves `postgres_main` and `mongodb_main` and
    /// knows mongodb's `orders` collection.
    struct TestCatalog;

    impl SourceCatalog for TestCatalog {
        fn resolve_source(&self, source_id: &str) -> Result<ResolvedSource, CatalogError> {
            match source_id {
                "postgres_main" => Ok(ResolvedSource {
                    canonical_id: source_id.to_string(),
                    kind: SourceKind::Postgres,
                }),
                "mongodb_main" => Ok(ResolvedSource {
                    canonical_id: source_id.to_string(),
                    kind: SourceKind::MongoDb,
                }),
                other => Err(CatalogError::UnknownSource(other.to_string())),
            }
        }

        fn check_collection(
            &self,
            _source_id: &str,
            collection: &str,
        ) -> Result<bool, CatalogError> {
            Ok(collection == "orders")
        }

        fn check_sql(&self, _source_id: &str, _sql: &str) -> Result<Vec<String>, CatalogError> {
            Ok(Vec::new())
        }
    }

    fn sql_op(id: &str, deps: &[&str]) -> Operation {
        Operation::new(
            id,
            Some(SourceKind::Postgres),
            Some("postgres_main".to_string()),
            OpSpec::Sql {
                query: "SELECT id FROM users".to_string(),
                params: vec![],
            },
        )
        .with_depends_on(deps.iter().copied())
    }

    #[test]
    fn empty_plan_is_invalid() {
        let plan = QueryPlan::new(vec![], PlanMetadata::default());
        let report = plan.validate(&TestCatalog);
        assert!(!report.valid);
        assert_eq!(report.errors, vec!["plan has no operations"]);
    }

    #[test]
    fn valid_plan_passes() {
        let plan = QueryPlan::new(
            vec![sql_op("a", &[]), sql_op("b", &["a"])],
            PlanMetadata::default(),
        );
        let report = plan.validate(&TestCatalog);
        assert!(report.valid, "unexpected errors: {:?}", report.errors);
    }

    #[test]
    fn cycle_is_a_validation_error() {
        let plan = QueryPlan::new(
            vec![sql_op("a", &["c"]), sql_op("b", &["a"]), sql_op("c", &["b"])],
            PlanMetadata::default(),
        );
        let report = plan.validate(&TestCatalog);
        assert!(!report.valid);
        assert!(
            report.errors.iter().any(|e| e.starts_with("cycle: ")),
            "missing cycle error in {:?}",
            report.errors
        );
    }

    #[test]
    fn unknown_source_is_a_validation_error() {
        let mut op = sql_op("a", &[]);
        op.source_id = Some("oracle_main".to_string());
        op.kind = None;
        let plan = QueryPlan::new(vec![op], PlanMetadata::default());
        let report = plan.validate(&TestCatalog);
        assert!(!report.valid);
        assert!(report.errors[0].contains("oracle_main"));
    }

    #[test]
    fn kind_mismatch_is_a_validation_error() {
        let op = Operation::new(
            "a",
            Some(SourceKind::MongoDb),
            Some("postgres_main".to_string()),
            OpSpec::Mongo {
                collection: "orders".to_string(),
                pipeline: vec![],
                filter: Map::new(),
                projection: Map::new(),
            },
        );
        let plan = QueryPlan::new(vec![op], PlanMetadata::default());
        let report = plan.validate(&TestCatalog);
        assert!(!report.valid);
        assert!(report.errors[0].contains("postgres_main"));
    }

    #[test]
    fn unknown_collection_is_a_validation_error() {
        let op = Operation::new(
            "a",
            Some(SourceKind::MongoDb),
            Some("mongodb_main".to_string()),
            OpSpec::Mongo {
                collection: "payments".to_string(),
                pipeline: vec![],
                filter: Map::new(),
                projection: Map::new(),
            },
        );
        let plan = QueryPlan::new(vec![op], PlanMetadata::default());
        let report = plan.validate(&TestCatalog);
        assert!(!report.valid);
        assert!(report.errors[0].contains("payments"));
    }

    #[test]
    fn dangling_output_operation_is_rejected() {
        let mut metadata = PlanMetadata::default();
        metadata.output_operation_id = Some("ghost".to_string());
        let plan = QueryPlan::new(vec![sql_op("a", &[])], metadata);
        let report = plan.validate(&TestCatalog);
        assert!(!report.valid);
        assert!(report.errors[0].contains("ghost"));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let plan = QueryPlan::new(
            vec![sql_op("a", &[]), sql_op("a", &[])],
            PlanMetadata::default(),
        );
        let report = plan.validate(&TestCatalog);
        assert!(!report.valid);
        assert!(report.errors.iter().any(|e| e.contains("duplicate")));
    }

    #[test]
    fn leaf_operations_exclude_depended_upon() {
        let plan = QueryPlan::new(
            vec![sql_op("a", &[]), sql_op("b", &["a"]), sql_op("c", &["a"])],
            PlanMetadata::default(),
        );
        let leaves: Vec<&str> = plan
            .leaf_operations()
            .iter()
            .map(|op| op.id.as_str())
            .collect();
        assert_eq!(leaves, vec!["b", "c"]);
    }
}
