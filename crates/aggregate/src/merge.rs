use serde::{Deserialize, Serialize};
use serde_json::Value;

use models::{Row, SourceKind};

/// The rows one source contributed to an aggregation, or its failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceResult {
    pub source_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<SourceKind>,
    pub success: bool,
    #[serde(default)]
    pub rows: Vec<Row>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SourceResult {
    pub fn ok(source_id: impl Into<String>, rows: Vec<Row>) -> Self {
        Self {
            source_id: source_id.into(),
            kind: None,
            success: true,
            rows,
            error: None,
        }
    }

    pub fn failed(source_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            kind: None,
            success: false,
            rows: Vec::new(),
            error: Some(error.into()),
        }
    }

    /// Builds a result from a JSON value holding either an array of rows
    /// or a single object.
    pub fn from_value(source_id: impl Into<String>, value: &Value) -> Self {
        let rows = rows_of(value);
        Self::ok(source_id, rows)
    }
}

/// Rows contained in an operation result value: an array of objects, a
/// single object, or nothing.
pub fn rows_of(value: &Value) -> Vec<Row> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Object(map) => map.clone(),
                other => Row::from_iter([("value".to_string(), other.clone())]),
            })
            .collect(),
        Value::Object(map) => {
            // Executor results wrap rows as {"rows": [...]}.
            if let Some(Value::Array(_)) = map.get("rows") {
                return rows_of(&map["rows"]);
            }
            vec![map.clone()]
        }
        Value::Null => Vec::new(),
        other => vec![Row::from_iter([("value".to_string(), other.clone())])],
    }
}

/// A failure record preserved alongside merged rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceError {
    pub source_id: String,
    pub error: String,
}

/// Result of a merge aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeOutput {
    pub success: bool,
    pub sources_queried: usize,
    pub successful_sources: usize,
    pub failed_sources: usize,
    pub total_rows: usize,
    pub rows: Vec<Row>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<SourceError>,
}

/// Field under which each merged row carries its origin.
pub const SOURCE_FIELD: &str = "_source_id";

/// Concatenates rows from every successful source, annotating each row
/// with its origin source id. Failures are preserved as records, not
/// silently dropped.
pub fn merge(inputs: &[SourceResult]) -> MergeOutput {
    let mut rows = Vec::new();
    let mut errors = Vec::new();
    let mut successful = 0;

    for input in inputs {
        if !input.success {
            errors.push(SourceError {
                source_id: input.source_id.clone(),
                error: input
                    .error
                    .clone()
                    .unwrap_or_else(|| "unknown failure".to_string()),
            });
            continue;
        }
        successful += 1;
        for row in &input.rows {
            let mut row = row.clone();
            row.insert(
                SOURCE_FIELD.to_string(),
                Value::String(input.source_id.clone()),
            );
            rows.push(row);
        }
    }

    tracing::debug!(
        sources = inputs.len(),
        successful,
        rows = rows.len(),
        "merged source results"
    );
    MergeOutput {
        success: successful > 0,
        sources_queried: inputs.len(),
        successful_sources: successful,
        failed_sources: inputs.len() - successful,
        total_rows: rows.len(),
        rows,
        errors,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn rows(value: Value) -> Vec<Row> {
        rows_of(&value)
    }

    #[test]
    fn merge_annotates_origin_and_keeps_failures() {
        let output = merge(&[
            SourceResult::ok("postgres_main", rows(json!([{"id": 1}, {"id": 2}]))),
            SourceResult::ok("mongodb_main", rows(json!([{"_id": "a"}]))),
            SourceResult::failed("slack_main", "rate limited"),
        ]);

        assert!(output.success);
        assert_eq!(output.sources_queried, 3);
        assert_eq!(output.successful_sources, 2);
        assert_eq!(output.failed_sources, 1);
        assert_eq!(output.total_rows, 3);
        assert_eq!(output.rows[0][SOURCE_FIELD], json!("postgres_main"));
        assert_eq!(output.rows[2][SOURCE_FIELD], json!("mongodb_main"));
        assert_eq!(
            output.errors,
            vec![SourceError {
                source_id: "slack_main".to_string(),
                error: "rate limited".to_string(),
            }]
        );
    }

    #[test]
    fn merge_of_only_failures_is_unsuccessful() {
        let output = merge(&[SourceResult::failed("postgres_main", "down")]);
        assert!(!output.success);
        assert_eq!(output.total_rows, 0);
    }

    #[test]
    fn rows_of_accepts_wrapped_and_scalar_shapes() {
        assert_eq!(rows(json!([{"a": 1}])).len(), 1);
        assert_eq!(rows(json!({"rows": [{"a": 1}, {"a": 2}]})).len(), 2);
        assert_eq!(rows(json!({"a": 1})).len(), 1);
        assert_eq!(rows(json!(null)).len(), 0);
        assert_eq!(rows(json!([1, 2]))[0]["value"], json!(1));
    }
}
