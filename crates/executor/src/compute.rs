//! In-process compute nodes: operations which combine the results of
//! their dependencies through the aggregator instead of querying a
//! backend.

use serde_json::{Map, Value};

use aggregate::{
    rows_of, AggregateError, AggregationSpec, Aggregator, JoinSpec, SourceResult,
};
use models::Row;

/// One dependency's contribution to a compute node. Keyed by the
/// dependency's source id when it has one, falling back to its operation
/// id (for chains of compute nodes).
#[derive(Debug, Clone)]
pub struct DepInput {
    pub op_id: String,
    pub source_id: Option<String>,
    pub result: Value,
}

impl DepInput {
    fn key(&self) -> String {
        self.source_id.clone().unwrap_or_else(|| self.op_id.clone())
    }

    fn to_source_result(&self) -> SourceResult {
        SourceResult::ok(self.key(), rows_of(&self.result))
    }
}

/// Runs one compute node: `strategy` comes from the operation's `params`
/// (falling back to its `operation_type` label), the inputs are its
/// dependencies' results.
pub fn run_compute(
    strategy: &str,
    params: &Map<String, Value>,
    deps: &[DepInput],
    aggregator: &Aggregator,
) -> Result<Value, AggregateError> {
    match strategy {
        "merge" | "aggregate" => {
            let inputs: Vec<SourceResult> =
                deps.iter().map(DepInput::to_source_result).collect();
            to_value(aggregator.merge(&inputs))
        }
        "join" => {
            let spec: JoinSpec = serde_json::from_value(Value::Object(params.clone()))
                .map_err(|err| {
                    AggregateError::InvalidParams(format!("join spec does not parse: {err}"))
                })?;
            let inputs: Vec<SourceResult> =
                deps.iter().map(DepInput::to_source_result).collect();
            to_value(aggregator.join(&inputs, &spec)?)
        }
        "group_by" => {
            let keys = string_list(params, &["keys", "group_by"]).ok_or_else(|| {
                AggregateError::InvalidParams("group_by needs a keys list".to_string())
            })?;
            let aggregations: Vec<AggregationSpec> = params
                .get("aggregations")
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .map_err(|err| {
                    AggregateError::InvalidParams(format!(
                        "aggregation specs do not parse: {err}"
                    ))
                })?
                .unwrap_or_default();
            let rows: Vec<Row> = deps
                .iter()
                .flat_map(|dep| rows_of(&dep.result))
                .collect();
            to_value(aggregator.group_by(&rows, keys, aggregations))
        }
        "transform" => {
            // Pass-through of the dependencies' rows, optionally projected
            // to a field list.
            let fields = string_list(params, &["fields"]);
            let rows: Vec<Row> = deps
                .iter()
                .flat_map(|dep| rows_of(&dep.result))
                .map(|row| match &fields {
                    None => row,
                    Some(fields) => fields
                        .iter()
                        .filter_map(|f| row.get(f).map(|v| (f.clone(), v.clone())))
                        .collect(),
                })
                .collect();
            Ok(Value::Array(rows.into_iter().map(Value::Object).collect()))
        }
        other => Err(AggregateError::UnsupportedStrategy(other.to_string())),
    }
}

fn string_list(params: &Map<String, Value>, keys: &[&str]) -> Option<Vec<String>> {
    keys.iter()
        .find_map(|k| params.get(*k).and_then(Value::as_array))
        .map(|list| {
            list.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
}

fn to_value<T: serde::Serialize>(output: T) -> Result<Value, AggregateError> {
    serde_json::to_value(output)
        .map_err(|err| AggregateError::InvalidParams(format!("output serialization: {err}")))
}
