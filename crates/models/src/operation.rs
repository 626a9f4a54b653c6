use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::{ModelError, SourceKind};

/// Operation types which execute in-process rather than against a backend
/// adapter. Operations carrying one of these labels (or no `source_id` at
/// all) are compute nodes: the executor feeds them the results of their
/// dependencies instead of dispatching them to an adapter.
pub const COMPUTE_OPERATION_TYPES: [&str; 5] =
    ["merge", "join", "group_by", "aggregate", "transform"];

/// Status of a single operation within a plan.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl OperationStatus {
    /// Terminal states admit no further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Completed | OperationStatus::Failed)
    }
}

/// Complexity weight governing global admission control.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Complexity {
    Simple,
    #[default]
    Medium,
    Complex,
    Heavy,
}

impl Complexity {
    pub fn weight(&self) -> u32 {
        match self {
            Complexity::Simple => 1,
            Complexity::Medium => 2,
            Complexity::Complex => 3,
            Complexity::Heavy => 4,
        }
    }

    pub fn parse(value: &Value) -> Option<Complexity> {
        match value {
            Value::String(s) => match s.to_ascii_uppercase().as_str() {
                "SIMPLE" => Some(Complexity::Simple),
                "MEDIUM" => Some(Complexity::Medium),
                "COMPLEX" => Some(Complexity::Complex),
                "HEAVY" => Some(Complexity::Heavy),
                _ => None,
            },
            Value::Number(n) => match n.as_u64() {
                Some(1) => Some(Complexity::Simple),
                Some(2) => Some(Complexity::Medium),
                Some(3) => Some(Complexity::Complex),
                Some(4) => Some(Complexity::Heavy),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Common operation metadata: the `operation_type` label, admission
/// weighting, and any free-form fields the planner attached.
#[derive(Debug, Clone, PartialEq)]
pub struct OpMetadata {
    pub operation_type: String,
    pub complexity: Complexity,
    pub priority: i32,
    pub estimated_cost: Option<f64>,
    pub extra: BTreeMap<String, Value>,
}

impl Default for OpMetadata {
    fn default() -> Self {
        Self {
            operation_type: "query".to_string(),
            complexity: Complexity::default(),
            priority: 1,
            estimated_cost: None,
            extra: BTreeMap::new(),
        }
    }
}

impl OpMetadata {
    pub fn from_map(map: &Map<String, Value>) -> Self {
        let mut meta = OpMetadata::default();
        for (key, value) in map {
            match key.as_str() {
                "operation_type" => {
                    if let Some(s) = value.as_str() {
                        meta.operation_type = s.to_string();
                    }
                }
                "complexity" => {
                    if let Some(c) = Complexity::parse(value) {
                        meta.complexity = c;
                    }
                }
                "priority" => {
                    if let Some(p) = value.as_i64() {
                        meta.priority = p as i32;
                    }
                }
                "estimated_cost" => meta.estimated_cost = value.as_f64(),
                _ => {
                    meta.extra.insert(key.clone(), value.clone());
                }
            }
        }
        meta
    }

    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert(
            "operation_type".to_string(),
            Value::String(self.operation_type.clone()),
        );
        map.insert(
            "complexity".to_string(),
            serde_json::to_value(self.complexity).unwrap_or(Value::Null),
        );
        map.insert("priority".to_string(), Value::from(self.priority));
        if let Some(cost) = self.estimated_cost {
            map.insert("estimated_cost".to_string(), Value::from(cost));
        }
        for (key, value) in &self.extra {
            map.insert(key.clone(), value.clone());
        }
        map
    }
}

/// Variant payload of an operation. Shared fields live on [`Operation`];
/// the payload holds only what the targeted backend needs.
#[derive(Debug, Clone, PartialEq)]
pub enum OpSpec {
    Sql {
        query: String,
        params: Vec<Value>,
    },
    Mongo {
        collection: String,
        /// Aggregation pipeline stages. When empty, `filter`/`projection`
        /// describe a find-style query instead.
        pipeline: Vec<Value>,
        filter: Map<String, Value>,
        projection: Map<String, Value>,
    },
    Vector {
        collection: String,
        vector: Vec<f32>,
        filter: Map<String, Value>,
        limit: usize,
    },
    Messaging {
        channel: Option<String>,
        query: Option<String>,
        time_range: Map<String, Value>,
        limit: usize,
    },
    Commerce {
        endpoint: String,
        query_params: Map<String, Value>,
        method: String,
        limit: usize,
    },
    Generic {
        params: Map<String, Value>,
    },
}

impl OpSpec {
    /// Structural checks which require no registry: each variant's
    /// required parameters must be present and well-formed.
    pub fn check(&self) -> Vec<String> {
        let mut errors = Vec::new();
        match self {
            OpSpec::Sql { query, .. } => {
                if query.trim().is_empty() {
                    errors.push("sql operation has an empty query".to_string());
                }
            }
            OpSpec::Mongo { collection, .. } => {
                if collection.is_empty() {
                    errors.push("mongodb operation is missing a collection".to_string());
                }
            }
            OpSpec::Vector {
                collection, vector, ..
            } => {
                if collection.is_empty() {
                    errors.push("vector operation is missing a collection".to_string());
                }
                if vector.is_empty() {
                    errors.push("vector operation has an empty query vector".to_string());
                }
            }
            OpSpec::Messaging { channel, query, .. } => {
                if channel.is_none() && query.as_deref().map_or(true, str::is_empty) {
                    errors
                        .push("messaging operation needs a channel or a search query".to_string());
                }
            }
            OpSpec::Commerce { endpoint, .. } => {
                if endpoint.is_empty() {
                    errors.push("commerce operation is missing an endpoint".to_string());
                }
            }
            OpSpec::Generic { .. } => {}
        }
        errors
    }

    /// Wire parameters of this payload, keyed per the plan JSON contract.
    pub fn to_params(&self) -> Map<String, Value> {
        let mut params = Map::new();
        match self {
            OpSpec::Sql { query, params: binds } => {
                params.insert("query".to_string(), Value::String(query.clone()));
                params.insert("params".to_string(), Value::Array(binds.clone()));
            }
            OpSpec::Mongo {
                collection,
                pipeline,
                filter,
                projection,
            } => {
                params.insert("collection".to_string(), Value::String(collection.clone()));
                if !pipeline.is_empty() {
                    params.insert("pipeline".to_string(), Value::Array(pipeline.clone()));
                } else {
                    params.insert("query".to_string(), Value::Object(filter.clone()));
                    params.insert("projection".to_string(), Value::Object(projection.clone()));
                }
            }
            OpSpec::Vector {
                collection,
                vector,
                filter,
                limit,
            } => {
                params.insert("collection".to_string(), Value::String(collection.clone()));
                params.insert(
                    "vector".to_string(),
                    Value::Array(vector.iter().map(|v| Value::from(*v as f64)).collect()),
                );
                params.insert("filter".to_string(), Value::Object(filter.clone()));
                params.insert("limit".to_string(), Value::from(*limit as u64));
            }
            OpSpec::Messaging {
                channel,
                query,
                time_range,
                limit,
            } => {
                params.insert(
                    "channel".to_string(),
                    channel.clone().map_or(Value::Null, Value::String),
                );
                params.insert(
                    "query".to_string(),
                    query.clone().map_or(Value::Null, Value::String),
                );
                params.insert("time_range".to_string(), Value::Object(time_range.clone()));
                params.insert("limit".to_string(), Value::from(*limit as u64));
            }
            OpSpec::Commerce {
                endpoint,
                query_params,
                method,
                limit,
            } => {
                params.insert("endpoint".to_string(), Value::String(endpoint.clone()));
                params.insert(
                    "query_params".to_string(),
                    Value::Object(query_params.clone()),
                );
                params.insert("method".to_string(), Value::String(method.clone()));
                params.insert("limit".to_string(), Value::from(*limit as u64));
            }
            OpSpec::Generic { params: generic } => {
                params = generic.clone();
            }
        }
        params
    }
}

/// Operation is a single unit of backend (or in-process compute) work
/// within a plan.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub id: String,
    /// Targeted source. `None` for pure compute nodes.
    pub source_id: Option<String>,
    /// Backend kind, when known. Serialized as `db_type`.
    pub kind: Option<SourceKind>,
    pub depends_on: Vec<String>,
    pub metadata: OpMetadata,
    pub spec: OpSpec,
    pub status: OperationStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub execution_time: f64,
}

impl Operation {
    pub fn new(
        id: impl Into<String>,
        kind: Option<SourceKind>,
        source_id: Option<String>,
        spec: OpSpec,
    ) -> Self {
        Self {
            id: id.into(),
            source_id,
            kind,
            depends_on: Vec::new(),
            metadata: OpMetadata::default(),
            spec,
            status: OperationStatus::Pending,
            result: None,
            error: None,
            execution_time: 0.0,
        }
    }

    pub fn with_depends_on(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata(mut self, metadata: OpMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Builds the variant payload for `kind` from loosely-keyed parameters,
    /// accepting the parameter aliases used across planner outputs
    /// (`query`/`sql_query`, `limit`/`top_k`, `channel`/`channels`, ...).
    /// `kind = None` yields a Generic payload carrying the raw parameters.
    pub fn for_kind(
        kind: Option<SourceKind>,
        source_id: Option<String>,
        params: Map<String, Value>,
        id: Option<String>,
        depends_on: Vec<String>,
        metadata: OpMetadata,
    ) -> Result<Operation, ModelError> {
        let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let spec = match kind {
            Some(SourceKind::Postgres) => coerce_sql(&id, &params)?,
            Some(SourceKind::MongoDb) => coerce_mongo(&id, &params)?,
            Some(SourceKind::Qdrant) => coerce_vector(&params),
            Some(SourceKind::Slack) => coerce_messaging(&params),
            Some(SourceKind::Shopify) => coerce_commerce(&params),
            // Analytics sources have no dedicated payload shape yet; their
            // parameters pass through to the adapter untouched.
            Some(SourceKind::Ga4) | None => OpSpec::Generic { params },
        };
        Ok(Operation {
            id,
            source_id,
            kind,
            depends_on,
            metadata,
            spec,
            status: OperationStatus::Pending,
            result: None,
            error: None,
            execution_time: 0.0,
        })
    }

    pub fn weight(&self) -> u32 {
        self.metadata.complexity.weight()
    }

    /// Whether this operation executes in-process, combining the results
    /// of its dependencies rather than querying a backend.
    pub fn is_compute(&self) -> bool {
        match &self.spec {
            OpSpec::Generic { .. } => {
                self.source_id.is_none()
                    || COMPUTE_OPERATION_TYPES.contains(&self.metadata.operation_type.as_str())
            }
            _ => false,
        }
    }

    /// Structural validity of this operation in isolation.
    pub fn check(&self) -> Vec<String> {
        let mut errors: Vec<String> = self
            .spec
            .check()
            .into_iter()
            .map(|e| format!("operation {}: {e}", self.id))
            .collect();
        if self.source_id.is_none() && !self.is_compute() {
            errors.push(format!("operation {}: missing source_id", self.id));
        }
        errors
    }
}

fn string_of(params: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| params.get(*k).and_then(Value::as_str))
        .map(str::to_string)
}

fn object_of(params: &Map<String, Value>, keys: &[&str]) -> Map<String, Value> {
    keys.iter()
        .find_map(|k| params.get(*k).and_then(Value::as_object))
        .cloned()
        .unwrap_or_default()
}

fn array_of(params: &Map<String, Value>, keys: &[&str]) -> Vec<Value> {
    keys.iter()
        .find_map(|k| params.get(*k).and_then(Value::as_array))
        .cloned()
        .unwrap_or_default()
}

fn limit_of(params: &Map<String, Value>, keys: &[&str], default: usize) -> usize {
    keys.iter()
        .find_map(|k| params.get(*k).and_then(Value::as_u64))
        .map(|v| v as usize)
        .unwrap_or(default)
}

fn coerce_sql(id: &str, params: &Map<String, Value>) -> Result<OpSpec, ModelError> {
    let query = string_of(params, &["query", "sql_query", "sql"]).ok_or_else(|| {
        ModelError::InvalidOperation {
            id: id.to_string(),
            reason: "sql operation is missing its query parameter".to_string(),
        }
    })?;
    Ok(OpSpec::Sql {
        query,
        params: array_of(params, &["params", "bind_params"]),
    })
}

fn coerce_mongo(id: &str, params: &Map<String, Value>) -> Result<OpSpec, ModelError> {
    let collection =
        string_of(params, &["collection"]).ok_or_else(|| ModelError::InvalidOperation {
            id: id.to_string(),
            reason: "mongodb operation is missing its collection parameter".to_string(),
        })?;
    Ok(OpSpec::Mongo {
        collection,
        pipeline: array_of(params, &["pipeline"]),
        filter: object_of(params, &["query", "filter"]),
        projection: object_of(params, &["projection"]),
    })
}

fn coerce_vector(params: &Map<String, Value>) -> OpSpec {
    let vector = array_of(params, &["vector", "vector_query"])
        .iter()
        .filter_map(Value::as_f64)
        .map(|v| v as f32)
        .collect();
    OpSpec::Vector {
        collection: string_of(params, &["collection"]).unwrap_or_default(),
        vector,
        filter: object_of(params, &["filter"]),
        limit: limit_of(params, &["limit", "top_k"], 10),
    }
}

fn coerce_messaging(params: &Map<String, Value>) -> OpSpec {
    // Accept either a scalar `channel` or the first entry of a `channels`
    // list, as planner outputs use both shapes.
    let channel = string_of(params, &["channel"]).or_else(|| {
        params
            .get("channels")
            .and_then(Value::as_array)
            .and_then(|list| list.first())
            .and_then(Value::as_str)
            .map(str::to_string)
    });
    OpSpec::Messaging {
        channel,
        query: string_of(params, &["query"]).filter(|q| !q.is_empty()),
        time_range: object_of(params, &["time_range"]),
        limit: limit_of(params, &["limit"], 100),
    }
}

fn coerce_commerce(params: &Map<String, Value>) -> OpSpec {
    OpSpec::Commerce {
        endpoint: string_of(params, &["endpoint"]).unwrap_or_else(|| "orders".to_string()),
        query_params: object_of(params, &["query_params", "params"]),
        method: string_of(params, &["method", "api_method"]).unwrap_or_else(|| "GET".to_string()),
        limit: limit_of(params, &["limit"], 100),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn factory_coerces_sql_aliases() {
        let op = Operation::for_kind(
            Some(SourceKind::Postgres),
            Some("postgres_main".to_string()),
            params(json!({"sql_query": "SELECT 1", "params": [42]})),
            Some("op1".to_string()),
            vec![],
            OpMetadata::default(),
        )
        .unwrap();
        match op.spec {
            OpSpec::Sql { query, params } => {
                assert_eq!(query, "SELECT 1");
                assert_eq!(params, vec![json!(42)]);
            }
            other => panic!("expected sql payload, got {other:?}"),
        }
    }

    #[test]
    fn factory_rejects_sql_without_query() {
        let err = Operation::for_kind(
            Some(SourceKind::Postgres),
            Some("postgres_main".to_string()),
            Map::new(),
            Some("op1".to_string()),
            vec![],
            OpMetadata::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ModelError::InvalidOperation { .. }));
    }

    #[test]
    fn factory_coerces_vector_top_k() {
        let op = Operation::for_kind(
            Some(SourceKind::Qdrant),
            Some("qdrant_main".to_string()),
            params(json!({"collection": "docs", "vector_query": [0.1, 0.2], "top_k": 7})),
            None,
            vec![],
            OpMetadata::default(),
        )
        .unwrap();
        match op.spec {
            OpSpec::Vector { vector, limit, .. } => {
                assert_eq!(vector.len(), 2);
                assert_eq!(limit, 7);
            }
            other => panic!("expected vector payload, got {other:?}"),
        }
    }

    #[test]
    fn factory_takes_first_of_channels_list() {
        let op = Operation::for_kind(
            Some(SourceKind::Slack),
            Some("slack_main".to_string()),
            params(json!({"channels": ["#general", "#random"]})),
            None,
            vec![],
            OpMetadata::default(),
        )
        .unwrap();
        match op.spec {
            OpSpec::Messaging { channel, .. } => assert_eq!(channel.as_deref(), Some("#general")),
            other => panic!("expected messaging payload, got {other:?}"),
        }
    }

    #[test]
    fn structural_checks_flag_empty_payloads() {
        let op = Operation::new(
            "v1",
            Some(SourceKind::Qdrant),
            Some("qdrant_main".to_string()),
            OpSpec::Vector {
                collection: "docs".to_string(),
                vector: vec![],
                filter: Map::new(),
                limit: 10,
            },
        );
        let errors = op.check();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("empty query vector"));
    }

    #[test]
    fn compute_ops_need_no_source() {
        let mut meta = OpMetadata::default();
        meta.operation_type = "join".to_string();
        let op = Operation::new(
            "join1",
            None,
            None,
            OpSpec::Generic { params: Map::new() },
        )
        .with_metadata(meta);
        assert!(op.is_compute());
        assert!(op.check().is_empty());
    }

    #[test]
    fn terminal_states_are_terminal() {
        assert!(!OperationStatus::Pending.is_terminal());
        assert!(!OperationStatus::Running.is_terminal());
        assert!(OperationStatus::Completed.is_terminal());
        assert!(OperationStatus::Failed.is_terminal());
    }
}
