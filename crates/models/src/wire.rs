//! Wire (de)serialization of plans and operations.
//!
//! The JSON contract keeps shared operation fields at the top level, the
//! variant payload under `params`, and the backend kind as `db_type`.
//! Unknown fields are tolerated on input; datetimes render as ISO-8601.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    ModelError, OpMetadata, Operation, OperationStatus, PlanMetadata, QueryPlan, SourceKind,
};

#[derive(Serialize, Deserialize)]
struct OperationDoc {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    source_id: Option<String>,
    #[serde(default)]
    db_type: Option<String>,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    metadata: Map<String, Value>,
    #[serde(default)]
    params: Map<String, Value>,
    #[serde(default)]
    status: Option<OperationStatus>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    execution_time: Option<f64>,
    /// Tolerated unknown fields. Planner outputs sometimes carry variant
    /// parameters at the top level instead of under `params`; these are
    /// folded in as fallbacks during decoding.
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl From<&Operation> for OperationDoc {
    fn from(op: &Operation) -> Self {
        OperationDoc {
            id: Some(op.id.clone()),
            source_id: op.source_id.clone(),
            db_type: op.kind.map(|k| k.as_str().to_string()),
            depends_on: op.depends_on.clone(),
            metadata: op.metadata.to_map(),
            params: op.spec.to_params(),
            status: Some(op.status),
            result: op.result.clone(),
            error: op.error.clone(),
            execution_time: Some(op.execution_time),
            extra: Map::new(),
        }
    }
}

impl TryFrom<OperationDoc> for Operation {
    type Error = ModelError;

    fn try_from(doc: OperationDoc) -> Result<Self, ModelError> {
        let kind = resolve_kind(&doc)?;

        // Variant parameters: top-level leftovers first, overridden by the
        // nested `params` object when both are present.
        let mut params = doc.extra;
        params.remove("type");
        params.extend(doc.params);

        let mut op = Operation::for_kind(
            kind,
            doc.source_id,
            params,
            doc.id,
            doc.depends_on,
            OpMetadata::from_map(&doc.metadata),
        )?;
        op.status = doc.status.unwrap_or_default();
        op.result = doc.result;
        op.error = doc.error;
        op.execution_time = doc.execution_time.unwrap_or(0.0);
        Ok(op)
    }
}

/// Backend kind of a decoded operation: `db_type` when present, otherwise
/// inferred from a legacy `type` class label or the source id prefix.
fn resolve_kind(doc: &OperationDoc) -> Result<Option<SourceKind>, ModelError> {
    if let Some(db_type) = doc.db_type.as_deref() {
        return db_type.parse().map(Some);
    }
    if let Some(label) = doc.extra.get("type").and_then(Value::as_str) {
        for (needle, kind) in [
            ("Sql", SourceKind::Postgres),
            ("Mongo", SourceKind::MongoDb),
            ("Qdrant", SourceKind::Qdrant),
            ("Vector", SourceKind::Qdrant),
            ("Slack", SourceKind::Slack),
            ("Shopify", SourceKind::Shopify),
        ] {
            if label.contains(needle) {
                return Ok(Some(kind));
            }
        }
    }
    if let Some(source_id) = doc.source_id.as_deref() {
        let prefix = source_id
            .split(|c| c == '_' || c == ':')
            .next()
            .unwrap_or(source_id);
        if let Ok(kind) = prefix.parse() {
            return Ok(Some(kind));
        }
    }
    Ok(None)
}

impl Serialize for Operation {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        OperationDoc::from(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Operation {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let doc = OperationDoc::deserialize(deserializer)?;
        Operation::try_from(doc).map_err(serde::de::Error::custom)
    }
}

#[derive(Serialize, Deserialize)]
struct PlanDoc {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    metadata: Map<String, Value>,
    #[serde(default)]
    operations: Vec<OperationDoc>,
    #[serde(flatten)]
    _extra: Map<String, Value>,
}

impl PlanMetadata {
    pub fn from_map(map: &Map<String, Value>) -> Self {
        let mut meta = PlanMetadata::default();
        for (key, value) in map {
            match key.as_str() {
                "created_at" => {
                    if let Some(ts) = value
                        .as_str()
                        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    {
                        meta.created_at = ts.with_timezone(&Utc);
                    }
                }
                "version" => {
                    if let Some(v) = value.as_str() {
                        meta.version = v.to_string();
                    }
                }
                "question" | "original_question" => {
                    meta.question = value.as_str().map(str::to_string);
                }
                "output_operation_id" => {
                    meta.output_operation_id = value.as_str().map(str::to_string);
                }
                "optimization_notes" => {
                    meta.optimization_notes = value.as_str().map(str::to_string);
                }
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
            "created_at".to_string(),
            Value::String(self.created_at.to_rfc3339()),
        );
        map.insert("version".to_string(), Value::String(self.version.clone()));
        if let Some(question) = &self.question {
            map.insert("question".to_string(), Value::String(question.clone()));
        }
        if let Some(output) = &self.output_operation_id {
            map.insert(
                "output_operation_id".to_string(),
                Value::String(output.clone()),
            );
        }
        if let Some(notes) = &self.optimization_notes {
            map.insert(
                "optimization_notes".to_string(),
                Value::String(notes.clone()),
            );
        }
        for (key, value) in &self.extra {
            map.insert(key.clone(), value.clone());
        }
        map
    }
}

impl Serialize for QueryPlan {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let doc = PlanDoc {
            id: Some(self.id.clone()),
            metadata: self.metadata.to_map(),
            operations: self.operations.iter().map(OperationDoc::from).collect(),
            _extra: Map::new(),
        };
        doc.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for QueryPlan {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let doc = PlanDoc::deserialize(deserializer)?;
        let mut operations = Vec::with_capacity(doc.operations.len());
        for op_doc in doc.operations {
            operations.push(Operation::try_from(op_doc).map_err(serde::de::Error::custom)?);
        }
        Ok(QueryPlan {
            id: doc
                .id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            metadata: PlanMetadata::from_map(&doc.metadata),
            operations,
        })
    }
}

impl QueryPlan {
    /// Decodes a plan from a planner-produced JSON document, tolerating
    /// unknown fields and parameter-alias variations.
    pub fn from_value(value: Value) -> Result<QueryPlan, ModelError> {
        serde_json::from_value(value).map_err(ModelError::Decode)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
