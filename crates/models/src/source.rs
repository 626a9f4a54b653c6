use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ModelError;

/// SourceKind is the type of an external data system.
///
/// Kinds are a closed set: plans referencing a kind outside of this
/// enumeration fail validation rather than falling back to a dynamically
/// registered variant.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[serde(alias = "postgresql")]
    Postgres,
    #[serde(alias = "mongo")]
    MongoDb,
    Qdrant,
    Slack,
    Shopify,
    Ga4,
}

impl SourceKind {
    pub const ALL: [SourceKind; 6] = [
        SourceKind::Postgres,
        SourceKind::MongoDb,
        SourceKind::Qdrant,
        SourceKind::Slack,
        SourceKind::Shopify,
        SourceKind::Ga4,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Postgres => "postgres",
            SourceKind::MongoDb => "mongodb",
            SourceKind::Qdrant => "qdrant",
            SourceKind::Slack => "slack",
            SourceKind::Shopify => "shopify",
            SourceKind::Ga4 => "ga4",
        }
    }

    /// The canonical source id for this kind's default tag, e.g. `postgres_main`.
    pub fn default_source_id(&self) -> String {
        format!("{}_main", self.as_str())
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SourceKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(SourceKind::Postgres),
            "mongodb" | "mongo" => Ok(SourceKind::MongoDb),
            "qdrant" => Ok(SourceKind::Qdrant),
            "slack" => Ok(SourceKind::Slack),
            "shopify" => Ok(SourceKind::Shopify),
            "ga4" => Ok(SourceKind::Ga4),
            other => Err(ModelError::UnknownKind(other.to_string())),
        }
    }
}

/// DataSource is the identity of one registered backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    /// Stable identifier, canonically `{kind}_{tag}` (e.g. `postgres_main`).
    pub id: String,
    #[serde(rename = "type")]
    pub kind: SourceKind,
    /// Opaque connection URI, resolved by the adapter layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_uri: Option<String>,
}

/// FieldMeta describes one field of a queryable object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldMeta {
    pub data_type: String,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub indexed: bool,
    /// Kind-specific extensions, such as vector dimension and distance
    /// metric for vector collections.
    #[serde(flatten, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

/// TableDescriptor is one queryable object (table, collection, channel,
/// endpoint) within a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub source_id: String,
    pub name: String,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldMeta>,
}

impl TableDescriptor {
    pub fn primary_key(&self) -> Option<&str> {
        self.fields
            .iter()
            .find(|(_, meta)| meta.primary_key)
            .map(|(name, _)| name.as_str())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kind_round_trips_through_wire_names() {
        for kind in SourceKind::ALL {
            let encoded = serde_json::to_string(&kind).unwrap();
            let decoded: SourceKind = serde_json::from_str(&encoded).unwrap();
            assert_eq!(kind, decoded);
            assert_eq!(encoded.trim_matches('"'), kind.as_str());
        }
    }

    #[test]
    fn kind_accepts_aliases() {
        assert_eq!(
            "postgresql".parse::<SourceKind>().unwrap(),
            SourceKind::Postgres
        );
        assert_eq!("mongo".parse::<SourceKind>().unwrap(), SourceKind::MongoDb);
        assert!("cassandra".parse::<SourceKind>().is_err());
    }

    #[test]
    fn table_primary_key_lookup() {
        let table: TableDescriptor = serde_json::from_value(serde_json::json!({
            "source_id": "postgres_main",
            "name": "users",
            "fields": {
                "id": {"data_type": "integer", "primary_key": true, "indexed": true},
                "name": {"data_type": "text", "nullable": true},
            }
        }))
        .unwrap();
        assert_eq!(table.primary_key(), Some("id"));
    }
}
