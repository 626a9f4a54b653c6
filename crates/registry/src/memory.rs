//! An in-memory, read-mostly registry.
//!
//! Lookups read a shared snapshot; `refresh` swaps the snapshot under a
//! single writer. Schema search runs over a term index derived from the
//! registered tables plus any seeded documents; production deployments
//! substitute a registry backed by a real vector index behind the same
//! trait.

use async_trait::async_trait;
use itertools::Itertools;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use crate::{
    keywords, normalize_source_id, referenced_tables, RegistryError, SchemaHit, SchemaRegistry,
    SqlCheck,
};
use models::{
    CatalogError, DataSource, ResolvedSource, SourceCatalog, SourceKind, TableDescriptor,
};

/// A free-form schema document to index for search, beyond what the
/// registered tables derive.
#[derive(Debug, Clone, Deserialize)]
pub struct SchemaDocument {
    pub kind: SourceKind,
    pub content: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

/// Seed document for a [`MemoryRegistry`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistrySeed {
    #[serde(default)]
    pub sources: Vec<DataSource>,
    #[serde(default)]
    pub tables: Vec<TableDescriptor>,
    #[serde(default)]
    pub documents: Vec<SchemaDocument>,
}

struct IndexEntry {
    kind: SourceKind,
    content: String,
    terms: BTreeSet<String>,
    metadata: BTreeMap<String, Value>,
}

struct Snapshot {
    sources: BTreeMap<String, DataSource>,
    tables: BTreeMap<String, BTreeMap<String, TableDescriptor>>,
    index: Vec<IndexEntry>,
}

/// MemoryRegistry serves reads from a cached snapshot and supports
/// wholesale refresh.
pub struct MemoryRegistry {
    inner: RwLock<Snapshot>,
}

impl MemoryRegistry {
    pub fn new(seed: RegistrySeed) -> Self {
        Self {
            inner: RwLock::new(Snapshot::build(seed)),
        }
    }

    /// Replaces the cached snapshot. Readers observe either the old or
    /// the new snapshot, never a mix.
    pub fn refresh(&self, seed: RegistrySeed) {
        let snapshot = Snapshot::build(seed);
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = snapshot;
        tracing::info!("schema registry snapshot refreshed");
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Snapshot> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl Snapshot {
    fn build(seed: RegistrySeed) -> Self {
        let sources: BTreeMap<String, DataSource> = seed
            .sources
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();

        let mut tables: BTreeMap<String, BTreeMap<String, TableDescriptor>> = BTreeMap::new();
        let mut index = Vec::new();

        for table in seed.tables {
            if let Some(source) = sources.get(&table.source_id) {
                index.push(IndexEntry::from_table(source.kind, &table));
            }
            tables
                .entry(table.source_id.clone())
                .or_default()
                .insert(table.name.clone(), table);
        }
        for doc in seed.documents {
            index.push(IndexEntry {
                kind: doc.kind,
                terms: terms_of(&doc.content),
                content: doc.content,
                metadata: doc.metadata,
            });
        }

        Self {
            sources,
            tables,
            index,
        }
    }
}

impl IndexEntry {
    fn from_table(kind: SourceKind, table: &TableDescriptor) -> Self {
        let object_label = match kind {
            SourceKind::Postgres => "TABLE",
            SourceKind::MongoDb | SourceKind::Qdrant => "COLLECTION",
            SourceKind::Slack => "CHANNEL",
            SourceKind::Shopify => "ENDPOINT",
            SourceKind::Ga4 => "REPORT",
        };
        let fields = table
            .fields
            .iter()
            .map(|(name, meta)| {
                if meta.primary_key {
                    format!("{name} {} primary key", meta.data_type)
                } else {
                    format!("{name} {}", meta.data_type)
                }
            })
            .join(", ");
        let content = format!("{object_label}: {} ({fields})", table.name);

        let metadata = BTreeMap::from([
            ("db_type".to_string(), Value::String(kind.as_str().into())),
            (
                "source_id".to_string(),
                Value::String(table.source_id.clone()),
            ),
            ("table".to_string(), Value::String(table.name.clone())),
        ]);
        Self {
            kind,
            terms: terms_of(&content),
            content,
            metadata,
        }
    }

    fn score(&self, question_terms: &BTreeSet<String>, question: &str) -> f64 {
        let overlap = self.terms.intersection(question_terms).count() as f64;
        let name_bonus = self
            .metadata
            .get("table")
            .and_then(Value::as_str)
            .map_or(0.0, |name| {
                if question.contains(&name.to_ascii_lowercase()) {
                    1.0
                } else {
                    0.0
                }
            });
        overlap + name_bonus
    }
}

fn terms_of(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(str::to_ascii_lowercase)
        .collect()
}

impl SourceCatalog for MemoryRegistry {
    fn resolve_source(&self, source_id: &str) -> Result<ResolvedSource, CatalogError> {
        normalize_source_id(source_id, &self.read().sources)
    }

    fn check_collection(&self, source_id: &str, collection: &str) -> Result<bool, CatalogError> {
        let snapshot = self.read();
        if !snapshot.sources.contains_key(source_id) {
            return Err(CatalogError::UnknownSource(source_id.to_string()));
        }
        match snapshot.tables.get(source_id) {
            // A source with no registered objects cannot be checked.
            None => Ok(true),
            Some(tables) => Ok(tables.contains_key(collection)),
        }
    }

    fn check_sql(&self, source_id: &str, sql: &str) -> Result<Vec<String>, CatalogError> {
        let snapshot = self.read();
        if !snapshot.sources.contains_key(source_id) {
            return Err(CatalogError::UnknownSource(source_id.to_string()));
        }
        let Some(tables) = snapshot.tables.get(source_id) else {
            return Ok(Vec::new());
        };
        let known: BTreeSet<String> = tables.keys().map(|k| k.to_ascii_lowercase()).collect();
        Ok(referenced_tables(sql)
            .into_iter()
            .filter(|table| !known.contains(table))
            .map(|table| format!("SQL references unknown table {table:?}"))
            .collect())
    }
}

#[async_trait]
impl SchemaRegistry for MemoryRegistry {
    fn list_sources(&self) -> Vec<DataSource> {
        self.read().sources.values().cloned().collect()
    }

    fn get_source(&self, id: &str) -> Option<DataSource> {
        self.read().sources.get(id).cloned()
    }

    fn list_tables(&self, source_id: &str) -> Result<Vec<String>, RegistryError> {
        let snapshot = self.read();
        if !snapshot.sources.contains_key(source_id) {
            return Err(RegistryError::UnknownSource(source_id.to_string()));
        }
        Ok(snapshot
            .tables
            .get(source_id)
            .map(|tables| tables.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn get_table(&self, source_id: &str, name: &str) -> Option<TableDescriptor> {
        self.read()
            .tables
            .get(source_id)
            .and_then(|tables| tables.get(name))
            .cloned()
    }

    fn validate_sql(&self, source_id: &str, sql: &str) -> Result<SqlCheck, RegistryError> {
        match self.check_sql(source_id, sql) {
            Ok(errors) => Ok(SqlCheck {
                valid: errors.is_empty(),
                errors,
            }),
            Err(CatalogError::UnknownSource(id)) => Err(RegistryError::UnknownSource(id)),
            Err(err) => Err(RegistryError::UnknownSource(err.to_string())),
        }
    }

    fn validate_collection(&self, source_id: &str, name: &str) -> Result<bool, RegistryError> {
        match self.check_collection(source_id, name) {
            Ok(known) => Ok(known),
            Err(CatalogError::UnknownSource(id)) => Err(RegistryError::UnknownSource(id)),
            Err(err) => Err(RegistryError::UnknownSource(err.to_string())),
        }
    }

    fn recommend_sources(&self, question: &str) -> BTreeSet<String> {
        let snapshot = self.read();
        let question = question.to_ascii_lowercase();
        let mut recommended = BTreeSet::new();

        // Explicit kind mentions pin the selection.
        for source in snapshot.sources.values() {
            if question.contains(source.kind.as_str()) {
                recommended.insert(source.id.clone());
            }
        }
        // Direct table mentions select the owning source.
        for (source_id, tables) in &snapshot.tables {
            if tables
                .keys()
                .any(|name| question.contains(&name.to_ascii_lowercase()))
            {
                recommended.insert(source_id.clone());
            }
        }
        // Keyword vocabularies: two hits select a kind outright; a single
        // hit only counts when nothing stronger matched.
        for threshold in [2, 1] {
            if !recommended.is_empty() {
                break;
            }
            for source in snapshot.sources.values() {
                if keywords::keyword_hits(&question, source.kind) >= threshold {
                    recommended.insert(source.id.clone());
                }
            }
        }

        tracing::debug!(?recommended, "rule-based source recommendation");
        recommended
    }

    async fn schema_search(
        &self,
        question: &str,
        kind: Option<SourceKind>,
        top_k: usize,
    ) -> Result<Vec<SchemaHit>, RegistryError> {
        let snapshot = self.read();
        let question = question.to_ascii_lowercase();
        let question_terms = terms_of(&question);

        let mut hits: Vec<SchemaHit> = snapshot
            .index
            .iter()
            .filter(|entry| kind.map_or(true, |k| entry.kind == k))
            .map(|entry| SchemaHit {
                score: entry.score(&question_terms, &question),
                content: entry.content.clone(),
                metadata: entry.metadata.clone(),
            })
            .filter(|hit| hit.score > 0.0)
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.content.cmp(&b.content))
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    fn as_catalog(&self) -> &dyn SourceCatalog {
        self
    }
}
