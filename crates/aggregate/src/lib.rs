//! Result aggregation across heterogeneous backends: merge, type-coerced
//! joins, group-by, and a streaming chunked variant.
//!
//! Joins are in-process and in-memory by design. The build side of every
//! join is indexed in memory, so joins scale to what fits; pushing joins
//! into an external engine is explicitly out of scope.

use serde::Deserialize;
use std::sync::Mutex;
use std::time::Duration;

mod cache;
mod coerce;
mod group;
mod join;
mod merge;
mod stream;

pub use coerce::{join_key, value_cmp, values_equal, JoinKey};
pub use group::{
    group_by, AggregationFunction, AggregationSpec, GroupByOutput, GroupByState,
};
pub use join::{
    join, join_with_predicate, JoinMetrics, JoinOutput, JoinSpec, JoinType, KeySpec, TypeMappings,
};
pub use merge::{merge, rows_of, MergeOutput, SourceError, SourceResult, SOURCE_FIELD};
pub use stream::{stream_aggregate, ChunkBatch};

/// Error raised by aggregation operations.
#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    #[error("join requires at least two successful keyed sources, got {0}")]
    NotEnoughSources(usize),
    #[error("no join key is configured for source {0:?}")]
    MissingKeySpec(String),
    #[error("unsupported aggregation strategy {0:?}")]
    UnsupportedStrategy(String),
    #[error("aggregation parameters are invalid: {0}")]
    InvalidParams(String),
}

fn default_chunk_size() -> usize {
    1000
}

fn default_cache_ttl() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregateConfig {
    #[serde(default = "default_chunk_size")]
    pub streaming_chunk_size: usize,
    #[serde(default)]
    pub cache_enabled: bool,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_seconds: u64,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            streaming_chunk_size: default_chunk_size(),
            cache_enabled: false,
            cache_ttl_seconds: default_cache_ttl(),
        }
    }
}

/// Aggregator bundles the aggregation operations with configuration and
/// an optional join cache.
pub struct Aggregator {
    config: AggregateConfig,
    join_cache: Mutex<cache::TtlCache<JoinOutput>>,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(AggregateConfig::default())
    }
}

impl Aggregator {
    pub fn new(config: AggregateConfig) -> Self {
        let ttl = Duration::from_secs(config.cache_ttl_seconds);
        Self {
            config,
            join_cache: Mutex::new(cache::TtlCache::new(ttl)),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.config.streaming_chunk_size
    }

    pub fn merge(&self, inputs: &[SourceResult]) -> MergeOutput {
        merge(inputs)
    }

    pub fn join(
        &self,
        inputs: &[SourceResult],
        spec: &JoinSpec,
    ) -> Result<JoinOutput, AggregateError> {
        if !self.config.cache_enabled {
            return join(inputs, spec);
        }

        let inputs_doc = serde_json::to_string(inputs).unwrap_or_default();
        let spec_doc = serde_json::to_string(spec).unwrap_or_default();
        let key = cache::cache_key(&[&inputs_doc, &spec_doc]);

        if let Ok(mut cache) = self.join_cache.lock() {
            if let Some(hit) = cache.get(key) {
                tracing::debug!(key, "join cache hit");
                return Ok(hit);
            }
        }
        let output = join(inputs, spec)?;
        if let Ok(mut cache) = self.join_cache.lock() {
            cache.put(key, output.clone());
        }
        Ok(output)
    }

    pub fn group_by(
        &self,
        rows: &[models::Row],
        keys: Vec<String>,
        aggregations: Vec<AggregationSpec>,
    ) -> GroupByOutput {
        group_by(rows, keys, aggregations)
    }
}
