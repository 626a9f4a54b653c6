use serde::Deserialize;

use models::SourceKind;

fn default_postgres() -> usize {
    8
}
fn default_mongodb() -> usize {
    6
}
fn default_qdrant() -> usize {
    4
}
fn default_slack() -> usize {
    2
}
fn default_shopify() -> usize {
    2
}
fn default_ga4() -> usize {
    1
}
fn default_unknown() -> usize {
    2
}
fn default_max_total_weight() -> u32 {
    24
}
fn default_max_concurrent() -> usize {
    16
}
fn default_timeout() -> u64 {
    60
}
fn default_retries() -> u32 {
    3
}

/// Per-backend admission limits and global executor gates.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_postgres")]
    pub postgres_limit: usize,
    #[serde(default = "default_mongodb")]
    pub mongodb_limit: usize,
    #[serde(default = "default_qdrant")]
    pub qdrant_limit: usize,
    #[serde(default = "default_slack")]
    pub slack_limit: usize,
    #[serde(default = "default_shopify")]
    pub shopify_limit: usize,
    #[serde(default = "default_ga4")]
    pub ga4_limit: usize,
    /// Limit applied to kinds without a dedicated semaphore.
    #[serde(default = "default_unknown")]
    pub unknown_kind_limit: usize,
    /// The total complexity weight of RUNNING operations never exceeds
    /// this bound.
    #[serde(default = "default_max_total_weight")]
    pub max_total_weight: u32,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_operations: usize,
    /// Per-operation deadline covering all retry attempts.
    #[serde(default = "default_timeout")]
    pub operation_timeout_seconds: u64,
    #[serde(default = "default_retries")]
    pub max_retry_attempts: u32,
    #[serde(default)]
    pub tuning: TuningConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            postgres_limit: default_postgres(),
            mongodb_limit: default_mongodb(),
            qdrant_limit: default_qdrant(),
            slack_limit: default_slack(),
            shopify_limit: default_shopify(),
            ga4_limit: default_ga4(),
            unknown_kind_limit: default_unknown(),
            max_total_weight: default_max_total_weight(),
            max_concurrent_operations: default_max_concurrent(),
            operation_timeout_seconds: default_timeout(),
            max_retry_attempts: default_retries(),
            tuning: TuningConfig::default(),
        }
    }
}

impl ExecutorConfig {
    /// The configured semaphore capacity for a backend kind.
    pub fn limit_for(&self, kind: Option<SourceKind>) -> usize {
        match kind {
            Some(SourceKind::Postgres) => self.postgres_limit,
            Some(SourceKind::MongoDb) => self.mongodb_limit,
            Some(SourceKind::Qdrant) => self.qdrant_limit,
            Some(SourceKind::Slack) => self.slack_limit,
            Some(SourceKind::Shopify) => self.shopify_limit,
            Some(SourceKind::Ga4) => self.ga4_limit,
            None => self.unknown_kind_limit,
        }
        .max(1)
    }
}

fn default_tuning_target() -> f64 {
    2.0
}
fn default_tuning_window() -> usize {
    20
}
fn default_tuning_min_samples() -> usize {
    5
}

/// Adaptive tuning of per-kind limits between plan executions.
#[derive(Debug, Clone, Deserialize)]
pub struct TuningConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Duration target; sustained averages above 3x this shrink a kind's
    /// limit, averages below it (with a high success rate) grow it.
    #[serde(default = "default_tuning_target")]
    pub target_duration_seconds: f64,
    #[serde(default = "default_tuning_window")]
    pub window: usize,
    #[serde(default = "default_tuning_min_samples")]
    pub min_samples: usize,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            target_duration_seconds: default_tuning_target(),
            window: default_tuning_window(),
            min_samples: default_tuning_min_samples(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_match_the_documented_limits() {
        let config = ExecutorConfig::default();
        assert_eq!(config.postgres_limit, 8);
        assert_eq!(config.mongodb_limit, 6);
        assert_eq!(config.qdrant_limit, 4);
        assert_eq!(config.slack_limit, 2);
        assert_eq!(config.shopify_limit, 2);
        assert_eq!(config.ga4_limit, 1);
        assert_eq!(config.max_total_weight, 24);
        assert_eq!(config.max_concurrent_operations, 16);
        assert_eq!(config.operation_timeout_seconds, 60);
        assert_eq!(config.max_retry_attempts, 3);
        assert_eq!(config.limit_for(None), 2);
        assert!(!config.tuning.enabled);
    }

    #[test]
    fn partial_documents_fill_in_defaults() {
        let config: ExecutorConfig =
            serde_json::from_value(serde_json::json!({"postgres_limit": 2})).unwrap();
        assert_eq!(config.postgres_limit, 2);
        assert_eq!(config.mongodb_limit, 6);
    }
}
