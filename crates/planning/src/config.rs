use serde::Deserialize;

fn default_items_per_kind() -> usize {
    5
}
fn default_max_schema_tokens() -> usize {
    4000
}
fn default_temperature() -> f32 {
    0.2
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlanningConfig {
    /// Schema-search results requested per selected backend kind.
    #[serde(default = "default_items_per_kind")]
    pub schema_items_per_kind: usize,
    /// Token budget for the schema context handed to plan synthesis.
    #[serde(default = "default_max_schema_tokens")]
    pub max_schema_tokens: usize,
    #[serde(default = "default_temperature")]
    pub llm_temperature: f32,
    /// Whether plan optimization may issue profiling probes against live
    /// backends. Off by default; probes are capped at two sources.
    #[serde(default)]
    pub gather_statistics: bool,
}

impl Default for PlanningConfig {
    fn default() -> Self {
        Self {
            schema_items_per_kind: default_items_per_kind(),
            max_schema_tokens: default_max_schema_tokens(),
            llm_temperature: default_temperature(),
            gather_statistics: false,
        }
    }
}
