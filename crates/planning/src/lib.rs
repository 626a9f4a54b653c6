//! The planning pipeline: classify relevant backends, retrieve schema
//! context, synthesize a plan through the LLM port, validate it against
//! the registry, and optionally optimize it.
//!
//! Planning never fails out of its public entry point: every path
//! returns a (possibly empty) plan plus a validation report. LLM calls
//! retry once on parse failure, then fall back to the rule-based
//! classifier where one exists.

use serde_json::{json, Value};
use std::sync::Arc;

use connectors::AdapterFactory;
use llm::{LlmClient, LlmError, TemplateEngine};
use models::{
    Operation, PlanMetadata, QueryPlan, SourceKind, ValidationReport,
};
use progress::{EventKind, ProgressBus};
use registry::{SchemaHit, SchemaRegistry};

mod config;
pub use config::PlanningConfig;

/// PlanningAgent owns the classify / retrieve / synthesize / validate /
/// optimize sequence for one deployment's ports.
pub struct PlanningAgent {
    config: PlanningConfig,
    llm: Arc<dyn LlmClient>,
    registry: Arc<dyn SchemaRegistry>,
    templates: TemplateEngine,
    /// Present only when optimization statistics probes are permitted.
    factory: Option<Arc<AdapterFactory>>,
    bus: ProgressBus,
}

impl PlanningAgent {
    pub fn new(
        config: PlanningConfig,
        llm: Arc<dyn LlmClient>,
        registry: Arc<dyn SchemaRegistry>,
        factory: Option<Arc<AdapterFactory>>,
        bus: ProgressBus,
    ) -> Self {
        Self {
            config,
            llm,
            registry,
            templates: TemplateEngine::new(),
            factory,
            bus,
        }
    }

    /// Creates a validated plan for `question`. Always returns a plan
    /// document and a report; an unusable question yields an empty plan
    /// with the reason in the report.
    #[tracing::instrument(skip_all, fields(question = %question))]
    pub async fn create_plan(
        &self,
        question: &str,
        optimize: bool,
    ) -> (QueryPlan, ValidationReport) {
        let mut report = ValidationReport::default();

        self.bus.publish(EventKind::Classifying {
            message: "determining relevant backends".to_string(),
        });
        let (kinds, reasoning) = self.classify(question, &mut report).await;
        if kinds.is_empty() {
            report.push_error("no relevant data sources identified for this question");
            let plan = QueryPlan::empty_with_error("no relevant data sources identified");
            return (plan, report);
        }
        self.bus.publish(EventKind::DatabasesSelected {
            databases: kinds.clone(),
            reasoning,
            is_cross_database: kinds.len() > 1,
        });

        let context = self.schema_context(question, &kinds).await;

        self.bus.publish(EventKind::Planning {
            question: question.to_string(),
        });
        let (mut plan, synth_errors) = match self.synthesize(question, &kinds, &context).await {
            Ok(parsed) => parsed,
            Err(err) => {
                report.push_error(format!("plan synthesis failed: {err}"));
                let plan = QueryPlan::empty_with_error("plan synthesis failed");
                return (plan, report);
            }
        };
        for error in synth_errors {
            report.push_error(error);
        }
        plan.metadata.question = Some(question.to_string());

        for op in &plan.operations {
            self.bus.publish(EventKind::QueryValidating {
                operation_id: op.id.clone(),
            });
        }
        report.merge(plan.validate(self.registry.as_catalog()));
        self.bus.publish(EventKind::PlanValidated {
            valid: report.valid,
            errors: report.errors.clone(),
            operations: plan.operations.len(),
        });
        if !report.valid {
            return (plan, report);
        }
        self.canonicalize_sources(&mut plan);

        if optimize {
            let (optimized, optimized_report) = self.optimize(plan, question).await;
            return (optimized, {
                let mut merged = report;
                merged.merge(optimized_report);
                merged
            });
        }

        (plan, report)
    }

    /// Backend kinds relevant to the question, via the classification
    /// template with a rule-based fallback.
    async fn classify(
        &self,
        question: &str,
        report: &mut ValidationReport,
    ) -> (Vec<SourceKind>, String) {
        let known: Vec<&str> = SourceKind::ALL.iter().map(SourceKind::as_str).collect();
        let prompt = match self.templates.render(
            "schema_classifier",
            &json!({"question": question, "kinds": known}),
        ) {
            Ok(prompt) => prompt,
            Err(err) => {
                report.push_warning(format!("classification template failed: {err}"));
                return (self.rule_based_kinds(question), "rule-based".to_string());
            }
        };

        match self.complete_json_with_retry(&prompt).await {
            Ok(value) => {
                let selected = value
                    .get("selected_databases")
                    .or_else(|| value.get("selected_kinds"))
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let mut kinds = Vec::new();
                for entry in selected.iter().filter_map(Value::as_str) {
                    match entry.parse::<SourceKind>() {
                        Ok(kind) if !kinds.contains(&kind) => kinds.push(kind),
                        Ok(_) => {}
                        Err(_) => report.push_warning(format!(
                            "classifier selected unknown backend kind {entry:?}"
                        )),
                    }
                }
                if kinds.is_empty() {
                    tracing::warn!("classifier returned no kinds; using rule-based fallback");
                    return (self.rule_based_kinds(question), "rule-based".to_string());
                }
                let reasoning = value
                    .get("rationale")
                    .map(Value::to_string)
                    .unwrap_or_default();
                (kinds, reasoning)
            }
            Err(err) => {
                tracing::warn!(error = %err, "classification failed; using rule-based fallback");
                report.push_warning(format!("llm classification failed: {err}"));
                (self.rule_based_kinds(question), "rule-based".to_string())
            }
        }
    }

    /// Keyword, table-mention, and explicit-kind recommendation through
    /// the registry, mapped to backend kinds.
    fn rule_based_kinds(&self, question: &str) -> Vec<SourceKind> {
        let mut kinds = Vec::new();
        for source_id in self.registry.recommend_sources(question) {
            if let Some(source) = self.registry.get_source(&source_id) {
                if !kinds.contains(&source.kind) {
                    kinds.push(source.kind);
                }
            }
        }
        kinds
    }

    /// Schema context for plan synthesis: per-kind search results,
    /// deduplicated and trimmed to the configured token budget by
    /// highest score first.
    async fn schema_context(&self, question: &str, kinds: &[SourceKind]) -> Vec<SchemaHit> {
        let mut hits = Vec::new();
        for (i, &kind) in kinds.iter().enumerate() {
            self.bus.publish(EventKind::SchemaLoading {
                database: kind,
                progress: i as f64 / kinds.len() as f64,
            });
            match self
                .registry
                .schema_search(question, Some(kind), self.config.schema_items_per_kind)
                .await
            {
                Ok(found) => {
                    self.bus.publish(EventKind::SchemaChunks {
                        database: kind,
                        chunks: found.len(),
                    });
                    hits.extend(found);
                }
                Err(err) => {
                    tracing::warn!(kind = %kind, error = %err, "schema search failed");
                }
            }
        }

        let mut seen = std::collections::BTreeSet::new();
        hits.retain(|hit| seen.insert(hit.content.clone()));
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        // Roughly four characters per token.
        let mut budget = self.config.max_schema_tokens * 4;
        hits.retain(|hit| {
            if hit.content.len() <= budget {
                budget -= hit.content.len();
                true
            } else {
                false
            }
        });
        hits
    }

    async fn synthesize(
        &self,
        question: &str,
        kinds: &[SourceKind],
        context: &[SchemaHit],
    ) -> Result<(QueryPlan, Vec<String>), LlmError> {
        for &kind in kinds {
            self.bus.publish(EventKind::QueryGenerating { database: kind });
        }
        let prompt = self.templates.render(
            "orchestration_plan",
            &json!({
                "question": question,
                "candidates": kinds.iter().map(SourceKind::as_str).collect::<Vec<_>>(),
                "schema_context": context,
            }),
        )?;
        let value = self.complete_json_with_retry(&prompt).await?;
        Ok(plan_from_value(value))
    }

    /// Best-effort plan optimization. Any failure, parse error, or
    /// invalid result returns the pre-optimization plan untouched.
    async fn optimize(
        &self,
        plan: QueryPlan,
        question: &str,
    ) -> (QueryPlan, ValidationReport) {
        let mut report = ValidationReport::default();

        let schemas = self.schema_summary(&plan);
        let statistics = if self.config.gather_statistics {
            self.gather_statistics(&plan).await
        } else {
            Value::Null
        };

        let prompt = match self.templates.render(
            "plan_optimization",
            &json!({
                "plan": serde_json::to_string_pretty(&plan).unwrap_or_default(),
                "schemas": schemas,
                "statistics": statistics,
            }),
        ) {
            Ok(prompt) => prompt,
            Err(err) => {
                report.push_warning(format!("optimization skipped: {err}"));
                return (plan, report);
            }
        };

        let value = match self.complete_json_with_retry(&prompt).await {
            Ok(value) => value,
            Err(err) => {
                report.push_warning(format!("optimization skipped: {err}"));
                return (plan, report);
            }
        };
        let (mut optimized, errors) = plan_from_value(value);
        if !errors.is_empty() {
            report.push_warning(format!(
                "optimized plan had invalid operations; keeping the original ({})",
                errors.join("; ")
            ));
            return (plan, report);
        }
        optimized.metadata.question = Some(question.to_string());

        let validation = optimized.validate(self.registry.as_catalog());
        if !validation.valid {
            report.push_warning(format!(
                "optimized plan failed validation; keeping the original ({})",
                validation.errors.join("; ")
            ));
            return (plan, report);
        }
        if let Some(notes) = &optimized.metadata.optimization_notes {
            tracing::info!(notes = %notes, "plan optimization applied");
        }
        self.canonicalize_sources(&mut optimized);
        (optimized, report)
    }

    fn schema_summary(&self, plan: &QueryPlan) -> Value {
        let mut summary = serde_json::Map::new();
        for op in &plan.operations {
            let Some(source_id) = op.source_id.as_deref() else {
                continue;
            };
            if summary.contains_key(source_id) {
                continue;
            }
            let tables = self.registry.list_tables(source_id).unwrap_or_default();
            let descriptors: Vec<Value> = tables
                .iter()
                .filter_map(|name| self.registry.get_table(source_id, name))
                .filter_map(|table| serde_json::to_value(table).ok())
                .collect();
            summary.insert(source_id.to_string(), Value::Array(descriptors));
        }
        Value::Object(summary)
    }

    /// Light profiling through adapter introspection, bounded to two
    /// sources. Failures are ignored: statistics are advisory.
    async fn gather_statistics(&self, plan: &QueryPlan) -> Value {
        let Some(factory) = &self.factory else {
            return Value::Null;
        };
        let mut stats = serde_json::Map::new();
        for op in &plan.operations {
            if stats.len() >= 2 {
                break;
            }
            let Some(source_id) = op.source_id.as_deref() else {
                continue;
            };
            if stats.contains_key(source_id) {
                continue;
            }
            let Some(source) = self.registry.get_source(source_id) else {
                continue;
            };
            match factory.adapter(&source).await {
                Ok(adapter) => match adapter.introspect_schema().await {
                    Ok(documents) => {
                        stats.insert(source_id.to_string(), Value::Array(documents));
                    }
                    Err(err) => {
                        tracing::debug!(source = source_id, error = %err, "statistics probe failed");
                    }
                },
                Err(err) => {
                    tracing::debug!(source = source_id, error = %err, "no adapter for statistics");
                }
            }
        }
        Value::Object(stats)
    }

    /// Rewrites operation source references to their canonical registry
    /// ids, so downstream components see one form.
    fn canonicalize_sources(&self, plan: &mut QueryPlan) {
        for op in &mut plan.operations {
            if let Some(source_id) = op.source_id.as_deref() {
                if let Ok(resolved) = self.registry.resolve_source(source_id) {
                    op.source_id = Some(resolved.canonical_id);
                }
            }
        }
    }

    /// One retry on parse failure; provider failures surface directly.
    async fn complete_json_with_retry(&self, prompt: &str) -> Result<Value, LlmError> {
        match self
            .llm
            .complete_json(prompt, self.config.llm_temperature)
            .await
        {
            Ok(value) => Ok(value),
            Err(err @ (LlmError::Parse { .. } | LlmError::Empty)) => {
                tracing::warn!(error = %err, "model response did not parse; retrying once");
                self.llm
                    .complete_json(prompt, self.config.llm_temperature)
                    .await
            }
            Err(err) => Err(err),
        }
    }
}

/// Decodes a planner-produced plan document, collecting per-operation
/// parse errors instead of failing wholesale.
pub fn plan_from_value(value: Value) -> (QueryPlan, Vec<String>) {
    let mut errors = Vec::new();

    let metadata = value
        .get("metadata")
        .and_then(Value::as_object)
        .map(PlanMetadata::from_map)
        .unwrap_or_default();

    let mut operations = Vec::new();
    for (index, op_value) in value
        .get("operations")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .enumerate()
    {
        match serde_json::from_value::<Operation>(op_value) {
            Ok(op) => operations.push(op),
            Err(err) => errors.push(format!("operation {index} does not parse: {err}")),
        }
    }

    let mut plan = QueryPlan::new(operations, metadata);
    if let Some(id) = value.get("id").and_then(Value::as_str) {
        plan.id = id.to_string();
    }
    (plan, errors)
}

#[cfg(test)]
mod test;
