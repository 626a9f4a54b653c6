//! The cross-database facade: accept a question, plan it, execute the
//! plan, aggregate the results, and return a structured envelope.
//!
//! The facade never propagates an error to callers: every failure path
//! yields a fully-populated [`ExecutionEnvelope`]. It owns the session
//! id stamped onto every progress event of a request.

use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use aggregate::{
    rows_of, stream_aggregate, AggregateConfig, Aggregator, MergeOutput, SourceError,
    SOURCE_FIELD,
};
use connectors::AdapterFactory;
use executor::{AdaptiveExecutor, ExecutorConfig};
use llm::LlmClient;
use models::{ExecutionEnvelope, ExecutionReport, OperationStatus, QueryPlan, Row};
use planning::{PlanningAgent, PlanningConfig};
use progress::{EventKind, EventStream, ProgressBus};
use registry::SchemaRegistry;

mod logging;
pub use logging::{init_logging, LogFormat};

/// Top-level configuration, nesting each subsystem's options. Every
/// field defaults, so an empty document is a valid configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub planning: PlanningConfig,
    #[serde(default)]
    pub aggregate: AggregateConfig,
}

/// Per-request options.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Run the best-effort plan optimization pass after validation.
    pub optimize: bool,
    /// Plan and validate only; skip execution.
    pub dry_run: bool,
    /// Accepted for API compatibility; session persistence is an
    /// external collaborator's concern.
    pub save_session: bool,
}

/// CrossDb wires the planning pipeline, executor, and aggregator behind
/// one entry point.
pub struct CrossDb {
    planner: PlanningAgent,
    executor: AdaptiveExecutor,
    aggregator: Arc<Aggregator>,
    bus: ProgressBus,
}

impl CrossDb {
    pub fn new(
        registry: Arc<dyn SchemaRegistry>,
        llm: Arc<dyn LlmClient>,
        factory: Arc<AdapterFactory>,
        config: Config,
    ) -> Self {
        let bus = ProgressBus::new(Uuid::new_v4());
        let aggregator = Arc::new(Aggregator::new(config.aggregate));
        let planner = PlanningAgent::new(
            config.planning,
            llm,
            registry.clone(),
            Some(factory.clone()),
            bus.clone(),
        );
        let executor = AdaptiveExecutor::new(
            config.executor,
            registry,
            factory,
            aggregator.clone(),
            bus.clone(),
        );
        Self {
            planner,
            executor,
            aggregator,
            bus,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.bus.session_id()
    }

    /// Subscribes to this facade's progress events; each event renders
    /// as one line-delimited JSON record.
    pub fn subscribe(&self) -> EventStream {
        self.bus.subscribe()
    }

    /// Answers `question` end-to-end.
    pub async fn run(&self, question: &str, options: RunOptions) -> ExecutionEnvelope {
        self.run_with_cancellation(question, options, CancellationToken::new())
            .await
    }

    /// As [`run`], with structured cancellation: cancelling the token
    /// cancels the executor and every in-flight adapter call.
    ///
    /// [`run`]: CrossDb::run
    #[tracing::instrument(skip_all, fields(session = %self.bus.session_id()))]
    pub async fn run_with_cancellation(
        &self,
        question: &str,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> ExecutionEnvelope {
        let (mut plan, validation) = self.planner.create_plan(question, options.optimize).await;

        if !validation.valid {
            self.bus.publish(EventKind::Error {
                message: "plan validation failed".to_string(),
                detail: serde_json::to_value(&validation).ok(),
            });
            self.bus.publish(EventKind::Complete { success: false });
            return ExecutionEnvelope {
                success: false,
                plan,
                validation,
                execution: ExecutionReport::default(),
            };
        }

        if options.dry_run {
            self.bus.publish(EventKind::Complete { success: true });
            let mut execution = ExecutionReport::default();
            execution.success = true;
            execution.execution_summary.total_operations = plan.operations.len();
            return ExecutionEnvelope {
                success: true,
                plan,
                validation,
                execution,
            };
        }
        if options.save_session {
            tracing::debug!("session persistence is delegated to the session store");
        }

        let mut execution = self.executor.execute(&mut plan, cancel).await;

        // The plan's final result: the declared output operation when one
        // exists, otherwise a merge over the leaf results.
        if plan.metadata.output_operation_id.is_none() {
            execution.result = self.merge_leaves(&plan).await;
        }

        let success = execution.success;
        self.bus.publish(EventKind::Complete { success });
        ExecutionEnvelope {
            success,
            plan,
            validation,
            execution,
        }
    }

    /// Streaming merge over the plan's leaf results: one bounded chunk
    /// per source at a time, each chunk annotated with its origin and
    /// surfaced as a `partial_results` event before the merged whole is
    /// returned. Failed leaves are preserved as error records.
    async fn merge_leaves(&self, plan: &QueryPlan) -> Value {
        let leaves = plan.leaf_operations();

        let mut errors = Vec::new();
        let mut streams: BTreeMap<String, BoxStream<'static, Row>> = BTreeMap::new();
        let mut labels: BTreeMap<String, String> = BTreeMap::new();
        let mut leaf_totals: BTreeMap<String, usize> = BTreeMap::new();
        let mut source_labels = Vec::new();
        let mut successful = 0;

        for op in &leaves {
            let label = op.source_id.clone().unwrap_or_else(|| op.id.clone());
            source_labels.push(label.clone());
            match op.status {
                OperationStatus::Completed => {
                    successful += 1;
                    let op_rows = rows_of(op.result.as_ref().unwrap_or(&Value::Null));
                    leaf_totals.insert(op.id.clone(), op_rows.len());
                    labels.insert(op.id.clone(), label);
                    streams.insert(op.id.clone(), futures::stream::iter(op_rows).boxed());
                }
                _ => errors.push(SourceError {
                    source_id: label,
                    error: op
                        .error
                        .clone()
                        .unwrap_or_else(|| "not executed".to_string()),
                }),
            }
        }

        self.bus.publish(EventKind::Aggregating {
            strategy: "merge".to_string(),
            sources: source_labels,
        });
        let started = Instant::now();

        let bus = self.bus.clone();
        let chunk_labels = labels;
        let chunks: Vec<Vec<Row>> = stream_aggregate(
            streams,
            self.aggregator.chunk_size(),
            move |batch| {
                let chunk_index = batch.chunk_index;
                let mut out = Vec::new();
                for (op_id, chunk_rows) in batch.per_source {
                    bus.publish(EventKind::PartialResults {
                        operation_id: op_id.clone(),
                        rows_count: chunk_rows.len(),
                        chunk_index,
                        is_complete: false,
                    });
                    let label = chunk_labels.get(&op_id).cloned().unwrap_or(op_id);
                    for mut row in chunk_rows {
                        row.insert(SOURCE_FIELD.to_string(), Value::String(label.clone()));
                        out.push(row);
                    }
                }
                out
            },
        )
        .collect()
        .await;
        let chunk_count = chunks.len();
        let rows: Vec<Row> = chunks.into_iter().flatten().collect();

        for (op_id, total) in leaf_totals {
            self.bus.publish(EventKind::PartialResults {
                operation_id: op_id,
                rows_count: total,
                chunk_index: chunk_count,
                is_complete: true,
            });
        }

        let duration = started.elapsed().as_secs_f64();
        self.bus.publish(EventKind::AggregationComplete {
            rows: rows.len(),
            duration_seconds: duration,
            rows_per_second: if duration > 0.0 {
                rows.len() as f64 / duration
            } else {
                0.0
            },
            // Merging builds no index; only joins hold one in memory.
            memory_bytes: 0,
        });

        let merged = MergeOutput {
            success: successful > 0,
            sources_queried: leaves.len(),
            successful_sources: successful,
            failed_sources: leaves.len() - successful,
            total_rows: rows.len(),
            rows,
            errors,
        };
        serde_json::to_value(merged).unwrap_or(Value::Null)
    }
}
