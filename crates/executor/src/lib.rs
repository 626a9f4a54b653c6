//! Dependency-gated parallel plan execution with per-backend semaphores
//! and complexity-weighted admission control.
//!
//! A single coordinator admits operations as their dependencies complete.
//! Three gates guard admission: the dependency gate, the targeted
//! backend's semaphore, and the global weight/concurrency gate. Admitted
//! operations run as independent tasks which suspend on adapter I/O; the
//! coordinator waits for whichever finishes first, never for a layer
//! boundary.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use aggregate::Aggregator;
use connectors::AdapterFactory;
use models::{
    ExecutionReport, ExecutionSummary, OpSpec, Operation, OperationDag, OperationDetail,
    OperationStatus, QueryPlan, Row, SourceKind,
};
use progress::{EventKind, ProgressBus};
use registry::SchemaRegistry;

mod compute;
mod config;
mod tuner;

pub use compute::{run_compute, DepInput};
pub use config::{ExecutorConfig, TuningConfig};

/// Error cause label for operations failed by an upstream failure.
pub const DEPENDENCY_FAILED: &str = "dependency_failed";

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Pending,
    Active,
    Completed,
    Failed,
}

impl Phase {
    fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }
}

#[derive(Debug)]
enum OutcomeKind {
    Rows(Vec<Row>),
    Computed(Value),
    Failed { kind: String, message: String },
    Cancelled,
}

#[derive(Debug)]
struct TaskOutcome {
    op_id: String,
    outcome: OutcomeKind,
    duration: f64,
    attempts: u32,
}

/// AdaptiveExecutor runs validated plans against the adapter layer.
pub struct AdaptiveExecutor {
    config: ExecutorConfig,
    registry: Arc<dyn SchemaRegistry>,
    factory: Arc<AdapterFactory>,
    aggregator: Arc<Aggregator>,
    bus: ProgressBus,
    tuner: Mutex<tuner::Tuner>,
}

impl AdaptiveExecutor {
    pub fn new(
        config: ExecutorConfig,
        registry: Arc<dyn SchemaRegistry>,
        factory: Arc<AdapterFactory>,
        aggregator: Arc<Aggregator>,
        bus: ProgressBus,
    ) -> Self {
        Self {
            config,
            registry,
            factory,
            aggregator,
            bus,
            tuner: Mutex::new(tuner::Tuner::default()),
        }
    }

    /// Executes `plan`, mutating per-operation status, result, and timing
    /// in place, and returns the execution report. Cancelling `cancel`
    /// cancels every in-flight operation task, which propagates into
    /// their adapter calls.
    #[tracing::instrument(skip_all, fields(plan = %plan.id))]
    pub async fn execute(
        &self,
        plan: &mut QueryPlan,
        cancel: CancellationToken,
    ) -> ExecutionReport {
        let started = Instant::now();

        let dag = match OperationDag::build(plan) {
            Ok(dag) => dag,
            Err(err) => {
                for op in &mut plan.operations {
                    op.status = OperationStatus::Failed;
                    op.error = Some(err.to_string());
                }
                return self.report(plan, started);
            }
        };

        let semaphores = self.build_semaphores();
        let mut phase: BTreeMap<String, Phase> = plan
            .operations
            .iter()
            .map(|op| (op.id.clone(), Phase::Pending))
            .collect();
        let mut join_set: JoinSet<TaskOutcome> = JoinSet::new();
        let mut running_weight: u32 = 0;
        let mut cancelled = false;

        loop {
            if cancelled {
                for op in &mut plan.operations {
                    if phase[&op.id] == Phase::Pending {
                        fail_op(op, &mut phase, "cancelled", "execution was cancelled");
                        self.bus.publish(EventKind::operation_failed(
                            op.id.as_str(),
                            "execution was cancelled",
                            "cancelled",
                        ));
                    }
                }
            }

            // Propagate upstream failures before admitting anything: an
            // operation whose dependency failed is failed, never started.
            let failed_now: Vec<String> = phase
                .iter()
                .filter(|(_, p)| **p == Phase::Failed)
                .map(|(id, _)| id.clone())
                .collect();
            for failed_id in failed_now {
                let dependents: Vec<String> = dag
                    .transitive_dependents_of(&failed_id)
                    .into_iter()
                    .map(str::to_string)
                    .collect();
                for dependent in dependents {
                    if phase.get(&dependent) != Some(&Phase::Pending) {
                        continue;
                    }
                    let message = format!("dependency {failed_id} failed");
                    if let Some(op) = plan.get_operation_mut(&dependent) {
                        fail_op(op, &mut phase, DEPENDENCY_FAILED, &message);
                    }
                    self.bus.publish(EventKind::operation_failed(
                        dependent,
                        message,
                        DEPENDENCY_FAILED,
                    ));
                }
            }

            let mut ready: Vec<usize> = (0..plan.operations.len())
                .filter(|&i| {
                    let op = &plan.operations[i];
                    phase[&op.id] == Phase::Pending
                        && op
                            .depends_on
                            .iter()
                            .all(|d| phase.get(d.as_str()) == Some(&Phase::Completed))
                })
                .collect();
            // Lighter operations first, then declared priority.
            ready.sort_by_key(|&i| {
                let op = &plan.operations[i];
                (op.weight(), op.metadata.priority, op.id.clone())
            });

            let mut launched = false;
            if !cancelled {
                for &idx in &ready {
                    if join_set.len() >= self.config.max_concurrent_operations {
                        break;
                    }
                    let weight = plan.operations[idx].weight();
                    if running_weight + weight > self.config.max_total_weight {
                        continue;
                    }
                    let permit = match self.acquire_permit(&plan.operations[idx], &semaphores) {
                        PermitOutcome::NotNeeded => None,
                        PermitOutcome::Acquired(permit) => Some(permit),
                        PermitOutcome::Exhausted => continue,
                    };
                    self.launch(&mut join_set, plan, idx, permit, &cancel, &mut phase);
                    running_weight += weight;
                    launched = true;
                }
            }

            if phase.values().all(Phase::is_terminal) && join_set.is_empty() {
                break;
            }

            // Deadlock avoidance: nothing active, nothing launched, yet
            // ready work remains. Force one admission past the global
            // gates; the backend semaphore still applies (and has free
            // permits, since nothing is running).
            if join_set.is_empty() && !launched && !cancelled {
                if let Some(&idx) = ready.first() {
                    tracing::warn!(
                        op = %plan.operations[idx].id,
                        "no progress possible within global gates; force-admitting"
                    );
                    match self.acquire_permit(&plan.operations[idx], &semaphores) {
                        PermitOutcome::Exhausted => {
                            fail_op(
                                &mut plan.operations[idx],
                                &mut phase,
                                "internal",
                                "backend semaphore exhausted with no active work",
                            );
                            continue;
                        }
                        PermitOutcome::NotNeeded => {
                            self.launch(&mut join_set, plan, idx, None, &cancel, &mut phase);
                            running_weight += plan.operations[idx].weight();
                        }
                        PermitOutcome::Acquired(permit) => {
                            let weight = plan.operations[idx].weight();
                            self.launch(
                                &mut join_set,
                                plan,
                                idx,
                                Some(permit),
                                &cancel,
                                &mut phase,
                            );
                            running_weight += weight;
                        }
                    }
                } else {
                    // Pending operations remain but none can ever become
                    // ready; only an unvalidated cyclic plan reaches this.
                    for op in &mut plan.operations {
                        if phase[&op.id] == Phase::Pending {
                            fail_op(
                                op,
                                &mut phase,
                                "internal",
                                "operation can never become ready",
                            );
                        }
                    }
                    continue;
                }
            }

            self.publish_snapshot(&phase);

            tokio::select! {
                _ = cancel.cancelled(), if !cancelled => {
                    tracing::info!("cancellation requested; draining in-flight operations");
                    cancelled = true;
                }
                joined = join_set.join_next() => {
                    match joined {
                        Some(Ok(outcome)) => {
                            running_weight = running_weight
                                .saturating_sub(self.apply(plan, &mut phase, outcome));
                        }
                        Some(Err(err)) => {
                            // A task panicked or was aborted out-of-band.
                            tracing::error!(error = %err, "operation task died");
                            for op in &mut plan.operations {
                                if phase[&op.id] == Phase::Active {
                                    fail_op(op, &mut phase, "internal", "operation task died");
                                }
                            }
                            running_weight = 0;
                        }
                        None => {}
                    }
                }
            }
        }

        if self.config.tuning.enabled {
            if let Ok(mut tuner) = self.tuner.lock() {
                tuner.retune(&self.config, &self.config.tuning);
            }
        }

        let report = self.report(plan, started);
        self.bus.publish(EventKind::ExecutorComplete {
            successful: report.execution_summary.successful_operations,
            failed: report.execution_summary.failed_operations,
            duration_seconds: report.execution_summary.execution_time_seconds,
        });
        report
    }

    fn build_semaphores(&self) -> BTreeMap<&'static str, Arc<Semaphore>> {
        let mut semaphores = BTreeMap::new();
        let tuner = self.tuner.lock().unwrap_or_else(|e| e.into_inner());
        for kind in SourceKind::ALL {
            semaphores.insert(
                kind.as_str(),
                Arc::new(Semaphore::new(tuner.limit_for(kind, &self.config))),
            );
        }
        semaphores.insert(
            "unknown",
            Arc::new(Semaphore::new(self.config.unknown_kind_limit.max(1))),
        );
        semaphores
    }

    fn acquire_permit(
        &self,
        op: &Operation,
        semaphores: &BTreeMap<&'static str, Arc<Semaphore>>,
    ) -> PermitOutcome {
        if op.is_compute() {
            return PermitOutcome::NotNeeded;
        }
        let key = op.kind.map(|k| k.as_str()).unwrap_or("unknown");
        let semaphore = semaphores
            .get(key)
            .or_else(|| semaphores.get("unknown"))
            .cloned();
        match semaphore {
            Some(semaphore) => match semaphore.try_acquire_owned() {
                Ok(permit) => PermitOutcome::Acquired(permit),
                Err(_) => PermitOutcome::Exhausted,
            },
            None => PermitOutcome::NotNeeded,
        }
    }

    fn launch(
        &self,
        join_set: &mut JoinSet<TaskOutcome>,
        plan: &mut QueryPlan,
        idx: usize,
        permit: Option<OwnedSemaphorePermit>,
        cancel: &CancellationToken,
        phase: &mut BTreeMap<String, Phase>,
    ) {
        let deps: Vec<DepInput> = plan.operations[idx]
            .depends_on
            .iter()
            .filter_map(|dep_id| plan.get_operation(dep_id))
            .map(|dep| DepInput {
                op_id: dep.id.clone(),
                source_id: dep.source_id.clone(),
                result: dep.result.clone().unwrap_or(Value::Null),
            })
            .collect();

        let op = &mut plan.operations[idx];
        op.status = OperationStatus::Running;
        phase.insert(op.id.clone(), Phase::Active);

        let task = OperationTask {
            op_id: op.id.clone(),
            source_id: op.source_id.clone(),
            kind: op.kind,
            spec: op.spec.clone(),
            operation_type: op.metadata.operation_type.clone(),
            is_compute: op.is_compute(),
            deps,
            registry: self.registry.clone(),
            factory: self.factory.clone(),
            aggregator: self.aggregator.clone(),
            bus: self.bus.clone(),
            timeout: Duration::from_secs(self.config.operation_timeout_seconds),
            max_attempts: self.config.max_retry_attempts.max(1),
        };
        let token = cancel.child_token();

        tracing::debug!(op = %task.op_id, kind = ?task.kind, "launching operation");
        join_set.spawn(async move {
            let started = Instant::now();
            let _permit = permit;
            let (outcome, attempts) = tokio::select! {
                _ = token.cancelled() => (OutcomeKind::Cancelled, 0),
                out = task.run() => out,
            };
            TaskOutcome {
                op_id: task.op_id,
                outcome,
                duration: started.elapsed().as_secs_f64(),
                attempts,
            }
        });
    }

    /// Applies a finished task to the plan, returning the weight to
    /// release.
    fn apply(
        &self,
        plan: &mut QueryPlan,
        phase: &mut BTreeMap<String, Phase>,
        outcome: TaskOutcome,
    ) -> u32 {
        let Some(op) = plan.get_operation_mut(&outcome.op_id) else {
            return 0;
        };
        let weight = op.weight();
        op.execution_time = outcome.duration;

        let ok = match outcome.outcome {
            OutcomeKind::Rows(rows) => {
                tracing::debug!(
                    op = %op.id,
                    attempts = outcome.attempts,
                    rows = rows.len(),
                    "operation completed"
                );
                self.bus.publish(EventKind::operation_completed(
                    op.id.as_str(),
                    rows.len(),
                    outcome.duration,
                ));
                op.result = Some(Value::Array(rows.into_iter().map(Value::Object).collect()));
                op.status = OperationStatus::Completed;
                phase.insert(op.id.clone(), Phase::Completed);
                true
            }
            OutcomeKind::Computed(value) => {
                self.bus.publish(EventKind::operation_completed(
                    op.id.as_str(),
                    aggregate::rows_of(&value).len(),
                    outcome.duration,
                ));
                op.result = Some(value);
                op.status = OperationStatus::Completed;
                phase.insert(op.id.clone(), Phase::Completed);
                true
            }
            OutcomeKind::Failed { kind, message } => {
                tracing::warn!(op = %op.id, kind = %kind, %message, "operation failed");
                self.bus.publish(EventKind::operation_failed(
                    op.id.as_str(),
                    message.as_str(),
                    kind.as_str(),
                ));
                op.error = Some(format!("{kind}: {message}"));
                op.status = OperationStatus::Failed;
                phase.insert(op.id.clone(), Phase::Failed);
                false
            }
            OutcomeKind::Cancelled => {
                self.bus.publish(EventKind::operation_failed(
                    op.id.as_str(),
                    "operation was cancelled",
                    "cancelled",
                ));
                op.error = Some("cancelled: operation was cancelled".to_string());
                op.status = OperationStatus::Failed;
                phase.insert(op.id.clone(), Phase::Failed);
                false
            }
        };

        if let Some(kind) = op.kind {
            if let Ok(mut tuner) = self.tuner.lock() {
                tuner.record(
                    kind,
                    op.metadata.complexity,
                    ok,
                    outcome.duration,
                    self.config.tuning.window,
                );
            }
        }
        weight
    }

    fn publish_snapshot(&self, phase: &BTreeMap<String, Phase>) {
        let count = |p: Phase| phase.values().filter(|&&v| v == p).count();
        self.bus.publish(EventKind::BatchSnapshot {
            pending: count(Phase::Pending),
            active: count(Phase::Active),
            completed: count(Phase::Completed),
            failed: count(Phase::Failed),
        });
    }

    fn report(&self, plan: &QueryPlan, started: Instant) -> ExecutionReport {
        let mut details = BTreeMap::new();
        let mut successful = 0;
        let mut failed = 0;
        let mut failed_operation_id = None;
        for op in &plan.operations {
            match op.status {
                OperationStatus::Completed => successful += 1,
                OperationStatus::Failed => {
                    failed += 1;
                    if failed_operation_id.is_none() {
                        failed_operation_id = Some(op.id.clone());
                    }
                }
                _ => {}
            }
            details.insert(
                op.id.clone(),
                OperationDetail {
                    status: op.status,
                    error: op.error.clone(),
                    execution_time: op.execution_time,
                },
            );
        }

        // Success binds to the output operation when one is declared,
        // otherwise every leaf must have completed.
        let success = match plan.output_operation() {
            Some(op) => op.status == OperationStatus::Completed,
            None => {
                !plan.operations.is_empty()
                    && plan
                        .leaf_operations()
                        .iter()
                        .all(|op| op.status == OperationStatus::Completed)
            }
        };
        let result = plan
            .output_operation()
            .and_then(|op| op.result.clone())
            .unwrap_or(Value::Null);

        ExecutionReport {
            success,
            execution_summary: ExecutionSummary {
                total_operations: plan.operations.len(),
                successful_operations: successful,
                failed_operations: failed,
                execution_time_seconds: started.elapsed().as_secs_f64(),
                failed_operation_id,
                operation_details: details,
            },
            result,
        }
    }
}

enum PermitOutcome {
    NotNeeded,
    Acquired(OwnedSemaphorePermit),
    Exhausted,
}

fn fail_op(
    op: &mut Operation,
    phase: &mut BTreeMap<String, Phase>,
    kind: &str,
    message: &str,
) {
    op.status = OperationStatus::Failed;
    op.error = Some(format!("{kind}: {message}"));
    phase.insert(op.id.clone(), Phase::Failed);
}

/// Everything one operation task needs, detached from the coordinator.
struct OperationTask {
    op_id: String,
    source_id: Option<String>,
    kind: Option<SourceKind>,
    spec: OpSpec,
    operation_type: String,
    is_compute: bool,
    deps: Vec<DepInput>,
    registry: Arc<dyn SchemaRegistry>,
    factory: Arc<AdapterFactory>,
    aggregator: Arc<Aggregator>,
    bus: ProgressBus,
    timeout: Duration,
    max_attempts: u32,
}

impl OperationTask {
    /// Runs the operation under its deadline, returning the outcome and
    /// how many attempts ran.
    async fn run(&self) -> (OutcomeKind, u32) {
        match tokio::time::timeout(self.timeout, self.attempt_loop()).await {
            Ok(result) => result,
            Err(_) => (
                OutcomeKind::Failed {
                    kind: "timeout".to_string(),
                    message: format!(
                        "operation exceeded its {}s deadline",
                        self.timeout.as_secs()
                    ),
                },
                0,
            ),
        }
    }

    async fn attempt_loop(&self) -> (OutcomeKind, u32) {
        if self.is_compute {
            self.bus.publish(EventKind::OperationStarted {
                operation_id: self.op_id.clone(),
                source_id: None,
                attempt: 1,
            });
            let params = match &self.spec {
                OpSpec::Generic { params } => params.clone(),
                _ => Default::default(),
            };
            let strategy = params
                .get("strategy")
                .and_then(Value::as_str)
                .unwrap_or(&self.operation_type)
                .to_string();
            self.bus.publish(EventKind::Aggregating {
                strategy: strategy.clone(),
                sources: self
                    .deps
                    .iter()
                    .map(|dep| dep.source_id.clone().unwrap_or_else(|| dep.op_id.clone()))
                    .collect(),
            });
            let started = Instant::now();
            let outcome = match run_compute(&strategy, &params, &self.deps, &self.aggregator) {
                Ok(value) => {
                    let duration = started.elapsed().as_secs_f64();
                    let rows = aggregate::rows_of(&value).len();
                    // Joins report their in-memory index high-water in the
                    // output's metrics block.
                    let memory_bytes = value
                        .get("metrics")
                        .and_then(|metrics| metrics.get("index_bytes_estimate"))
                        .and_then(Value::as_u64)
                        .unwrap_or(0) as usize;
                    self.bus.publish(EventKind::AggregationComplete {
                        rows,
                        duration_seconds: duration,
                        rows_per_second: if duration > 0.0 {
                            rows as f64 / duration
                        } else {
                            0.0
                        },
                        memory_bytes,
                    });
                    OutcomeKind::Computed(value)
                }
                Err(err) => OutcomeKind::Failed {
                    kind: "aggregation".to_string(),
                    message: err.to_string(),
                },
            };
            return (outcome, 1);
        }

        let Some(source_id) = self.source_id.as_deref() else {
            return (
                OutcomeKind::Failed {
                    kind: "validation".to_string(),
                    message: "operation has no source and is not a compute node".to_string(),
                },
                0,
            );
        };
        let source = match self
            .registry
            .resolve_source(source_id)
            .ok()
            .and_then(|resolved| self.registry.get_source(&resolved.canonical_id))
        {
            Some(source) => source,
            None => {
                return (
                    OutcomeKind::Failed {
                        kind: "schema_unknown".to_string(),
                        message: format!("source {source_id:?} does not resolve"),
                    },
                    0,
                )
            }
        };

        let backoff = exponential_backoff::Backoff::new(
            self.max_attempts,
            Duration::from_millis(100),
            Some(Duration::from_secs(5)),
        );
        let mut attempt = 1;
        loop {
            self.bus.publish(EventKind::OperationStarted {
                operation_id: self.op_id.clone(),
                source_id: Some(source.id.clone()),
                attempt,
            });
            self.bus.publish(EventKind::QueryExecuting {
                operation_id: self.op_id.clone(),
                source_id: Some(source.id.clone()),
            });

            let result = async {
                let adapter = self.factory.adapter(&source).await?;
                adapter.execute(&self.spec).await
            }
            .await;

            match result {
                Ok(rows) => return (OutcomeKind::Rows(rows), attempt),
                Err(err) if err.retryable() && attempt < self.max_attempts => {
                    tracing::warn!(
                        op = %self.op_id,
                        attempt,
                        error = %err,
                        "transient adapter failure; backing off"
                    );
                    if let Some(delay) = backoff.next(attempt) {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(err) => {
                    return (
                        OutcomeKind::Failed {
                            kind: err.kind_label().to_string(),
                            message: err.to_string(),
                        },
                        attempt,
                    )
                }
            }
        }
    }
}
