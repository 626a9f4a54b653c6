//! Executor behavior against scripted adapters: admission bounds,
//! dependency gating, retry, timeouts, and cancellation.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use aggregate::Aggregator;
use connectors::stub::{FailureMode, StubAdapter};
use connectors::{Adapter, AdapterFactory};
use executor::{AdaptiveExecutor, ExecutorConfig};
use models::{
    Complexity, OpMetadata, OpSpec, Operation, OperationStatus, PlanMetadata, QueryPlan,
    SourceKind,
};
use progress::{EventKind, ProgressBus};
use registry::{MemoryRegistry, RegistrySeed};

fn registry() -> Arc<MemoryRegistry> {
    let seed: RegistrySeed = serde_json::from_value(json!({
        "sources": [
            {"id": "postgres_main", "type": "postgres"},
            {"id": "mongodb_main", "type": "mongodb"},
        ],
    }))
    .unwrap();
    Arc::new(MemoryRegistry::new(seed))
}

fn factory_with(
    postgres: Arc<StubAdapter>,
    mongodb: Option<Arc<StubAdapter>>,
) -> Arc<AdapterFactory> {
    let mut factory = AdapterFactory::new().register(
        SourceKind::Postgres,
        move |_: &models::DataSource| -> Result<Arc<dyn Adapter>, connectors::AdapterError> {
            Ok(postgres.clone())
        },
    );
    if let Some(mongodb) = mongodb {
        factory = factory.register(
            SourceKind::MongoDb,
            move |_: &models::DataSource| -> Result<Arc<dyn Adapter>, connectors::AdapterError> {
                Ok(mongodb.clone())
            },
        );
    }
    Arc::new(factory)
}

fn executor_with(config: ExecutorConfig, factory: Arc<AdapterFactory>) -> AdaptiveExecutor {
    AdaptiveExecutor::new(
        config,
        registry(),
        factory,
        Arc::new(Aggregator::default()),
        ProgressBus::new(uuid::Uuid::new_v4()),
    )
}

fn sql_op(id: &str, deps: &[&str]) -> Operation {
    Operation::new(
        id,
        Some(SourceKind::Postgres),
        Some("postgres_main".to_string()),
        OpSpec::Sql {
            query: "SELECT 1".to_string(),
            params: vec![],
        },
    )
    .with_depends_on(deps.iter().copied())
}

fn plan_of(operations: Vec<Operation>) -> QueryPlan {
    QueryPlan::new(operations, PlanMetadata::default())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn backend_semaphore_bounds_concurrency() {
    // Sixteen independent postgres operations, each sleeping 200ms, with
    // a limit of eight: two full waves, so between 400 and 800ms overall,
    // and never more than eight in flight.
    let stub = Arc::new(
        StubAdapter::named("postgres_main").with_latency(Duration::from_millis(200)),
    );
    let executor = executor_with(ExecutorConfig::default(), factory_with(stub.clone(), None));

    let mut plan = plan_of((0..16).map(|i| sql_op(&format!("op{i}"), &[])).collect());
    let started = Instant::now();
    let report = executor.execute(&mut plan, CancellationToken::new()).await;
    let elapsed = started.elapsed();

    assert!(report.success);
    assert_eq!(report.execution_summary.successful_operations, 16);
    assert!(stub.max_concurrency() <= 8, "saw {}", stub.max_concurrency());
    assert!(elapsed >= Duration::from_millis(400), "too fast: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(800), "too slow: {elapsed:?}");
}

#[tokio::test]
async fn weight_gate_bounds_total_running_weight() {
    // Heavy operations weigh 4; with a total budget of 8 at most two run
    // at once, regardless of the backend limit.
    let stub = Arc::new(
        StubAdapter::named("postgres_main").with_latency(Duration::from_millis(30)),
    );
    let config = ExecutorConfig {
        max_total_weight: 8,
        ..ExecutorConfig::default()
    };
    let executor = executor_with(config, factory_with(stub.clone(), None));

    let mut heavy = OpMetadata::default();
    heavy.complexity = Complexity::Heavy;
    let mut plan = plan_of(
        (0..6)
            .map(|i| sql_op(&format!("op{i}"), &[]).with_metadata(heavy.clone()))
            .collect(),
    );

    let report = executor.execute(&mut plan, CancellationToken::new()).await;
    assert!(report.success);
    assert!(stub.max_concurrency() <= 2, "saw {}", stub.max_concurrency());
}

#[tokio::test]
async fn dependency_failure_propagates_and_independents_run() {
    // op1 fails with a non-retryable error; op2 depends on it; op3 is
    // independent.
    let failing = Arc::new(StubAdapter::named("postgres_main").failing(1, FailureMode::Syntax));
    let mongodb = Arc::new(StubAdapter::named("mongodb_main").with_rows(json!([{"ok": 1}])));
    let executor = executor_with(
        ExecutorConfig::default(),
        factory_with(failing.clone(), Some(mongodb)),
    );

    let op3 = Operation::new(
        "op3",
        Some(SourceKind::MongoDb),
        Some("mongodb_main".to_string()),
        OpSpec::Mongo {
            collection: "orders".to_string(),
            pipeline: vec![],
            filter: Default::default(),
            projection: Default::default(),
        },
    );
    let mut plan = plan_of(vec![sql_op("op1", &[]), sql_op("op2", &["op1"]), op3]);

    let report = executor.execute(&mut plan, CancellationToken::new()).await;

    assert!(!report.success);
    let op1 = plan.get_operation("op1").unwrap();
    let op2 = plan.get_operation("op2").unwrap();
    let op3 = plan.get_operation("op3").unwrap();
    assert_eq!(op1.status, OperationStatus::Failed);
    assert_eq!(op2.status, OperationStatus::Failed);
    assert!(op2.error.as_deref().unwrap().contains("dependency_failed"));
    assert_eq!(op3.status, OperationStatus::Completed);
    // op2 never reached the adapter.
    assert_eq!(failing.calls(), 1);
}

#[tokio::test]
async fn transient_failures_retry_with_backoff() {
    let flaky = Arc::new(
        StubAdapter::named("postgres_main")
            .failing(2, FailureMode::Transient)
            .with_rows(json!([{"id": 1}])),
    );
    let executor = executor_with(ExecutorConfig::default(), factory_with(flaky.clone(), None));

    let mut plan = plan_of(vec![sql_op("op1", &[])]);
    let report = executor.execute(&mut plan, CancellationToken::new()).await;

    assert!(report.success);
    assert_eq!(flaky.calls(), 3);
    assert_eq!(
        plan.get_operation("op1").unwrap().status,
        OperationStatus::Completed
    );
}

#[tokio::test]
async fn syntax_errors_are_never_retried() {
    let broken = Arc::new(StubAdapter::named("postgres_main").failing(5, FailureMode::Syntax));
    let executor = executor_with(ExecutorConfig::default(), factory_with(broken.clone(), None));

    let mut plan = plan_of(vec![sql_op("op1", &[])]);
    let report = executor.execute(&mut plan, CancellationToken::new()).await;

    assert!(!report.success);
    assert_eq!(broken.calls(), 1);
    let error = plan.get_operation("op1").unwrap().error.clone().unwrap();
    assert!(error.starts_with("adapter_syntax"), "{error}");
}

#[tokio::test]
async fn deadline_fails_hanging_operations() {
    let hanging = Arc::new(StubAdapter::named("postgres_main").hanging());
    let config = ExecutorConfig {
        operation_timeout_seconds: 1,
        ..ExecutorConfig::default()
    };
    let executor = executor_with(config, factory_with(hanging, None));

    let mut plan = plan_of(vec![sql_op("op1", &[])]);
    let started = Instant::now();
    let report = executor.execute(&mut plan, CancellationToken::new()).await;

    assert!(!report.success);
    assert!(started.elapsed() < Duration::from_secs(5));
    let error = plan.get_operation("op1").unwrap().error.clone().unwrap();
    assert!(error.starts_with("timeout"), "{error}");
}

#[tokio::test]
async fn cancellation_reaches_in_flight_operations() {
    let hanging = Arc::new(StubAdapter::named("postgres_main").hanging());
    let executor = Arc::new(executor_with(
        ExecutorConfig::default(),
        factory_with(hanging, None),
    ));

    let token = CancellationToken::new();
    let child = token.clone();
    let handle = tokio::spawn({
        let executor = executor.clone();
        async move {
            let mut plan = plan_of(vec![sql_op("op1", &[]), sql_op("op2", &["op1"])]);
            let report = executor.execute(&mut plan, child).await;
            (plan, report)
        }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    let cancelled_at = Instant::now();
    token.cancel();
    let (plan, report) = handle.await.unwrap();

    // In-flight adapter calls observe cancellation well within the grace
    // window.
    assert!(cancelled_at.elapsed() < Duration::from_millis(500));
    assert!(!report.success);
    for op in &plan.operations {
        assert_eq!(op.status, OperationStatus::Failed);
        assert!(op.error.as_deref().unwrap().contains("cancel"));
    }
}

#[tokio::test]
async fn compute_join_runs_over_dependency_results() {
    let postgres = Arc::new(StubAdapter::named("postgres_main").with_rows(json!([
        {"id": 1, "name": "A"},
        {"id": 2, "name": "B"},
        {"id": 3, "name": "C"},
    ])));
    let mongodb = Arc::new(StubAdapter::named("mongodb_main").with_rows(json!([
        {"_id": 1, "count": 5},
        {"_id": 3, "count": 2},
    ])));
    let executor = executor_with(
        ExecutorConfig::default(),
        factory_with(postgres, Some(mongodb)),
    );

    let op2 = Operation::new(
        "op2",
        Some(SourceKind::MongoDb),
        Some("mongodb_main".to_string()),
        OpSpec::Mongo {
            collection: "orders".to_string(),
            pipeline: vec![json!({"$match": {"user_id": {"$in": [1, 2, 3]}}})],
            filter: Default::default(),
            projection: Default::default(),
        },
    );
    let mut join_meta = OpMetadata::default();
    join_meta.operation_type = "join".to_string();
    let op3 = Operation::new(
        "op3",
        None,
        None,
        OpSpec::Generic {
            params: json!({
                "join_type": "inner",
                "keys": {"postgres_main": "id", "mongodb_main": "_id"},
            })
            .as_object()
            .cloned()
            .unwrap(),
        },
    )
    .with_depends_on(["op1", "op2"])
    .with_metadata(join_meta);

    let mut metadata = PlanMetadata::default();
    metadata.output_operation_id = Some("op3".to_string());
    let mut plan = QueryPlan::new(vec![sql_op("op1", &[]), op2, op3], metadata);

    let report = executor.execute(&mut plan, CancellationToken::new()).await;

    assert!(report.success);
    assert_eq!(report.result["total_rows"], json!(2));
    let rows = report.result["rows"].as_array().unwrap();
    assert_eq!(rows.len(), 2);
    for row in rows {
        for field in [
            "postgres_main_id",
            "postgres_main_name",
            "mongodb_main__id",
            "mongodb_main_count",
        ] {
            assert!(row.get(field).is_some(), "missing {field} in {row}");
        }
    }
}

#[tokio::test]
async fn dependencies_finish_before_dependents_start() {
    let stub = Arc::new(
        StubAdapter::named("postgres_main")
            .with_latency(Duration::from_millis(20))
            .with_rows(json!([{"id": 1}])),
    );
    let bus = ProgressBus::new(uuid::Uuid::new_v4());
    let mut events = bus.subscribe();
    let executor = AdaptiveExecutor::new(
        ExecutorConfig::default(),
        registry(),
        factory_with(stub, None),
        Arc::new(Aggregator::default()),
        bus,
    );

    let mut plan = plan_of(vec![
        sql_op("a", &[]),
        sql_op("b", &["a"]),
        sql_op("c", &["b"]),
    ]);
    let report = executor.execute(&mut plan, CancellationToken::new()).await;
    assert!(report.success);

    let drained = events.drain();
    let position = |pred: &dyn Fn(&EventKind) -> bool| {
        drained
            .iter()
            .position(|e| pred(&e.kind))
            .expect("event present")
    };
    let completed = |id: &'static str| {
        position(&move |k| {
            matches!(k, EventKind::OperationCompleted { operation_id, .. } if operation_id.as_str() == id)
        })
    };
    let started = |id: &'static str| {
        position(&move |k| {
            matches!(k, EventKind::OperationStarted { operation_id, .. } if operation_id.as_str() == id)
        })
    };

    assert!(completed("a") < started("b"));
    assert!(completed("b") < started("c"));
}

#[tokio::test]
async fn plans_with_unknown_dependencies_fail_cleanly() {
    let stub = Arc::new(StubAdapter::named("postgres_main"));
    let executor = executor_with(ExecutorConfig::default(), factory_with(stub, None));

    let mut plan = plan_of(vec![sql_op("a", &["ghost"])]);
    let report = executor.execute(&mut plan, CancellationToken::new()).await;

    assert!(!report.success);
    assert_eq!(report.execution_summary.failed_operations, 1);
    let error = plan.get_operation("a").unwrap().error.clone().unwrap();
    assert!(error.contains("ghost"), "{error}");
}

#[tokio::test]
async fn report_summarizes_every_operation() {
    let stub = Arc::new(StubAdapter::named("postgres_main").with_rows(json!([{"n": 1}])));
    let executor = executor_with(ExecutorConfig::default(), factory_with(stub, None));

    let mut plan = plan_of(vec![sql_op("a", &[]), sql_op("b", &["a"])]);
    let report = executor.execute(&mut plan, CancellationToken::new()).await;

    assert!(report.success);
    assert_eq!(report.execution_summary.total_operations, 2);
    assert_eq!(report.execution_summary.successful_operations, 2);
    assert_eq!(report.execution_summary.failed_operations, 0);
    assert_eq!(report.execution_summary.failed_operation_id, None);
    assert!(report.execution_summary.operation_details.contains_key("a"));
    assert!(report.execution_summary.operation_details.contains_key("b"));
    assert!(report.execution_summary.execution_time_seconds > 0.0);
    // No output operation declared: the facade aggregates leaves.
    assert_eq!(report.result, Value::Null);
}
