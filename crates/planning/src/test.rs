use super::*;
use llm::testing::ScriptedLlm;
use models::OperationStatus;
use pretty_assertions::assert_eq;
use registry::{MemoryRegistry, RegistrySeed};

fn seeded_registry() -> Arc<MemoryRegistry> {
    let seed: RegistrySeed = serde_json::from_value(json!({
        "sources": [
            {"id": "postgres_main", "type": "postgres"},
            {"id": "mongodb_main", "type": "mongodb"},
        ],
        "tables": [
            {
                "source_id": "postgres_main",
                "name": "users",
                "fields": {
                    "id": {"data_type": "integer", "primary_key": true},
                    "name": {"data_type": "text"},
                },
            },
            {
                "source_id": "mongodb_main",
                "name": "orders",
                "fields": {
                    "_id": {"data_type": "objectId", "primary_key": true},
                    "user_id": {"data_type": "number"},
                },
            },
        ],
    }))
    .unwrap();
    Arc::new(MemoryRegistry::new(seed))
}

fn classification() -> Value {
    json!({
        "selected_databases": ["postgres", "mongodb"],
        "rationale": {"postgres": "users live here", "mongodb": "orders live here"},
    })
}

fn plan_document() -> Value {
    json!({
        "metadata": {"version": "1.0", "output_operation_id": "join1"},
        "operations": [
            {
                "id": "op1",
                "source_id": "postgres_main",
                "db_type": "postgres",
                "depends_on": [],
                "metadata": {"operation_type": "query", "complexity": "SIMPLE"},
                "params": {"query": "SELECT id, name FROM users", "params": []},
            },
            {
                "id": "op2",
                "source_id": "mongodb:collection:orders",
                "db_type": "mongodb",
                "depends_on": [],
                "metadata": {"operation_type": "aggregate"},
                "params": {"collection": "orders", "pipeline": [{"$match": {}}]},
            },
            {
                "id": "join1",
                "source_id": null,
                "db_type": null,
                "depends_on": ["op1", "op2"],
                "metadata": {"operation_type": "join"},
                "params": {
                    "join_type": "inner",
                    "keys": {"postgres_main": "id", "mongodb_main": "_id"},
                },
            },
        ],
    })
}

fn agent(llm: ScriptedLlm) -> PlanningAgent {
    agent_with_config(llm, PlanningConfig::default())
}

fn agent_with_config(llm: ScriptedLlm, config: PlanningConfig) -> PlanningAgent {
    PlanningAgent::new(
        config,
        Arc::new(llm),
        seeded_registry(),
        None,
        ProgressBus::new(uuid::Uuid::new_v4()),
    )
}

#[tokio::test]
async fn create_plan_classifies_synthesizes_and_validates() {
    let agent = agent(
        ScriptedLlm::new()
            .respond_json(classification())
            .respond_json(plan_document()),
    );

    let (plan, report) = agent.create_plan("orders per user", false).await;

    assert!(report.valid, "errors: {:?}", report.errors);
    assert_eq!(plan.operations.len(), 3);
    assert_eq!(plan.metadata.question.as_deref(), Some("orders per user"));
    assert_eq!(plan.metadata.output_operation_id.as_deref(), Some("join1"));
    // Compound source references were canonicalized.
    assert_eq!(
        plan.get_operation("op2").unwrap().source_id.as_deref(),
        Some("mongodb_main")
    );
    assert_eq!(
        plan.get_operation("op1").unwrap().status,
        OperationStatus::Pending
    );
}

#[tokio::test]
async fn planning_emits_progress_events() {
    let bus = ProgressBus::new(uuid::Uuid::new_v4());
    let mut events = bus.subscribe();
    let agent = PlanningAgent::new(
        PlanningConfig::default(),
        Arc::new(
            ScriptedLlm::new()
                .respond_json(classification())
                .respond_json(plan_document()),
        ),
        seeded_registry(),
        None,
        bus,
    );

    let (_, report) = agent.create_plan("orders per user", false).await;
    assert!(report.valid);

    let kinds: Vec<String> = events
        .drain()
        .into_iter()
        .map(|e| {
            serde_json::to_value(&e.kind).unwrap()["type"]
                .as_str()
                .unwrap()
                .to_string()
        })
        .collect();
    for expected in [
        "classifying",
        "databases_selected",
        "schema_loading",
        "schema_chunks",
        "planning",
        "query_generating",
        "query_validating",
        "plan_validated",
    ] {
        assert!(kinds.contains(&expected.to_string()), "missing {expected} in {kinds:?}");
    }
}

#[tokio::test]
async fn unparseable_classification_retries_then_falls_back_to_rules() {
    // Two parse failures exhaust the retry; the question mentions the
    // `users` table, so the rule-based fallback selects postgres.
    let plan = json!({
        "metadata": {},
        "operations": [{
            "id": "op1",
            "source_id": "postgres_main",
            "db_type": "postgres",
            "params": {"query": "SELECT id FROM users"},
        }],
    });
    let llm = ScriptedLlm::new()
        .respond("definitely not json")
        .respond("still not json")
        .respond_json(plan);
    let agent = agent(llm);

    let (plan, report) = agent.create_plan("show the five most recent users", false).await;

    assert!(report.valid, "errors: {:?}", report.errors);
    assert_eq!(plan.operations.len(), 1);
    assert!(report
        .warnings
        .iter()
        .any(|w| w.contains("classification failed")));
}

#[tokio::test]
async fn no_candidates_yields_an_empty_plan_with_errors() {
    let agent = agent(ScriptedLlm::new().respond_json(json!({"selected_databases": []})));

    let (plan, report) = agent.create_plan("xylophone zygote", false).await;

    assert!(!report.valid);
    assert!(plan.operations.is_empty());
    assert!(report.errors[0].contains("no relevant data sources"));
}

#[tokio::test]
async fn invalid_plans_are_reported_not_executed() {
    let bad_plan = json!({
        "metadata": {},
        "operations": [{
            "id": "op1",
            "source_id": "postgres_main",
            "db_type": "postgres",
            "params": {"query": "SELECT * FROM invoices"},
        }],
    });
    let agent = agent(
        ScriptedLlm::new()
            .respond_json(classification())
            .respond_json(bad_plan),
    );

    let (_, report) = agent.create_plan("invoices?", false).await;
    assert!(!report.valid);
    assert!(report.errors.iter().any(|e| e.contains("invoices")));
}

#[tokio::test]
async fn unparseable_operations_become_plan_errors() {
    let partially_bad = json!({
        "metadata": {},
        "operations": [
            {
                "id": "op1",
                "source_id": "postgres_main",
                "db_type": "postgres",
                "params": {"query": "SELECT id FROM users"},
            },
            {
                "id": "op2",
                "source_id": "oracle_main",
                "db_type": "oracle",
                "params": {"query": "SELECT 1"},
            },
        ],
    });
    let agent = agent(
        ScriptedLlm::new()
            .respond_json(classification())
            .respond_json(partially_bad),
    );

    let (plan, report) = agent.create_plan("users", false).await;
    assert!(!report.valid);
    assert_eq!(plan.operations.len(), 1);
    assert!(report.errors.iter().any(|e| e.contains("does not parse")));
}

#[tokio::test]
async fn failed_optimization_keeps_the_validated_plan() {
    let agent = agent(
        ScriptedLlm::new()
            .respond_json(classification())
            .respond_json(plan_document())
            .fail("provider down"),
    );

    let (plan, report) = agent.create_plan("orders per user", true).await;

    assert!(report.valid, "errors: {:?}", report.errors);
    assert_eq!(plan.operations.len(), 3);
    assert!(report
        .warnings
        .iter()
        .any(|w| w.contains("optimization skipped")));
}

#[tokio::test]
async fn successful_optimization_replaces_the_plan() {
    let optimized = json!({
        "metadata": {"optimization_notes": "merged the two reads"},
        "operations": [{
            "id": "op1",
            "source_id": "postgres_main",
            "db_type": "postgres",
            "params": {"query": "SELECT id, name FROM users"},
        }],
    });
    let agent = agent(
        ScriptedLlm::new()
            .respond_json(classification())
            .respond_json(plan_document())
            .respond_json(optimized),
    );

    let (plan, report) = agent.create_plan("orders per user", true).await;

    assert!(report.valid, "errors: {:?}", report.errors);
    assert_eq!(plan.operations.len(), 1);
    assert_eq!(
        plan.metadata.optimization_notes.as_deref(),
        Some("merged the two reads")
    );
}

#[tokio::test]
async fn invalid_optimization_output_keeps_the_original() {
    let broken = json!({
        "metadata": {},
        "operations": [{
            "id": "op1",
            "source_id": "postgres_main",
            "db_type": "postgres",
            "params": {"query": "SELECT * FROM not_a_table"},
        }],
    });
    let agent = agent(
        ScriptedLlm::new()
            .respond_json(classification())
            .respond_json(plan_document())
            .respond_json(broken),
    );

    let (plan, report) = agent.create_plan("orders per user", true).await;

    assert!(report.valid);
    assert_eq!(plan.operations.len(), 3);
    assert!(report
        .warnings
        .iter()
        .any(|w| w.contains("keeping the original")));
}

#[tokio::test]
async fn schema_context_respects_the_token_budget() {
    let run = |max_schema_tokens: usize| async move {
        let llm = Arc::new(
            ScriptedLlm::new()
                .respond_json(classification())
                .respond_json(plan_document()),
        );
        let agent = PlanningAgent::new(
            PlanningConfig {
                max_schema_tokens,
                ..PlanningConfig::default()
            },
            llm.clone(),
            seeded_registry(),
            None,
            ProgressBus::new(uuid::Uuid::new_v4()),
        );
        let _ = agent.create_plan("recent users", false).await;
        // The second prompt is the synthesis prompt.
        llm.prompts()[1].clone()
    };

    let rich = run(4000).await;
    assert!(rich.contains("TABLE: users"));

    let starved = run(0).await;
    assert!(!starved.contains("TABLE: users"));
}

#[test]
fn plan_from_value_reads_ids_and_metadata() {
    let (plan, errors) = plan_from_value(json!({
        "id": "plan-7",
        "metadata": {"version": "1.0", "question": "q"},
        "operations": [],
    }));
    assert!(errors.is_empty());
    assert_eq!(plan.id, "plan-7");
    assert_eq!(plan.metadata.question.as_deref(), Some("q"));
}
