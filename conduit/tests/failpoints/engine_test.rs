use conduit::adapter::{AdapterRegistry, WriteOptions};
use conduit::error::ErrorKind;
use conduit::events::EventBus;
use conduit::execution::{ExecutionStatus, Mapping, MappingEngine, ResourceSnapshot};
use conduit::failpoints::BEFORE_BATCH_WRITE;
use conduit::test_utils::fixtures::{memory_users, memory_users_with, user_ids, users, users_ref};
use conduit_config::shared::{ErrorPolicy, ExecutionConfig};
use conduit_telemetry::tracing::init_test_tracing;
use fail::FailScenario;

async fn engine_with_users(count: i64) -> (MappingEngine, std::sync::Arc<conduit::adapter::MemoryAdapter>) {
    let events = EventBus::new(1_024);
    let source = memory_users_with("source", events.clone(), users(count)).await;
    let target = memory_users("target", events.clone()).await;

    let registry = AdapterRegistry::new();
    registry.register(source);
    registry.register(target.clone());

    let engine = MappingEngine::new(registry, events).with_resources(ResourceSnapshot::default());
    (engine, target)
}

fn mapping() -> Mapping {
    Mapping::new("users-copy", users_ref("source"), users_ref("target"))
        .with_write_options(WriteOptions::upsert(["id"]).with_batch_size(10))
}

fn config(error_policy: ErrorPolicy) -> ExecutionConfig {
    ExecutionConfig {
        retry_attempts: 3,
        retry_delay_ms: 10,
        max_retry_delay_ms: 50,
        error_policy,
        ..ExecutionConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_injected_write_errors_are_retried() {
    init_test_tracing();
    let scenario = FailScenario::setup();
    fail::cfg(BEFORE_BATCH_WRITE, "2*return(transient)").unwrap();

    let (engine, target) = engine_with_users(3).await;
    let context = engine.execute(&mapping(), config(ErrorPolicy::Stop)).await.unwrap();

    assert_eq!(context.status(), ExecutionStatus::Completed);
    assert_eq!(context.state.retry_count, 2);
    assert_eq!(user_ids(&target).await, vec![1, 2, 3]);

    scenario.teardown();
}

#[tokio::test(flavor = "multi_thread")]
async fn fatal_injected_write_errors_fail_the_run() {
    init_test_tracing();
    let scenario = FailScenario::setup();
    fail::cfg(BEFORE_BATCH_WRITE, "return(fatal)").unwrap();

    let (engine, target) = engine_with_users(3).await;
    let context = engine.execute(&mapping(), config(ErrorPolicy::Stop)).await.unwrap();

    assert_eq!(context.status(), ExecutionStatus::Failed);
    assert_eq!(context.state.retry_count, 0);
    assert_eq!(
        context.into_result().unwrap_err().kind(),
        ErrorKind::InjectedFatal
    );
    assert!(user_ids(&target).await.is_empty());

    scenario.teardown();
}

#[tokio::test(flavor = "multi_thread")]
async fn skip_policy_records_every_row_a_fatal_write_rejects() {
    init_test_tracing();
    let scenario = FailScenario::setup();
    fail::cfg(BEFORE_BATCH_WRITE, "return(fatal)").unwrap();

    let (engine, target) = engine_with_users(3).await;
    let context = engine.execute(&mapping(), config(ErrorPolicy::Skip)).await.unwrap();

    // Every row is retried on its own and rejected again.
    assert_eq!(context.status(), ExecutionStatus::Completed);
    assert_eq!(context.state.records_processed, 0);
    assert_eq!(context.state.records_failed, 3);
    assert!(
        context
            .state
            .errors
            .iter()
            .all(|issue| issue.kind == ErrorKind::InjectedFatal && issue.stage.as_deref() == Some("write"))
    );
    assert!(user_ids(&target).await.is_empty());

    scenario.teardown();
}
