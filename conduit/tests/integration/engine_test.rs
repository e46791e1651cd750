use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use conduit::adapter::{AdapterRegistry, MemoryAdapter, WriteOptions};
use conduit::conduit_error;
use conduit::error::ErrorKind;
use conduit::events::{Event, EventBus};
use conduit::execution::{
    ChildOptions, ExecutionContext, ExecutionStatus, Mapping, MappingDefinition, MappingEngine,
    ResourceSnapshot,
};
use conduit::store::{ContextStore, MemoryContextStore};
use conduit::test_utils::adapter::FaultyAdapter;
use conduit::test_utils::fixtures::{
    USERS_NAMESPACE, USERS_TABLE, memory_users, memory_users_with, user, user_ids, users,
    users_ref,
};
use conduit::types::Value;
use conduit::validation::Condition;
use conduit_config::shared::{ErrorPolicy, ExecutionConfig};
use conduit_telemetry::tracing::init_test_tracing;
use serde_json::json;
use tokio::sync::broadcast::error::TryRecvError;

const SOURCE: &str = "source";
const TARGET: &str = "target";

struct Systems {
    events: EventBus,
    registry: AdapterRegistry,
    source: Arc<MemoryAdapter>,
    target: Arc<MemoryAdapter>,
}

impl Systems {
    async fn with_users(count: i64) -> Self {
        let events = EventBus::new(4_096);
        let source = memory_users_with(SOURCE, events.clone(), users(count)).await;
        let target = memory_users(TARGET, events.clone()).await;

        let registry = AdapterRegistry::new();
        registry.register(source.clone());
        registry.register(target.clone());

        Self {
            events,
            registry,
            source,
            target,
        }
    }

    /// Replaces the registered target with a fault injecting wrapper around it.
    fn wrap_target(&self, wrap: impl FnOnce(FaultyAdapter) -> FaultyAdapter) -> FaultyAdapter {
        let faulty = wrap(FaultyAdapter::new(self.target.clone()));
        self.registry.register(Arc::new(faulty.clone()));

        faulty
    }

    fn engine(&self) -> MappingEngine {
        MappingEngine::new(self.registry.clone(), self.events.clone())
            .with_resources(ResourceSnapshot::default())
    }
}

fn upsert_users(batch_size: usize) -> Mapping {
    Mapping::new("users-copy", users_ref(SOURCE), users_ref(TARGET))
        .with_write_options(WriteOptions::upsert(["id"]).with_batch_size(batch_size))
}

fn fast_retries() -> ExecutionConfig {
    ExecutionConfig {
        retry_attempts: 3,
        retry_delay_ms: 10,
        max_retry_delay_ms: 50,
        ..ExecutionConfig::default()
    }
}

fn drain(receiver: &mut tokio::sync::broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    loop {
        match receiver.try_recv() {
            Ok(event) => events.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => return events,
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn identity_upsert_copies_every_row_in_batches() {
    init_test_tracing();
    let systems = Systems::with_users(3).await;
    let mut events = systems.events.subscribe();

    let context = systems
        .engine()
        .execute(&upsert_users(2), ExecutionConfig::default())
        .await
        .unwrap();

    assert_eq!(context.status(), ExecutionStatus::Completed);
    assert_eq!(context.state.records_processed, 3);
    assert_eq!(context.state.records_failed, 0);
    assert!(context.state.errors.is_empty());
    assert_eq!(context.state.progress, 100.0);
    assert_eq!(context.metrics.batches_written, 2);
    assert!(context.state.duration_ms.is_some());
    assert_eq!(user_ids(&systems.target).await, vec![1, 2, 3]);

    let names = drain(&mut events)
        .into_iter()
        .filter(|event| event.context_id() == Some(context.id))
        .map(|event| event.name())
        .collect::<Vec<_>>();
    assert_eq!(names.first(), Some(&"execution.started"));
    assert_eq!(names.last(), Some(&"execution.completed"));
    assert_eq!(
        names.iter().filter(|name| **name == "execution.progress").count(),
        2
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn rerunning_an_upsert_is_idempotent() {
    init_test_tracing();
    let systems = Systems::with_users(3).await;
    let engine = systems.engine();
    let mapping = upsert_users(2);

    for _ in 0..2 {
        let context = engine
            .execute(&mapping, ExecutionConfig::default())
            .await
            .unwrap()
            .into_result()
            .unwrap();
        assert_eq!(context.state.records_processed, 3);
    }

    assert_eq!(
        systems.target.row_count(USERS_NAMESPACE, USERS_TABLE).await.unwrap(),
        3
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn skip_policy_drops_invalid_records_and_keeps_going() {
    init_test_tracing();
    let systems = Systems::with_users(0).await;
    systems
        .source
        .insert_rows(
            USERS_NAMESPACE,
            USERS_TABLE,
            vec![
                user(1, Some("ada")),
                user(2, Some("grace")),
                user(3, None),
                user(4, Some("edsger")),
                user(5, Some("barbara")),
            ],
        )
        .await
        .unwrap();

    let definition: MappingDefinition = serde_json::from_value(json!({
        "id": "named-users",
        "source": {"systemId": SOURCE, "namespace": "public", "name": "users"},
        "target": {"systemId": TARGET, "namespace": "public", "name": "users"},
        "mode": "upsert",
        "conflictColumns": ["id"],
        "rules": [{"name": "name required", "field": "name", "check": "required"}]
    }))
    .unwrap();
    let mapping = Mapping::from_definition(&definition).unwrap();

    let config = ExecutionConfig {
        error_policy: ErrorPolicy::Skip,
        ..ExecutionConfig::default()
    };
    let context = systems.engine().execute(&mapping, config).await.unwrap();

    assert_eq!(context.status(), ExecutionStatus::Completed);
    assert_eq!(context.state.records_processed, 4);
    assert_eq!(context.state.records_failed, 1);
    assert_eq!(context.state.errors.len(), 1);

    let issue = &context.state.errors[0];
    assert_eq!(issue.kind, ErrorKind::ValidationFailed);
    assert_eq!(issue.stage.as_deref(), Some("validate_input"));
    assert_eq!(issue.record.as_ref().and_then(|record| record["id"].as_i64()), Some(3));
    assert_eq!(user_ids(&systems.target).await, vec![1, 2, 4, 5]);
}

#[tokio::test(flavor = "multi_thread")]
async fn strict_mode_fails_on_the_first_invalid_record() {
    init_test_tracing();
    let systems = Systems::with_users(0).await;
    systems
        .source
        .insert_rows(USERS_NAMESPACE, USERS_TABLE, vec![user(1, None)])
        .await
        .unwrap();

    let definition: MappingDefinition = serde_json::from_value(json!({
        "id": "strict-users",
        "source": {"systemId": SOURCE, "namespace": "public", "name": "users"},
        "target": {"systemId": TARGET, "namespace": "public", "name": "users"},
        "rules": [{"name": "name required", "field": "name", "check": "required"}]
    }))
    .unwrap();
    let mapping = Mapping::from_definition(&definition).unwrap();

    let config = ExecutionConfig {
        strict_mode: true,
        ..ExecutionConfig::default()
    };
    let context = systems.engine().execute(&mapping, config).await.unwrap();

    assert_eq!(context.status(), ExecutionStatus::Failed);
    assert_eq!(
        context.clone().into_result().unwrap_err().kind(),
        ErrorKind::ValidationFailed
    );
    assert!(user_ids(&systems.target).await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_write_failures_are_retried() {
    init_test_tracing();
    let systems = Systems::with_users(3).await;
    let faulty = systems.wrap_target(|adapter| adapter.fail_next_writes(1, ErrorKind::Transient));

    let context = systems
        .engine()
        .execute(&upsert_users(10), fast_retries())
        .await
        .unwrap();

    assert_eq!(context.status(), ExecutionStatus::Completed);
    assert_eq!(context.state.retry_count, 1);
    assert_eq!(context.state.records_processed, 3);
    assert_eq!(faulty.write_calls(), 2);
    assert_eq!(user_ids(&systems.target).await, vec![1, 2, 3]);
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_retries_fail_the_run_under_stop() {
    init_test_tracing();
    let systems = Systems::with_users(3).await;
    let faulty = systems.wrap_target(|adapter| adapter.fail_next_writes(10, ErrorKind::Transient));

    let config = ExecutionConfig {
        retry_attempts: 2,
        error_policy: ErrorPolicy::Stop,
        ..fast_retries()
    };
    let context = systems.engine().execute(&upsert_users(10), config).await.unwrap();

    assert_eq!(context.status(), ExecutionStatus::Failed);
    assert_eq!(context.state.retry_count, 2);
    assert_eq!(faulty.write_calls(), 3);
    assert_eq!(context.state.errors.last().map(|issue| issue.kind), Some(ErrorKind::Transient));
}

#[tokio::test(flavor = "multi_thread")]
async fn skip_policy_isolates_rejected_rows_of_a_batch() {
    init_test_tracing();
    let systems = Systems::with_users(4).await;
    let faulty =
        systems.wrap_target(|adapter| adapter.fail_next_writes(1, ErrorKind::ConstraintViolated));

    let config = ExecutionConfig {
        error_policy: ErrorPolicy::Skip,
        ..fast_retries()
    };
    let context = systems.engine().execute(&upsert_users(10), config).await.unwrap();

    // The failed batch is written again one row at a time.
    assert_eq!(context.status(), ExecutionStatus::Completed);
    assert_eq!(context.state.retry_count, 0);
    assert_eq!(context.state.records_processed, 4);
    assert_eq!(faulty.write_calls(), 5);
    assert_eq!(user_ids(&systems.target).await, vec![1, 2, 3, 4]);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_stops_before_the_next_batch() {
    init_test_tracing();
    let systems = Systems::with_users(10_000).await;

    let slot: Arc<OnceLock<Weak<MappingEngine>>> = Arc::new(OnceLock::new());
    let hook_slot = slot.clone();
    let faulty = systems.wrap_target(move |adapter| {
        adapter.on_write(move |written| {
            if written < 2_500 {
                return;
            }
            if let Some(engine) = hook_slot.get().and_then(Weak::upgrade) {
                for id in engine.active_runs() {
                    let _ = engine.cancel(id, "enough rows");
                }
            }
        })
    });

    let engine = Arc::new(systems.engine());
    slot.set(Arc::downgrade(&engine)).unwrap();

    let context = engine
        .execute(&upsert_users(100), ExecutionConfig::default())
        .await
        .unwrap();

    assert_eq!(context.status(), ExecutionStatus::Cancelled);
    assert_eq!(context.state.cancel_reason.as_deref(), Some("enough rows"));
    assert!((2_500..=2_600).contains(&context.state.records_processed));
    assert_eq!(faulty.written(), context.state.records_processed);
    assert_eq!(
        systems.target.row_count(USERS_NAMESPACE, USERS_TABLE).await.unwrap() as u64,
        context.state.records_processed
    );
    assert!(engine.active_runs().is_empty());
    assert_eq!(
        context.into_result().unwrap_err().kind(),
        ErrorKind::Cancelled
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelling_an_unknown_run_is_not_found() {
    init_test_tracing();
    let systems = Systems::with_users(0).await;

    let err = systems
        .engine()
        .cancel(uuid::Uuid::new_v4(), "nothing to cancel")
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_policy_fails_on_transform_errors() {
    init_test_tracing();
    let systems = Systems::with_users(3).await;
    let mapping = upsert_users(10).map("id", "id").compute("name", |record| {
        if record["id"] == Value::Long(2) {
            return Err(conduit_error!(ErrorKind::ConversionError, "Unreadable name"));
        }
        Ok(record["name"].clone())
    });

    let config = ExecutionConfig {
        error_policy: ErrorPolicy::Stop,
        ..ExecutionConfig::default()
    };
    let context = systems.engine().execute(&mapping, config).await.unwrap();

    assert_eq!(context.status(), ExecutionStatus::Failed);
    assert_eq!(
        context.into_result().unwrap_err().kind(),
        ErrorKind::ConversionError
    );
    let written = user_ids(&systems.target).await;
    assert!(!written.contains(&2) && !written.contains(&3));
}

#[tokio::test(flavor = "multi_thread")]
async fn pre_conditions_filter_source_records() {
    init_test_tracing();
    let systems = Systems::with_users(5).await;
    let mapping = upsert_users(10)
        .with_pre_condition(Condition::parse(&json!({"id": {"$gt": 2}})).unwrap());

    let context = systems
        .engine()
        .execute(&mapping, ExecutionConfig::default())
        .await
        .unwrap();

    assert_eq!(context.status(), ExecutionStatus::Completed);
    assert_eq!(context.state.records_processed, 3);
    assert_eq!(context.state.records_filtered, 2);
    assert_eq!(user_ids(&systems.target).await, vec![3, 4, 5]);
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_systems_are_reported_as_unavailable() {
    init_test_tracing();
    let systems = Systems::with_users(1).await;
    let engine = systems.engine();

    let missing_source = Mapping::new("m", users_ref("nowhere"), users_ref(TARGET));
    let context = engine
        .execute(&missing_source, ExecutionConfig::default())
        .await
        .unwrap();
    assert_eq!(context.status(), ExecutionStatus::Failed);
    assert_eq!(context.state.errors[0].kind, ErrorKind::SourceUnavailable);

    let missing_target = Mapping::new("m", users_ref(SOURCE), users_ref("nowhere"));
    let context = engine
        .execute(&missing_target, ExecutionConfig::default())
        .await
        .unwrap();
    assert_eq!(context.state.errors[0].kind, ErrorKind::TargetUnavailable);
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_configuration_is_rejected_before_running() {
    init_test_tracing();
    let systems = Systems::with_users(1).await;

    let config = ExecutionConfig {
        timeout_ms: 0,
        ..ExecutionConfig::default()
    };
    let err = systems
        .engine()
        .execute(&upsert_users(10), config)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
}

#[tokio::test(flavor = "multi_thread")]
async fn runs_exceeding_their_timeout_fail() {
    init_test_tracing();
    let systems = Systems::with_users(10).await;
    let faulty = systems.wrap_target(|faulty| faulty.with_write_delay(Duration::from_millis(200)));

    let config = ExecutionConfig {
        timeout_ms: 300,
        ..ExecutionConfig::default()
    };
    let started = Instant::now();
    let context = systems
        .engine()
        .execute(&upsert_users(2), config)
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(context.status(), ExecutionStatus::Failed);
    assert_eq!(
        context.state.errors.last().map(|issue| issue.kind),
        Some(ErrorKind::Timeout)
    );
    assert!(faulty.written() < 10);
    assert!(user_ids(&systems.target).await.len() < 10);
    assert_eq!(context.into_result().unwrap_err().kind(), ErrorKind::Timeout);
}

#[tokio::test(flavor = "multi_thread")]
async fn finished_runs_can_be_observed_through_the_store() {
    init_test_tracing();
    let systems = Systems::with_users(3).await;
    let store = MemoryContextStore::new();
    let engine = systems.engine().with_store(Arc::new(store.clone()));

    let config = ExecutionConfig {
        enable_profiling: true,
        ..ExecutionConfig::default()
    };
    let context = engine.execute(&upsert_users(10), config).await.unwrap();

    let snapshot = engine.observe(context.id).await.unwrap();
    assert_eq!(snapshot.summary.status, ExecutionStatus::Completed);
    assert_eq!(snapshot.summary.records_processed, 3);
    assert_eq!(snapshot.metrics.batches_written, 1);

    let profiling = snapshot.profiling.unwrap();
    for stage in ["read", "transform", "write"] {
        assert!(profiling.contains_key(stage), "missing stage {stage}");
    }

    let stored: ExecutionContext = store.load(context.id).await.unwrap().unwrap();
    assert_eq!(stored.id, context.id);
    assert_eq!(
        engine.observe(uuid::Uuid::new_v4()).await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn child_runs_are_merged_into_their_parent() {
    init_test_tracing();
    let systems = Systems::with_users(3).await;
    let engine = systems.engine();

    let mut parent = ExecutionContext::new("batch-job", ExecutionConfig::default());
    let first = engine
        .execute_child(&mut parent, &upsert_users(2), ChildOptions::default())
        .await
        .unwrap();
    let second = engine
        .execute_child(&mut parent, &upsert_users(10), ChildOptions::default())
        .await
        .unwrap();

    assert_eq!(first.parent_id, Some(parent.id));
    assert_eq!(first.status(), ExecutionStatus::Completed);
    assert_eq!(second.mapping_id(), "users-copy");
    assert_eq!(parent.state.records_processed, 6);
    assert_eq!(parent.metrics.batches_written, 3);
    assert_eq!(parent.status(), ExecutionStatus::Initialized);
}
