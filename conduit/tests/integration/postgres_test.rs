use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bigdecimal::BigDecimal;
use bytes::Bytes;
use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
use conduit::adapter::postgres::PostgresAdapter;
use conduit::adapter::{
    Adapter, AdapterRegistry, DiscoverOptions, OrderBy, ReadOptions, WriteMode, WriteOptions,
};
use conduit::error::ErrorKind;
use conduit::events::EventBus;
use conduit::execution::{
    ChildOptions, ExecutionContext, ExecutionStatus, Mapping, MappingEngine, ResourceSnapshot,
};
use conduit::pool::{PoolManager, PoolStats};
use conduit::store::{ContextStore, PostgresContextStore};
use conduit::types::{Record, SchemaKind, SchemaRef, Value, record_from_pairs};
use conduit_config::shared::{ExecutionConfig, PgConnectionConfig, PoolConfig};
use conduit_postgres::test_utils::{PgDatabase, local_pg_connection_config};
use conduit_telemetry::tracing::init_test_tracing;
use futures::future::join_all;
use serde_json::json;

const SOURCE: &str = "pg-source";
const TARGET: &str = "pg-target";

struct PgSystems {
    database: PgDatabase,
    pools: PoolManager,
    registry: AdapterRegistry,
    events: EventBus,
}

impl PgSystems {
    /// A fresh database with `source_users` holding `rows` users and an empty `target_users`.
    async fn spawn(rows: i64, pool: PoolConfig) -> Self {
        init_test_tracing();
        let database = PgDatabase::new(local_pg_connection_config()).await;
        database
            .run(&format!(
                "create table public.source_users (id bigint primary key, name text);
                 create table public.target_users (id bigint primary key, name text);
                 insert into public.source_users (id, name)
                 select g, 'user-' || g from generate_series(1, {rows}) as g;"
            ))
            .await;

        let events = EventBus::new(4_096);
        let pools = PoolManager::new(events.clone());
        let registry = AdapterRegistry::new();
        for system_id in [SOURCE, TARGET] {
            registry.register(Arc::new(PostgresAdapter::new(
                system_id,
                database.config.clone(),
                pool.clone(),
                pools.clone(),
                events.clone(),
            )));
        }

        Self {
            database,
            pools,
            registry,
            events,
        }
    }

    fn engine(&self) -> MappingEngine {
        MappingEngine::new(self.registry.clone(), self.events.clone())
            .with_resources(ResourceSnapshot::default())
    }

    fn config(&self) -> &PgConnectionConfig {
        &self.database.config
    }

    /// The registered adapter for `system_id`, connected.
    async fn adapter(&self, system_id: &str) -> Arc<dyn Adapter> {
        let adapter = self.registry.get(system_id).unwrap();
        adapter.connect().await.unwrap();
        adapter
    }

    fn pool_stats(&self) -> PoolStats {
        self.pools.stats(&self.config().pool_key()).unwrap()
    }

    /// Waits until no session of the test database is left idle inside a transaction.
    async fn wait_for_no_open_transactions(&self) {
        let mut open = 0;
        for _ in 0..50 {
            open = self
                .database
                .client
                .query_one(
                    "select count(*) from pg_stat_activity \
                     where datname = current_database() and state = 'idle in transaction'",
                    &[],
                )
                .await
                .unwrap()
                .get::<_, i64>(0);
            if open == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        panic!("{open} sessions are still idle in transaction");
    }

    async fn target_rows(&self) -> Vec<(i64, Option<String>)> {
        self.database
            .client
            .query("select id, name from public.target_users order by id", &[])
            .await
            .unwrap()
            .iter()
            .map(|row| (row.get(0), row.get(1)))
            .collect()
    }

    async fn shutdown(self) {
        self.registry.cleanup_all().await;
        self.pools.shutdown().await;
        self.database.drop_database().await;
    }
}

fn copy_users(batch_size: usize) -> Mapping {
    Mapping::new(
        "pg-users-copy",
        SchemaRef::new(SOURCE, "public", "source_users"),
        SchemaRef::new(TARGET, "public", "target_users"),
    )
    .with_write_options(WriteOptions::upsert(["id"]).with_batch_size(batch_size))
}

fn pg_user(id: i64, name: &str) -> Record {
    record_from_pairs([("id", Value::Long(id)), ("name", Value::from(name))])
}

fn small_pool(max_connections: usize) -> PoolConfig {
    PoolConfig {
        min_connections: 0,
        max_connections,
        ..PoolConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn copies_a_table_between_postgres_systems() {
    let systems = PgSystems::spawn(3, small_pool(4)).await;

    let context = systems
        .engine()
        .execute(&copy_users(2), ExecutionConfig::default())
        .await
        .unwrap();

    assert_eq!(context.status(), ExecutionStatus::Completed);
    assert_eq!(context.state.records_processed, 3);
    assert_eq!(context.metrics.batches_written, 2);
    assert_eq!(
        systems.target_rows().await,
        vec![
            (1, Some("user-1".to_string())),
            (2, Some("user-2".to_string())),
            (3, Some("user-3".to_string())),
        ]
    );

    systems.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn rerunning_an_upsert_leaves_the_target_unchanged() {
    let systems = PgSystems::spawn(3, small_pool(4)).await;
    let engine = systems.engine();

    let mut parent = ExecutionContext::new("nightly", ExecutionConfig::default());
    for _ in 0..2 {
        let child = engine
            .execute_child(&mut parent, &copy_users(2), ChildOptions::default())
            .await
            .unwrap();
        assert_eq!(child.status(), ExecutionStatus::Completed);
    }

    assert_eq!(parent.state.records_processed, 6);
    assert_eq!(systems.target_rows().await.len(), 3);

    systems.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_runs_share_a_saturated_pool() {
    let systems = PgSystems::spawn(50, small_pool(2)).await;
    let engine = Arc::new(systems.engine());
    let mapping = copy_users(10);

    let runs = (0..5).map(|_| {
        let engine = engine.clone();
        let mapping = mapping.clone();
        async move { engine.execute(&mapping, ExecutionConfig::default()).await }
    });
    let contexts = join_all(runs).await;

    for context in contexts {
        let context = context.unwrap();
        assert_eq!(context.status(), ExecutionStatus::Completed);
        assert_eq!(context.state.records_processed, 50);
    }

    // Both systems point at the same database and therefore share one pool.
    let stats = systems.pools.stats(&systems.config().pool_key()).unwrap();
    assert!(stats.created <= 2, "pool grew to {} connections", stats.created);
    assert_eq!(stats.timeouts, 0);
    assert_eq!(stats.acquired, stats.released);
    assert_eq!(systems.target_rows().await.len(), 50);

    systems.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn finished_runs_are_persisted_in_postgres() {
    let systems = PgSystems::spawn(3, small_pool(2)).await;
    let store = Arc::new(PostgresContextStore::connect(systems.config()).await.unwrap());
    let engine = systems.engine().with_store(store.clone());

    let mut parent = ExecutionContext::new("nightly", ExecutionConfig::default());
    store.save(&parent).await.unwrap();
    let child = engine
        .execute_child(&mut parent, &copy_users(10), ChildOptions::default())
        .await
        .unwrap();

    let loaded = store.load(child.id).await.unwrap().unwrap();
    assert_eq!(loaded.id, child.id);
    assert_eq!(loaded.parent_id, Some(parent.id));
    assert_eq!(loaded.status(), ExecutionStatus::Completed);
    assert_eq!(loaded.state.records_processed, 3);

    let children = store.list_children(parent.id).await.unwrap();
    assert_eq!(children.len(), 1);

    let snapshot = engine.observe(child.id).await.unwrap();
    assert_eq!(snapshot.summary.records_processed, 3);

    assert!(store.delete(child.id).await.unwrap());
    assert!(!store.delete(child.id).await.unwrap());
    assert!(store.load(child.id).await.unwrap().is_none());

    systems.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn abandoned_transactional_writes_do_not_leak_into_the_pool() {
    let systems = PgSystems::spawn(0, small_pool(1)).await;
    let target = systems.adapter(TARGET).await;
    let schema = target.get_schema("public", "target_users", true).await.unwrap();

    // Another session holds the key, so the transactional upsert blocks after BEGIN.
    systems
        .database
        .run("begin; insert into public.target_users (id, name) values (1, 'held');")
        .await;
    let transactional = WriteOptions {
        transaction: true,
        ..WriteOptions::upsert(["id"])
    };
    let blocked = tokio::time::timeout(
        Duration::from_millis(300),
        target.write_data(&schema, vec![pg_user(1, "blocked")], &transactional),
    )
    .await;
    assert!(blocked.is_err());
    systems.database.run("rollback;").await;

    let written = target
        .write_data(&schema, vec![pg_user(2, "after")], &WriteOptions::upsert(["id"]))
        .await
        .unwrap();
    assert_eq!(written.written, 1);

    assert_eq!(systems.target_rows().await, vec![(2, Some("after".to_string()))]);
    assert!(systems.pool_stats().destroyed >= 1);
    systems.wait_for_no_open_transactions().await;

    systems.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn discovers_keys_foreign_keys_indexes_and_views() {
    let systems = PgSystems::spawn(0, small_pool(2)).await;
    systems
        .database
        .run(
            "create table public.teams (id int4 primary key, name text not null);
             create table public.members (
                 team_id int4 not null references public.teams (id) on delete cascade,
                 member_id int8 not null,
                 email varchar(120),
                 score numeric(10, 2) default 0,
                 primary key (team_id, member_id)
             );
             comment on table public.members is 'team membership';
             create unique index members_email_key on public.members (email);
             create index members_score_idx on public.members (score);
             create materialized view public.team_sizes as
                 select team_id, count(*) as members from public.members group by team_id;",
        )
        .await;
    let adapter = systems.adapter(SOURCE).await;

    let members = adapter.get_schema("public", "members", true).await.unwrap();
    assert_eq!(members.kind, SchemaKind::Table);
    assert_eq!(members.comment.as_deref(), Some("team membership"));
    assert_eq!(members.primary_keys, vec!["team_id", "member_id"]);

    let email = members.column("email").unwrap();
    assert!(email.nullable);
    assert!(!email.primary_key);
    assert_eq!(email.max_length, Some(120));
    let score = members.column("score").unwrap();
    assert_eq!(score.numeric_precision, Some(10));
    assert_eq!(score.numeric_scale, Some(2));
    assert!(score.default_value.is_some());

    assert_eq!(members.foreign_keys.len(), 1);
    let foreign_key = &members.foreign_keys[0];
    assert_eq!(foreign_key.column, "team_id");
    assert_eq!(foreign_key.referenced_table, "teams");
    assert_eq!(foreign_key.referenced_column, "id");
    assert_eq!(foreign_key.on_delete.as_deref(), Some("CASCADE"));
    assert_eq!(foreign_key.on_update.as_deref(), Some("NO ACTION"));
    assert_eq!(members.column("team_id").unwrap().foreign_keys.len(), 1);

    // The primary key index is reported through the columns only.
    let indexes: Vec<(&str, bool, &[String])> = members
        .indexes
        .iter()
        .map(|index| (index.name.as_str(), index.unique, index.columns.as_slice()))
        .collect();
    assert_eq!(
        indexes,
        vec![
            ("members_email_key", true, &["email".to_string()][..]),
            ("members_score_idx", false, &["score".to_string()][..]),
        ]
    );

    let sizes = adapter.get_schema("public", "team_sizes", true).await.unwrap();
    assert_eq!(sizes.kind, SchemaKind::View);
    assert!(sizes.definition.is_some());
    assert!(sizes.primary_keys.is_empty());

    let names = |schemas: Vec<conduit::types::Schema>| {
        schemas.into_iter().map(|schema| schema.name).collect::<Vec<_>>()
    };
    let with_views = DiscoverOptions {
        name_pattern: Some("team%".to_string()),
        ..DiscoverOptions::in_namespace("public")
    };
    assert_eq!(
        names(adapter.discover_schemas(&with_views).await.unwrap()),
        vec!["team_sizes", "teams"]
    );
    let tables_only = DiscoverOptions {
        include_views: false,
        ..with_views
    };
    assert_eq!(
        names(adapter.discover_schemas(&tables_only).await.unwrap()),
        vec!["teams"]
    );

    systems.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn every_universal_type_survives_a_round_trip() {
    let systems = PgSystems::spawn(0, small_pool(2)).await;
    systems
        .database
        .run(
            "create table public.typed (
                 id int8 primary key,
                 flag bool,
                 small int4,
                 ratio float4,
                 precise float8,
                 amount numeric(10, 2),
                 label text,
                 born date,
                 alarm time,
                 local_at timestamp,
                 at timestamptz,
                 payload bytea,
                 doc jsonb,
                 markup xml,
                 tags int8[]
             );",
        )
        .await;
    let adapter = systems.adapter(TARGET).await;
    let schema = adapter.get_schema("public", "typed", true).await.unwrap();

    let full = record_from_pairs([
        ("id", Value::Long(1)),
        ("flag", Value::Bool(true)),
        ("small", Value::Integer(-7)),
        ("ratio", Value::Float(1.5)),
        ("precise", Value::Double(2.25)),
        ("amount", Value::Decimal(BigDecimal::from_str("12.50").unwrap())),
        ("label", Value::from("héllo, \"world\"")),
        ("born", Value::Date(NaiveDate::from_ymd_opt(1990, 2, 28).unwrap())),
        ("alarm", Value::Time(NaiveTime::from_hms_opt(6, 30, 15).unwrap())),
        (
            "local_at",
            Value::DateTime(
                NaiveDate::from_ymd_opt(2024, 3, 1)
                    .unwrap()
                    .and_hms_opt(8, 15, 0)
                    .unwrap(),
            ),
        ),
        (
            "at",
            Value::Timestamp(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()),
        ),
        ("payload", Value::Binary(Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]))),
        ("doc", Value::Json(json!({"plan": "pro", "seats": [1, 2]}))),
        ("markup", Value::Xml("<note>hi</note>".to_string())),
        ("tags", Value::Array(vec![Value::Long(1), Value::Null, Value::Long(3)])),
    ]);
    let empty = record_from_pairs([("id", Value::Long(2)), ("label", Value::Null)]);

    let written = adapter
        .write_data(&schema, vec![full.clone(), empty], &WriteOptions::default())
        .await
        .unwrap();
    assert_eq!(written.written, 2);

    let read = adapter
        .read_data(&schema, &ReadOptions::default().with_order(OrderBy::asc("id")))
        .await
        .unwrap();
    assert_eq!(read.row_count, 2);
    for (column, value) in &full {
        assert_eq!(&read.rows[0][column.as_str()], value, "column {column}");
    }
    for column in schema.column_names().filter(|name| *name != "id") {
        assert_eq!(read.rows[1][column], Value::Null, "column {column}");
    }

    systems.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn replace_and_update_modes_rewrite_matching_rows() {
    let systems = PgSystems::spawn(2, small_pool(2)).await;
    systems
        .database
        .run("insert into public.target_users select * from public.source_users;")
        .await;
    let target = systems.adapter(TARGET).await;
    let schema = target.get_schema("public", "target_users", true).await.unwrap();

    let replace = WriteOptions {
        mode: WriteMode::Replace,
        conflict_columns: vec!["id".to_string()],
        ..WriteOptions::default()
    };
    let replaced = target
        .write_data(&schema, vec![pg_user(2, "replaced"), pg_user(3, "new")], &replace)
        .await
        .unwrap();
    assert_eq!(replaced.written, 2);

    // Rows are matched on the primary key when no other columns are named.
    let update = WriteOptions {
        mode: WriteMode::Update,
        ..WriteOptions::default()
    };
    let updated = target
        .write_data(&schema, vec![pg_user(1, "renamed"), pg_user(9, "missing")], &update)
        .await
        .unwrap();
    assert_eq!(updated.written, 1);

    assert_eq!(
        systems.target_rows().await,
        vec![
            (1, Some("renamed".to_string())),
            (2, Some("replaced".to_string())),
            (3, Some("new".to_string())),
        ]
    );

    systems
        .database
        .run("create table public.audit_log (message text);")
        .await;
    let keyless = target.get_schema("public", "audit_log", true).await.unwrap();
    let err = target
        .write_data(
            &keyless,
            vec![record_from_pairs([("message", Value::from("x"))])],
            &update,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QueryInvalid);

    // Both writes returned their connections to the pool in a reusable state.
    assert_eq!(systems.pool_stats().destroyed, 0);
    systems.wait_for_no_open_transactions().await;

    systems.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn transactions_commit_roll_back_and_discard_abandoned_work() {
    let systems = PgSystems::spawn(0, small_pool(2)).await;
    let target = systems.adapter(TARGET).await;
    let schema = target.get_schema("public", "target_users", true).await.unwrap();
    let upsert = WriteOptions::upsert(["id"]);

    let mut rolled_back = target.begin_transaction().await.unwrap();
    rolled_back
        .write_data(&schema, vec![pg_user(1, "rolled back")], &upsert)
        .await
        .unwrap();
    rolled_back.rollback().await.unwrap();
    assert!(systems.target_rows().await.is_empty());

    let mut committed = target.begin_transaction().await.unwrap();
    committed
        .write_data(&schema, vec![pg_user(2, "committed")], &upsert)
        .await
        .unwrap();
    let inside = committed
        .execute_query("select count(*) as n from public.target_users", &[])
        .await
        .unwrap();
    assert_eq!(inside.rows[0]["n"], Value::Long(1));
    assert!(systems.target_rows().await.is_empty());
    committed.commit().await.unwrap();
    assert_eq!(systems.target_rows().await, vec![(2, Some("committed".to_string()))]);
    assert_eq!(systems.pool_stats().destroyed, 0);

    let mut abandoned = target.begin_transaction().await.unwrap();
    abandoned
        .write_data(&schema, vec![pg_user(3, "abandoned")], &upsert)
        .await
        .unwrap();
    drop(abandoned);

    assert_eq!(systems.pool_stats().destroyed, 1);
    systems.wait_for_no_open_transactions().await;
    assert_eq!(systems.target_rows().await.len(), 1);

    systems.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn queries_check_their_parameters() {
    let systems = PgSystems::spawn(2, small_pool(2)).await;
    let source = systems.adapter(SOURCE).await;

    let result = source
        .execute_query("select $1::int8 + 1 as next", &[Value::Long(41)])
        .await
        .unwrap();
    assert_eq!(result.command, "SELECT");
    assert_eq!(result.row_count, 1);
    assert_eq!(result.rows[0]["next"], Value::Long(42));
    assert_eq!(result.fields[0].name, "next");
    assert_eq!(result.fields[0].native_type, "int8");

    let updated = source
        .execute_query(
            "update public.source_users set name = $1 where id >= $2",
            &[Value::from("renamed"), Value::Long(2)],
        )
        .await
        .unwrap();
    assert_eq!(updated.command, "UPDATE");
    assert_eq!(updated.row_count, 1);
    assert!(updated.rows.is_empty());

    let err = source
        .execute_query("select $1::int8, $2::text", &[Value::Long(1)])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QueryInvalid);

    let err = source.execute_query("selec 1", &[]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QueryInvalid);

    systems.shutdown().await;
}
