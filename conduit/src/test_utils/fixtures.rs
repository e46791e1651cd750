use std::sync::Arc;

use crate::adapter::MemoryAdapter;
use crate::events::EventBus;
use crate::types::{Column, Record, Schema, SchemaKind, SchemaRef, UniversalType, Value, record_from_pairs};

pub const USERS_NAMESPACE: &str = "public";
pub const USERS_TABLE: &str = "users";

/// `public.users(id int8 primary key, name text)`.
pub fn users_schema(system_id: &str) -> Schema {
    Schema::new(
        system_id,
        USERS_NAMESPACE,
        USERS_TABLE,
        SchemaKind::Table,
        vec![
            Column::new("id", 1, "int8", UniversalType::Long).with_primary_key(),
            Column::new("name", 2, "text", UniversalType::String).with_nullable(true),
        ],
    )
}

pub fn users_ref(system_id: &str) -> SchemaRef {
    SchemaRef::new(system_id, USERS_NAMESPACE, USERS_TABLE)
}

pub fn user(id: i64, name: Option<&str>) -> Record {
    record_from_pairs([
        ("id", Value::Long(id)),
        ("name", name.map(Value::from).unwrap_or(Value::Null)),
    ])
}

/// Users `1..=count` named `user-<id>`.
pub fn users(count: i64) -> Vec<Record> {
    (1..=count)
        .map(|id| user(id, Some(&format!("user-{id}"))))
        .collect()
}

/// A connected memory adapter holding an empty users table.
pub async fn memory_users(system_id: &str, events: EventBus) -> Arc<MemoryAdapter> {
    use crate::adapter::Adapter;

    let adapter = Arc::new(MemoryAdapter::new(system_id, events));
    adapter.create_table(users_schema(system_id)).await;
    adapter
        .connect()
        .await
        .expect("memory adapters always connect");

    adapter
}

/// A connected memory adapter whose users table holds `rows`.
pub async fn memory_users_with(system_id: &str, events: EventBus, rows: Vec<Record>) -> Arc<MemoryAdapter> {
    let adapter = memory_users(system_id, events).await;
    adapter
        .insert_rows(USERS_NAMESPACE, USERS_TABLE, rows)
        .await
        .expect("the users table exists");

    adapter
}

/// Ids of the rows of the users table of `adapter`, sorted.
pub async fn user_ids(adapter: &MemoryAdapter) -> Vec<i64> {
    let mut ids: Vec<i64> = adapter
        .rows(USERS_NAMESPACE, USERS_TABLE)
        .await
        .expect("the users table exists")
        .iter()
        .filter_map(|row| row.get("id").and_then(Value::as_i64))
        .collect();
    ids.sort();

    ids
}
