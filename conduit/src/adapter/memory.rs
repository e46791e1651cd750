use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::adapter::base::{Adapter, Transaction};
use crate::adapter::cache::SchemaCache;
use crate::adapter::capabilities::{Capabilities, Capability, Operation, SupportedOperations};
use crate::adapter::filter::{Filter, like_regex};
use crate::adapter::options::{
    DiscoverOptions, OnConflict, OrderBy, QueryResult, ReadOptions, ReadResult, SortDirection,
    SystemMetadata, WriteMode, WriteOptions, WriteResult,
};
use crate::bail;
use crate::error::{ConduitResult, ErrorKind};
use crate::events::{Event, EventBus};
use crate::types::{Record, Schema, SchemaKind, Value};

const NULL: &Value = &Value::Null;

#[derive(Debug, Clone)]
struct Table {
    schema: Schema,
    rows: Vec<Record>,
}

type Tables = BTreeMap<(String, String), Table>;

#[derive(Debug, Default)]
struct Inner {
    tables: Tables,
}

/// An adapter keeping tables of records in process memory.
///
/// It evaluates the whole filter grammar, ordering, pagination and every write mode, and enforces
/// primary keys and non-nullable columns the way a database would. Raw queries are not supported.
///
/// A transaction holds the adapter lock until it commits or rolls back, so it must not be
/// interleaved with other calls on the same adapter from the same task.
#[derive(Debug, Clone)]
pub struct MemoryAdapter {
    system_id: String,
    connected: Arc<AtomicBool>,
    inner: Arc<Mutex<Inner>>,
    cache: SchemaCache,
    events: EventBus,
}

impl MemoryAdapter {
    /// Creates a new memory adapter without any table.
    pub fn new(system_id: impl Into<String>, events: EventBus) -> Self {
        Self {
            system_id: system_id.into(),
            connected: Arc::new(AtomicBool::new(false)),
            inner: Arc::new(Mutex::new(Inner::default())),
            cache: SchemaCache::default(),
            events,
        }
    }

    /// Creates or replaces a table. The schema's system id is set to this adapter's.
    pub async fn create_table(&self, mut schema: Schema) {
        schema.system_id = self.system_id.clone();
        let key = (schema.namespace.clone(), schema.name.clone());
        self.cache.invalidate(&key.0, &key.1).await;

        let mut inner = self.inner.lock().await;
        inner.tables.insert(
            key,
            Table {
                schema,
                rows: Vec::new(),
            },
        );
    }

    /// Appends rows without going through the write contract.
    pub async fn insert_rows(
        &self,
        namespace: &str,
        name: &str,
        rows: Vec<Record>,
    ) -> ConduitResult<()> {
        let mut inner = self.inner.lock().await;
        let table = table_mut(&mut inner.tables, namespace, name)?;
        table.rows.extend(rows);

        Ok(())
    }

    /// Returns every row of a table in storage order.
    pub async fn rows(&self, namespace: &str, name: &str) -> ConduitResult<Vec<Record>> {
        let inner = self.inner.lock().await;
        let table = table_ref(&inner.tables, namespace, name)?;

        Ok(table.rows.clone())
    }

    /// Returns the number of rows stored in a table.
    pub async fn row_count(&self, namespace: &str, name: &str) -> ConduitResult<usize> {
        let inner = self.inner.lock().await;
        Ok(table_ref(&inner.tables, namespace, name)?.rows.len())
    }

    fn ensure_connected(&self) -> ConduitResult<()> {
        if !self.is_connected() {
            bail!(
                ErrorKind::InvalidState,
                "Adapter is not connected",
                self.system_id.clone()
            );
        }

        Ok(())
    }
}

#[async_trait]
impl Adapter for MemoryAdapter {
    fn system_id(&self) -> &str {
        &self.system_id
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            schema_discovery: true,
            batch_operations: true,
            streaming: true,
            transactions: true,
            partitioning: false,
            cdc: false,
            incremental_sync: true,
            custom_query: false,
        }
    }

    fn supported_operations(&self) -> SupportedOperations {
        SupportedOperations {
            create_schema: false,
            drop_schema: false,
            ..SupportedOperations::all()
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(AtomicOrdering::SeqCst)
    }

    async fn connect(&self) -> ConduitResult<()> {
        if self.connected.swap(true, AtomicOrdering::SeqCst) {
            return Ok(());
        }

        info!(system_id = %self.system_id, "memory adapter connected");
        self.events.publish(Event::AdapterConnected {
            system_id: self.system_id.clone(),
            server_version: None,
        });

        Ok(())
    }

    async fn disconnect(&self) -> ConduitResult<()> {
        if !self.connected.swap(false, AtomicOrdering::SeqCst) {
            return Ok(());
        }

        self.cache.clear().await;
        info!(system_id = %self.system_id, "memory adapter disconnected");
        self.events.publish(Event::AdapterDisconnected {
            system_id: self.system_id.clone(),
        });

        Ok(())
    }

    async fn test_connection(&self) -> bool {
        self.is_connected()
    }

    async fn system_metadata(&self) -> ConduitResult<SystemMetadata> {
        let inner = self.inner.lock().await;

        let mut properties = serde_json::Map::new();
        properties.insert("tables".to_string(), inner.tables.len().into());

        Ok(SystemMetadata {
            system_id: self.system_id.clone(),
            system_type: "memory".to_string(),
            version: None,
            properties,
        })
    }

    async fn discover_schemas(&self, options: &DiscoverOptions) -> ConduitResult<Vec<Schema>> {
        self.require_capability(Capability::SchemaDiscovery)?;
        self.ensure_connected()?;

        let name_pattern = options
            .name_pattern
            .as_deref()
            .map(|pattern| like_regex(pattern, false))
            .transpose()?;

        let inner = self.inner.lock().await;
        let mut schemas: Vec<Schema> = inner
            .tables
            .values()
            .map(|table| &table.schema)
            .filter(|schema| {
                options
                    .namespace
                    .as_ref()
                    .is_none_or(|namespace| &schema.namespace == namespace)
            })
            .filter(|schema| {
                name_pattern
                    .as_ref()
                    .is_none_or(|pattern| pattern.is_match(&schema.name))
            })
            .filter(|schema| options.include_views || schema.kind != SchemaKind::View)
            .take(options.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        drop(inner);

        if !options.include_indexes {
            for schema in &mut schemas {
                schema.indexes.clear();
            }
        }

        self.cache.insert_all(&schemas).await;

        Ok(schemas)
    }

    async fn get_schema(
        &self,
        namespace: &str,
        name: &str,
        refresh: bool,
    ) -> ConduitResult<Schema> {
        self.ensure_connected()?;

        if !refresh {
            if let Some(schema) = self.cache.get(namespace, name).await {
                return Ok(schema.as_ref().clone());
            }
        }

        let schema = {
            let inner = self.inner.lock().await;
            table_ref(&inner.tables, namespace, name)?.schema.clone()
        };

        Ok(self.cache.insert(schema).await.as_ref().clone())
    }

    async fn read_data(&self, schema: &Schema, options: &ReadOptions) -> ConduitResult<ReadResult> {
        self.require_operation(Operation::Read)?;
        self.ensure_connected()?;

        if !options.joins.is_empty() || !options.group_by.is_empty() || !options.having.is_empty()
        {
            bail!(
                ErrorKind::Unsupported,
                "Joins and grouping are not supported by the memory adapter"
            );
        }

        let inner = self.inner.lock().await;
        let table = table_ref(&inner.tables, &schema.namespace, &schema.name)?;

        let mut rows = Vec::new();
        for row in &table.rows {
            if matches_all(&options.filters, row)? {
                rows.push(row);
            }
        }

        if !options.order_by.is_empty() {
            rows.sort_by(|a, b| compare_rows(a, b, &options.order_by));
        }

        let total_count = options.include_total_count.then_some(rows.len() as u64);
        let offset = options.offset.unwrap_or(0) as usize;
        let limit = options.limit.map(|limit| limit as usize).unwrap_or(usize::MAX);

        let rows: Vec<Record> = rows
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|row| project(row, &options.columns))
            .collect();

        Ok(ReadResult {
            row_count: rows.len(),
            rows,
            total_count,
            metadata: serde_json::Map::new(),
        })
    }

    async fn write_data(
        &self,
        schema: &Schema,
        data: Vec<Record>,
        options: &WriteOptions,
    ) -> ConduitResult<WriteResult> {
        self.require_write_mode(options.mode)?;
        self.ensure_connected()?;

        let mut inner = self.inner.lock().await;
        if options.transaction {
            // One snapshot for the whole call.
            let mut working = inner.tables.clone();
            let result = write_batches(&mut working, schema, data, options)?;
            inner.tables = working;
            return Ok(result);
        }

        write_batches(&mut inner.tables, schema, data, options)
    }

    async fn execute_query(&self, _sql: &str, _params: &[Value]) -> ConduitResult<QueryResult> {
        self.require_capability(Capability::CustomQuery)?;
        bail!(ErrorKind::Unsupported, "Raw queries are not supported");
    }

    async fn begin_transaction(&self) -> ConduitResult<Box<dyn Transaction>> {
        self.require_capability(Capability::Transactions)?;
        self.ensure_connected()?;

        let guard = Arc::clone(&self.inner).lock_owned().await;
        let snapshot = guard.tables.clone();
        debug!(system_id = %self.system_id, "memory transaction started");

        Ok(Box::new(MemoryTransaction {
            guard: Some(guard),
            snapshot: Some(snapshot),
            system_id: self.system_id.clone(),
            supported: self.supported_operations(),
        }))
    }
}

/// Writes applied directly to the adapter state while holding its lock.
struct MemoryTransaction {
    guard: Option<OwnedMutexGuard<Inner>>,
    snapshot: Option<Tables>,
    system_id: String,
    supported: SupportedOperations,
}

impl MemoryTransaction {
    fn inner(&mut self) -> ConduitResult<&mut Inner> {
        match self.guard.as_deref_mut() {
            Some(inner) => Ok(inner),
            None => bail!(ErrorKind::InvalidState, "Transaction already finished"),
        }
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn write_data(
        &mut self,
        schema: &Schema,
        data: Vec<Record>,
        options: &WriteOptions,
    ) -> ConduitResult<WriteResult> {
        self.supported.require(Operation::Write, &self.system_id)?;
        self.supported
            .require(Operation::for_write_mode(options.mode), &self.system_id)?;

        let inner = self.inner()?;
        write_batches(&mut inner.tables, schema, data, options)
    }

    async fn execute_query(&mut self, _sql: &str, _params: &[Value]) -> ConduitResult<QueryResult> {
        bail!(ErrorKind::Unsupported, "Raw queries are not supported");
    }

    async fn commit(mut self: Box<Self>) -> ConduitResult<()> {
        self.snapshot = None;
        self.guard = None;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> ConduitResult<()> {
        self.restore();
        Ok(())
    }
}

impl MemoryTransaction {
    fn restore(&mut self) {
        if let (Some(mut guard), Some(snapshot)) = (self.guard.take(), self.snapshot.take()) {
            guard.tables = snapshot;
        }
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.restore();
    }
}

fn table_ref<'a>(tables: &'a Tables, namespace: &str, name: &str) -> ConduitResult<&'a Table> {
    match tables.get(&(namespace.to_string(), name.to_string())) {
        Some(table) => Ok(table),
        None => bail!(
            ErrorKind::NotFound,
            "Table not found",
            format!("{namespace}.{name}")
        ),
    }
}

fn table_mut<'a>(
    tables: &'a mut Tables,
    namespace: &str,
    name: &str,
) -> ConduitResult<&'a mut Table> {
    match tables.get_mut(&(namespace.to_string(), name.to_string())) {
        Some(table) => Ok(table),
        None => bail!(
            ErrorKind::NotFound,
            "Table not found",
            format!("{namespace}.{name}")
        ),
    }
}

fn matches_all(filters: &[Filter], row: &Record) -> ConduitResult<bool> {
    for filter in filters {
        if !filter.matches(row)? {
            return Ok(false);
        }
    }

    Ok(true)
}

/// Orders rows like PostgreSQL: nulls last ascending, first descending.
fn compare_rows(a: &Record, b: &Record, order_by: &[OrderBy]) -> Ordering {
    for order in order_by {
        let left = a.get(&order.column).unwrap_or(NULL);
        let right = b.get(&order.column).unwrap_or(NULL);

        let ordering = match (left.is_null(), right.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => left.compare(right).unwrap_or(Ordering::Equal),
        };
        let ordering = match order.direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        };

        if ordering != Ordering::Equal {
            return ordering;
        }
    }

    Ordering::Equal
}

fn project(row: &Record, columns: &[String]) -> Record {
    if columns.is_empty() {
        return row.clone();
    }

    columns
        .iter()
        .map(|column| (column.clone(), row.get(column).cloned().unwrap_or(Value::Null)))
        .collect()
}

fn same_key(a: &Record, b: &Record, columns: &[String]) -> bool {
    !columns.is_empty()
        && columns.iter().all(|column| {
            let left = a.get(column).unwrap_or(NULL);
            let right = b.get(column).unwrap_or(NULL);
            // Nulls never collide, as in a unique index.
            !left.is_null() && left.loosely_equals(right)
        })
}

/// Applies a write in batches. Every batch is atomic; earlier batches stay applied when a later
/// one fails.
fn write_batches(
    tables: &mut Tables,
    schema: &Schema,
    data: Vec<Record>,
    options: &WriteOptions,
) -> ConduitResult<WriteResult> {
    let table = table_mut(tables, &schema.namespace, &schema.name)?;
    let conflict_columns = options.conflict_target(&table.schema);
    options.check(&conflict_columns)?;

    let mut result = WriteResult::default();
    let batch_size = options.effective_batch_size();
    let mut rows = data.into_iter().peekable();

    while rows.peek().is_some() {
        let batch: Vec<Record> = rows.by_ref().take(batch_size).collect();
        let batch = prepare_rows(&table.schema, batch, options)?;

        let mut working = table.rows.clone();
        let batch_result = apply_batch(&table.schema, &mut working, batch, options, &conflict_columns)?;
        table.rows = working;

        result.merge(batch_result);
        result.batches += 1;
    }

    Ok(result)
}

/// Enforces column presence and nullability, coercing values when schema validation is enabled.
fn prepare_rows(
    schema: &Schema,
    rows: Vec<Record>,
    options: &WriteOptions,
) -> ConduitResult<Vec<Record>> {
    let inserting = options.mode != WriteMode::Update;
    let mut prepared = Vec::with_capacity(rows.len());

    for row in rows {
        let row = if options.validate_schema {
            let mut coerced = Record::with_capacity(row.len());
            for (name, value) in row {
                let Some(column) = schema.column(&name) else {
                    bail!(
                        ErrorKind::QueryInvalid,
                        "Unknown column",
                        format!("{}.{}.{name}", schema.namespace, schema.name)
                    );
                };
                let value = value.coerce(column.universal_type)?;
                coerced.insert(name, value);
            }
            coerced
        } else {
            row
        };

        if inserting {
            for column in &schema.columns {
                let missing = row.get(&column.name).is_none_or(Value::is_null);
                if missing && !column.nullable && column.default_value.is_none() {
                    bail!(
                        ErrorKind::ConstraintViolated,
                        "Null value in non-nullable column",
                        column.name.clone()
                    );
                }
            }
        }

        prepared.push(row);
    }

    Ok(prepared)
}

fn apply_batch(
    schema: &Schema,
    rows: &mut Vec<Record>,
    batch: Vec<Record>,
    options: &WriteOptions,
    conflict_columns: &[String],
) -> ConduitResult<WriteResult> {
    let mut result = WriteResult::default();
    let mut returned = Vec::new();

    match options.mode {
        WriteMode::Insert => {
            for row in batch {
                match rows
                    .iter()
                    .position(|existing| same_key(existing, &row, &schema.primary_keys))
                {
                    Some(position) => match options.on_conflict {
                        OnConflict::Error => bail!(
                            ErrorKind::ConstraintViolated,
                            "Duplicate key value violates unique constraint",
                            schema.primary_keys.join(", ")
                        ),
                        OnConflict::Ignore => continue,
                        OnConflict::Update => {
                            merge_into(&mut rows[position], &row, options, &schema.primary_keys);
                            returned.push(rows[position].clone());
                        }
                    },
                    None => {
                        returned.push(row.clone());
                        rows.push(row);
                    }
                }
                result.written += 1;
            }
        }
        WriteMode::Upsert => {
            for row in batch {
                match rows
                    .iter()
                    .position(|existing| same_key(existing, &row, conflict_columns))
                {
                    Some(position) => {
                        merge_into(&mut rows[position], &row, options, conflict_columns);
                        returned.push(rows[position].clone());
                    }
                    None => {
                        if rows
                            .iter()
                            .any(|existing| same_key(existing, &row, &schema.primary_keys))
                        {
                            bail!(
                                ErrorKind::ConstraintViolated,
                                "Duplicate key value violates unique constraint",
                                schema.primary_keys.join(", ")
                            );
                        }
                        returned.push(row.clone());
                        rows.push(row);
                    }
                }
                result.written += 1;
            }
        }
        WriteMode::Replace => {
            rows.retain(|existing| !batch.iter().any(|row| same_key(existing, row, conflict_columns)));
            for row in batch {
                if rows
                    .iter()
                    .any(|existing| same_key(existing, &row, &schema.primary_keys))
                {
                    bail!(
                        ErrorKind::ConstraintViolated,
                        "Duplicate key value violates unique constraint",
                        schema.primary_keys.join(", ")
                    );
                }
                returned.push(row.clone());
                rows.push(row);
                result.written += 1;
            }
        }
        WriteMode::Update => {
            let where_columns = options.update_keys(conflict_columns);

            for row in batch {
                for existing in rows.iter_mut() {
                    let key_matches = where_columns.iter().all(|column| {
                        existing
                            .get(column)
                            .unwrap_or(NULL)
                            .loosely_equals(row.get(column).unwrap_or(NULL))
                    });
                    if key_matches && matches_all(&options.where_filters, existing)? {
                        merge_into(existing, &row, options, where_columns);
                        returned.push(existing.clone());
                        result.written += 1;
                    }
                }
            }
        }
    }

    if !options.returning.is_empty() {
        result.data = Some(
            returned
                .iter()
                .map(|row| project(row, &options.returning))
                .collect(),
        );
    }

    Ok(result)
}

/// Copies the update columns of `row` into `existing`, never touching key columns.
fn merge_into(existing: &mut Record, row: &Record, options: &WriteOptions, keys: &[String]) {
    for (name, value) in row {
        let selected = options.update_columns.is_empty() || options.update_columns.contains(name);
        if selected && !keys.contains(name) {
            existing.insert(name.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use conduit_telemetry::tracing::init_test_tracing;

    use super::*;
    use crate::adapter::filter::FilterCondition;
    use crate::types::{Column, UniversalType, record_from_pairs};

    fn users_schema() -> Schema {
        Schema::new(
            "mem",
            "public",
            "users",
            SchemaKind::Table,
            vec![
                Column::new("id", 1, "int4", UniversalType::Integer).with_primary_key(),
                Column::new("name", 2, "text", UniversalType::String),
            ],
        )
    }

    fn user(id: i64, name: &str) -> Record {
        record_from_pairs([("id", Value::Long(id)), ("name", Value::from(name))])
    }

    async fn adapter() -> MemoryAdapter {
        let adapter = MemoryAdapter::new("mem", EventBus::default());
        adapter.create_table(users_schema()).await;
        adapter.connect().await.unwrap();
        adapter
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        init_test_tracing();

        let adapter = adapter().await;
        let schema = users_schema();
        let rows = vec![user(1, "a"), user(2, "b"), user(3, "c")];
        let options = WriteOptions::upsert(["id"]).with_batch_size(2);

        let first = adapter
            .write_data(&schema, rows.clone(), &options)
            .await
            .unwrap();
        let second = adapter.write_data(&schema, rows, &options).await.unwrap();

        assert_eq!(first.written, 3);
        assert_eq!(first.batches, 2);
        assert_eq!(second.written, 3);
        assert_eq!(adapter.row_count("public", "users").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_keys_per_batch() {
        init_test_tracing();

        let adapter = adapter().await;
        let schema = users_schema();
        let options = WriteOptions::default().with_batch_size(2);

        let err = adapter
            .write_data(
                &schema,
                vec![user(1, "a"), user(2, "b"), user(3, "c"), user(1, "d")],
                &options,
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ConstraintViolated);
        // The first batch stays applied, the failing one is discarded.
        assert_eq!(adapter.row_count("public", "users").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn replace_deletes_then_inserts() {
        init_test_tracing();

        let adapter = adapter().await;
        let schema = users_schema();
        adapter
            .insert_rows("public", "users", vec![user(1, "a"), user(2, "b")])
            .await
            .unwrap();

        let options = WriteOptions {
            mode: WriteMode::Replace,
            conflict_columns: vec!["id".to_string()],
            ..WriteOptions::default()
        };
        adapter
            .write_data(&schema, vec![user(2, "z")], &options)
            .await
            .unwrap();

        let rows = adapter.rows("public", "users").await.unwrap();
        assert_eq!(rows, vec![user(1, "a"), user(2, "z")]);
    }

    #[tokio::test]
    async fn update_matches_each_row_by_its_keys() {
        init_test_tracing();

        let adapter = adapter().await;
        let schema = users_schema();
        adapter
            .insert_rows("public", "users", vec![user(1, "a"), user(2, "b")])
            .await
            .unwrap();

        let options = WriteOptions {
            mode: WriteMode::Update,
            returning: vec!["id".to_string()],
            ..WriteOptions::default()
        };
        let result = adapter
            .write_data(&schema, vec![user(2, "bb"), user(9, "x")], &options)
            .await
            .unwrap();

        assert_eq!(result.written, 1);
        assert_eq!(result.data.unwrap(), vec![record_from_pairs([("id", 2i64)])]);
        assert_eq!(
            adapter.rows("public", "users").await.unwrap()[1],
            user(2, "bb")
        );
    }

    #[tokio::test]
    async fn reads_filter_order_and_paginate() {
        init_test_tracing();

        let adapter = adapter().await;
        let schema = users_schema();
        adapter
            .insert_rows(
                "public",
                "users",
                (1..=10).map(|id| user(id, &format!("user{id}"))).collect(),
            )
            .await
            .unwrap();

        let options = ReadOptions {
            columns: vec!["id".to_string()],
            include_total_count: true,
            ..ReadOptions::default()
        }
        .with_filter(Filter::new("id", FilterCondition::Gt(Value::Long(3))))
        .with_order(OrderBy::desc("id"))
        .with_limit(2)
        .with_offset(1);

        let result = adapter.read_data(&schema, &options).await.unwrap();
        assert_eq!(result.total_count, Some(7));
        assert_eq!(
            result.rows,
            vec![
                record_from_pairs([("id", 9i64)]),
                record_from_pairs([("id", 8i64)])
            ]
        );
    }

    #[tokio::test]
    async fn rolled_back_transactions_leave_no_trace() {
        init_test_tracing();

        let adapter = adapter().await;
        let schema = users_schema();

        let mut transaction = adapter.begin_transaction().await.unwrap();
        transaction
            .write_data(&schema, vec![user(1, "a")], &WriteOptions::default())
            .await
            .unwrap();
        transaction.rollback().await.unwrap();
        assert_eq!(adapter.row_count("public", "users").await.unwrap(), 0);

        let mut transaction = adapter.begin_transaction().await.unwrap();
        transaction
            .write_data(&schema, vec![user(1, "a")], &WriteOptions::default())
            .await
            .unwrap();
        transaction.commit().await.unwrap();
        assert_eq!(adapter.row_count("public", "users").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn raw_queries_are_unsupported() {
        init_test_tracing();

        let adapter = adapter().await;
        let err = adapter.execute_query("select 1", &[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[tokio::test]
    async fn discovery_is_ordered_and_filtered() {
        init_test_tracing();

        let adapter = adapter().await;
        let mut orders = users_schema();
        orders.name = "orders".to_string();
        adapter.create_table(orders).await;
        let mut view = users_schema();
        view.name = "active_users".to_string();
        view.kind = SchemaKind::View;
        adapter.create_table(view).await;

        let names = |schemas: Vec<Schema>| -> Vec<String> {
            schemas.into_iter().map(|schema| schema.name).collect()
        };

        let all = adapter
            .discover_schemas(&DiscoverOptions::default())
            .await
            .unwrap();
        assert_eq!(names(all), vec!["active_users", "orders", "users"]);

        let tables = adapter
            .discover_schemas(&DiscoverOptions {
                include_views: false,
                name_pattern: Some("%s".to_string()),
                ..DiscoverOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(names(tables), vec!["orders", "users"]);
    }
}
