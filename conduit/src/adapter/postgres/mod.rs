//! PostgreSQL adapter.
//!
//! Connections come from a named pool of the shared [`PoolManager`], keyed by server, database
//! and role. Schemas are discovered from the system catalog and cached. Reads and writes go
//! through parameterized statements whose parameters are sent as text, which lets the server
//! parse every universal value into the type of the column it targets.

mod catalog;
mod connection;
mod sql;
mod types;

use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use async_trait::async_trait;
use conduit_config::shared::{PgConnectionConfig, PoolConfig};
use tokio_postgres::Client;
use tracing::{debug, info, warn};

use crate::adapter::base::{Adapter, Transaction};
use crate::adapter::cache::SchemaCache;
use crate::adapter::capabilities::{Capabilities, Capability, Operation, SupportedOperations};
use crate::adapter::options::{
    DiscoverOptions, FieldInfo, OnConflict, QueryResult, ReadOptions, ReadResult,
    SystemMetadata, WriteMode, WriteOptions, WriteResult,
};
use crate::error::{ConduitResult, ErrorKind};
use crate::events::{Event, EventBus};
use crate::pool::{Pool, PoolManager, PooledConnection};
use crate::types::{Record, Schema, Value};
use crate::{bail, conduit_error};

pub use connection::{PgConnection, PgConnectionFactory};
pub use types::universal_type_for;

use sql::{InsertConflict, Statement};
use types::{TextParam, as_sql_params, decode_row};

/// Upper bound of bind parameters in one statement imposed by the wire protocol.
const MAX_BIND_PARAMS: usize = 65_535;

type PgPooledConnection = PooledConnection<PgConnectionFactory>;

#[derive(Clone)]
struct ConnectedState {
    pool: Pool<PgConnectionFactory>,
    server_version: Option<String>,
}

/// [`Adapter`] over a PostgreSQL server.
pub struct PostgresAdapter {
    system_id: String,
    config: PgConnectionConfig,
    pool_config: PoolConfig,
    pools: PoolManager,
    events: EventBus,
    cache: SchemaCache,
    state: Mutex<Option<ConnectedState>>,
}

impl PostgresAdapter {
    /// Creates a new adapter for `system_id`.
    ///
    /// No connection is opened until [`Adapter::connect`] is called. The pool is created in `pools`
    /// at that point, or shared when another adapter already created it for the same server.
    pub fn new(
        system_id: impl Into<String>,
        config: PgConnectionConfig,
        pool_config: PoolConfig,
        pools: PoolManager,
        events: EventBus,
    ) -> Self {
        Self {
            system_id: system_id.into(),
            config,
            pool_config,
            pools,
            events,
            cache: SchemaCache::default(),
            state: Mutex::new(None),
        }
    }

    /// Returns the connection configuration.
    pub fn config(&self) -> &PgConnectionConfig {
        &self.config
    }

    /// Name of the pool this adapter acquires its connections from.
    pub fn pool_name(&self) -> String {
        self.config.pool_key()
    }

    /// Version reported by the server when the adapter connected.
    pub fn server_version(&self) -> Option<String> {
        self.lock_state()
            .as_ref()
            .and_then(|state| state.server_version.clone())
    }

    fn lock_state(&self) -> MutexGuard<'_, Option<ConnectedState>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn acquire(&self) -> ConduitResult<PgPooledConnection> {
        let pool = self.lock_state().as_ref().map(|state| state.pool.clone());
        match pool {
            Some(pool) => pool.acquire().await,
            None => bail!(
                ErrorKind::InvalidState,
                "Adapter is not connected",
                self.system_id.clone()
            ),
        }
    }
}

impl fmt::Debug for PostgresAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresAdapter")
            .field("system_id", &self.system_id)
            .field("pool", &self.pool_name())
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[async_trait]
impl Adapter for PostgresAdapter {
    fn system_id(&self) -> &str {
        &self.system_id
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            schema_discovery: true,
            batch_operations: true,
            streaming: true,
            transactions: true,
            partitioning: true,
            cdc: false,
            incremental_sync: true,
            custom_query: true,
        }
    }

    fn supported_operations(&self) -> SupportedOperations {
        SupportedOperations::all()
    }

    fn is_connected(&self) -> bool {
        self.lock_state().is_some()
    }

    async fn connect(&self) -> ConduitResult<()> {
        if self.is_connected() {
            return Ok(());
        }

        self.config.validate()?;

        let pool_name = self.pool_name();
        let pool = self.pools.create_pool(
            &pool_name,
            PgConnectionFactory::new(self.config.clone()),
            self.pool_config.clone(),
        )?;

        // The first connection proves the server is reachable and reports its version.
        let server_version = match pool.acquire().await {
            Ok(connection) => connection.server_version().map(str::to_string),
            Err(err) => {
                let _ = self.pools.destroy_pool(&pool_name);
                let kind = match err.kind() {
                    ErrorKind::PermissionDenied | ErrorKind::NotFound => err.kind(),
                    _ => ErrorKind::ConnectFailed,
                };
                return Err(err.with_kind(kind));
            }
        };

        *self.lock_state() = Some(ConnectedState {
            pool,
            server_version: server_version.clone(),
        });

        info!(
            system_id = %self.system_id,
            pool = %pool_name,
            server_version = ?server_version,
            "postgres adapter connected"
        );
        self.events.publish(Event::AdapterConnected {
            system_id: self.system_id.clone(),
            server_version,
        });

        Ok(())
    }

    async fn disconnect(&self) -> ConduitResult<()> {
        let state = self.lock_state().take();
        let Some(state) = state else {
            return Ok(());
        };

        state.pool.drain().await;
        // The manager may already have forgotten the pool during a shutdown.
        if let Err(err) = self.pools.destroy_pool(state.pool.name()) {
            debug!(error = %err, "pool was already removed");
            state.pool.destroy();
        }
        self.cache.clear().await;

        info!(system_id = %self.system_id, "postgres adapter disconnected");
        self.events.publish(Event::AdapterDisconnected {
            system_id: self.system_id.clone(),
        });

        Ok(())
    }

    async fn test_connection(&self) -> bool {
        let mut connection = match self.acquire().await {
            Ok(connection) => connection,
            Err(_) => return false,
        };

        match connection.client().simple_query("SELECT 1").await {
            Ok(_) => true,
            Err(err) => {
                warn!(system_id = %self.system_id, error = %err, "postgres liveness check failed");
                connection.mark_broken();
                false
            }
        }
    }

    async fn system_metadata(&self) -> ConduitResult<SystemMetadata> {
        let connection = self.acquire().await?;
        let row = connection
            .client()
            .query_one(
                "select version(), current_database()::text, current_setting('max_connections')",
                &[],
            )
            .await?;

        let version: String = row.try_get(0)?;
        let database: String = row.try_get(1)?;
        let max_connections: String = row.try_get(2)?;

        let mut properties = serde_json::Map::new();
        properties.insert("database".to_string(), database.into());
        properties.insert("maxConnections".to_string(), max_connections.into());
        if let Some(server_version) = connection.server_version() {
            properties.insert("serverVersion".to_string(), server_version.into());
        }

        Ok(SystemMetadata {
            system_id: self.system_id.clone(),
            system_type: "postgresql".to_string(),
            version: Some(version),
            properties,
        })
    }

    async fn discover_schemas(&self, options: &DiscoverOptions) -> ConduitResult<Vec<Schema>> {
        self.require_capability(Capability::SchemaDiscovery)?;

        let connection = self.acquire().await?;
        let schemas = catalog::discover(connection.client(), &self.system_id, options, None).await?;
        drop(connection);

        self.cache.insert_all(&schemas).await;

        Ok(schemas)
    }

    async fn get_schema(
        &self,
        namespace: &str,
        name: &str,
        refresh: bool,
    ) -> ConduitResult<Schema> {
        if !refresh {
            if let Some(schema) = self.cache.get(namespace, name).await {
                return Ok(schema.as_ref().clone());
            }
        }

        let options = DiscoverOptions {
            include_indexes: true,
            ..DiscoverOptions::in_namespace(namespace)
        };
        let connection = self.acquire().await?;
        let mut schemas =
            catalog::discover(connection.client(), &self.system_id, &options, Some(name)).await?;
        drop(connection);

        let Some(schema) = schemas.pop() else {
            bail!(
                ErrorKind::NotFound,
                "Schema not found",
                format!("{}.{namespace}.{name}", self.system_id)
            );
        };

        Ok(self.cache.insert(schema).await.as_ref().clone())
    }

    async fn read_data(&self, schema: &Schema, options: &ReadOptions) -> ConduitResult<ReadResult> {
        self.require_operation(Operation::Read)?;

        let connection = self.acquire().await?;
        let client = connection.client();

        let statement = sql::build_select(schema, options);
        debug!(sql = %statement.sql, "reading postgres rows");
        let rows = query_records(client, &statement).await?;

        let total_count = if options.include_total_count {
            let statement = sql::build_count(schema, options);
            let row = client
                .query_one(&statement.sql, &as_sql_params(&statement.params))
                .await?;
            let count: i64 = row.try_get(0)?;
            Some(count.max(0) as u64)
        } else {
            None
        };

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
        if data.is_empty() {
            return Ok(WriteResult::default());
        }

        let mut connection = self.acquire().await?;
        if !options.transaction {
            return write_rows(&mut connection, schema, data, options, false).await;
        }

        connection.mark_broken();
        connection.client().batch_execute("BEGIN").await?;
        let result = write_rows(&mut connection, schema, data, options, true).await;
        finish_transaction(&mut connection, result).await
    }

    async fn execute_query(&self, sql: &str, params: &[Value]) -> ConduitResult<QueryResult> {
        self.require_capability(Capability::CustomQuery)?;

        let connection = self.acquire().await?;
        run_query(connection.client(), sql, params).await
    }

    async fn begin_transaction(&self) -> ConduitResult<Box<dyn Transaction>> {
        self.require_capability(Capability::Transactions)?;

        let mut connection = self.acquire().await?;
        connection.mark_broken();
        connection.client().batch_execute("BEGIN").await?;

        Ok(Box::new(PgTransaction {
            connection: Some(connection),
        }))
    }
}

/// A transaction holding one pooled connection until it finishes.
///
/// The connection stays marked broken while the transaction is open, so dropping an unfinished
/// transaction destroys it and the server rolls the transaction back.
pub struct PgTransaction {
    connection: Option<PgPooledConnection>,
}

impl PgTransaction {
    fn connection(&mut self) -> ConduitResult<&mut PgPooledConnection> {
        self.connection
            .as_mut()
            .ok_or_else(|| conduit_error!(ErrorKind::InvalidState, "Transaction already finished"))
    }

    async fn finish(&mut self, command: &str) -> ConduitResult<()> {
        let mut connection = match self.connection.take() {
            Some(connection) => connection,
            None => bail!(ErrorKind::InvalidState, "Transaction already finished"),
        };

        connection.client().batch_execute(command).await?;
        connection.mark_reusable();

        Ok(())
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn write_data(
        &mut self,
        schema: &Schema,
        data: Vec<Record>,
        options: &WriteOptions,
    ) -> ConduitResult<WriteResult> {
        let connection = self.connection()?;
        write_rows(connection, schema, data, options, true).await
    }

    async fn execute_query(&mut self, sql: &str, params: &[Value]) -> ConduitResult<QueryResult> {
        let connection = self.connection()?;
        run_query(connection.client(), sql, params).await
    }

    async fn commit(mut self: Box<Self>) -> ConduitResult<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(mut self: Box<Self>) -> ConduitResult<()> {
        self.finish("ROLLBACK").await
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        if self.connection.take().is_some() {
            warn!("postgres transaction dropped without commit or rollback");
        }
    }
}

impl fmt::Debug for PgTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgTransaction")
            .field("connection", &self.connection)
            .finish()
    }
}

/// Commits when `result` succeeded and rolls back otherwise.
///
/// The connection was marked broken before `BEGIN` and becomes reusable only once the
/// transaction has ended on the server.
async fn finish_transaction<T>(
    connection: &mut PgPooledConnection,
    result: ConduitResult<T>,
) -> ConduitResult<T> {
    let command = if result.is_ok() { "COMMIT" } else { "ROLLBACK" };
    if let Err(err) = connection.client().batch_execute(command).await {
        connection.mark_broken();
        // The original failure explains more than a failed rollback.
        return match result {
            Ok(_) => Err(err.into()),
            Err(original) => {
                warn!(error = %err, "postgres rollback failed, discarding the connection");
                Err(original)
            }
        };
    }

    connection.mark_reusable();
    result
}

async fn query_records(client: &Client, statement: &Statement) -> ConduitResult<Vec<Record>> {
    let rows = client
        .query(&statement.sql, &as_sql_params(&statement.params))
        .await?;

    rows.iter().map(decode_row).collect()
}

async fn run_statement(
    client: &Client,
    statement: &Statement,
    returning: bool,
) -> ConduitResult<WriteResult> {
    if returning {
        let data = query_records(client, statement).await?;
        return Ok(WriteResult {
            written: data.len() as u64,
            data: Some(data),
            ..WriteResult::default()
        });
    }

    let written = client
        .execute(&statement.sql, &as_sql_params(&statement.params))
        .await?;

    Ok(WriteResult {
        written,
        ..WriteResult::default()
    })
}

/// Rejects rows carrying columns the schema does not have.
fn check_columns(schema: &Schema, rows: &[Record]) -> ConduitResult<()> {
    for row in rows {
        if let Some(name) = row.keys().find(|name| schema.column(name).is_none()) {
            bail!(
                ErrorKind::QueryInvalid,
                "Unknown column",
                format!("{}.{}.{name}", schema.namespace, schema.name)
            );
        }
    }

    Ok(())
}

/// Writes `data` in batches on `connection`.
///
/// Outside a transaction every batch commits on its own, and a `replace` batch runs its delete
/// and insert in a transaction of its own.
async fn write_rows(
    connection: &mut PgPooledConnection,
    schema: &Schema,
    data: Vec<Record>,
    options: &WriteOptions,
    in_transaction: bool,
) -> ConduitResult<WriteResult> {
    let conflict_target = options.conflict_target(schema);
    options.check(&conflict_target)?;
    if options.validate_schema {
        check_columns(schema, &data)?;
    }

    let column_count = sql::batch_columns(&data).len().max(1);
    let batch_size = options
        .effective_batch_size()
        .min(MAX_BIND_PARAMS / column_count)
        .max(1);
    let returning = !options.returning.is_empty();

    let mut result = WriteResult::default();
    for batch in data.chunks(batch_size) {
        let started = Instant::now();
        let batch_result = match options.mode {
            WriteMode::Insert => {
                let conflict = match options.on_conflict {
                    OnConflict::Error => InsertConflict::Fail,
                    OnConflict::Ignore => InsertConflict::DoNothing,
                    OnConflict::Update if conflict_target.is_empty() => bail!(
                        ErrorKind::QueryInvalid,
                        "Conflict update requires conflict columns",
                        sql::table_name(schema)
                    ),
                    OnConflict::Update => InsertConflict::DoUpdate {
                        target: &conflict_target,
                        update_columns: &options.update_columns,
                    },
                };
                let statement = sql::build_insert(schema, batch, conflict, &options.returning)?;
                run_statement(connection.client(), &statement, returning).await?
            }
            WriteMode::Upsert => {
                let conflict = InsertConflict::DoUpdate {
                    target: &conflict_target,
                    update_columns: &options.update_columns,
                };
                let statement = sql::build_insert(schema, batch, conflict, &options.returning)?;
                run_statement(connection.client(), &statement, returning).await?
            }
            WriteMode::Replace => {
                let delete = sql::build_delete_keys(schema, batch, &conflict_target)?;
                let insert =
                    sql::build_insert(schema, batch, InsertConflict::Fail, &options.returning)?;

                if in_transaction {
                    run_statement(connection.client(), &delete, false).await?;
                    run_statement(connection.client(), &insert, returning).await?
                } else {
                    connection.mark_broken();
                    connection.client().batch_execute("BEGIN").await?;
                    let replaced = async {
                        run_statement(connection.client(), &delete, false).await?;
                        run_statement(connection.client(), &insert, returning).await
                    }
                    .await;
                    finish_transaction(connection, replaced).await?
                }
            }
            WriteMode::Update => {
                let keys = options.update_keys(&conflict_target);
                let mut updated = WriteResult::default();
                for row in batch {
                    if let Some(statement) = sql::build_update(schema, row, keys, options)? {
                        let written =
                            run_statement(connection.client(), &statement, returning).await?;
                        updated.merge(written);
                    }
                }
                updated
            }
        };

        debug!(
            table = %sql::table_name(schema),
            mode = options.mode.as_str(),
            rows = batch.len(),
            written = batch_result.written,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "wrote postgres batch"
        );
        result.merge(batch_result);
        result.batches += 1;
    }

    Ok(result)
}

/// Leading keyword of a statement, e.g. `SELECT`.
fn command_of(sql: &str) -> String {
    sql.split_whitespace()
        .next()
        .map(|word| word.trim_start_matches('(').to_uppercase())
        .unwrap_or_default()
}

async fn run_query(client: &Client, sql: &str, params: &[Value]) -> ConduitResult<QueryResult> {
    let started = Instant::now();
    let statement = client.prepare(sql).await?;
    if statement.params().len() != params.len() {
        bail!(
            ErrorKind::QueryInvalid,
            "Wrong number of query parameters",
            format!(
                "expected {}, got {}",
                statement.params().len(),
                params.len()
            )
        );
    }

    let fields = statement
        .columns()
        .iter()
        .map(|column| FieldInfo {
            name: column.name().to_string(),
            native_type: column.type_().name().to_string(),
        })
        .collect();

    let params: Vec<TextParam> = params.iter().map(TextParam::from).collect();
    let sql_params = as_sql_params(&params);
    let (rows, row_count) = if statement.columns().is_empty() {
        let affected = client.execute(&statement, &sql_params).await?;
        (Vec::new(), affected)
    } else {
        let rows = client
            .query(&statement, &sql_params)
            .await?
            .iter()
            .map(decode_row)
            .collect::<ConduitResult<Vec<_>>>()?;
        let count = rows.len() as u64;
        (rows, count)
    };

    Ok(QueryResult {
        rows,
        row_count,
        fields,
        command: command_of(sql),
        duration: started.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_is_the_leading_keyword() {
        assert_eq!(command_of("  select 1"), "SELECT");
        assert_eq!(command_of("(select 1) union (select 2)"), "SELECT");
        assert_eq!(command_of(""), "");
    }

    #[test]
    fn unknown_columns_are_rejected() {
        use crate::types::{Column, SchemaKind, UniversalType, record_from_pairs};

        let schema = Schema::new(
            "pg",
            "public",
            "users",
            SchemaKind::Table,
            vec![Column::new("id", 1, "int4", UniversalType::Integer)],
        );

        assert!(check_columns(&schema, &[record_from_pairs([("id", Value::Long(1))])]).is_ok());
        let err =
            check_columns(&schema, &[record_from_pairs([("nope", Value::Long(1))])]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueryInvalid);
    }
}
