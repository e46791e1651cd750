use std::fmt;

use async_trait::async_trait;

use crate::adapter::capabilities::{Capabilities, Capability, Operation, SupportedOperations};
use crate::adapter::options::{
    DiscoverOptions, QueryResult, ReadOptions, ReadResult, SystemMetadata, WriteMode,
    WriteOptions, WriteResult,
};
use crate::error::ConduitResult;
use crate::types::{Record, Schema, Value};

/// Uniform contract over a data system.
///
/// Implementations translate native errors into [`ErrorKind`](crate::error::ErrorKind) at this
/// boundary. An operation whose capability is missing fails with
/// [`ErrorKind::Unsupported`](crate::error::ErrorKind::Unsupported) before any side effect.
///
/// Adapters are shared across concurrent executions, so every method takes `&self` and
/// implementations keep their mutable state behind locks.
#[async_trait]
pub trait Adapter: Send + Sync + fmt::Debug {
    /// Identifier of the system, used by mappings to reference it.
    fn system_id(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    fn supported_operations(&self) -> SupportedOperations;

    fn is_connected(&self) -> bool;

    /// Establishes the resources of the adapter. Calling it on a connected adapter is a no-op.
    async fn connect(&self) -> ConduitResult<()>;

    /// Releases all resources. Idempotent.
    async fn disconnect(&self) -> ConduitResult<()>;

    /// Non-destructive liveness check.
    async fn test_connection(&self) -> bool;

    async fn system_metadata(&self) -> ConduitResult<SystemMetadata>;

    /// Discovers containers of records, ordered by namespace then name.
    async fn discover_schemas(&self, options: &DiscoverOptions) -> ConduitResult<Vec<Schema>>;

    /// Returns the schema of one container, served from the schema cache unless `refresh` is set.
    async fn get_schema(&self, namespace: &str, name: &str, refresh: bool)
    -> ConduitResult<Schema>;

    async fn read_data(&self, schema: &Schema, options: &ReadOptions) -> ConduitResult<ReadResult>;

    /// Writes `data` in batches of at most `options.batch_size` rows.
    async fn write_data(
        &self,
        schema: &Schema,
        data: Vec<Record>,
        options: &WriteOptions,
    ) -> ConduitResult<WriteResult>;

    async fn execute_query(&self, sql: &str, params: &[Value]) -> ConduitResult<QueryResult>;

    /// Starts a transaction bound to one underlying resource until commit or rollback.
    async fn begin_transaction(&self) -> ConduitResult<Box<dyn Transaction>>;

    /// Releases everything the adapter holds. Safe to call multiple times.
    async fn cleanup(&self) -> ConduitResult<()> {
        self.disconnect().await
    }

    fn require_capability(&self, capability: Capability) -> ConduitResult<()> {
        self.capabilities().require(capability, self.system_id())
    }

    fn require_operation(&self, operation: Operation) -> ConduitResult<()> {
        self.supported_operations()
            .require(operation, self.system_id())
    }

    /// Checks that the write `mode` is supported.
    fn require_write_mode(&self, mode: WriteMode) -> ConduitResult<()> {
        self.require_operation(Operation::Write)?;
        self.require_operation(Operation::for_write_mode(mode))
    }
}

/// A unit of work scoped to one connection.
///
/// Both [`Transaction::commit`] and [`Transaction::rollback`] release the underlying resource.
/// Dropping a transaction without finishing it rolls it back.
#[async_trait]
pub trait Transaction: Send {
    async fn write_data(
        &mut self,
        schema: &Schema,
        data: Vec<Record>,
        options: &WriteOptions,
    ) -> ConduitResult<WriteResult>;

    async fn execute_query(&mut self, sql: &str, params: &[Value]) -> ConduitResult<QueryResult>;

    async fn commit(self: Box<Self>) -> ConduitResult<()>;

    async fn rollback(self: Box<Self>) -> ConduitResult<()>;
}
