use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::adapter::{
    Adapter, Capabilities, DiscoverOptions, QueryResult, ReadOptions, ReadResult,
    SupportedOperations, SystemMetadata, Transaction, WriteOptions, WriteResult,
};
use crate::conduit_error;
use crate::error::{ConduitResult, ErrorKind};
use crate::types::{Record, Schema, Value};

type WriteHook = Arc<dyn Fn(u64) + Send + Sync>;

/// Wraps an adapter to inject write failures and observe writes.
///
/// The write hook runs after every successful write with the total number of rows written through
/// the wrapper so far.
#[derive(Clone)]
pub struct FaultyAdapter {
    inner: Arc<dyn Adapter>,
    pending_failures: Arc<AtomicU32>,
    failure_kind: ErrorKind,
    write_calls: Arc<AtomicU64>,
    written: Arc<AtomicU64>,
    write_delay: Option<Duration>,
    on_write: Option<WriteHook>,
}

impl FaultyAdapter {
    /// Creates a new adapter delegating every call to `inner`.
    pub fn new(inner: Arc<dyn Adapter>) -> Self {
        Self {
            inner,
            pending_failures: Arc::new(AtomicU32::new(0)),
            failure_kind: ErrorKind::Transient,
            write_calls: Arc::new(AtomicU64::new(0)),
            written: Arc::new(AtomicU64::new(0)),
            write_delay: None,
            on_write: None,
        }
    }

    /// Fails the next `count` write calls with an error of `kind`.
    pub fn fail_next_writes(mut self, count: u32, kind: ErrorKind) -> Self {
        self.pending_failures.store(count, Ordering::SeqCst);
        self.failure_kind = kind;
        self
    }

    /// Delays every write call by `delay` before it reaches the wrapped adapter.
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    pub fn on_write<F>(mut self, hook: F) -> Self
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.on_write = Some(Arc::new(hook));
        self
    }

    /// Write calls made, failed ones included.
    pub fn write_calls(&self) -> u64 {
        self.write_calls.load(Ordering::SeqCst)
    }

    pub fn written(&self) -> u64 {
        self.written.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        self.pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |pending| pending.checked_sub(1))
            .is_ok()
    }
}

impl fmt::Debug for FaultyAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultyAdapter")
            .field("inner", &self.inner)
            .field("pending_failures", &self.pending_failures)
            .field("write_calls", &self.write_calls)
            .field("written", &self.written)
            .finish()
    }
}

#[async_trait]
impl Adapter for FaultyAdapter {
    fn system_id(&self) -> &str {
        self.inner.system_id()
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    fn supported_operations(&self) -> SupportedOperations {
        self.inner.supported_operations()
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    async fn connect(&self) -> ConduitResult<()> {
        self.inner.connect().await
    }

    async fn disconnect(&self) -> ConduitResult<()> {
        self.inner.disconnect().await
    }

    async fn test_connection(&self) -> bool {
        self.inner.test_connection().await
    }

    async fn system_metadata(&self) -> ConduitResult<SystemMetadata> {
        self.inner.system_metadata().await
    }

    async fn discover_schemas(&self, options: &DiscoverOptions) -> ConduitResult<Vec<Schema>> {
        self.inner.discover_schemas(options).await
    }

    async fn get_schema(&self, namespace: &str, name: &str, refresh: bool) -> ConduitResult<Schema> {
        self.inner.get_schema(namespace, name, refresh).await
    }

    async fn read_data(&self, schema: &Schema, options: &ReadOptions) -> ConduitResult<ReadResult> {
        self.inner.read_data(schema, options).await
    }

    async fn write_data(
        &self,
        schema: &Schema,
        data: Vec<Record>,
        options: &WriteOptions,
    ) -> ConduitResult<WriteResult> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }
        if self.take_failure() {
            return Err(conduit_error!(self.failure_kind, "Injected write failure"));
        }

        let result = self.inner.write_data(schema, data, options).await?;
        let written = self.written.fetch_add(result.written, Ordering::SeqCst) + result.written;
        if let Some(hook) = &self.on_write {
            hook(written);
        }

        Ok(result)
    }

    async fn execute_query(&self, sql: &str, params: &[Value]) -> ConduitResult<QueryResult> {
        self.inner.execute_query(sql, params).await
    }

    async fn begin_transaction(&self) -> ConduitResult<Box<dyn Transaction>> {
        self.inner.begin_transaction().await
    }
}
