use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use conduit::error::{ConduitResult, ErrorKind};
use conduit::events::EventBus;
use conduit::failpoints::BEFORE_POOL_CREATE;
use conduit::pool::{ConnectionFactory, Pool};
use conduit_config::shared::PoolConfig;
use conduit_telemetry::tracing::init_test_tracing;
use fail::FailScenario;

#[derive(Debug, Clone, Default)]
struct CountingFactory {
    created: Arc<AtomicU64>,
}

#[async_trait]
impl ConnectionFactory for CountingFactory {
    type Connection = u64;

    async fn create(&self) -> ConduitResult<Self::Connection> {
        Ok(self.created.fetch_add(1, Ordering::SeqCst))
    }
}

fn pool(max_retries: u32) -> (Pool<CountingFactory>, CountingFactory) {
    let factory = CountingFactory::default();
    let config = PoolConfig {
        min_connections: 0,
        max_connections: 2,
        max_retries,
        ..PoolConfig::default()
    };
    let pool = Pool::new("failpoints", factory.clone(), config, EventBus::new(64)).unwrap();

    (pool, factory)
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_create_failures_are_retried() {
    init_test_tracing();
    let scenario = FailScenario::setup();
    fail::cfg(BEFORE_POOL_CREATE, "1*return(transient)").unwrap();

    let (pool, factory) = pool(2);
    let connection = pool.acquire().await.unwrap();

    assert_eq!(*connection, 0);
    assert_eq!(factory.created.load(Ordering::SeqCst), 1);

    drop(connection);
    pool.destroy();
    scenario.teardown();
}

#[tokio::test(flavor = "multi_thread")]
async fn fatal_create_failures_reach_the_caller() {
    init_test_tracing();
    let scenario = FailScenario::setup();
    fail::cfg(BEFORE_POOL_CREATE, "return(fatal)").unwrap();

    let (pool, factory) = pool(2);
    let err = pool.acquire().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InjectedFatal);
    assert_eq!(factory.created.load(Ordering::SeqCst), 0);
    assert_eq!(pool.stats().total(), 0);

    pool.destroy();
    scenario.teardown();
}
