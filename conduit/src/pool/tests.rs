use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use conduit_config::shared::PoolConfig;
use conduit_telemetry::tracing::init_test_tracing;
use tokio::sync::mpsc;

use crate::conduit_error;
use crate::error::{ConduitResult, ErrorKind};
use crate::events::{Event, EventBus};
use crate::pool::{ConnectionFactory, Pool, PoolManager};

#[derive(Debug)]
struct TestConnection {
    serial: u64,
    healthy: Arc<AtomicBool>,
}

#[derive(Debug, Clone, Default)]
struct TestFactory {
    created: Arc<AtomicU64>,
    fail_creates: Arc<AtomicBool>,
    healthy: Arc<AtomicBool>,
}

impl TestFactory {
    fn new() -> Self {
        let factory = Self::default();
        factory.healthy.store(true, Ordering::SeqCst);
        factory
    }

    fn created(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionFactory for TestFactory {
    type Connection = TestConnection;

    async fn create(&self) -> ConduitResult<Self::Connection> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(conduit_error!(ErrorKind::PermissionDenied, "Bad credentials"));
        }

        let serial = self.created.fetch_add(1, Ordering::SeqCst);
        Ok(TestConnection {
            serial,
            healthy: Arc::clone(&self.healthy),
        })
    }

    fn is_valid(&self, connection: &Self::Connection) -> bool {
        connection.healthy.load(Ordering::SeqCst)
    }
}

fn config(min: usize, max: usize) -> PoolConfig {
    PoolConfig {
        min_connections: min,
        max_connections: max,
        acquire_timeout_ms: 5_000,
        idle_timeout_ms: 30_000,
        create_timeout_ms: 1_000,
        reap_interval_ms: 60_000,
        health_check_interval_ms: 60_000,
        max_retries: 0,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn waiters_are_served_in_fifo_order() {
    init_test_tracing();

    let pool = Pool::new("fifo", TestFactory::new(), config(0, 2), EventBus::default()).unwrap();
    let first = pool.acquire().await.unwrap();
    let second = pool.acquire().await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let (release_tx, release_rx) = mpsc::unbounded_channel::<()>();
    let release_rx = Arc::new(tokio::sync::Mutex::new(release_rx));

    for waiter in 0..3usize {
        let waiter_pool = pool.clone();
        let tx = tx.clone();
        let release_rx = Arc::clone(&release_rx);
        tokio::spawn(async move {
            let connection = waiter_pool.acquire().await.unwrap();
            tx.send(waiter).unwrap();
            release_rx.lock().await.recv().await;
            drop(connection);
        });

        let expected = waiter + 1;
        wait_until(|| pool.stats().waiting == expected).await;
    }

    // Only two connections may ever exist.
    assert_eq!(pool.stats().total(), 2);

    drop(first);
    assert_eq!(rx.recv().await, Some(0));
    drop(second);
    assert_eq!(rx.recv().await, Some(1));
    release_tx.send(()).unwrap();
    assert_eq!(rx.recv().await, Some(2));

    let stats = pool.stats();
    assert_eq!(stats.created, 2);
    assert_eq!(stats.timeouts, 0);
}

#[tokio::test]
async fn acquire_times_out_when_exhausted() {
    init_test_tracing();

    let mut config = config(0, 1);
    config.acquire_timeout_ms = 30;
    let pool = Pool::new("timeout", TestFactory::new(), config, EventBus::default()).unwrap();

    let _held = pool.acquire().await.unwrap();
    let err = pool.acquire().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::AcquireTimeout);
    let stats = pool.stats();
    assert_eq!(stats.timeouts, 1);
    assert_eq!(stats.waiting, 0);
    assert_eq!(stats.active, 1);
}

#[tokio::test]
async fn broken_connections_are_destroyed_on_release() {
    init_test_tracing();

    let factory = TestFactory::new();
    let pool = Pool::new("broken", factory.clone(), config(0, 2), EventBus::default()).unwrap();

    let mut connection = pool.acquire().await.unwrap();
    assert_eq!(connection.serial, 0);
    connection.mark_broken();
    drop(connection);

    let stats = pool.stats();
    assert_eq!(stats.destroyed, 1);
    assert_eq!(stats.idle, 0);

    let connection = pool.acquire().await.unwrap();
    assert_eq!(connection.serial, 1);
    assert_eq!(factory.created(), 2);
}

#[tokio::test]
async fn connections_marked_reusable_again_return_to_the_pool() {
    init_test_tracing();

    let factory = TestFactory::new();
    let pool = Pool::new("guarded", factory.clone(), config(0, 2), EventBus::default()).unwrap();

    let mut connection = pool.acquire().await.unwrap();
    connection.mark_broken();
    assert!(connection.is_broken());
    connection.mark_reusable();
    drop(connection);

    let stats = pool.stats();
    assert_eq!(stats.destroyed, 0);
    assert_eq!(stats.idle, 1);

    // Dropped while still marked, e.g. a cancelled operation, the connection is destroyed.
    let mut connection = pool.acquire().await.unwrap();
    assert_eq!(connection.serial, 0);
    connection.mark_broken();
    drop(connection);
    assert_eq!(pool.stats().destroyed, 1);
    assert_eq!(factory.created(), 1);
}

#[tokio::test]
async fn released_connections_are_reused() {
    init_test_tracing();

    let factory = TestFactory::new();
    let pool = Pool::new("reuse", factory.clone(), config(0, 4), EventBus::default()).unwrap();

    for _ in 0..5 {
        let connection = pool.acquire().await.unwrap();
        pool.release(connection);
    }

    assert_eq!(factory.created(), 1);
    let stats = pool.stats();
    assert_eq!(stats.acquired, 5);
    assert_eq!(stats.released, 5);
    assert_eq!(stats.idle, 1);
}

#[tokio::test]
async fn drain_waits_for_lent_connections() {
    init_test_tracing();

    let pool = Pool::new("drain", TestFactory::new(), config(0, 2), EventBus::default()).unwrap();
    let held = pool.acquire().await.unwrap();

    let drain = tokio::spawn({
        let pool = pool.clone();
        async move { pool.drain().await }
    });
    wait_until(|| pool.is_draining()).await;

    let err = pool.acquire().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PoolClosed);
    assert!(!drain.is_finished());

    drop(held);
    drain.await.unwrap();

    let stats = pool.stats();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.destroyed, 1);
}

#[tokio::test]
async fn destroyed_pool_rejects_acquires_and_waiters() {
    init_test_tracing();

    let pool = Pool::new("destroy", TestFactory::new(), config(0, 1), EventBus::default()).unwrap();
    let held = pool.acquire().await.unwrap();

    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire().await.map(|_| ()) }
    });
    wait_until(|| pool.stats().waiting == 1).await;

    pool.destroy();
    assert_eq!(waiter.await.unwrap().unwrap_err().kind(), ErrorKind::PoolClosed);
    assert_eq!(pool.acquire().await.unwrap_err().kind(), ErrorKind::PoolClosed);

    drop(held);
    assert_eq!(pool.stats().destroyed, 1);
}

#[tokio::test]
async fn creation_failures_reach_the_waiter() {
    init_test_tracing();

    let factory = TestFactory::new();
    factory.fail_creates.store(true, Ordering::SeqCst);
    let events = EventBus::default();
    let mut rx = events.subscribe();
    let pool = Pool::new("failing", factory, config(0, 1), events).unwrap();

    let err = pool.acquire().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert_eq!(pool.stats().errors, 1);

    let mut saw_error = false;
    while let Ok(event) = rx.try_recv() {
        saw_error |= matches!(event, Event::PoolError { .. });
    }
    assert!(saw_error);
}

#[tokio::test]
async fn reaper_keeps_the_minimum() {
    init_test_tracing();

    let mut config = config(1, 4);
    config.idle_timeout_ms = 10;
    let pool = Pool::new("reap", TestFactory::new(), config, EventBus::default()).unwrap();

    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    let c = pool.acquire().await.unwrap();
    drop((a, b, c));
    assert_eq!(pool.stats().idle, 3);

    tokio::time::sleep(Duration::from_millis(30)).await;
    pool.reap_now();

    let stats = pool.stats();
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.destroyed, 2);
}

#[tokio::test]
async fn health_check_replaces_unhealthy_connections() {
    init_test_tracing();

    let factory = TestFactory::new();
    let pool = Pool::new("health", factory.clone(), config(2, 4), EventBus::default()).unwrap();
    wait_until(|| pool.stats().idle == 2).await;

    factory.healthy.store(false, Ordering::SeqCst);
    pool.health_check_now().await;
    factory.healthy.store(true, Ordering::SeqCst);

    assert_eq!(pool.stats().destroyed, 2);
    wait_until(|| pool.stats().idle == 2).await;
    assert_eq!(factory.created(), 4);
}

#[tokio::test]
async fn execute_with_releases_on_error() {
    init_test_tracing();

    let pool = Pool::new("execute", TestFactory::new(), config(0, 1), EventBus::default()).unwrap();

    let result: ConduitResult<()> = pool
        .execute_with(|_connection| {
            Box::pin(async { Err(conduit_error!(ErrorKind::QueryInvalid, "Bad query")) })
        })
        .await;
    assert_eq!(result.unwrap_err().kind(), ErrorKind::QueryInvalid);

    let serial = pool
        .execute_with(|connection| Box::pin(async move { Ok(connection.serial) }))
        .await
        .unwrap();
    assert_eq!(serial, 0);
    assert_eq!(pool.stats().active, 0);
}

#[tokio::test]
async fn manager_returns_existing_pools_by_name() {
    init_test_tracing();

    let manager = PoolManager::new(EventBus::default());
    let factory = TestFactory::new();

    let first = manager
        .create_pool("orders", factory.clone(), config(0, 2))
        .unwrap();
    let second = manager
        .create_pool("orders", TestFactory::new(), config(0, 8))
        .unwrap();
    assert_eq!(second.config().max_connections, 2);

    let connection = manager.acquire::<TestFactory>("orders").await.unwrap();
    manager.release(connection);
    assert_eq!(first.stats().acquired, 1);

    manager.destroy_pool("orders").unwrap();
    assert!(first.is_destroyed());
    assert_eq!(
        manager.acquire::<TestFactory>("orders").await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
    manager.shutdown().await;
}
