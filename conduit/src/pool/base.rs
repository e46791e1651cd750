use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use conduit_config::shared::PoolConfig;
use futures::future::BoxFuture;
use metrics::{counter, gauge, histogram};
use tokio::sync::{Notify, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, info, warn};

use crate::concurrency::shutdown::{ShutdownRx, ShutdownTx, create_shutdown_channel};
use crate::error::{ConduitResult, ErrorKind};
use crate::events::{Event, EventBus};
use crate::execution::retry::backoff_delay;
use crate::metrics::{
    CONDUIT_POOL_ACQUIRE_WAIT_SECONDS, CONDUIT_POOL_ACQUIRES_TOTAL,
    CONDUIT_POOL_ACTIVE_CONNECTIONS, CONDUIT_POOL_IDLE_CONNECTIONS, CONDUIT_POOL_TIMEOUTS_TOTAL,
    POOL_LABEL,
};
use crate::pool::connection::{PooledConnection, Slot};
use crate::pool::factory::ConnectionFactory;
use crate::pool::stats::PoolStats;
use crate::{bail, conduit_error};

const CREATE_RETRY_INITIAL_DELAY: Duration = Duration::from_millis(50);
const CREATE_RETRY_MAX_DELAY: Duration = Duration::from_secs(2);

struct Waiter<C> {
    id: u64,
    tx: oneshot::Sender<ConduitResult<Slot<C>>>,
}

struct PoolState<C> {
    idle: VecDeque<Slot<C>>,
    waiters: VecDeque<Waiter<C>>,
    /// Connections lent to callers.
    active: usize,
    /// Connections being created.
    pending: usize,
    /// Idle connections temporarily taken out by the health check.
    checking: usize,
    draining: bool,
    destroyed: bool,
    next_waiter_id: u64,
    next_connection_id: u64,
    stats: PoolStats,
}

impl<C> PoolState<C> {
    fn total(&self) -> usize {
        self.idle.len() + self.active + self.pending + self.checking
    }

    fn is_closed(&self) -> bool {
        self.draining || self.destroyed
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            idle: self.idle.len(),
            active: self.active,
            pending: self.pending,
            waiting: self.waiters.len(),
            ..self.stats
        }
    }
}

pub(crate) struct PoolInner<F: ConnectionFactory> {
    name: String,
    factory: F,
    config: PoolConfig,
    events: EventBus,
    state: Mutex<PoolState<F::Connection>>,
    /// Woken whenever a lent connection comes back or a creation settles.
    settled: Notify,
    shutdown_tx: ShutdownTx,
}

impl<F: ConnectionFactory> PoolInner<F> {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState<F::Connection>> {
        // A panic while holding the lock cannot leave the counters half-updated.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Hands idle connections to waiters in FIFO order and starts creations for the rest.
    ///
    /// Runs until no waiter is left or nothing more can be done right now.
    fn service_locked(self: &Arc<Self>, state: &mut PoolState<F::Connection>) {
        loop {
            while state
                .waiters
                .front()
                .is_some_and(|waiter| waiter.tx.is_closed())
            {
                state.waiters.pop_front();
            }

            if state.waiters.is_empty() {
                break;
            }

            if let Some(mut slot) = state.idle.pop_front() {
                let Some(waiter) = state.waiters.pop_front() else {
                    state.idle.push_front(slot);
                    break;
                };

                slot.last_used = Instant::now();
                state.active += 1;
                if let Err(Ok(slot)) = waiter.tx.send(Ok(slot)) {
                    // The acquirer went away between the check above and the send.
                    state.active -= 1;
                    state.idle.push_front(slot);
                }
                continue;
            }

            if !state.is_closed()
                && state.total() < self.config.max_connections
                && state.pending < state.waiters.len()
            {
                state.pending += 1;
                self.spawn_create(true);
                continue;
            }

            break;
        }

        self.record_gauges(state);
    }

    fn record_gauges(&self, state: &PoolState<F::Connection>) {
        gauge!(CONDUIT_POOL_IDLE_CONNECTIONS, POOL_LABEL => self.name.clone())
            .set(state.idle.len() as f64);
        gauge!(CONDUIT_POOL_ACTIVE_CONNECTIONS, POOL_LABEL => self.name.clone())
            .set(state.active as f64);
    }

    /// Creates a connection in the background. The caller already counted it as pending.
    fn spawn_create(self: &Arc<Self>, for_waiter: bool) {
        let inner = Arc::clone(self);
        let span = tracing::debug_span!("pool_create", pool = %self.name);

        tokio::spawn(
            async move {
                let result = inner.create_connection().await;

                let leftover = {
                    let mut state = inner.lock_state();
                    state.pending -= 1;

                    let leftover = match result {
                        Ok(connection) if state.is_closed() => Some(connection),
                        Ok(connection) => {
                            let id = state.next_connection_id;
                            state.next_connection_id += 1;
                            state.stats.created += 1;
                            state.idle.push_back(Slot::new(id, connection));
                            inner.events.publish(Event::PoolConnect {
                                pool: inner.name.clone(),
                                connection_id: id,
                            });
                            None
                        }
                        Err(err) => {
                            state.stats.errors += 1;
                            warn!(pool = %inner.name, error = %err, "failed to create connection");
                            inner.events.publish(Event::PoolError {
                                pool: inner.name.clone(),
                                error: err.to_string(),
                            });
                            if for_waiter {
                                if let Some(waiter) = state.waiters.pop_front() {
                                    let _ = waiter.tx.send(Err(err));
                                }
                            }
                            None
                        }
                    };

                    inner.service_locked(&mut state);
                    leftover
                };

                if let Some(connection) = leftover {
                    inner.factory.destroy(connection);
                }
                inner.settled.notify_waiters();
            }
            .instrument(span),
        );
    }

    async fn create_connection(&self) -> ConduitResult<F::Connection> {
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(self.config.create_timeout(), self.create_once()).await
            {
                Ok(result) => result,
                Err(_) => Err(conduit_error!(
                    ErrorKind::ConnectFailed,
                    "Connection creation timed out",
                    format!("no connection after {:?}", self.config.create_timeout())
                )),
            };

            match result {
                Ok(connection) => return Ok(connection),
                Err(err) if err.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let delay =
                        backoff_delay(CREATE_RETRY_INITIAL_DELAY, CREATE_RETRY_MAX_DELAY, attempt);
                    debug!(pool = %self.name, attempt, ?delay, error = %err, "retrying connection creation");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn create_once(&self) -> ConduitResult<F::Connection> {
        #[cfg(feature = "failpoints")]
        crate::failpoints::conduit_fail_point(crate::failpoints::BEFORE_POOL_CREATE)?;

        self.factory.create().await
    }

    /// Takes a connection back from a caller.
    pub(crate) fn release(self: &Arc<Self>, mut slot: Slot<F::Connection>, broken: bool) {
        let connection_id = slot.id;
        let valid = !broken && self.factory.is_valid(&slot.connection);

        let destroyed = {
            let mut state = self.lock_state();
            state.active -= 1;
            state.stats.released += 1;

            let destroyed = if valid && !state.is_closed() {
                slot.last_used = Instant::now();
                state.idle.push_back(slot);
                None
            } else {
                state.stats.destroyed += 1;
                Some(slot)
            };

            self.service_locked(&mut state);
            destroyed
        };

        self.events.publish(Event::PoolRelease {
            pool: self.name.clone(),
            connection_id,
        });

        if let Some(slot) = destroyed {
            self.destroy_slot(slot);
        }

        self.settled.notify_waiters();
    }

    fn destroy_slot(&self, slot: Slot<F::Connection>) {
        debug!(pool = %self.name, connection_id = slot.id, "destroying connection");
        self.events.publish(Event::PoolDisconnect {
            pool: self.name.clone(),
            connection_id: slot.id,
        });
        self.factory.destroy(slot.connection);
    }

    /// Drops idle connections unused for longer than the idle timeout, keeping at least the
    /// minimum number of connections.
    fn reap_idle(self: &Arc<Self>) {
        let idle_timeout = self.config.idle_timeout();
        let min = self.config.min_connections;

        let reaped = {
            let mut state = self.lock_state();
            let mut reaped = Vec::new();
            let mut kept = VecDeque::with_capacity(state.idle.len());

            while let Some(slot) = state.idle.pop_front() {
                let total_with_slot = state.total() + kept.len() + 1;
                if total_with_slot > min && slot.last_used.elapsed() > idle_timeout {
                    reaped.push(slot);
                } else {
                    kept.push_back(slot);
                }
            }

            state.idle = kept;
            state.stats.destroyed += reaped.len() as u64;
            self.record_gauges(&state);
            reaped
        };

        if !reaped.is_empty() {
            debug!(pool = %self.name, count = reaped.len(), "reaped idle connections");
        }
        for slot in reaped {
            self.destroy_slot(slot);
        }
    }

    /// Checks every idle connection, destroys the failing ones and tops the pool up to its
    /// minimum size.
    async fn health_check(self: &Arc<Self>) {
        let slots: Vec<_> = {
            let mut state = self.lock_state();
            let slots: Vec<_> = state.idle.drain(..).collect();
            state.checking += slots.len();
            slots
        };

        let mut checked = Vec::with_capacity(slots.len());
        for mut slot in slots {
            let healthy = self.factory.health_check(&mut slot.connection).await;
            checked.push((slot, healthy));
        }

        let destroyed = {
            let mut state = self.lock_state();
            let mut destroyed = Vec::new();
            for (slot, healthy) in checked {
                state.checking -= 1;
                if healthy && !state.is_closed() {
                    state.idle.push_back(slot);
                } else {
                    state.stats.destroyed += 1;
                    destroyed.push(slot);
                }
            }

            self.ensure_min_locked(&mut state);
            self.service_locked(&mut state);
            destroyed
        };

        if !destroyed.is_empty() {
            warn!(pool = %self.name, count = destroyed.len(), "destroyed unhealthy connections");
        }
        for slot in destroyed {
            self.destroy_slot(slot);
        }
    }

    fn ensure_min_locked(self: &Arc<Self>, state: &mut PoolState<F::Connection>) {
        if state.is_closed() {
            return;
        }

        let min = self.config.min_connections;
        while state.total() < min {
            state.pending += 1;
            self.spawn_create(false);
        }
    }
}

/// A named pool of reusable connections created by a [`ConnectionFactory`].
///
/// Acquirers are served strictly in arrival order. The number of idle, lent and in-creation
/// connections never exceeds the configured maximum. A background task reaps idle connections
/// and runs health checks until the pool is destroyed or every handle is dropped.
///
/// Must be created inside a Tokio runtime.
pub struct Pool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ConnectionFactory> fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.inner.name)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<F: ConnectionFactory> Pool<F> {
    /// Creates a new pool and starts its maintenance task.
    ///
    /// `min_connections` connections are opened in the background. Fails with `ConfigInvalid`
    /// when `config` is invalid.
    pub fn new(
        name: impl Into<String>,
        factory: F,
        config: PoolConfig,
        events: EventBus,
    ) -> ConduitResult<Self> {
        config.validate()?;

        let name = name.into();
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let inner = Arc::new(PoolInner {
            name: name.clone(),
            factory,
            config: config.clone(),
            events,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                waiters: VecDeque::new(),
                active: 0,
                pending: 0,
                checking: 0,
                draining: false,
                destroyed: false,
                next_waiter_id: 0,
                next_connection_id: 1,
                stats: PoolStats::default(),
            }),
            settled: Notify::new(),
            shutdown_tx,
        });

        {
            let mut state = inner.lock_state();
            inner.ensure_min_locked(&mut state);
        }

        let span = tracing::info_span!("pool_maintenance", pool = %name);
        tokio::spawn(run_maintenance(Arc::downgrade(&inner), shutdown_rx, config).instrument(span));

        info!(pool = %name, "created connection pool");

        Ok(Self { inner })
    }

    /// Returns the name of the pool.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the configuration the pool was created with.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Returns the factory creating the connections of this pool.
    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    /// Waits for a connection for at most the configured acquire timeout.
    pub async fn acquire(&self) -> ConduitResult<PooledConnection<F>> {
        let started = Instant::now();

        let (waiter_id, mut rx) = {
            let mut state = self.inner.lock_state();
            if state.destroyed {
                bail!(ErrorKind::PoolClosed, "Pool is destroyed", self.inner.name);
            }
            if state.draining {
                bail!(ErrorKind::PoolClosed, "Pool is draining", self.inner.name);
            }

            let waiter_id = state.next_waiter_id;
            state.next_waiter_id += 1;

            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter { id: waiter_id, tx });
            self.inner.service_locked(&mut state);

            (waiter_id, rx)
        };

        let slot = match tokio::time::timeout(self.inner.config.acquire_timeout(), &mut rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => bail!(ErrorKind::PoolClosed, "Pool closed while waiting", self.inner.name),
            Err(_) => {
                let still_queued = {
                    let mut state = self.inner.lock_state();
                    let position = state.waiters.iter().position(|w| w.id == waiter_id);
                    if let Some(position) = position {
                        state.waiters.remove(position);
                        state.stats.timeouts += 1;
                    }
                    position.is_some()
                };

                if still_queued {
                    counter!(CONDUIT_POOL_TIMEOUTS_TOTAL, POOL_LABEL => self.inner.name.clone())
                        .increment(1);
                    bail!(
                        ErrorKind::AcquireTimeout,
                        "Timed out waiting for a connection",
                        format!(
                            "pool {} after {:?}",
                            self.inner.name,
                            self.inner.config.acquire_timeout()
                        )
                    );
                }

                // Served right at the deadline: the result is already in the channel.
                match rx.try_recv() {
                    Ok(result) => result?,
                    Err(_) => bail!(
                        ErrorKind::AcquireTimeout,
                        "Timed out waiting for a connection",
                        self.inner.name
                    ),
                }
            }
        };

        let waited = started.elapsed();
        {
            let mut state = self.inner.lock_state();
            state.stats.acquired += 1;
        }
        counter!(CONDUIT_POOL_ACQUIRES_TOTAL, POOL_LABEL => self.inner.name.clone()).increment(1);
        histogram!(CONDUIT_POOL_ACQUIRE_WAIT_SECONDS, POOL_LABEL => self.inner.name.clone())
            .record(waited.as_secs_f64());
        self.inner.events.publish(Event::PoolAcquire {
            pool: self.inner.name.clone(),
            connection_id: slot.id,
            waited_ms: waited.as_millis() as u64,
        });

        Ok(PooledConnection::new(slot, Arc::clone(&self.inner)))
    }

    /// Returns a connection to the pool. Equivalent to dropping it.
    pub fn release(&self, connection: PooledConnection<F>) {
        drop(connection);
    }

    /// Acquires a connection, runs `f` with it and releases it whatever the outcome.
    pub async fn execute_with<T, Fun>(&self, f: Fun) -> ConduitResult<T>
    where
        Fun: for<'c> FnOnce(&'c mut F::Connection) -> BoxFuture<'c, ConduitResult<T>>,
    {
        let mut connection = self.acquire().await?;
        let result = f(&mut connection).await;
        drop(connection);

        result
    }

    /// Stops handing out connections and waits for every lent connection to come back.
    ///
    /// Pending acquirers fail with [`ErrorKind::PoolClosed`]; idle connections are destroyed
    /// immediately and returned ones on release.
    pub async fn drain(&self) {
        let idle = {
            let mut state = self.inner.lock_state();
            state.draining = true;
            self.fail_waiters_locked(&mut state, "Pool is draining");
            let idle: Vec<_> = state.idle.drain(..).collect();
            state.stats.destroyed += idle.len() as u64;
            idle
        };
        for slot in idle {
            self.inner.destroy_slot(slot);
        }

        loop {
            let settled = self.inner.settled.notified();
            {
                let state = self.inner.lock_state();
                if state.active == 0 && state.pending == 0 && state.checking == 0 {
                    break;
                }
            }
            settled.await;
        }

        info!(pool = %self.inner.name, "drained connection pool");
    }

    /// Closes the pool for good. Lent connections are destroyed when released.
    pub fn destroy(&self) {
        let idle = {
            let mut state = self.inner.lock_state();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            self.fail_waiters_locked(&mut state, "Pool is destroyed");
            let idle: Vec<_> = state.idle.drain(..).collect();
            state.stats.destroyed += idle.len() as u64;
            idle
        };

        self.inner.shutdown_tx.shutdown();
        for slot in idle {
            self.inner.destroy_slot(slot);
        }

        info!(pool = %self.inner.name, "destroyed connection pool");
    }

    fn fail_waiters_locked(&self, state: &mut PoolState<F::Connection>, reason: &'static str) {
        for waiter in state.waiters.drain(..) {
            let _ = waiter.tx.send(Err(conduit_error!(
                ErrorKind::PoolClosed,
                reason,
                self.inner.name
            )));
        }
    }

    /// Returns `true` once [`Pool::destroy`] was called.
    pub fn is_destroyed(&self) -> bool {
        self.inner.lock_state().destroyed
    }

    /// Returns `true` while the pool refuses new acquires.
    pub fn is_draining(&self) -> bool {
        self.inner.lock_state().draining
    }

    /// Returns a snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        self.inner.lock_state().snapshot()
    }

    /// Runs the idle reaper once, outside its schedule.
    pub fn reap_now(&self) {
        self.inner.reap_idle();
    }

    /// Runs a health check once, outside its schedule.
    pub async fn health_check_now(&self) {
        self.inner.health_check().await;
    }
}

async fn run_maintenance<F: ConnectionFactory>(
    inner: Weak<PoolInner<F>>,
    mut shutdown_rx: ShutdownRx,
    config: PoolConfig,
) {
    let mut reap = tokio::time::interval(config.reap_interval());
    reap.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut health = tokio::time::interval(config.health_check_interval());
    health.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Both intervals fire immediately on their first tick.
    reap.tick().await;
    health.tick().await;

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.wait() => break,

            _ = reap.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                inner.reap_idle();
            }

            _ = health.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                inner.health_check().await;
            }
        }
    }

    debug!("pool maintenance stopped");
}
