use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use conduit_config::shared::PoolConfig;
use futures::future::BoxFuture;
use tracing::info;

use crate::error::{ConduitResult, ErrorKind};
use crate::events::EventBus;
use crate::pool::{ConnectionFactory, Pool, PoolStats, PooledConnection};
use crate::{bail, conduit_error};

/// Type erased view of a pool, used by the manager for lifecycle operations.
pub trait ManagedPool: Send + Sync {
    fn name(&self) -> &str;

    fn stats(&self) -> PoolStats;

    fn drain(&self) -> BoxFuture<'_, ()>;

    fn destroy(&self);

    fn as_any(&self) -> &dyn Any;
}

impl<F: ConnectionFactory> ManagedPool for Pool<F> {
    fn name(&self) -> &str {
        Pool::name(self)
    }

    fn stats(&self) -> PoolStats {
        Pool::stats(self)
    }

    fn drain(&self) -> BoxFuture<'_, ()> {
        Box::pin(Pool::drain(self))
    }

    fn destroy(&self) {
        Pool::destroy(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Registry of named pools shared by every adapter of a process.
#[derive(Clone)]
pub struct PoolManager {
    pools: Arc<Mutex<HashMap<String, Arc<dyn ManagedPool>>>>,
    events: EventBus,
}

impl PoolManager {
    /// Creates a new manager without pools.
    pub fn new(events: EventBus) -> Self {
        Self {
            pools: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    fn lock_pools(&self) -> MutexGuard<'_, HashMap<String, Arc<dyn ManagedPool>>> {
        self.pools
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the pool called `name`, creating it with `factory` when it does not exist yet.
    ///
    /// Fails with [`ErrorKind::InvalidState`] when a pool with that name exists for a different
    /// factory type.
    pub fn create_pool<F: ConnectionFactory>(
        &self,
        name: &str,
        factory: F,
        config: PoolConfig,
    ) -> ConduitResult<Pool<F>> {
        let mut pools = self.lock_pools();

        if let Some(existing) = pools.get(name) {
            return match existing.as_any().downcast_ref::<Pool<F>>() {
                Some(pool) if !pool.is_destroyed() => Ok(pool.clone()),
                Some(_) => {
                    let pool = Pool::new(name, factory, config, self.events.clone())?;
                    pools.insert(name.to_string(), Arc::new(pool.clone()));
                    Ok(pool)
                }
                None => bail!(
                    ErrorKind::InvalidState,
                    "Pool exists with a different connection type",
                    name
                ),
            };
        }

        let pool = Pool::new(name, factory, config, self.events.clone())?;
        pools.insert(name.to_string(), Arc::new(pool.clone()));

        Ok(pool)
    }

    /// Returns the pool registered as `name` when its factory type is `F`.
    pub fn get_pool<F: ConnectionFactory>(&self, name: &str) -> Option<Pool<F>> {
        self.lock_pools()
            .get(name)
            .and_then(|pool| pool.as_any().downcast_ref::<Pool<F>>().cloned())
    }

    fn require_pool<F: ConnectionFactory>(&self, name: &str) -> ConduitResult<Pool<F>> {
        self.get_pool(name)
            .ok_or_else(|| conduit_error!(ErrorKind::NotFound, "Unknown pool", name))
    }

    /// Acquires a connection from the pool registered as `name`.
    pub async fn acquire<F: ConnectionFactory>(
        &self,
        name: &str,
    ) -> ConduitResult<PooledConnection<F>> {
        self.require_pool::<F>(name)?.acquire().await
    }

    /// Releases `connection` back to its pool.
    pub fn release<F: ConnectionFactory>(&self, connection: PooledConnection<F>) {
        drop(connection);
    }

    /// Runs `f` with a connection of the pool `name`, releasing it afterwards.
    pub async fn execute_with<F, T, Fun>(&self, name: &str, f: Fun) -> ConduitResult<T>
    where
        F: ConnectionFactory,
        Fun: for<'c> FnOnce(&'c mut F::Connection) -> BoxFuture<'c, ConduitResult<T>>,
    {
        self.require_pool::<F>(name)?.execute_with(f).await
    }

    /// Returns the counters of the pool `name`.
    pub fn stats(&self, name: &str) -> Option<PoolStats> {
        self.lock_pools().get(name).map(|pool| pool.stats())
    }

    /// Returns the counters of every pool by name.
    pub fn all_stats(&self) -> HashMap<String, PoolStats> {
        self.lock_pools()
            .iter()
            .map(|(name, pool)| (name.clone(), pool.stats()))
            .collect()
    }

    /// Drains the pool `name`: waits for lent connections and closes the idle ones.
    pub async fn drain_pool(&self, name: &str) -> ConduitResult<()> {
        let pool = self.lock_pools().get(name).cloned();
        match pool {
            Some(pool) => {
                pool.drain().await;
                Ok(())
            }
            None => bail!(ErrorKind::NotFound, "Unknown pool", name),
        }
    }

    /// Destroys the pool and forgets it, so the name can be reused.
    pub fn destroy_pool(&self, name: &str) -> ConduitResult<()> {
        let pool = self.lock_pools().remove(name);
        match pool {
            Some(pool) => {
                pool.destroy();
                Ok(())
            }
            None => bail!(ErrorKind::NotFound, "Unknown pool", name),
        }
    }

    /// Drains and destroys every pool.
    pub async fn shutdown(&self) {
        let pools: Vec<_> = self.lock_pools().drain().map(|(_, pool)| pool).collect();

        for pool in &pools {
            pool.drain().await;
            pool.destroy();
        }

        info!(count = pools.len(), "shut down connection pools");
    }
}
