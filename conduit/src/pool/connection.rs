use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Instant;

use crate::pool::base::PoolInner;
use crate::pool::factory::ConnectionFactory;

/// A connection owned by a pool, together with its bookkeeping.
pub(super) struct Slot<C> {
    pub(super) id: u64,
    pub(super) connection: C,
    pub(super) created_at: Instant,
    pub(super) last_used: Instant,
}

impl<C> Slot<C> {
    pub(super) fn new(id: u64, connection: C) -> Self {
        let now = Instant::now();
        Self {
            id,
            connection,
            created_at: now,
            last_used: now,
        }
    }
}

/// A connection lent to a caller.
///
/// Dropping it hands the connection back to its pool, which either returns it to the idle list
/// or destroys it when it is no longer valid.
pub struct PooledConnection<F: ConnectionFactory> {
    slot: Option<Slot<F::Connection>>,
    pool: Arc<PoolInner<F>>,
    broken: bool,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    pub(super) fn new(slot: Slot<F::Connection>, pool: Arc<PoolInner<F>>) -> Self {
        Self {
            slot: Some(slot),
            pool,
            broken: false,
        }
    }

    /// Stable id of the connection inside its pool.
    pub fn id(&self) -> u64 {
        self.slot.as_ref().map(|slot| slot.id).unwrap_or_default()
    }

    /// Returns the name of the owning pool.
    pub fn pool_name(&self) -> &str {
        self.pool.name()
    }

    /// Returns when the connection was opened.
    pub fn created_at(&self) -> Option<Instant> {
        self.slot.as_ref().map(|slot| slot.created_at)
    }

    /// Makes the pool destroy the connection on release instead of reusing it.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Undoes [`Self::mark_broken`] once the connection is known to be clean again.
    ///
    /// Session state that must not outlive an operation, such as an open transaction, is
    /// guarded by marking the connection broken first and reusable after it is cleared.
    pub fn mark_reusable(&mut self) {
        self.broken = false;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        match &self.slot {
            Some(slot) => &slot.connection,
            // The slot is only taken in `drop`.
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<F: ConnectionFactory> DerefMut for PooledConnection<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.slot {
            Some(slot) => &mut slot.connection,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.release(slot, self.broken);
        }
    }
}

impl<F: ConnectionFactory> fmt::Debug for PooledConnection<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool", &self.pool.name())
            .field("id", &self.id())
            .field("broken", &self.broken)
            .finish()
    }
}
