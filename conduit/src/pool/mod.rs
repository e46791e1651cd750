//! Named pools of reusable connections.
//!
//! A [`Pool`] lends connections created by a [`ConnectionFactory`] to callers in strict FIFO
//! order, bounded by the configured maximum. Released connections are validated and either
//! reused or destroyed. A background task reaps connections idle for too long and runs health
//! checks that also top the pool up to its minimum size. The [`PoolManager`] keeps pools by name.

mod base;
mod connection;
mod factory;
mod manager;
mod stats;

pub use base::Pool;
pub use connection::PooledConnection;
pub use factory::ConnectionFactory;
pub use manager::{ManagedPool, PoolManager};
pub use stats::PoolStats;

#[cfg(test)]
mod tests;
