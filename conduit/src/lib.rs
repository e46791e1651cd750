//! Data integration engine moving records between systems.
//!
//! A [`execution::Mapping`] describes how records of a source container become records of a
//! target container. The [`execution::MappingEngine`] runs it: it reads the source through an
//! [`adapter::Adapter`], drives every record through the stages of a [`stream::Pipeline`]
//! (conditions, [`validation`], transforms) and writes batches to the target, retrying transient
//! failures and recording everything in an [`execution::ExecutionContext`].
//!
//! Connections are pooled by the [`pool::PoolManager`] and lifecycle events are published on an
//! [`events::EventBus`].

pub mod adapter;
pub mod concurrency;
pub mod error;
pub mod events;
pub mod execution;
#[cfg(feature = "failpoints")]
pub mod failpoints;
mod macros;
pub mod metrics;
pub mod pool;
pub mod store;
pub mod stream;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
pub mod validation;
