//! Uniform contract over data systems.
//!
//! An [`Adapter`] connects to one system, discovers the schemas of its containers of records and
//! reads and writes them through the universal [`Value`](crate::types::Value) lattice. The
//! [`MemoryAdapter`] keeps its data in process and [`postgres::PostgresAdapter`] is the reference
//! implementation over a PostgreSQL server.

mod base;
mod cache;
mod capabilities;
mod filter;
mod memory;
mod options;
mod paged;
pub mod postgres;
mod registry;

pub use base::{Adapter, Transaction};
pub use cache::{DEFAULT_SCHEMA_TTL, SchemaCache};
pub use capabilities::{Capabilities, Capability, Operation, SupportedOperations};
pub use filter::{Filter, FilterCondition, json_contains, like_regex};
pub use memory::MemoryAdapter;
pub use options::{
    DEFAULT_WRITE_BATCH_SIZE, DiscoverOptions, FieldInfo, Join, JoinCondition, JoinKind,
    OnConflict, OrderBy, QueryResult, ReadOptions, ReadResult, SortDirection, SystemMetadata,
    WriteMode, WriteOptions, WriteResult,
};
pub use paged::{PageSize, count_rows, read_paged};
pub use registry::AdapterRegistry;
