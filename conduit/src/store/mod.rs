//! Persistence of execution contexts.

mod base;
mod memory;
mod postgres;

pub use base::ContextStore;
pub use memory::MemoryContextStore;
pub use postgres::PostgresContextStore;
