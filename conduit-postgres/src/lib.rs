//! PostgreSQL plumbing shared by the conduit adapter and the execution context store.

pub mod connect;
pub mod numeric;
pub mod pool;
pub mod table;
#[cfg(feature = "test-utils")]
pub mod test_utils;
pub mod version;
