//! Per component configuration structs.

mod base;
mod connection;
mod execution;
mod pool;
mod stream;
mod validation;

pub use base::ValidationError;
pub use connection::{
    IntoConnectOptions, PgConnectionConfig, PgConnectionConfigWithoutSecrets,
    PgConnectionOptions, TlsConfig,
};
pub use execution::{ErrorPolicy, ExecutionConfig};
pub use pool::PoolConfig;
pub use stream::StreamConfig;
pub use validation::ValidationConfig;
