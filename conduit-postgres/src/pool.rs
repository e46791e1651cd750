use std::time::Duration;

use conduit_config::shared::{IntoConnectOptions, PgConnectionConfig};
use sqlx::{
    PgPool,
    postgres::{PgConnectOptions, PgPoolOptions},
};

/// Opens a small sqlx pool used for bookkeeping queries such as the execution context store.
pub async fn connect_pool(
    config: &PgConnectionConfig,
    min_connections: u32,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    let options = config.connection_options();
    let connect_options: PgConnectOptions = config.with_db(Some(&options));

    PgPoolOptions::new()
        .min_connections(min_connections)
        .max_connections(max_connections)
        .acquire_timeout(config.connect_timeout().max(Duration::from_secs(1)))
        .connect_with(connect_options)
        .await
}
