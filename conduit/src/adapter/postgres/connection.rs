use async_trait::async_trait;
use conduit_config::shared::PgConnectionConfig;
use conduit_postgres::connect::connect;
use tokio_postgres::Client;
use tracing::debug;

use crate::error::ConduitResult;
use crate::pool::ConnectionFactory;

/// A client connection to PostgreSQL, as lent out by the adapter pool.
#[derive(Debug)]
pub struct PgConnection {
    client: Client,
    server_version: Option<String>,
}

impl PgConnection {
    /// Returns the client of this connection.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// The `server_version` reported at startup.
    pub fn server_version(&self) -> Option<&str> {
        self.server_version.as_deref()
    }
}

/// Opens connections described by a [`PgConnectionConfig`].
///
/// Every session carries the configured statement timeout.
#[derive(Debug, Clone)]
pub struct PgConnectionFactory {
    config: PgConnectionConfig,
}

impl PgConnectionFactory {
    /// Creates a new factory for connections described by `config`.
    pub fn new(config: PgConnectionConfig) -> Self {
        Self { config }
    }

    /// Returns the connection configuration.
    pub fn config(&self) -> &PgConnectionConfig {
        &self.config
    }
}

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    type Connection = PgConnection;

    async fn create(&self) -> ConduitResult<Self::Connection> {
        let connected = connect(&self.config).await?;
        debug!(
            host = %self.config.host,
            database = %self.config.name,
            server_version = ?connected.server_version_string,
            "opened postgres connection"
        );

        Ok(PgConnection {
            client: connected.client,
            server_version: connected.server_version_string,
        })
    }

    fn is_valid(&self, connection: &Self::Connection) -> bool {
        !connection.client.is_closed()
    }

    async fn health_check(&self, connection: &mut Self::Connection) -> bool {
        !connection.client.is_closed() && connection.client.simple_query("SELECT 1").await.is_ok()
    }
}
