//! Disposable databases for integration tests.

use conduit_config::shared::{IntoConnectOptions, PgConnectionConfig, TlsConfig};
use sqlx::{Connection, Executor, PgConnection};
use tokio_postgres::Client;
use uuid::Uuid;

use crate::connect::connect;

/// Builds a config for a uniquely named database on the test server.
///
/// Reads `TESTS_DATABASE_HOST`, `TESTS_DATABASE_PORT`, `TESTS_DATABASE_USERNAME` and the
/// optional `TESTS_DATABASE_PASSWORD`.
pub fn local_pg_connection_config() -> PgConnectionConfig {
    let value = base_config(
        std::env::var("TESTS_DATABASE_HOST").expect("TESTS_DATABASE_HOST must be set"),
        std::env::var("TESTS_DATABASE_PORT")
            .expect("TESTS_DATABASE_PORT must be set")
            .parse()
            .expect("TESTS_DATABASE_PORT must be a valid port number"),
        std::env::var("TESTS_DATABASE_USERNAME").expect("TESTS_DATABASE_USERNAME must be set"),
    );

    PgConnectionConfig {
        password: std::env::var("TESTS_DATABASE_PASSWORD")
            .ok()
            .map(Into::into),
        ..value
    }
}

fn base_config(host: String, port: u16, username: String) -> PgConnectionConfig {
    PgConnectionConfig {
        host,
        port,
        name: Uuid::new_v4().to_string(),
        username,
        password: None,
        tls: TlsConfig::disabled(),
        statement_timeout_ms: 30_000,
        connect_timeout_ms: 10_000,
        application_name: "conduit_tests".to_string(),
    }
}

/// A database created for one test and dropped by [`PgDatabase::drop_database`].
pub struct PgDatabase {
    pub config: PgConnectionConfig,
    pub client: Client,
}

impl PgDatabase {
    /// Creates the database described by `config` and connects a client to it.
    ///
    /// # Panics
    ///
    /// Panics when the server is unreachable or the database cannot be created.
    pub async fn new(config: PgConnectionConfig) -> Self {
        let mut connection = PgConnection::connect_with(&config.without_db(None))
            .await
            .expect("Failed to connect to Postgres");
        connection
            .execute(&*format!(r#"create database "{}";"#, config.name))
            .await
            .expect("Failed to create database");

        let connected = connect(&config)
            .await
            .expect("Failed to connect to the test database");

        Self {
            config,
            client: connected.client,
        }
    }

    /// Runs a batch of statements, panicking on failure.
    pub async fn run(&self, sql: &str) {
        self.client
            .batch_execute(sql)
            .await
            .unwrap_or_else(|err| panic!("Failed to run `{sql}`: {err}"));
    }

    /// Terminates remaining sessions and drops the database. Errors are only reported.
    pub async fn drop_database(self) {
        drop(self.client);

        let mut connection = match PgConnection::connect_with(&self.config.without_db(None)).await
        {
            Ok(connection) => connection,
            Err(err) => {
                eprintln!("warning: failed to connect to Postgres for cleanup: {err}");
                return;
            }
        };

        let terminate = format!(
            "select pg_terminate_backend(pid) from pg_stat_activity \
             where datname = '{}' and pid <> pg_backend_pid();",
            self.config.name
        );
        if let Err(err) = connection.execute(&*terminate).await {
            eprintln!(
                "warning: failed to terminate sessions of {}: {err}",
                self.config.name
            );
        }

        if let Err(err) = connection
            .execute(&*format!(r#"drop database if exists "{}";"#, self.config.name))
            .await
        {
            eprintln!("warning: failed to drop database {}: {err}", self.config.name);
        }
    }
}
