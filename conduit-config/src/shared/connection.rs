use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions as SqlxConnectOptions, PgSslMode as SqlxSslMode};
use tokio_postgres::{Config as TokioPgConnectOptions, config::SslMode as TokioPgSslMode};

use crate::shared::ValidationError;

const DATESTYLE: &str = "ISO";
const INTERVALSTYLE: &str = "postgres";
const EXTRA_FLOAT_DIGITS: i32 = 3;
const CLIENT_ENCODING: &str = "UTF8";
const TIMEZONE: &str = "UTC";

const DEFAULT_APPLICATION_NAME: &str = "conduit";
const DEFAULT_STATEMENT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Session settings applied to every connection through the startup `options` parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgConnectionOptions {
    pub statement_timeout_ms: u64,
    pub lock_timeout_ms: u64,
    pub idle_in_transaction_session_timeout_ms: u64,
    pub application_name: String,
}

impl PgConnectionOptions {
    fn settings(&self) -> Vec<(&'static str, String)> {
        vec![
            ("datestyle", DATESTYLE.to_string()),
            ("intervalstyle", INTERVALSTYLE.to_string()),
            ("extra_float_digits", EXTRA_FLOAT_DIGITS.to_string()),
            ("client_encoding", CLIENT_ENCODING.to_string()),
            ("timezone", TIMEZONE.to_string()),
            ("statement_timeout", self.statement_timeout_ms.to_string()),
            ("lock_timeout", self.lock_timeout_ms.to_string()),
            (
                "idle_in_transaction_session_timeout",
                self.idle_in_transaction_session_timeout_ms.to_string(),
            ),
            ("application_name", self.application_name.clone()),
        ]
    }

    /// Renders the settings as `-c key=value` pairs for the tokio-postgres `options` parameter.
    pub fn to_options_string(&self) -> String {
        self.settings()
            .into_iter()
            .map(|(key, value)| format!("-c {key}={value}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Returns the connection options as `key=value` pairs, without the password.
    pub fn to_key_value_pairs(&self) -> Vec<(String, String)> {
        self.settings()
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect()
    }
}

/// Connection parameters of a PostgreSQL server.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PgConnectionConfig {
    pub host: String,
    pub port: u16,
    /// Database name.
    pub name: String,
    pub username: String,
    #[serde(default)]
    pub password: Option<SecretString>,
    #[serde(default = "TlsConfig::disabled")]
    pub tls: TlsConfig,
    /// Server side statement timeout of every query, in milliseconds.
    #[serde(rename = "statementTimeout", default = "default_statement_timeout_ms")]
    pub statement_timeout_ms: u64,
    #[serde(rename = "connectTimeout", default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_application_name")]
    pub application_name: String,
}

impl PgConnectionConfig {
    /// Returns the statement timeout applied to every session.
    pub fn statement_timeout(&self) -> Duration {
        Duration::from_millis(self.statement_timeout_ms)
    }

    /// Returns the timeout for establishing a connection.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Session settings derived from this config.
    pub fn connection_options(&self) -> PgConnectionOptions {
        PgConnectionOptions {
            statement_timeout_ms: self.statement_timeout_ms,
            lock_timeout_ms: self.statement_timeout_ms,
            idle_in_transaction_session_timeout_ms: 60_000,
            application_name: self.application_name.clone(),
        }
    }

    /// Key identifying the server, database and role, used to name connection pools.
    pub fn pool_key(&self) -> String {
        format!(
            "postgres://{}@{}:{}/{}",
            self.username, self.host, self.port, self.name
        )
    }

    /// Validates the connection settings.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.host.is_empty() {
            return Err(ValidationError::invalid("host", "must not be empty"));
        }

        if self.name.is_empty() {
            return Err(ValidationError::invalid("name", "must not be empty"));
        }

        self.tls.validate()
    }
}

/// [`PgConnectionConfig`] without the password, safe to log and serialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PgConnectionConfigWithoutSecrets {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub username: String,
    pub tls: TlsConfig,
}

impl From<&PgConnectionConfig> for PgConnectionConfigWithoutSecrets {
    fn from(value: &PgConnectionConfig) -> Self {
        PgConnectionConfigWithoutSecrets {
            host: value.host.clone(),
            port: value.port,
            name: value.name.clone(),
            username: value.username.clone(),
            tls: value.tls.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    /// PEM encoded root certificates trusted when verifying the server.
    pub trusted_root_certs: String,
    pub enabled: bool,
}

impl TlsConfig {
    /// Creates a TLS configuration with TLS turned off.
    pub fn disabled() -> Self {
        Self {
            trusted_root_certs: String::new(),
            enabled: false,
        }
    }

    /// Validates the TLS settings.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.enabled && self.trusted_root_certs.trim().is_empty() {
            return Err(ValidationError::MissingTrustedRootCerts);
        }

        Ok(())
    }
}

/// Builds driver specific connect options from a [`PgConnectionConfig`].
pub trait IntoConnectOptions<Output> {
    fn without_db(&self, options: Option<&PgConnectionOptions>) -> Output;
    fn with_db(&self, options: Option<&PgConnectionOptions>) -> Output;
}

impl IntoConnectOptions<SqlxConnectOptions> for PgConnectionConfig {
    fn without_db(&self, options: Option<&PgConnectionOptions>) -> SqlxConnectOptions {
        let ssl_mode = if self.tls.enabled {
            SqlxSslMode::VerifyFull
        } else {
            SqlxSslMode::Prefer
        };
        let mut connect_options = SqlxConnectOptions::new_without_pgpass()
            .host(&self.host)
            .username(&self.username)
            .port(self.port)
            .ssl_mode(ssl_mode)
            .application_name(&self.application_name);

        if self.tls.enabled {
            connect_options = connect_options
                .ssl_root_cert_from_pem(self.tls.trusted_root_certs.clone().into_bytes());
        }

        if let Some(password) = &self.password {
            connect_options = connect_options.password(password.expose_secret());
        }

        if let Some(options) = options {
            connect_options = connect_options.options(options.to_key_value_pairs());
        }

        connect_options
    }

    fn with_db(&self, options: Option<&PgConnectionOptions>) -> SqlxConnectOptions {
        let connect_options: SqlxConnectOptions = self.without_db(options);
        connect_options.database(&self.name)
    }
}

impl IntoConnectOptions<TokioPgConnectOptions> for PgConnectionConfig {
    fn without_db(&self, options: Option<&PgConnectionOptions>) -> TokioPgConnectOptions {
        let ssl_mode = if self.tls.enabled {
            TokioPgSslMode::Require
        } else {
            TokioPgSslMode::Prefer
        };
        let mut config = TokioPgConnectOptions::new();
        config
            .host(&self.host)
            .port(self.port)
            .user(&self.username)
            .ssl_mode(ssl_mode)
            .connect_timeout(self.connect_timeout());

        if let Some(password) = &self.password {
            config.password(password.expose_secret());
        }

        if let Some(options) = options {
            config.options(&options.to_options_string());
        }

        config
    }

    fn with_db(&self, options: Option<&PgConnectionOptions>) -> TokioPgConnectOptions {
        let mut config: TokioPgConnectOptions = self.without_db(options);
        config.dbname(&self.name);
        config
    }
}

fn default_statement_timeout_ms() -> u64 {
    DEFAULT_STATEMENT_TIMEOUT_MS
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_application_name() -> String {
    DEFAULT_APPLICATION_NAME.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PgConnectionConfig {
        serde_json::from_value(serde_json::json!({
            "host": "localhost",
            "port": 5432,
            "name": "orders",
            "username": "conduit",
            "password": "secret"
        }))
        .unwrap()
    }

    #[test]
    fn options_string_contains_statement_timeout() {
        let options = config().connection_options();
        assert_eq!(
            options.to_options_string(),
            "-c datestyle=ISO -c intervalstyle=postgres -c extra_float_digits=3 -c client_encoding=UTF8 -c timezone=UTC -c statement_timeout=30000 -c lock_timeout=30000 -c idle_in_transaction_session_timeout=60000 -c application_name=conduit"
        );
    }

    #[test]
    fn pool_key_omits_password() {
        let key = config().pool_key();
        assert_eq!(key, "postgres://conduit@localhost:5432/orders");
        assert!(!key.contains("secret"));
    }

    #[test]
    fn tls_without_certificates_is_invalid() {
        let mut config = config();
        config.tls.enabled = true;
        assert_eq!(
            config.validate().unwrap_err(),
            ValidationError::MissingTrustedRootCerts
        );
    }
}
