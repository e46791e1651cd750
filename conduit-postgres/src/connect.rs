use std::io::BufReader;
use std::num::NonZeroI32;

use conduit_config::shared::{IntoConnectOptions, PgConnectionConfig};
use rustls::ClientConfig;
use thiserror::Error;
use tokio_postgres::tls::MakeTlsConnect;
use tokio_postgres::{Client, Config, Connection, NoTls, Socket};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{Instrument, debug, error};

use crate::version::extract_server_version;

/// Errors raised while opening a client connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("postgres connection failed: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("invalid trusted root certificates: {0}")]
    Certificates(#[from] std::io::Error),

    #[error("rejected trusted root certificate: {0}")]
    Tls(#[from] rustls::Error),
}

/// A client together with what the server reported at startup.
#[derive(Debug)]
pub struct ConnectedClient {
    pub client: Client,
    /// Raw `server_version` parameter, e.g. `16.2`.
    pub server_version_string: Option<String>,
    pub server_version: Option<NonZeroI32>,
}

/// Opens a client connection, using TLS when the config enables it.
///
/// The connection future is driven by a background task that lives as long as the client.
pub async fn connect(config: &PgConnectionConfig) -> Result<ConnectedClient, ConnectError> {
    let options = config.connection_options();
    let pg_config: Config = config.with_db(Some(&options));

    if config.tls.enabled {
        let mut root_store = rustls::RootCertStore::empty();
        let mut reader = BufReader::new(config.tls.trusted_root_certs.as_bytes());
        for cert in rustls_pemfile::certs(&mut reader) {
            root_store.add(cert?)?;
        }

        let tls_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let (client, connection) = pg_config.connect(MakeRustlsConnect::new(tls_config)).await?;
        let server_version_string = connection.parameter("server_version").map(str::to_owned);
        spawn_postgres_connection::<MakeRustlsConnect>(connection);

        debug!(host = %config.host, "connected to postgres with tls");

        Ok(ConnectedClient {
            client,
            server_version: server_version_string
                .as_deref()
                .and_then(extract_server_version),
            server_version_string,
        })
    } else {
        let (client, connection) = pg_config.connect(NoTls).await?;
        let server_version_string = connection.parameter("server_version").map(str::to_owned);
        spawn_postgres_connection::<NoTls>(connection);

        debug!(host = %config.host, "connected to postgres without tls");

        Ok(ConnectedClient {
            client,
            server_version: server_version_string
                .as_deref()
                .and_then(extract_server_version),
            server_version_string,
        })
    }
}

/// Drives a connection until it terminates. Dropping the client terminates the connection.
fn spawn_postgres_connection<T>(connection: Connection<Socket, T::Stream>)
where
    T: MakeTlsConnect<Socket>,
    T::Stream: Send + 'static,
{
    let span = tracing::Span::current();
    let task = async move {
        if let Err(err) = connection.await {
            error!(error = %err, "postgres connection terminated with an error");
        } else {
            debug!("postgres connection terminated");
        }
    }
    .instrument(span);

    tokio::spawn(task);
}
