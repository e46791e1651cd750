use std::sync::Once;

use conduit_config::Environment;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Enables log output in tests when set to any value.
const ENABLE_TRACING_ENV: &str = "ENABLE_TRACING";

static TEST_TRACING: Once = Once::new();

/// Errors raised while installing the global subscriber.
#[derive(Debug, Error)]
pub enum TracingError {
    #[error("failed to read the runtime environment: {0}")]
    Environment(#[from] std::io::Error),

    #[error("failed to bridge `log` records into tracing: {0}")]
    LogBridge(#[from] tracing_log::log::SetLoggerError),

    #[error("failed to install the tracing subscriber: {0}")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}

/// Flushes buffered log lines when dropped. Keep it alive for the lifetime of `main`.
#[must_use = "dropping the flusher stops log output"]
pub struct LogFlusher {
    _guard: WorkerGuard,
}

/// Installs the global subscriber for a binary named `app_name`.
///
/// The filter comes from `RUST_LOG` and defaults to `info` for the binary and the library.
/// Production emits JSON lines, development emits human readable output.
pub fn init_tracing(app_name: &str) -> Result<LogFlusher, TracingError> {
    let environment = Environment::load()?;

    tracing_log::LogTracer::init()?;

    let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let crate_name = app_name.replace('-', "_");
        format!("{crate_name}=info,conduit=info").into()
    });

    let json_layer = environment.is_prod().then(|| {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(writer.clone())
    });
    let pretty_layer = (!environment.is_prod()).then(|| fmt::layer().with_writer(writer));

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(pretty_layer)
        .try_init()?;

    Ok(LogFlusher { _guard: guard })
}

/// Installs a test subscriber once per process when `ENABLE_TRACING` is set.
pub fn init_test_tracing() {
    TEST_TRACING.call_once(|| {
        if std::env::var_os(ENABLE_TRACING_ENV).is_none() {
            return;
        }

        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "conduit=debug,info".into());
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_test_writer())
            .try_init();
    });
}
