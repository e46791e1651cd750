use conduit::error::ConduitError;
use conduit_config::{LoadConfigError, StrictConfigError};
use conduit_telemetry::tracing::TracingError;
use thiserror::Error;

pub type RunnerResult<T> = Result<T, RunnerError>;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("configuration error: {0}")]
    Config(#[from] LoadConfigError),

    #[error("configuration error: {0}")]
    StrictConfig(#[from] StrictConfigError),

    #[error("tracing setup failed: {0}")]
    Tracing(#[from] TracingError),

    #[error("runtime setup failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("mapping run failed: {0}")]
    Conduit(#[from] ConduitError),
}
