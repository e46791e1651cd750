//! Runs one configured mapping between PostgreSQL systems and exits.
//!
//! The exit code is non-zero when the configuration is invalid or the run does not complete.

use std::process::ExitCode;

use conduit_telemetry::tracing::init_tracing;
use tracing::{error, info};

use crate::config::{RunnerConfig, load_runner_config};
use crate::core::run_mapping;
use crate::error::RunnerResult;

mod config;
mod core;
mod error;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> RunnerResult<()> {
    let config = load_runner_config()?;
    let _log_flusher = init_tracing(env!("CARGO_BIN_NAME"))?;

    // Failures past this point are logged as well.
    run_with_tracing(config).inspect_err(|err| error!(%err, "conduit runner failed"))
}

fn run_with_tracing(config: RunnerConfig) -> RunnerResult<()> {
    let context = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run_mapping(config))?;

    let summary = context.summary();
    info!(
        context_id = %summary.id,
        status = summary.status.as_str(),
        processed = summary.records_processed,
        failed = summary.records_failed,
        filtered = summary.records_filtered,
        "mapping run finished"
    );

    context.into_result()?;

    Ok(())
}
