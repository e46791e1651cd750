use std::sync::Arc;

use conduit::adapter::AdapterRegistry;
use conduit::adapter::postgres::PostgresAdapter;
use conduit::events::{Event, EventBus};
use conduit::execution::{ExecutionContext, Mapping, MappingEngine};
use conduit::pool::PoolManager;
use conduit::store::PostgresContextStore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RunnerConfig;
use crate::error::RunnerResult;

/// Wires the configured systems into an engine and runs the mapping to completion.
///
/// A Ctrl-C during the run cancels it cooperatively.
pub async fn run_mapping(config: RunnerConfig) -> RunnerResult<ExecutionContext> {
    let events = EventBus::default();
    let pools = PoolManager::new(events.clone());
    let registry = AdapterRegistry::new();

    for system in &config.systems {
        registry.register(Arc::new(PostgresAdapter::new(
            system.id.clone(),
            system.connection.clone(),
            config.pool.clone(),
            pools.clone(),
            events.clone(),
        )));
    }

    let mut engine = MappingEngine::new(registry.clone(), events.clone())
        .with_stream_config(config.stream.clone())
        .with_validation_config(&config.validation);
    if let Some(store) = &config.store {
        let store = PostgresContextStore::connect(store).await?;
        engine = engine.with_store(Arc::new(store));
    }
    let engine = Arc::new(engine);

    let mapping = Mapping::from_definition(&config.mapping)?;
    let event_logger = spawn_event_logger(&events);
    let signal_handler = spawn_cancel_on_ctrl_c(engine.clone());

    info!(mapping_id = %mapping.id, "executing mapping");
    let result = engine.execute(&mapping, config.execution.clone()).await;

    signal_handler.abort();
    event_logger.abort();
    registry.cleanup_all().await;
    pools.shutdown().await;

    Ok(result?)
}

fn spawn_event_logger(events: &EventBus) -> JoinHandle<()> {
    let mut receiver = events.subscribe();

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(Event::ExecutionProgress {
                    current, percent, ..
                }) => info!(current, percent, "mapping progress"),
                Ok(Event::ExecutionError { kind, error, .. }) => {
                    warn!(?kind, %error, "record rejected")
                }
                Ok(event) => debug!(event = event.name(), "event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "event logger lagged")
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn spawn_cancel_on_ctrl_c(engine: Arc<MappingEngine>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }

        info!("interrupt received, cancelling active runs");
        for id in engine.active_runs() {
            if let Err(err) = engine.cancel(id, "interrupted") {
                warn!(%err, context_id = %id, "could not cancel run");
            }
        }
    })
}
