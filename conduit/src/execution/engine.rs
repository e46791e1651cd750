use std::collections::HashMap;
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use conduit_config::shared::{ErrorPolicy, ExecutionConfig, StreamConfig, ValidationConfig};
use futures::future;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use indexmap::IndexMap;
use metrics::{counter, histogram};
use serde::Serialize;
use serde_json::{Value as Json, json};
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::adapter::{Adapter, AdapterRegistry, Operation, ReadOptions, WriteResult, count_rows, read_paged};
use crate::concurrency::cancel::{CancelRx, CancelTx, create_cancel_channel};
use crate::error::{ConduitError, ConduitResult, ErrorKind};
use crate::events::{Event, EventBus};
use crate::execution::context::{
    ChildOptions, ExecutionContext, ExecutionIssue, ExecutionMetrics, ExecutionStatus,
    ExecutionSummary, StageProfile,
};
use crate::execution::mapping::Mapping;
use crate::execution::profiler::Profiler;
use crate::execution::retry::{RetryDirective, RetryPolicy};
use crate::execution::strategy::{ExecutionStrategy, ReadMode, ResourceSnapshot};
#[cfg(feature = "failpoints")]
use crate::failpoints::{BEFORE_BATCH_WRITE, conduit_fail_point};
use crate::metrics::{
    CONDUIT_BATCHES_WRITTEN_TOTAL, CONDUIT_EXECUTION_DURATION_SECONDS,
    CONDUIT_RECORDS_FAILED_TOTAL, CONDUIT_RECORDS_PROCESSED_TOTAL, MAPPING_ID_LABEL,
};
use crate::store::ContextStore;
use crate::stream::{
    AdaptiveBatchSizer, BatchStream, ParallelStream, Pipeline, StageError, StageObserver,
    StreamStats, TransformStream, bounded,
};
use crate::types::{Record, Schema, SchemaRef, record_to_json};
use crate::validation::{ValidationCache, ValidationContext, ValidationResult, Validator};
use crate::{bail, conduit_error};

const PRE_CONDITION_STAGE: &str = "precondition";
const VALIDATE_INPUT_STAGE: &str = "validate_input";
const TRANSFORM_STAGE: &str = "transform";
const POST_CONDITION_STAGE: &str = "postcondition";
const VALIDATE_OUTPUT_STAGE: &str = "validate_output";
const READ_STAGE: &str = "read";
const WRITE_STAGE: &str = "write";

type SharedContext = Arc<Mutex<ExecutionContext>>;
type SharedSizer = Arc<Mutex<AdaptiveBatchSizer>>;

fn lock(context: &Mutex<ExecutionContext>) -> MutexGuard<'_, ExecutionContext> {
    context
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock_sizer(sizer: &Mutex<AdaptiveBatchSizer>) -> MutexGuard<'_, AdaptiveBatchSizer> {
    sizer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn issue_message(err: &ConduitError) -> String {
    match err.detail() {
        Some(detail) => format!("{}: {detail}", err.description()),
        None => err.description().to_string(),
    }
}

/// Read-only view of a run returned by [`MappingEngine::observe`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSnapshot {
    pub summary: ExecutionSummary,
    pub metrics: ExecutionMetrics,
    pub profiling: Option<IndexMap<String, StageProfile>>,
}

impl From<&ExecutionContext> for ExecutionSnapshot {
    fn from(context: &ExecutionContext) -> Self {
        Self {
            summary: context.summary(),
            metrics: context.metrics.clone(),
            profiling: context.profiling.clone(),
        }
    }
}

#[derive(Debug)]
struct RunHandle {
    cancel: CancelTx,
    context: SharedContext,
}

/// How the driver loop of a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunEnd {
    Drained,
    Cancelled,
}

/// What the record pipeline made of one source record.
enum RecordOutcome {
    Mapped(Record),
    /// Dropped by the pre-condition.
    Filtered,
    Rejected {
        stage: String,
        error: ConduitError,
        record: Json,
    },
}

/// State shared by the tasks of one run.
#[derive(Clone)]
struct Run {
    id: Uuid,
    mapping: Arc<Mapping>,
    config: ExecutionConfig,
    context: SharedContext,
    cancel: CancelRx,
    events: EventBus,
    profiler: Arc<Profiler>,
}

impl Run {
    fn record_failure(&self, stage: &str, error: &ConduitError, record: Json) {
        let message = issue_message(error);
        debug!(stage, %error, "skipping failed record");

        lock(&self.context).record_failure(
            ExecutionIssue::new(error.kind(), message.clone())
                .with_stage(stage)
                .with_record(record.clone()),
        );
        if self.config.collect_metrics {
            counter!(CONDUIT_RECORDS_FAILED_TOTAL, MAPPING_ID_LABEL => self.mapping.id.clone())
                .increment(1);
        }
        self.events.publish(Event::ExecutionError {
            context_id: self.id,
            record: Some(record),
            kind: error.kind(),
            error: message,
        });
    }

    /// Decides what happens to a processed record: mapped records go on to the writer, failures
    /// are either recorded or end the run.
    fn route(&self, outcome: ConduitResult<RecordOutcome>) -> Option<ConduitResult<Record>> {
        match outcome {
            Ok(RecordOutcome::Mapped(record)) => Some(Ok(record)),
            Ok(RecordOutcome::Filtered) => {
                lock(&self.context).state.records_filtered += 1;
                None
            }
            Ok(RecordOutcome::Rejected {
                stage,
                error,
                record,
            }) => {
                let fatal = if error.kind() == ErrorKind::ValidationFailed {
                    self.config.strict_mode
                } else {
                    self.config.error_policy != ErrorPolicy::Skip
                };
                if fatal {
                    return Some(Err(error));
                }

                self.record_failure(&stage, &error, record);
                None
            }
            Err(err) => Some(Err(err)),
        }
    }

    fn complete_batch(&self, written: u64, total: Option<u64>) {
        let (current, percent) = {
            let mut context = lock(&self.context);
            let percent = context.add_processed(written, total);
            context.metrics.batches_written += 1;
            (context.state.records_processed, percent)
        };

        if self.config.collect_metrics {
            counter!(CONDUIT_RECORDS_PROCESSED_TOTAL, MAPPING_ID_LABEL => self.mapping.id.clone())
                .increment(written);
            counter!(CONDUIT_BATCHES_WRITTEN_TOTAL, MAPPING_ID_LABEL => self.mapping.id.clone())
                .increment(1);
            if let Some(resident) = self.profiler.sample() {
                lock(&self.context).observe_memory(resident);
            }
        }

        debug!(current, ?total, percent, "batch written");
        self.events.publish(Event::ExecutionProgress {
            context_id: self.id,
            current,
            total,
            percent,
        });
    }

    fn on_retry(&self, attempt: u32, error: &ConduitError) {
        let mut context = lock(&self.context);
        context.state.retry_count += 1;
        let payload = json!({ "retry": attempt, "error": issue_message(error) });
        match context.transition(ExecutionStatus::Running, Some(payload)) {
            Ok(event) => self.events.publish(event),
            Err(err) => warn!(%err, "could not record retry"),
        }
    }
}

/// Validates records against a list of validators through the shared cache.
#[derive(Clone)]
struct RecordChecker {
    cache: ValidationCache,
    use_cache: bool,
    validation: ValidationContext,
    context: SharedContext,
}

impl RecordChecker {
    fn check(
        &self,
        stage: &str,
        validators: &[Arc<dyn Validator>],
        record: Record,
    ) -> ConduitResult<Option<Record>> {
        let data = record_to_json(&record);
        let mut result = ValidationResult::valid();
        for validator in validators {
            result.merge(
                self.cache
                    .validate(validator.as_ref(), &data, &self.validation, self.use_cache),
            );
        }

        if !result.warnings.is_empty() {
            let mut context = lock(&self.context);
            for warning in &result.warnings {
                let message = if warning.field.is_empty() {
                    warning.message.clone()
                } else {
                    format!("{}: {}", warning.field, warning.message)
                };
                context.record_warning(
                    ExecutionIssue::new(ErrorKind::ValidationFailed, message)
                        .with_stage(stage)
                        .with_record(data.clone()),
                );
            }
        }

        if !result.valid {
            bail!(
                ErrorKind::ValidationFailed,
                "Record failed validation",
                result.error_summary()
            );
        }

        Ok(Some(record))
    }
}

/// Runs mappings end to end: reads the source, drives records through the pipeline stages and
/// writes batches to the target.
#[derive(Debug)]
pub struct MappingEngine {
    registry: AdapterRegistry,
    events: EventBus,
    stream: StreamConfig,
    validation_cache: ValidationCache,
    use_validation_cache: bool,
    store: Option<Arc<dyn ContextStore>>,
    resources: Option<ResourceSnapshot>,
    runs: Mutex<HashMap<Uuid, RunHandle>>,
}

impl MappingEngine {
    /// Creates a new engine resolving systems through `registry`.
    ///
    /// Host resources are sampled once here and drive the choice of execution strategy.
    pub fn new(registry: AdapterRegistry, events: EventBus) -> Self {
        let validation = ValidationConfig::default();

        Self {
            registry,
            events,
            stream: StreamConfig::default(),
            validation_cache: ValidationCache::from_config(&validation),
            use_validation_cache: validation.use_cache,
            store: None,
            resources: None,
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Uses `config` for buffers, concurrency and adaptive batching.
    pub fn with_stream_config(mut self, config: StreamConfig) -> Self {
        self.stream = config;
        self
    }

    /// Sizes the shared validation cache from `config`.
    pub fn with_validation_config(mut self, config: &ValidationConfig) -> Self {
        self.validation_cache = ValidationCache::from_config(config);
        self.use_validation_cache = config.use_cache;
        self
    }

    /// Persists every finished run and lets [`MappingEngine::observe`] find it afterwards.
    pub fn with_store(mut self, store: Arc<dyn ContextStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Plans runs for fixed resources instead of sampling the host.
    pub fn with_resources(mut self, resources: ResourceSnapshot) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    pub fn validation_cache(&self) -> &ValidationCache {
        &self.validation_cache
    }

    fn lock_runs(&self) -> MutexGuard<'_, HashMap<Uuid, RunHandle>> {
        self.runs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ids of the runs in progress.
    pub fn active_runs(&self) -> Vec<Uuid> {
        self.lock_runs().keys().copied().collect()
    }

    /// Runs `mapping` to a terminal state.
    ///
    /// Invalid configuration fails before a context is created. Every other outcome, failures
    /// included, is reported through the returned context; use
    /// [`ExecutionContext::into_result`] to turn it into an error.
    pub async fn execute(
        &self,
        mapping: &Mapping,
        config: ExecutionConfig,
    ) -> ConduitResult<ExecutionContext> {
        config.validate()?;
        self.stream.validate()?;
        mapping.validate()?;

        let context = ExecutionContext::new(mapping.id.clone(), config);

        Ok(self.run(mapping, context).await)
    }

    /// Requests cooperative cancellation of a run in progress.
    ///
    /// The run stops before its next batch write or page read. Writes already submitted are not
    /// recalled.
    pub fn cancel(&self, context_id: Uuid, reason: impl Into<String>) -> ConduitResult<()> {
        let runs = self.lock_runs();
        let Some(handle) = runs.get(&context_id) else {
            bail!(
                ErrorKind::NotFound,
                "No run in progress with this id",
                context_id.to_string()
            );
        };

        let reason = reason.into();
        info!(%context_id, %reason, "cancelling mapping run");
        lock(&handle.context).state.cancel_reason = Some(reason.clone());
        handle.cancel.cancel(reason);

        Ok(())
    }

    /// Creates a new pending child context of `parent`.
    pub fn create_child(&self, parent: &ExecutionContext, options: ChildOptions) -> ExecutionContext {
        parent.child(options)
    }

    /// Runs `mapping` as a child of `parent` and merges its outcome back into `parent`.
    pub async fn execute_child(
        &self,
        parent: &mut ExecutionContext,
        mapping: &Mapping,
        options: ChildOptions,
    ) -> ConduitResult<ExecutionContext> {
        let mut child = self.create_child(parent, options);
        child.config.validate()?;
        mapping.validate()?;
        child
            .metadata
            .insert("mappingId".to_string(), Json::String(mapping.id.clone()));

        let child = self.run(mapping, child).await;
        parent.merge_child(&child);

        Ok(child)
    }

    /// Looks a run up among the runs in progress, then in the context store.
    pub async fn observe(&self, context_id: Uuid) -> ConduitResult<ExecutionSnapshot> {
        let live = self
            .lock_runs()
            .get(&context_id)
            .map(|handle| lock(&handle.context).clone());
        if let Some(context) = live {
            return Ok(ExecutionSnapshot::from(&context));
        }

        if let Some(store) = &self.store {
            if let Some(context) = store.load(context_id).await? {
                return Ok(ExecutionSnapshot::from(&context));
            }
        }

        bail!(
            ErrorKind::NotFound,
            "Unknown execution context",
            context_id.to_string()
        )
    }

    async fn run(&self, mapping: &Mapping, mut context: ExecutionContext) -> ExecutionContext {
        let id = context.id;
        let span = info_span!("mapping_run", context_id = %id, mapping_id = %mapping.id);

        async move {
            let config = context.config.clone();
            let (cancel_tx, cancel_rx) = create_cancel_channel();

            self.events.publish(Event::ExecutionStarted {
                context_id: id,
                mapping_id: mapping.id.clone(),
            });
            match context.transition(ExecutionStatus::Running, None) {
                Ok(event) => self.events.publish(event),
                Err(err) => warn!(%err, "could not start the run"),
            }

            let shared = Arc::new(Mutex::new(context));
            self.lock_runs().insert(
                id,
                RunHandle {
                    cancel: cancel_tx,
                    context: shared.clone(),
                },
            );

            let run = Run {
                id,
                mapping: Arc::new(mapping.clone()),
                profiler: Arc::new(Profiler::new(config.enable_profiling)),
                config,
                context: shared,
                cancel: cancel_rx,
                events: self.events.clone(),
            };

            info!("starting mapping run");

            let outcome = match tokio::time::timeout(run.config.timeout(), self.drive(&run)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(conduit_error!(
                    ErrorKind::Timeout,
                    "Mapping run timed out",
                    format!("exceeded {} ms", run.config.timeout_ms)
                )),
            };

            self.lock_runs().remove(&id);
            let mut context = lock(&run.context).clone();
            self.finish(&run, &mut context, outcome);

            if let Some(store) = &self.store {
                if let Err(err) = store.save(&context).await {
                    warn!(%err, "failed to persist the execution context");
                }
            }

            context
        }
        .instrument(span)
        .await
    }

    fn finish(&self, run: &Run, context: &mut ExecutionContext, outcome: ConduitResult<RunEnd>) {
        if let Some(profiling) = context.profiling.as_mut() {
            for (stage, profile) in run.profiler.stages() {
                profiling.entry(stage).or_default().merge(&profile);
            }
        }
        if run.config.collect_metrics {
            context.observe_memory(run.profiler.peak_memory());
        }

        let next = match outcome {
            Ok(RunEnd::Drained) => ExecutionStatus::Completed,
            Ok(RunEnd::Cancelled) => ExecutionStatus::Cancelled,
            Err(err) if err.kind() == ErrorKind::Cancelled => ExecutionStatus::Cancelled,
            Err(err) => {
                warn!(%err, "mapping run failed");
                let message = issue_message(&err);
                context.record_error(ExecutionIssue::new(err.kind(), message.clone()));
                self.events.publish(Event::ExecutionError {
                    context_id: run.id,
                    record: None,
                    kind: err.kind(),
                    error: message,
                });
                ExecutionStatus::Failed
            }
        };

        if next == ExecutionStatus::Cancelled && context.state.cancel_reason.is_none() {
            context.state.cancel_reason = run.cancel.reason();
        }

        match context.transition(next, None) {
            Ok(event) => self.events.publish(event),
            Err(err) => warn!(%err, "could not finish the run"),
        }

        match next {
            ExecutionStatus::Completed => self.events.publish(Event::ExecutionCompleted {
                context_id: run.id,
                metrics: context.metrics.clone(),
            }),
            ExecutionStatus::Cancelled => self.events.publish(Event::ExecutionCancelled {
                context_id: run.id,
                reason: context.state.cancel_reason.clone(),
            }),
            _ => {}
        }

        if run.config.collect_metrics {
            histogram!(CONDUIT_EXECUTION_DURATION_SECONDS, MAPPING_ID_LABEL => run.mapping.id.clone())
                .record(context.metrics.total_time_ms as f64 / 1_000.0);
        }

        info!(
            status = next.as_str(),
            processed = context.state.records_processed,
            failed = context.state.records_failed,
            filtered = context.state.records_filtered,
            retries = context.state.retry_count,
            "mapping run finished"
        );
    }

    async fn drive(&self, run: &Run) -> ConduitResult<RunEnd> {
        let mapping = &run.mapping;

        let source = self
            .resolve(&mapping.source, ErrorKind::SourceUnavailable)
            .await?;
        source.require_operation(Operation::Read)?;
        let target = self
            .resolve(&mapping.target, ErrorKind::TargetUnavailable)
            .await?;
        target.require_write_mode(mapping.write.mode)?;

        let source_schema = source
            .get_schema(&mapping.source.namespace, &mapping.source.name, false)
            .await?;
        let target_schema = target
            .get_schema(&mapping.target.namespace, &mapping.target.name, false)
            .await?;

        let total = estimate(source.as_ref(), &source_schema, &mapping.read).await;
        let resources = match self.resources {
            Some(resources) => resources,
            None => ResourceSnapshot::sample().await,
        };
        let strategy = ExecutionStrategy::select(
            total,
            mapping.function_transforms(),
            &resources,
            &self.stream,
        );
        info!(
            ?total,
            read_mode = ?strategy.read_mode,
            page_size = strategy.page_size,
            concurrency = strategy.concurrency,
            "selected execution strategy"
        );
        lock(&run.context)
            .data
            .insert("strategy".to_string(), serde_json::to_value(strategy)?);

        let sizer = Arc::new(Mutex::new(AdaptiveBatchSizer::new(&StreamConfig {
            chunk_size: strategy.page_size,
            enable_adaptive_buffering: self.stream.enable_adaptive_buffering
                && strategy.read_mode != ReadMode::Sequential,
            ..self.stream.clone()
        })));

        let records = self.read_records(run, source, source_schema, strategy.read_mode, sizer.clone());
        let outcomes = self.process_records(run, records, &strategy);
        let router = run.clone();
        let routed = outcomes.filter_map(move |outcome| future::ready(router.route(outcome)));

        self.write_records(run, target.as_ref(), &target_schema, total, routed, &sizer)
            .await
    }

    async fn resolve(&self, reference: &SchemaRef, kind: ErrorKind) -> ConduitResult<Arc<dyn Adapter>> {
        let adapter = self
            .registry
            .get(&reference.system_id)
            .map_err(|err| err.with_kind(kind))?;

        if !adapter.is_connected() {
            adapter.connect().await.map_err(|err| {
                conduit_error!(
                    kind,
                    "Could not connect to the system",
                    reference.system_id.as_str(),
                    source: err
                )
            })?;
        }

        Ok(adapter)
    }

    /// Source records as a stream, read ahead into a bounded buffer when streaming.
    fn read_records(
        &self,
        run: &Run,
        source: Arc<dyn Adapter>,
        schema: Schema,
        read_mode: ReadMode,
        sizer: SharedSizer,
    ) -> BoxStream<'static, ConduitResult<Record>> {
        let page_size = lock_sizer(&sizer).page_size();
        let pages = read_paged(source, schema, run.mapping.read.clone(), page_size);

        // Pages are timed one by one so that the sizer sees the read throughput only.
        let state = (pages, sizer.clone(), run.profiler.clone(), run.cancel.clone());
        let pages = stream::unfold(state, |(mut pages, sizer, profiler, cancel)| async move {
            if cancel.is_cancelled() {
                return None;
            }

            let memory_before = profiler.sample_memory();
            let started = Instant::now();
            let page = pages.next().await?;
            let elapsed = started.elapsed();
            let memory_delta = memory_before
                .zip(profiler.sample_memory())
                .map(|(before, after)| after as i64 - before as i64);
            profiler.observe(READ_STAGE, elapsed, memory_delta);
            if let Ok(rows) = &page {
                lock_sizer(&sizer).record_page(rows.len(), elapsed);
            }

            Some((page, (pages, sizer, profiler, cancel)))
        });

        let records = pages
            .map_ok(|rows| stream::iter(rows.into_iter().map(Ok::<Record, ConduitError>)))
            .try_flatten()
            .boxed();

        if read_mode != ReadMode::Streaming {
            return records;
        }

        let (tx, rx) = bounded::<ConduitResult<Record>>(
            format!("{}:read", run.mapping.id),
            &self.stream,
            self.events.clone(),
        );
        let producer = async move {
            let mut records = records;
            while let Some(record) = records.next().await {
                let failed = record.is_err();
                let backpressure_before = tx.stats().snapshot().backpressure_events;
                if tx.send(record).await.is_err() {
                    debug!("record consumer went away, stopping the reader");
                    break;
                }
                if tx.stats().snapshot().backpressure_events > backpressure_before {
                    lock_sizer(&sizer).on_backpressure();
                }
                if failed {
                    break;
                }
            }
        };
        tokio::spawn(producer.in_current_span());

        rx.boxed()
    }

    fn build_pipeline(&self, run: &Run) -> Pipeline<Record> {
        let mapping = run.mapping.clone();
        let checker = RecordChecker {
            cache: self.validation_cache.clone(),
            use_cache: self.use_validation_cache,
            validation: ValidationContext {
                path: String::new(),
                strict: run.config.strict_mode,
                mapping_id: Some(mapping.id.clone()),
            },
            context: run.context.clone(),
        };

        let mut pipeline = Pipeline::new(mapping.id.clone()).with_observer(run.profiler.clone());

        if let Some(condition) = mapping.pre_condition.clone() {
            pipeline = pipeline.stage(PRE_CONDITION_STAGE, move |record: Record| {
                let keep = condition.matches(&record_to_json(&record));
                future::ready(Ok(keep.then_some(record)))
            });
        }

        if run.config.validate_input && !mapping.input_validators.is_empty() {
            let validators = mapping.input_validators.clone();
            let checker = checker.clone();
            pipeline = pipeline.stage(VALIDATE_INPUT_STAGE, move |record: Record| {
                future::ready(checker.check(VALIDATE_INPUT_STAGE, &validators, record))
            });
        }

        let retry = if run.config.error_policy == ErrorPolicy::Retry {
            RetryPolicy::from_config(&run.config)
        } else {
            RetryPolicy::none()
        };
        let transform_mapping = mapping.clone();
        let context = run.context.clone();
        pipeline = pipeline.stage(TRANSFORM_STAGE, move |record: Record| {
            let mapping = transform_mapping.clone();
            let context = context.clone();
            async move {
                retry
                    .run(
                        || future::ready(mapping.apply(&record)),
                        |_, _| lock(&context).state.retry_count += 1,
                    )
                    .await
                    .map(Some)
            }
        });

        if let Some(condition) = mapping.post_condition.clone() {
            pipeline = pipeline.stage(POST_CONDITION_STAGE, move |record: Record| {
                let result = if condition.matches(&record_to_json(&record)) {
                    Ok(Some(record))
                } else {
                    Err(conduit_error!(
                        ErrorKind::ValidationFailed,
                        "Record does not satisfy the post-condition"
                    ))
                };
                future::ready(result)
            });
        }

        if run.config.validate_output && !mapping.output_validators.is_empty() {
            let validators = mapping.output_validators.clone();
            pipeline = pipeline.stage(VALIDATE_OUTPUT_STAGE, move |record: Record| {
                future::ready(checker.check(VALIDATE_OUTPUT_STAGE, &validators, record))
            });
        }

        pipeline
    }

    fn process_records(
        &self,
        run: &Run,
        records: BoxStream<'static, ConduitResult<Record>>,
        strategy: &ExecutionStrategy,
    ) -> BoxStream<'static, ConduitResult<RecordOutcome>> {
        let pipeline = Arc::new(self.build_pipeline(run));
        debug!(stages = ?pipeline.stage_names().collect::<Vec<_>>(), "built record pipeline");

        let process = move |item: ConduitResult<Record>| {
            let pipeline = pipeline.clone();
            async move {
                let record = item?;
                let original = record.clone();
                let outcome = match pipeline.process(record).await {
                    Ok(Some(mapped)) => RecordOutcome::Mapped(mapped),
                    Ok(None) => RecordOutcome::Filtered,
                    Err(StageError { stage, error }) => RecordOutcome::Rejected {
                        stage,
                        error,
                        record: record_to_json(&original),
                    },
                };
                Ok::<_, ConduitError>(Some(outcome))
            }
        };

        let stats = StreamStats::new();
        if strategy.is_parallel() {
            ParallelStream::new(records, strategy.concurrency, stats, process).boxed()
        } else {
            TransformStream::new(records, stats, process).boxed()
        }
    }

    async fn write_records<S>(
        &self,
        run: &Run,
        target: &dyn Adapter,
        schema: &Schema,
        total: Option<u64>,
        records: S,
        sizer: &SharedSizer,
    ) -> ConduitResult<RunEnd>
    where
        S: futures::Stream<Item = ConduitResult<Record>>,
    {
        let mut batches = pin!(BatchStream::new(
            records,
            run.mapping.write.effective_batch_size(),
            self.stream.flush_timeout(),
        ));

        while let Some(batch) = batches.next().await {
            let rows = batch.into_iter().collect::<ConduitResult<Vec<Record>>>()?;

            if run.cancel.is_cancelled() {
                info!("cancellation observed, no further batches are written");
                return Ok(RunEnd::Cancelled);
            }

            self.write_batch(run, target, schema, rows, total, sizer).await?;
        }

        if run.cancel.is_cancelled() {
            return Ok(RunEnd::Cancelled);
        }

        Ok(RunEnd::Drained)
    }

    async fn write_batch(
        &self,
        run: &Run,
        target: &dyn Adapter,
        schema: &Schema,
        rows: Vec<Record>,
        total: Option<u64>,
        sizer: &SharedSizer,
    ) -> ConduitResult<()> {
        let policy = RetryPolicy::from_config(&run.config);
        let memory_before = run.profiler.sample_memory();
        let started = Instant::now();

        match write_with_retry(run, &policy, target, schema, &rows).await {
            Ok(_) => run.complete_batch(rows.len() as u64, total),
            Err(err) => {
                lock_sizer(sizer).on_error();
                if run.config.error_policy != ErrorPolicy::Skip {
                    return Err(err);
                }

                if RetryDirective::for_error(&err) == RetryDirective::Retry {
                    warn!(%err, rows = rows.len(), "batch write failed after retries, skipping its rows");
                    for row in &rows {
                        run.record_failure(WRITE_STAGE, &err, record_to_json(row));
                    }
                } else {
                    // We isolate the offending rows by writing the batch one row at a time.
                    warn!(%err, rows = rows.len(), "batch write failed, writing its rows one at a time");
                    let mut written = 0;
                    for row in rows {
                        match write_with_retry(run, &policy, target, schema, std::slice::from_ref(&row)).await {
                            Ok(_) => written += 1,
                            Err(err) => run.record_failure(WRITE_STAGE, &err, record_to_json(&row)),
                        }
                    }
                    if written > 0 {
                        run.complete_batch(written, total);
                    }
                }
            }
        }

        let memory_delta = memory_before
            .zip(run.profiler.sample_memory())
            .map(|(before, after)| after as i64 - before as i64);
        run.profiler.observe(WRITE_STAGE, started.elapsed(), memory_delta);

        Ok(())
    }
}

/// Estimated number of records a read returns, `None` when the source cannot count.
async fn estimate(adapter: &dyn Adapter, schema: &Schema, options: &ReadOptions) -> Option<u64> {
    match count_rows(adapter, schema, options).await {
        Ok(Some(count)) => {
            let count = count.saturating_sub(options.offset.unwrap_or(0));
            Some(options.limit.map_or(count, |limit| limit.min(count)))
        }
        Ok(None) => None,
        Err(err) => {
            debug!(%err, "could not estimate the source size");
            None
        }
    }
}

async fn write_with_retry(
    run: &Run,
    policy: &RetryPolicy,
    target: &dyn Adapter,
    schema: &Schema,
    rows: &[Record],
) -> ConduitResult<WriteResult> {
    let options = &run.mapping.write;

    policy
        .run(
            || async move {
                #[cfg(feature = "failpoints")]
                conduit_fail_point(BEFORE_BATCH_WRITE)?;

                target.write_data(schema, rows.to_vec(), options).await
            },
            |attempt, err| run.on_retry(attempt, err),
        )
        .await
}
