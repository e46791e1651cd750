use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{Future, FutureExt, Stream, StreamExt};
use indexmap::IndexMap;
use metrics::histogram;
use tracing::debug;

use crate::error::{ConduitError, ConduitResult};
use crate::metrics::{CONDUIT_STAGE_DURATION_SECONDS, STAGE_LABEL};
use crate::stream::parallel::ParallelStream;
use crate::stream::stats::{StreamMetrics, StreamStats};
use crate::stream::transform::TransformStream;

pub type StageFn<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ConduitResult<Option<T>>> + Send + Sync>;

/// Receives the timing of every stage invocation.
pub trait StageObserver: Send + Sync {
    /// Memory sample taken around each invocation. `None` skips memory accounting.
    fn sample_memory(&self) -> Option<u64> {
        None
    }

    fn observe(&self, stage: &str, elapsed: Duration, memory_delta: Option<i64>);
}

/// A failure of one pipeline stage.
#[derive(Debug, Clone)]
pub struct StageError {
    pub stage: String,
    pub error: ConduitError,
}

impl From<StageError> for ConduitError {
    fn from(err: StageError) -> Self {
        err.error
    }
}

struct Stage<T> {
    name: String,
    f: StageFn<T>,
    stats: StreamStats,
}

/// How [`Pipeline::run`] drives items through the stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveMode {
    /// One item at a time, outputs in input order.
    Sequential,
    /// Up to `max_concurrency` items at once, outputs in completion order.
    Parallel { max_concurrency: usize },
}

/// An ordered sequence of named stages applied to every item.
///
/// Each stage maps an item to zero or one item. A stage returning `None` drops the item and
/// skips the remaining stages.
pub struct Pipeline<T> {
    name: String,
    stages: Vec<Stage<T>>,
    observer: Option<Arc<dyn StageObserver>>,
}

impl<T: Send + 'static> Pipeline<T> {
    /// Creates a new pipeline without stages.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            observer: None,
        }
    }

    /// Appends a stage named `name`.
    pub fn stage<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ConduitResult<Option<T>>> + Send + 'static,
    {
        self.stages.push(Stage {
            name: name.into(),
            f: Arc::new(move |item| f(item).boxed()),
            stats: StreamStats::new(),
        });
        self
    }

    /// Reports the timing of every stage invocation to `observer`.
    pub fn with_observer(mut self, observer: Arc<dyn StageObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stage_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.stages.iter().map(|stage| stage.name.as_str())
    }

    /// Runs `item` through every stage.
    pub async fn process(&self, mut item: T) -> Result<Option<T>, StageError> {
        for stage in &self.stages {
            let memory_before = self.observer.as_ref().and_then(|o| o.sample_memory());
            let started = Instant::now();
            let output = (stage.f)(item).await;
            let elapsed = started.elapsed();

            histogram!(CONDUIT_STAGE_DURATION_SECONDS, STAGE_LABEL => stage.name.clone())
                .record(elapsed.as_secs_f64());
            if let Some(observer) = &self.observer {
                let memory_delta = memory_before
                    .zip(observer.sample_memory())
                    .map(|(before, after)| after as i64 - before as i64);
                observer.observe(&stage.name, elapsed, memory_delta);
            }

            match output {
                Ok(Some(next)) => {
                    stage.stats.record_processed(elapsed);
                    item = next;
                }
                Ok(None) => {
                    stage.stats.record_processed(elapsed);
                    return Ok(None);
                }
                Err(error) => {
                    stage.stats.record_error();
                    debug!(pipeline = %self.name, stage = %stage.name, %error, "stage failed");
                    return Err(StageError {
                        stage: stage.name.clone(),
                        error,
                    });
                }
            }
        }

        Ok(Some(item))
    }

    /// Drives a stream of items through the pipeline.
    pub fn run<S>(self: Arc<Self>, input: S, mode: DriveMode, stats: StreamStats) -> BoxStream<'static, ConduitResult<T>>
    where
        S: Stream<Item = T> + Send + 'static,
    {
        debug!(pipeline = %self.name, ?mode, stages = self.stages.len(), "starting pipeline");

        let process = move |item: T| {
            let pipeline = self.clone();
            async move { pipeline.process(item).await.map_err(ConduitError::from) }
        };

        match mode {
            DriveMode::Sequential => TransformStream::new(input, stats, process).boxed(),
            DriveMode::Parallel { max_concurrency } => {
                ParallelStream::new(input, max_concurrency, stats, process).boxed()
            }
        }
    }

    /// Per stage metrics, in stage order.
    pub fn metrics(&self) -> IndexMap<String, StreamMetrics> {
        self.stages
            .iter()
            .map(|stage| (stage.name.clone(), stage.stats.snapshot()))
            .collect()
    }
}

impl<T> fmt::Debug for Pipeline<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field(
                "stages",
                &self.stages.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
