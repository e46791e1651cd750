use std::time::Duration;

use chrono::{DateTime, Utc};
use conduit_config::shared::ExecutionConfig;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use uuid::Uuid;

use crate::error::{ConduitResult, ErrorKind};
use crate::events::Event;
use crate::{bail, conduit_error};

const MAPPING_ID_KEY: &str = "mappingId";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Initialized,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// `initialized -> running -> {completed, failed, cancelled}`, with `running -> running` on
    /// retries. A run may also fail or be cancelled before it started.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;

        matches!(
            (self, next),
            (Initialized, Running | Failed | Cancelled)
                | (Running, Running | Completed | Failed | Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Initialized => "initialized",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

/// An error or warning recorded during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionIssue {
    pub timestamp: DateTime<Utc>,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// The offending source record, when the issue concerns one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<Json>,
}

impl ExecutionIssue {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            message: message.into(),
            stage: None,
            record: None,
        }
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn with_record(mut self, record: Json) -> Self {
        self.record = Some(record);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    pub status: ExecutionStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    /// Percentage in `[0, 100]`.
    pub progress: f64,
    pub records_processed: u64,
    pub records_failed: u64,
    /// Source records dropped by the mapping's pre-condition.
    pub records_filtered: u64,
    pub retry_count: u64,
    pub errors: Vec<ExecutionIssue>,
    pub warnings: Vec<ExecutionIssue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
}

impl Default for ExecutionState {
    fn default() -> Self {
        Self {
            status: ExecutionStatus::Initialized,
            start_time: None,
            end_time: None,
            duration_ms: None,
            progress: 0.0,
            records_processed: 0,
            records_failed: 0,
            records_filtered: 0,
            retry_count: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
            cancel_reason: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetrics {
    pub records_processed: u64,
    pub records_failed: u64,
    pub batches_written: u64,
    pub total_time_ms: u64,
    pub average_record_time_ms: f64,
    pub peak_memory_bytes: u64,
    /// Records per second.
    pub throughput: f64,
}

impl ExecutionMetrics {
    fn recompute(&mut self) {
        let seconds = self.total_time_ms as f64 / 1_000.0;
        self.throughput = if seconds > 0.0 {
            self.records_processed as f64 / seconds
        } else {
            0.0
        };
        self.average_record_time_ms = if self.records_processed > 0 {
            self.total_time_ms as f64 / self.records_processed as f64
        } else {
            0.0
        };
    }
}

/// Aggregated timings of one pipeline stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageProfile {
    pub count: u64,
    pub total_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
    pub memory_delta_bytes: i64,
}

impl StageProfile {
    pub fn record(&mut self, elapsed: Duration, memory_delta: Option<i64>) {
        let ms = elapsed.as_secs_f64() * 1_000.0;
        self.min_ms = if self.count == 0 { ms } else { self.min_ms.min(ms) };
        self.max_ms = self.max_ms.max(ms);
        self.count += 1;
        self.total_ms += ms;
        self.avg_ms = self.total_ms / self.count as f64;
        self.memory_delta_bytes += memory_delta.unwrap_or_default();
    }

    /// Sums counts, totals and memory, keeps the extremes and recomputes the average.
    pub fn merge(&mut self, other: &StageProfile) {
        if other.count == 0 {
            return;
        }
        self.min_ms = if self.count == 0 {
            other.min_ms
        } else {
            self.min_ms.min(other.min_ms)
        };
        self.max_ms = self.max_ms.max(other.max_ms);
        self.count += other.count;
        self.total_ms += other.total_ms;
        self.avg_ms = self.total_ms / self.count as f64;
        self.memory_delta_bytes += other.memory_delta_bytes;
    }
}

/// What a child run changes relative to its parent.
#[derive(Debug, Clone, Default)]
pub struct ChildOptions {
    pub metadata: Map<String, Json>,
    pub config: Option<ExecutionConfig>,
    pub data: Map<String, Json>,
}

/// Runtime state of one mapping run.
///
/// Serializes to `{id, parentId, createdAt, updatedAt, metadata, config, state, metrics,
/// profiling, data}` with ISO-8601 timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: Map<String, Json>,
    pub config: ExecutionConfig,
    pub state: ExecutionState,
    pub metrics: ExecutionMetrics,
    pub profiling: Option<IndexMap<String, StageProfile>>,
    pub data: Map<String, Json>,
}

impl ExecutionContext {
    /// Creates a new pending context for a run of `mapping_id`.
    pub fn new(mapping_id: impl Into<String>, config: ExecutionConfig) -> Self {
        let now = Utc::now();
        let mut metadata = Map::new();
        metadata.insert(MAPPING_ID_KEY.to_string(), Json::String(mapping_id.into()));

        Self {
            id: Uuid::new_v4(),
            parent_id: None,
            created_at: now,
            updated_at: now,
            metadata,
            profiling: config.enable_profiling.then(IndexMap::new),
            config,
            state: ExecutionState::default(),
            metrics: ExecutionMetrics::default(),
            data: Map::new(),
        }
    }

    pub fn mapping_id(&self) -> &str {
        self.metadata
            .get(MAPPING_ID_KEY)
            .and_then(Json::as_str)
            .unwrap_or_default()
    }

    /// Returns the current status.
    pub fn status(&self) -> ExecutionStatus {
        self.state.status
    }

    pub fn is_terminal(&self) -> bool {
        self.state.status.is_terminal()
    }

    /// Moves to `next`, returning the state change event to publish.
    ///
    /// Terminal states are sticky: leaving one fails with [`ErrorKind::InvalidState`].
    pub fn transition(
        &mut self,
        next: ExecutionStatus,
        payload: Option<Json>,
    ) -> ConduitResult<Event> {
        let previous = self.state.status;
        if !previous.can_transition_to(next) {
            bail!(
                ErrorKind::InvalidState,
                "Invalid execution state transition",
                format!("{} -> {}", previous.as_str(), next.as_str())
            );
        }

        let now = Utc::now();
        if next == ExecutionStatus::Running && self.state.start_time.is_none() {
            self.state.start_time = Some(now);
        }
        if next.is_terminal() {
            self.state.end_time = Some(now);
            let duration = self
                .state
                .start_time
                .map(|start| (now - start).num_milliseconds().max(0) as u64)
                .unwrap_or_default();
            self.state.duration_ms = Some(duration);
            self.metrics.total_time_ms = duration;
            self.metrics.records_processed = self.state.records_processed;
            self.metrics.records_failed = self.state.records_failed;
            self.metrics.recompute();
            if next == ExecutionStatus::Completed {
                self.state.progress = 100.0;
            }
        }
        self.state.status = next;
        self.updated_at = now;

        Ok(Event::ExecutionStateChanged {
            context_id: self.id,
            previous,
            new: next,
            payload,
        })
    }

    /// Records an error of the run.
    pub fn record_error(&mut self, issue: ExecutionIssue) {
        self.state.errors.push(issue);
        self.updated_at = Utc::now();
    }

    /// Records a warning of the run.
    pub fn record_warning(&mut self, issue: ExecutionIssue) {
        self.state.warnings.push(issue);
        self.updated_at = Utc::now();
    }

    /// Records a failed source record.
    pub fn record_failure(&mut self, issue: ExecutionIssue) {
        self.state.records_failed += 1;
        self.record_error(issue);
    }

    /// Adds written records and recomputes progress against `total` when known.
    pub fn add_processed(&mut self, records: u64, total: Option<u64>) -> f64 {
        self.state.records_processed += records;
        if let Some(total) = total.filter(|total| *total > 0) {
            let done = self.state.records_processed + self.state.records_failed + self.state.records_filtered;
            self.state.progress = (done as f64 / total as f64 * 100.0).min(100.0);
        }
        self.updated_at = Utc::now();
        self.state.progress
    }

    pub fn record_stage(&mut self, stage: &str, elapsed: Duration, memory_delta: Option<i64>) {
        if let Some(profiling) = self.profiling.as_mut() {
            profiling
                .entry(stage.to_string())
                .or_default()
                .record(elapsed, memory_delta);
        }
    }

    /// Tracks the peak resident memory of the run.
    pub fn observe_memory(&mut self, resident_bytes: u64) {
        self.metrics.peak_memory_bytes = self.metrics.peak_memory_bytes.max(resident_bytes);
    }

    /// Creates a child run inheriting metadata, configuration and data.
    pub fn child(&self, options: ChildOptions) -> ExecutionContext {
        let now = Utc::now();
        let mut metadata = self.metadata.clone();
        metadata.extend(options.metadata);
        let mut data = self.data.clone();
        data.extend(options.data);
        let config = options.config.unwrap_or_else(|| self.config.clone());

        ExecutionContext {
            id: Uuid::new_v4(),
            parent_id: Some(self.id),
            created_at: now,
            updated_at: now,
            metadata,
            profiling: config.enable_profiling.then(IndexMap::new),
            config,
            state: ExecutionState::default(),
            metrics: ExecutionMetrics::default(),
            data,
        }
    }

    /// Folds a finished child run into this one.
    pub fn merge_child(&mut self, child: &ExecutionContext) {
        self.state.records_processed += child.state.records_processed;
        self.state.records_failed += child.state.records_failed;
        self.state.records_filtered += child.state.records_filtered;
        self.state.retry_count += child.state.retry_count;
        self.state.errors.extend(child.state.errors.iter().cloned());
        self.state.warnings.extend(child.state.warnings.iter().cloned());

        self.metrics.records_processed += child.metrics.records_processed;
        self.metrics.records_failed += child.metrics.records_failed;
        self.metrics.batches_written += child.metrics.batches_written;
        self.metrics.total_time_ms += child.metrics.total_time_ms;
        self.metrics.peak_memory_bytes = self
            .metrics
            .peak_memory_bytes
            .max(child.metrics.peak_memory_bytes);
        self.metrics.recompute();

        if let Some(child_profiling) = &child.profiling {
            let profiling = self.profiling.get_or_insert_with(IndexMap::new);
            for (stage, profile) in child_profiling {
                profiling.entry(stage.clone()).or_default().merge(profile);
            }
        }
        self.updated_at = Utc::now();
    }

    /// Returns the summary published to observers.
    pub fn summary(&self) -> ExecutionSummary {
        ExecutionSummary {
            id: self.id,
            parent_id: self.parent_id,
            mapping_id: self.mapping_id().to_string(),
            status: self.state.status,
            progress: self.state.progress,
            records_processed: self.state.records_processed,
            records_failed: self.state.records_failed,
            records_filtered: self.state.records_filtered,
            retry_count: self.state.retry_count,
            errors: self.state.errors.len(),
            warnings: self.state.warnings.len(),
            duration_ms: self.state.duration_ms,
        }
    }

    /// Serializes the context into its self-describing JSON form.
    pub fn to_json(&self) -> ConduitResult<Json> {
        Ok(serde_json::to_value(self)?)
    }

    /// Restores a context from its JSON form.
    pub fn from_json(json: Json) -> ConduitResult<Self> {
        serde_json::from_value(json).map_err(|err| {
            conduit_error!(
                ErrorKind::DeserializationError,
                "Invalid execution context",
                source: err
            )
        })
    }

    /// Turns a terminal context into the outcome of the run.
    pub fn into_result(self) -> ConduitResult<ExecutionContext> {
        match self.state.status {
            ExecutionStatus::Completed => Ok(self),
            ExecutionStatus::Failed => {
                let (kind, message) = self
                    .state
                    .errors
                    .last()
                    .map(|issue| (issue.kind, issue.message.clone()))
                    .unwrap_or((ErrorKind::Unknown, String::from("no error recorded")));
                Err(conduit_error!(kind, "Mapping run failed", message))
            }
            ExecutionStatus::Cancelled => Err(conduit_error!(
                ErrorKind::Cancelled,
                "Mapping run was cancelled",
                self.state.cancel_reason.unwrap_or_default()
            )),
            status => Err(conduit_error!(
                ErrorKind::InvalidState,
                "Mapping run has not finished",
                status.as_str()
            )),
        }
    }
}

/// Read-only overview of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub mapping_id: String,
    pub status: ExecutionStatus,
    pub progress: f64,
    pub records_processed: u64,
    pub records_failed: u64,
    pub records_filtered: u64,
    pub retry_count: u64,
    pub errors: usize,
    pub warnings: usize,
    pub duration_ms: Option<u64>,
}
