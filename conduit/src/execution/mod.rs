//! Mapping execution: run state, strategy selection, retries, profiling and the engine that
//! drives a mapping from its source to its target.

mod context;
mod engine;
mod mapping;
mod profiler;
pub mod retry;
mod strategy;

pub use context::{
    ChildOptions, ExecutionContext, ExecutionIssue, ExecutionMetrics, ExecutionState,
    ExecutionStatus, ExecutionSummary, StageProfile,
};
pub use engine::{ExecutionSnapshot, MappingEngine};
pub use mapping::{
    FieldMappingDefinition, FieldSource, Mapping, MappingDefinition, Transform, TransformFn,
};
pub use profiler::{MemorySampler, Profiler};
pub use retry::{RetryDirective, RetryPolicy, backoff_delay};
pub use strategy::{
    ABUNDANT_CORES, COMPLEXITY_THRESHOLD, ExecutionStrategy, ReadMode, ResourceSnapshot,
    SEQUENTIAL_THRESHOLD, STREAMING_THRESHOLD,
};
