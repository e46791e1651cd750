//! Streaming primitives used to drive records through a mapping run.
//!
//! [`TransformStream`] keeps input order, [`ParallelStream`] bounds the number of items in flight
//! and yields in completion order, and [`BatchStream`] groups items by size or time. A bounded
//! buffer from [`bounded`] connects a producer task to a consuming stream with high and low water
//! marks. [`Pipeline`] chains named stages and instruments each of them.

mod adaptive;
mod batch;
mod buffer;
mod parallel;
mod pipeline;
mod stats;
mod transform;

pub use adaptive::AdaptiveBatchSizer;
pub use batch::BatchStream;
pub use buffer::{BufferRx, BufferTx, bounded};
pub use parallel::ParallelStream;
pub use pipeline::{DriveMode, Pipeline, StageError, StageFn, StageObserver};
pub use stats::{StreamMetrics, StreamStats};
pub use transform::TransformStream;
