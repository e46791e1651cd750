//! Coordination primitives shared by the pool maintenance task and execution runs.

pub mod cancel;
pub mod shutdown;
