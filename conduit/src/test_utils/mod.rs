//! Helpers shared by unit and integration tests.

pub mod adapter;
pub mod fixtures;
