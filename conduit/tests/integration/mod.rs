#![cfg(feature = "test-utils")]

mod engine_test;
mod postgres_test;
