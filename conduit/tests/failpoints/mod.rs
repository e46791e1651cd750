#![cfg(all(feature = "failpoints", feature = "test-utils"))]

mod engine_test;
mod pool_test;
