//! Configuration types and loading for conduit services.
//!
//! Every component reads a dedicated, explicitly typed configuration struct from
//! [`shared`]. Binaries load their top level configuration through [`load_config`].

mod environment;
mod load;
pub mod shared;
mod strict;

pub use environment::Environment;
pub use load::{Config, LoadConfigError, load_config, load_config_from};
pub use strict::{StrictConfigError, parse_strict, parse_strict_map};
