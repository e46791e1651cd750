//! Data types flowing through the pipeline: values, records and discovered schemas.

mod record;
mod schema;
mod value;

pub use record::*;
pub use schema::*;
pub use value::*;
