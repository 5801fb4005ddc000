//! Core schema model for the Alyx runtime.
//!
//! Everything in this crate is pure: schema documents, typed runtime
//! values, the change differ, and the query model. I/O lives in
//! `alyx-store`; policy evaluation in `alyx-rules`.

pub mod diff;
pub mod error;
pub mod hash;
pub mod query;
pub mod types;
pub mod value;

pub use diff::{ChangeSet, Safety, SchemaChange, SchemaDiff};
pub use error::SchemaError;
pub use types::Schema;
pub use value::{Document, Value};
