//! Storage-agnostic query compiler.
//!
//! Declarative client queries are resolved against a schema, normalized into
//! a typed canonical model, and lowered into logical and physical plans that
//! respect what each storage backend can execute natively.

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod query;

pub use config::{CompilerConfig, ConfigError, CostModel, Limits, SelectivityTable};
pub use error::{PipelineError, QueryError, Stage};
pub use query::{CompiledQuery, Deadline, QueryBuilder, QueryCompiler, QueryState};
