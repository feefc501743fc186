//! Query compiler pipeline.
//!
//! A client [`ast::Query`] is resolved against a schema registry, coerced,
//! normalized, validated, canonicalized, and lowered into logical and
//! physical plans for a pluggable storage backend. [`pipeline::QueryCompiler`]
//! drives the stages; the submodules expose each one on its own.

/// Client-facing query types.
///
/// Loosely typed literals, the nested filter tree, and the query envelope as
/// deserialized from JSON.
pub mod ast;

/// Fluent builder for client queries.
pub mod builder;

/// Plan cache keyed by fingerprint and catalog versions.
pub mod cache;

/// Canonical query model and its fingerprint.
pub mod canonical;

/// Backend capability descriptor interface and an in-memory implementation.
pub mod capabilities;

/// Shared, refreshable snapshots of the schema registry and capability descriptor.
pub mod catalog;

/// Literal to typed value coercion.
pub mod coerce;

/// Selectivity and cost heuristics.
pub mod cost;

/// Opaque pagination cursors.
pub mod cursor;

/// Stage error kinds and validation codes.
pub mod errors;

/// Explain tree serialization.
pub mod explain;

/// Logical plan representation and lowering.
pub mod logical;

/// Predicate normalization into negation-normal form.
pub mod normalize;

/// Operator legality matrix.
pub mod operators;

/// Physical plan representation.
pub mod physical;

/// Compilation orchestrator, lifecycle, and deadlines.
pub mod pipeline;

/// Capability-aware physical planner.
pub mod planner;

/// Normalized predicate tree.
pub mod predicate;

/// Field path resolution.
pub mod resolve;

/// Schema registry interface and an in-memory registry.
pub mod schema;

/// Whole-query resolution and validation.
pub mod validate;

/// Typed runtime values.
pub mod value;

pub use builder::QueryBuilder;
pub use pipeline::{CompiledQuery, Deadline, QueryCompiler, QueryState, StageGate};
pub use value::Value;
