//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use std::sync::Arc;

use querycraft::query::capabilities::{
    BackendProfile, EntityStats, FieldStats, InMemoryCapabilities,
};
use querycraft::query::schema::{EntitySchema, FieldDef, FieldType, InMemorySchema};
use querycraft::query::builder::BuilderError;
use querycraft::{CompilerConfig, PipelineError, QueryCompiler};
use tracing_subscriber::EnvFilter;

/// Document-store backend id: native filters, joins, aggregates, sorts.
pub const DOCS: &str = "docs";
/// Key-value backend id: equality lookups only, sorts need an index.
pub const KV: &str = "kv";
/// Backend that only scans.
pub const SCAN_ONLY: &str = "scan";

/// Routes `tracing` output to the test harness when `RUST_LOG` is set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn users() -> EntitySchema {
    EntitySchema::new("users")
        .with_field(FieldDef::new("id", FieldType::Integer).indexed().required())
        .with_field(FieldDef::new("status", FieldType::String).indexed())
        .with_field(FieldDef::new("age", FieldType::Integer).aggregable())
        .with_field(FieldDef::new("score", FieldType::Float).aggregable())
        .with_field(FieldDef::new("name", FieldType::String))
        .with_field(FieldDef::new("email", FieldType::String).indexed())
        .with_field(FieldDef::new("created_at", FieldType::Timestamp).indexed())
        .with_field(FieldDef::new("address.city", FieldType::String))
        .with_field(FieldDef::new("address.zip", FieldType::String))
        .with_field(FieldDef::new("tags", FieldType::list(FieldType::String)))
}

pub fn orders() -> EntitySchema {
    EntitySchema::new("orders")
        .with_field(FieldDef::new("id", FieldType::Integer).indexed().required())
        .with_field(FieldDef::new("user_id", FieldType::Integer).indexed())
        .with_field(FieldDef::new("total", FieldType::Float).aggregable())
        .with_field(FieldDef::new("status", FieldType::String))
        .with_field(FieldDef::new("placed_at", FieldType::Timestamp).indexed())
}

pub fn schema() -> InMemorySchema {
    InMemorySchema::new().with_entity(users()).with_entity(orders())
}

pub fn docs_profile() -> BackendProfile {
    BackendProfile::full()
        .with_index("users", "id")
        .with_index("users", "status")
        .with_index("users", "email")
        .with_index("users", "created_at")
        .with_index("orders", "id")
        .with_index("orders", "user_id")
        .with_stats(
            "users",
            EntityStats::with_rows(10_000).with_field(
                "status",
                FieldStats {
                    distinct_count: 10,
                    null_count: 0,
                },
            ),
        )
        .with_stats("orders", EntityStats::with_rows(50_000))
}

pub fn kv_profile() -> BackendProfile {
    BackendProfile::key_value()
        .with_index("users", "id")
        .with_index("users", "email")
        .with_index("orders", "user_id")
        .forbid_full_scan("orders")
}

pub fn capabilities() -> InMemoryCapabilities {
    InMemoryCapabilities::new()
        .with_backend(DOCS, docs_profile())
        .with_backend(KV, kv_profile())
        .with_backend(SCAN_ONLY, BackendProfile::new())
}

pub fn compiler_with(config: CompilerConfig) -> QueryCompiler {
    init_tracing();
    QueryCompiler::new(config, Arc::new(schema()), Arc::new(capabilities()))
}

pub fn compiler() -> QueryCompiler {
    compiler_with(CompilerConfig::default())
}

/// Unwraps the compilation failure carried by a builder error.
pub fn pipeline_err(err: BuilderError) -> PipelineError {
    match err {
        BuilderError::Pipeline(err) => err,
        other => panic!("expected a pipeline error, got builder misuse: {other}"),
    }
}
