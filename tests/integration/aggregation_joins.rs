//! Aggregation and join compilation: validation rules, operator placement and
//! join strategy selection.

#![allow(missing_docs)]

mod support;

use std::sync::Arc;

use querycraft::query::ast::{AggregateFunction, Direction, JoinType, Query};
use querycraft::query::capabilities::{BackendProfile, EntityStats, InMemoryCapabilities};
use querycraft::query::errors::ValidationCode;
use querycraft::query::logical::{FilterStage, LogicalOp};
use querycraft::query::physical::{AccessMethod, PhysicalOp};
use querycraft::query::schema::FieldSource;
use querycraft::query::QueryBuilder;
use querycraft::{CompiledQuery, CompilerConfig, QueryCompiler, QueryError};

use support::{compiler, pipeline_err, DOCS, SCAN_ONLY};

fn shape(compiled: &CompiledQuery) -> Vec<&'static str> {
    compiled.physical.nodes().iter().map(|n| n.op.name()).collect()
}

fn validation_codes(err: &querycraft::PipelineError) -> Vec<ValidationCode> {
    match &err.error {
        QueryError::Validation(errors) => errors.iter().map(|e| e.code).collect(),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn grouped_aggregate_with_having_and_sort() {
    let compiled = QueryBuilder::new("users")
        .group_by(["status"])
        .count("n")
        .aggregate(AggregateFunction::Avg, "score", "avg_score")
        .having(|p| {
            p.gt("n", 10_i64);
        })
        .order_by("n", Direction::Desc)
        .compile(&compiler(), DOCS)
        .expect("compiles");

    let logical: Vec<&str> = compiled.logical.nodes().iter().map(|n| n.op.name()).collect();
    assert_eq!(logical, vec!["Sort", "Filter", "Aggregate", "Scan"]);
    assert!(matches!(
        compiled.logical.nodes()[1].op,
        LogicalOp::Filter {
            stage: FilterStage::Having,
            ..
        }
    ));

    assert_eq!(shape(&compiled), vec!["Sort", "Filter", "Aggregate", "FullScan"]);
    let aggregate = &compiled.physical.root.inputs[0].inputs[0];
    assert_eq!(aggregate.strategy.access, AccessMethod::Backend);
    assert!((aggregate.strategy.estimated_rows - 1_000.0).abs() < 1e-6);
    match &compiled.physical.root.op {
        PhysicalOp::Sort { keys } => {
            assert_eq!(keys[0].field.source, FieldSource::Aggregate);
            assert_eq!(compiled.physical.root.strategy.access, AccessMethod::InMemory);
        }
        other => panic!("unexpected root: {other:?}"),
    }
    assert!(compiled.warnings.is_empty());
}

#[test]
fn unsupported_aggregate_runs_in_memory() {
    let compiled = QueryBuilder::new("users")
        .percentile("age", 95.0, "p95")
        .compile(&compiler(), SCAN_ONLY)
        .expect("compiles");
    assert_eq!(shape(&compiled), vec!["Aggregate", "FullScan"]);
    assert_eq!(compiled.physical.root.strategy.access, AccessMethod::InMemory);
    assert!((compiled.physical.root.strategy.estimated_rows - 1.0).abs() < 1e-9);
    assert_eq!(compiled.explain.detail("aggregates"), Some("PERCENTILE(age, 95) AS p95"));
}

#[test]
fn having_must_reference_the_aggregate_output() {
    let err = QueryBuilder::new("users")
        .group_by(["status"])
        .count("n")
        .having(|p| {
            p.gt("age", 10_i64);
        })
        .compile(&compiler(), DOCS)
        .expect_err("age is neither grouped nor an alias");
    let err = pipeline_err(err);
    assert_eq!(err.code(), "FIELD_NOT_IN_AGGREGATE_OUTPUT");
}

#[test]
fn aggregate_rules_are_reported_together() {
    let err = QueryBuilder::new("users")
        .group_by(["status"])
        .percentile("age", 150.0, "p")
        .aggregate(AggregateFunction::Sum, "score", "p")
        .compile(&compiler(), DOCS)
        .expect_err("invalid rank and duplicate alias");
    let err = pipeline_err(err);
    let codes = validation_codes(&err);
    assert!(codes.contains(&ValidationCode::AggPercentileInvalid));
    assert!(codes.contains(&ValidationCode::AggAliasDuplicate));
}

#[test]
fn joins_run_in_the_backend_when_both_sides_do() {
    let compiled = QueryBuilder::new("orders")
        .join("users", "u", "user_id", "id")
        .compile(&compiler(), DOCS)
        .expect("compiles");
    assert_eq!(shape(&compiled), vec!["Limit", "BackendJoin", "FullScan", "FullScan"]);
    match &compiled.physical.root.inputs[0].op {
        PhysicalOp::BackendJoin(keys) => {
            assert_eq!(keys.alias, "u");
            assert_eq!(keys.left_key.path, "user_id");
            assert_eq!(keys.right_key.path, "id");
            assert_eq!(keys.join_type, JoinType::Inner);
        }
        other => panic!("unexpected join: {other:?}"),
    }
    assert_eq!(compiled.explain.children[0].detail("on"), Some("user_id = u.id"));
}

#[test]
fn alias_filters_push_into_the_joined_scan() {
    let compiled = QueryBuilder::new("orders")
        .join("users", "u", "user_id", "id")
        .filter(|p| {
            p.eq("u.status", "active").gt("total", 100.0);
        })
        .compile(&compiler(), DOCS)
        .expect("compiles");
    // The left side filters in memory, so the join falls back to a hash join.
    assert_eq!(
        shape(&compiled),
        vec!["Limit", "HashJoin", "Filter", "FullScan", "IndexScan"]
    );
    let right = &compiled.physical.root.inputs[0].inputs[1];
    match &right.op {
        PhysicalOp::IndexScan { alias, index, .. } => {
            assert_eq!(alias.as_deref(), Some("u"));
            assert_eq!(index, "idx_users_status");
        }
        other => panic!("unexpected right input: {other:?}"),
    }
}

#[test]
fn left_join_filters_stay_above_the_join() {
    let compiled = QueryBuilder::new("orders")
        .left_join("users", "u", "user_id", "id")
        .filter(|p| {
            p.eq("u.status", "active");
        })
        .compile(&compiler(), DOCS)
        .expect("compiles");
    assert_eq!(
        shape(&compiled),
        vec!["Limit", "Filter", "BackendJoin", "FullScan", "FullScan"]
    );
}

#[test]
fn small_right_input_uses_a_nested_loop() {
    let caps = InMemoryCapabilities::new().with_backend(
        "tiny",
        BackendProfile::new().with_stats("users", EntityStats::with_rows(12)),
    );
    let compiler = QueryCompiler::new(
        CompilerConfig::default(),
        Arc::new(support::schema()),
        Arc::new(caps),
    );
    let compiled = QueryBuilder::new("orders")
        .join("users", "u", "user_id", "id")
        .compile(&compiler, "tiny")
        .expect("compiles");
    assert_eq!(shape(&compiled)[1], "NestedLoopJoin");

    let large = QueryBuilder::new("users")
        .join("orders", "o", "id", "user_id")
        .compile(&support::compiler(), SCAN_ONLY)
        .expect("compiles");
    assert_eq!(shape(&large)[1], "HashJoin");
}

#[test]
fn join_validation_rules() {
    let mismatch = QueryBuilder::new("orders")
        .join("users", "u", "status", "id")
        .compile(&compiler(), DOCS)
        .expect_err("string joined to integer");
    let mismatch = pipeline_err(mismatch);
    assert_eq!(
        validation_codes(&mismatch),
        vec![ValidationCode::JoinKeyTypeMismatch]
    );

    let mut query = Query::new("users");
    query.joins = vec![
        querycraft::query::ast::JoinSpec::inner("orders", "o", "id", "user_id"),
        querycraft::query::ast::JoinSpec::inner("orders", "o", "id", "user_id"),
    ];
    let duplicate = compiler().compile(&query, DOCS).expect_err("alias reused");
    assert!(validation_codes(&duplicate).contains(&ValidationCode::JoinAliasDuplicate));

    let shadow = QueryBuilder::new("users")
        .join("orders", "address", "id", "user_id")
        .compile(&compiler(), DOCS)
        .expect_err("alias shadows a field");
    let shadow = pipeline_err(shadow);
    assert!(validation_codes(&shadow).contains(&ValidationCode::JoinAliasShadowsField));
}

#[test]
fn grouping_by_a_joined_field() {
    let compiled = QueryBuilder::new("orders")
        .join("users", "u", "user_id", "id")
        .group_by(["u.status"])
        .aggregate(AggregateFunction::Sum, "total", "revenue")
        .order_by("revenue", Direction::Desc)
        .compile(&compiler(), DOCS)
        .expect("compiles");
    match &compiled.canonical.aggregation {
        Some(aggregation) => {
            assert_eq!(aggregation.group_by[0].display_name(), "u.status");
            assert_eq!(aggregation.aggregates[0].alias, "revenue");
        }
        None => panic!("aggregation missing"),
    }
    assert_eq!(shape(&compiled), vec!["Sort", "Aggregate", "BackendJoin", "FullScan", "FullScan"]);
}
