//! Push-down and fallback decisions across backends with different capabilities.
//!
//! Every conjunct of the WHERE clause must appear exactly once in the physical
//! plan: either folded into an index scan or inside one in-memory filter.

#![allow(missing_docs)]

mod support;

use std::sync::Arc;

use querycraft::query::ast::{Direction, Operator, Query};
use querycraft::query::capabilities::{BackendProfile, InMemoryCapabilities};
use querycraft::query::physical::{AccessMethod, PhysicalOp, PhysicalPlan};
use querycraft::query::predicate::Predicate;
use querycraft::query::schema::FieldType;
use querycraft::query::QueryBuilder;
use querycraft::{CompiledQuery, CompilerConfig, QueryCompiler, Stage};

use support::{compiler, pipeline_err, DOCS, KV, SCAN_ONLY};

fn placed_conjuncts(plan: &PhysicalPlan) -> Vec<String> {
    let mut keys = Vec::new();
    for node in plan.nodes() {
        match &node.op {
            PhysicalOp::IndexScan { predicate, .. } | PhysicalOp::Filter { predicate, .. } => {
                keys.extend(predicate.conjuncts().iter().map(|c| c.canonical_key()));
            }
            _ => {}
        }
    }
    keys.sort();
    keys
}

fn assert_each_conjunct_once(compiled: &CompiledQuery) {
    let mut expected: Vec<String> = compiled
        .canonical
        .filter
        .as_ref()
        .map(|f| f.conjuncts().iter().map(|c| c.canonical_key()).collect())
        .unwrap_or_default();
    expected.sort();
    assert_eq!(placed_conjuncts(&compiled.physical), expected);
}

fn memory_filters(plan: &PhysicalPlan) -> Vec<&Predicate> {
    plan.nodes()
        .into_iter()
        .filter_map(|node| match &node.op {
            PhysicalOp::Filter { predicate, .. } => {
                assert_eq!(node.strategy.access, AccessMethod::InMemory);
                Some(predicate)
            }
            _ => None,
        })
        .collect()
}

#[test]
fn partial_push_down_splits_index_scan_and_filter() {
    let compiled = QueryBuilder::new("users")
        .filter(|p| {
            p.eq("email", "a@example.com")
                .gt("age", 30_i64)
                .starts_with("name", "A");
        })
        .compile(&compiler(), KV)
        .expect("compiles");

    let types: Vec<&str> = compiled.physical.nodes().iter().map(|n| n.op.name()).collect();
    assert_eq!(types, vec!["Limit", "Filter", "IndexScan"]);
    let filters = memory_filters(&compiled.physical);
    assert_eq!(filters.len(), 1);
    assert_eq!(filters[0].conjuncts().len(), 2);
    assert_each_conjunct_once(&compiled);
}

#[test]
fn scan_only_backend_filters_everything_in_memory() {
    let compiled = QueryBuilder::new("users")
        .filter(|p| {
            p.eq("status", "active").is_not_null("email");
        })
        .compile(&compiler(), SCAN_ONLY)
        .expect("compiles");

    let scan = compiled
        .physical
        .nodes()
        .into_iter()
        .find(|n| matches!(n.op, PhysicalOp::FullScan { .. }))
        .expect("full scan present");
    assert!(scan.strategy.index.is_none());
    assert_eq!(memory_filters(&compiled.physical).len(), 1);
    assert_each_conjunct_once(&compiled);
    // Limit cannot be pushed above an in-memory filter.
    assert_eq!(compiled.physical.root.strategy.access, AccessMethod::InMemory);
}

#[test]
fn disjunction_with_an_unindexed_branch_is_not_pushed() {
    let compiled = QueryBuilder::new("users")
        .filter(|p| {
            p.eq("status", "vip").any(|o| {
                o.eq("email", "a@example.com").eq("name", "Ann");
            });
        })
        .compile(&compiler(), DOCS)
        .expect("compiles");

    let filters = memory_filters(&compiled.physical);
    assert_eq!(filters.len(), 1);
    assert!(matches!(filters[0], Predicate::Or(_)));
    assert_each_conjunct_once(&compiled);
}

#[test]
fn operator_unsupported_by_the_backend_falls_back() {
    let caps = InMemoryCapabilities::new().with_backend(
        "strict",
        BackendProfile::full()
            .with_index("users", "status")
            .exclude_filter_type(Operator::StartsWith, FieldType::String),
    );
    let compiler = QueryCompiler::new(
        CompilerConfig::default(),
        Arc::new(support::schema()),
        Arc::new(caps),
    );
    let compiled = QueryBuilder::new("users")
        .filter(|p| {
            p.starts_with("status", "act");
        })
        .compile(&compiler, "strict")
        .expect("compiles");

    assert!(compiled
        .physical
        .nodes()
        .iter()
        .any(|n| matches!(n.op, PhysicalOp::FullScan { .. })));
    assert_each_conjunct_once(&compiled);
}

#[test]
fn forbidden_full_scan_is_a_planning_error() {
    let mut query = Query::new("orders");
    query.filter = Some(querycraft::query::ast::Filter::gt("total", 5.0));
    let err = compiler().compile(&query, KV).expect_err("no usable index");
    assert_eq!(err.code(), "FULL_SCAN_FORBIDDEN");
    assert_eq!(err.stage, Stage::PhysicalPlan);

    let compiled = QueryBuilder::new("orders")
        .filter(|p| {
            p.eq("user_id", 7_i64).gt("total", 5.0);
        })
        .compile(&compiler(), KV)
        .expect("indexed lookup avoids the full scan");
    assert_each_conjunct_once(&compiled);
}

#[test]
fn key_value_sorts_need_an_index() {
    let err = QueryBuilder::new("users")
        .order_by("name", Direction::Asc)
        .compile(&compiler(), KV)
        .expect_err("name has no backend index");
    let err = pipeline_err(err);
    assert_eq!(err.code(), "SORT_INDEX_REQUIRED");

    let compiled = QueryBuilder::new("users")
        .order_by("id", Direction::Desc)
        .compile(&compiler(), KV)
        .expect("id is indexed");
    let sort = &compiled.physical.root.inputs[0];
    assert!(matches!(sort.op, PhysicalOp::Sort { .. }));
    assert!(sort.strategy.is_backend());
}

#[test]
fn operators_above_in_memory_input_stay_in_memory() {
    let compiled = QueryBuilder::new("users")
        .filter(|p| {
            p.gt("age", 21_i64);
        })
        .order_by("created_at", Direction::Desc)
        .select(["id", "name"])
        .compile(&compiler(), KV)
        .expect("compiles");

    let types: Vec<&str> = compiled.physical.nodes().iter().map(|n| n.op.name()).collect();
    assert_eq!(types, vec!["Limit", "Project", "Sort", "Filter", "FullScan"]);
    for node in compiled.physical.nodes().into_iter().take(4) {
        assert_eq!(node.strategy.access, AccessMethod::InMemory, "{}", node.op.name());
    }
}

#[test]
fn never_matching_filter_stays_in_memory_with_zero_rows() {
    let compiled = QueryBuilder::new("users")
        .filter_tree(querycraft::query::ast::Filter::or([]))
        .compile(&compiler(), DOCS)
        .expect("compiles");
    let filters = memory_filters(&compiled.physical);
    assert_eq!(filters.len(), 1);
    assert!(filters[0].is_never());
    assert_eq!(compiled.physical.root.strategy.estimated_rows, 0.0);
}

#[test]
fn contradiction_compiles_where_full_scans_are_forbidden() {
    let mut query = Query::new("orders");
    query.filter = Some(querycraft::query::ast::Filter::or([]));
    let compiled = compiler()
        .compile(&query, KV)
        .expect("a contradiction reads nothing");
    let filters = memory_filters(&compiled.physical);
    assert_eq!(filters.len(), 1);
    assert!(filters[0].is_never());
    assert_each_conjunct_once(&compiled);

    let scan = compiled
        .physical
        .nodes()
        .into_iter()
        .find(|n| matches!(n.op, PhysicalOp::FullScan { .. }))
        .expect("scan leaf");
    assert_eq!(scan.strategy.estimated_rows, 0.0);
    assert_eq!(compiled.physical.root.strategy.estimated_rows, 0.0);
}
