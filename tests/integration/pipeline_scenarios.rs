//! End-to-end compilation scenarios through [`QueryCompiler`].

#![allow(missing_docs)]

mod support;

use std::io::Write;
use std::sync::Arc;

use querycraft::query::ast::{
    AggregateFunction, AggregateSpec, AggregationSpec, Direction, Filter, Pagination, Query,
};
use querycraft::query::canonical::Window;
use querycraft::query::cursor::encode_cursor;
use querycraft::query::errors::ValidationCode;
use querycraft::query::physical::PhysicalOp;
use querycraft::query::predicate::Predicate;
use querycraft::query::{QueryBuilder, QueryState, Value};
use querycraft::{CompilerConfig, Deadline, QueryError, Stage};

use support::{compiler, compiler_with, DOCS};

fn node_types(compiled: &querycraft::CompiledQuery) -> Vec<&'static str> {
    compiled
        .physical
        .nodes()
        .into_iter()
        .map(|node| node.op.name())
        .collect()
}

#[test]
fn indexed_equality_compiles_to_a_single_index_scan() {
    let compiler = compiler();
    let compiled = QueryBuilder::new("users")
        .filter(|p| {
            p.eq("status", "active");
        })
        .compile(&compiler, DOCS)
        .expect("query compiles");

    assert_eq!(node_types(&compiled), vec!["Limit", "IndexScan"]);
    let scan = &compiled.physical.root.inputs[0];
    match &scan.op {
        PhysicalOp::IndexScan {
            entity,
            index,
            field,
            ..
        } => {
            assert_eq!(entity, "users");
            assert_eq!(index, "idx_users_status");
            assert_eq!(field.path, "status");
        }
        other => panic!("unexpected scan: {other:?}"),
    }
    // 10k rows, 10 distinct statuses.
    assert!((scan.strategy.estimated_rows - 1_000.0).abs() < 1e-6);
    assert!((scan.strategy.estimated_cost - 1_000.0).abs() < 1e-6);

    let explain = compiled.explain.to_json();
    assert_eq!(explain["node_type"], "Limit");
    assert_eq!(explain["children"][0]["node_type"], "IndexScan");
    assert_eq!(explain["children"][0]["strategy"], "backend/index=idx_users_status");
}

#[test]
fn negated_conjunction_becomes_disjunction_of_negations() {
    let compiler = compiler();
    let compiled = QueryBuilder::new("users")
        .filter(|p| {
            p.not(|n| {
                n.eq("status", "active").gt("age", 30_i64);
            });
        })
        .compile(&compiler, DOCS)
        .expect("query compiles");

    match compiled.canonical.filter.as_ref().expect("filter present") {
        Predicate::Or(children) => {
            assert_eq!(children.len(), 2);
            let mut negated: Vec<&str> = children
                .iter()
                .map(|child| match child {
                    Predicate::Not(cond) => cond.field.path.as_str(),
                    other => panic!("unexpected disjunct: {other}"),
                })
                .collect();
            negated.sort_unstable();
            assert_eq!(negated, vec!["age", "status"]);
        }
        other => panic!("unexpected filter: {other}"),
    }
}

#[test]
fn unknown_path_is_rejected_at_resolution() {
    let compiler = compiler();
    let mut query = Query::new("users");
    query.filter = Some(Filter::eq("bogus.path", 1_i64));
    let err = compiler.compile(&query, DOCS).expect_err("path does not exist");
    assert_eq!(err.code(), "FIELD_NOT_FOUND");
    assert_eq!(err.stage, Stage::Resolve);
}

#[test]
fn rejected_compilation_reports_its_lifecycle() {
    let mut query = Query::new("users");
    query.filter = Some(Filter::eq("bogus.path", 1_i64));
    let err = compiler().compile(&query, DOCS).expect_err("path does not exist");
    assert_eq!(
        err.states,
        vec![
            QueryState::Received,
            QueryState::Rejected {
                stage: "resolve",
                code: "FIELD_NOT_FOUND",
            },
        ]
    );
    let last = err.states.last().expect("terminal state");
    assert_eq!(last.to_string(), "REJECTED(resolve: FIELD_NOT_FOUND)");

    let mut query = Query::new("users");
    query.aggregation = Some(AggregationSpec {
        group_by: vec!["status".into()],
        aggregates: vec![AggregateSpec::new(AggregateFunction::Max, "name", "last_name")],
        having: None,
    });
    let err = compiler().compile(&query, DOCS).expect_err("name is not aggregable");
    assert_eq!(err.states.len(), 2);
    assert!(matches!(
        err.states[1],
        QueryState::Rejected {
            stage: "validate",
            ..
        }
    ));
}

#[test]
fn aggregate_over_non_aggregable_field_is_rejected() {
    let compiler = compiler();
    let mut query = Query::new("users");
    query.aggregation = Some(AggregationSpec {
        group_by: vec!["status".into()],
        aggregates: vec![AggregateSpec::new(AggregateFunction::Max, "name", "last_name")],
        having: None,
    });
    let err = compiler.compile(&query, DOCS).expect_err("name is not aggregable");
    assert_eq!(err.stage, Stage::Validate);
    match &err.error {
        QueryError::Validation(errors) => {
            assert!(errors.contains(ValidationCode::AggFieldNotAggregable));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn conjunct_order_does_not_change_the_fingerprint() {
    let mut forward = Query::new("users");
    forward.filter = Some(Filter::and([
        Filter::eq("status", "active"),
        Filter::gt("age", 30_i64),
    ]));
    let mut reversed = forward.clone();
    reversed.filter = Some(Filter::and([
        Filter::gt("age", 30_i64),
        Filter::eq("status", "active"),
    ]));

    let a = compiler().compile(&forward, DOCS).expect("compiles");
    let b = compiler().compile(&reversed, DOCS).expect("compiles");
    assert_eq!(a.canonical.fingerprint(), b.canonical.fingerprint());
    assert_eq!(a.physical, b.physical);

    let mut different = forward.clone();
    different.filter = Some(Filter::and([
        Filter::eq("status", "inactive"),
        Filter::gt("age", 30_i64),
    ]));
    let c = compiler().compile(&different, DOCS).expect("compiles");
    assert_ne!(a.canonical.fingerprint(), c.canonical.fingerprint());
}

#[test]
fn execution_hints_are_not_part_of_the_fingerprint() {
    let compiler = compiler();
    let plain = QueryBuilder::new("users").build().expect("builds");
    let hinted = QueryBuilder::new("users")
        .explain()
        .timeout_ms(60_000)
        .build()
        .expect("builds");
    let a = compiler.compile(&plain, DOCS).expect("compiles");
    let b = compiler.compile(&hinted, DOCS).expect("compiles");
    assert_eq!(a.canonical.fingerprint(), b.canonical.fingerprint());
    assert!(b.cache_hit);
}

#[test]
fn successful_compilation_walks_every_state() {
    let compiled = compiler()
        .compile(&Query::new("users"), DOCS)
        .expect("compiles");
    assert_eq!(
        compiled.states,
        vec![
            QueryState::Received,
            QueryState::Validated,
            QueryState::Resolved,
            QueryState::PlannedLogical,
            QueryState::PlannedPhysical,
            QueryState::Ready,
        ]
    );
}

#[test]
fn spent_deadline_aborts_before_resolution() {
    let compiler = compiler();
    let err = compiler
        .compile_with_deadline(&Query::new("users"), DOCS, Deadline::after(0))
        .expect_err("no budget");
    assert_eq!(err.code(), "DEADLINE_EXCEEDED");
    assert_eq!(err.stage, Stage::Resolve);

    let mut query = Query::new("users");
    query.options.timeout_ms = Some(0);
    let err = compiler.compile(&query, DOCS).expect_err("query timeout of zero");
    assert_eq!(err.code(), "DEADLINE_EXCEEDED");
}

#[test]
fn unindexed_sort_is_only_a_warning() {
    let compiled = QueryBuilder::new("users")
        .order_by("name", Direction::Asc)
        .compile(&compiler(), DOCS)
        .expect("compiles");
    assert_eq!(compiled.warnings.len(), 1);
    assert_eq!(compiled.warnings[0].code, ValidationCode::SortFieldNotIndexed);
    assert_eq!(node_types(&compiled), vec!["Limit", "Sort", "FullScan"]);
}

#[test]
fn plan_cache_hits_until_a_catalog_refresh() {
    let compiler = compiler();
    let query = QueryBuilder::new("users")
        .filter(|p| {
            p.eq("status", "active");
        })
        .build()
        .expect("builds");

    assert!(!compiler.compile(&query, DOCS).expect("compiles").cache_hit);
    assert!(compiler.compile(&query, DOCS).expect("compiles").cache_hit);

    compiler.refresh_capabilities(Arc::new(support::capabilities()));
    assert!(!compiler.compile(&query, DOCS).expect("compiles").cache_hit);

    compiler.refresh_schema(Arc::new(support::schema()));
    assert!(!compiler.compile(&query, DOCS).expect("compiles").cache_hit);

    let stats = compiler.cache_stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 3);
    assert_eq!(compiler.catalog_generations(), (1, 1));
}

#[test]
fn clearing_the_plan_cache_forces_replanning() {
    let compiler = compiler();
    let query = Query::new("users");
    assert!(!compiler.compile(&query, DOCS).expect("compiles").cache_hit);
    assert!(compiler.compile(&query, DOCS).expect("compiles").cache_hit);
    assert_eq!(compiler.cache_stats().len, 1);

    compiler.clear_plan_cache();
    assert_eq!(compiler.cache_stats().len, 0);
    assert!(!compiler.compile(&query, DOCS).expect("compiles").cache_hit);

    let stats = compiler.cache_stats();
    assert_eq!((stats.hits, stats.misses, stats.len), (1, 2, 1));
    assert_eq!(compiler.catalog_generations(), (0, 0));
}

#[test]
fn cursor_pagination_resumes_after_the_keys() {
    let cursor = encode_cursor(&[Value::Int(42)]);
    let compiled = QueryBuilder::new("users")
        .order_by("id", Direction::Asc)
        .after(cursor, 10)
        .compile(&compiler(), DOCS)
        .expect("compiles");
    assert_eq!(
        compiled.canonical.window,
        Window::After {
            keys: vec![Value::Int(42)],
            limit: 10,
        }
    );
    assert_eq!(compiled.explain.detail("limit"), Some("10"));
}

#[test]
fn query_parses_from_json_and_compiles() {
    let json = r#"{
        "entity": "users",
        "filter": {"or": [
            {"condition": {"field": "status", "operator": "EQ", "value": "active"}},
            {"condition": {"field": "email", "operator": "EQ", "value": "a@example.com"}}
        ]},
        "pagination": {"page": {"page": 3, "page_size": 20}}
    }"#;
    let query: Query = serde_json::from_str(json).expect("json parses");
    assert_eq!(
        query.pagination,
        Some(Pagination::Page {
            page: 3,
            page_size: 20
        })
    );
    let compiled = compiler().compile(&query, DOCS).expect("compiles");
    assert_eq!(
        compiled.canonical.window,
        Window::Offset {
            offset: 40,
            limit: 20
        }
    );
    // Both disjuncts are indexed, so the whole OR is pushed.
    assert_eq!(node_types(&compiled), vec!["Limit", "IndexScan"]);
}

#[test]
fn toml_config_drives_default_pagination() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    writeln!(file, "[limits]\ndefault_page_size = 7\n").expect("write config");
    let config = CompilerConfig::load(file.path()).expect("config loads");
    let compiled = compiler_with(config)
        .compile(&Query::new("users"), DOCS)
        .expect("compiles");
    assert_eq!(
        compiled.canonical.window,
        Window::Offset {
            offset: 0,
            limit: 7
        }
    );
}
