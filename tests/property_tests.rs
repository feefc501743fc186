#![allow(missing_docs)]

use std::sync::Arc;

use proptest::prelude::*;
use querycraft::query::ast::{Filter, Literal, Query};
use querycraft::query::capabilities::{
    BackendProfile, EntityStats, FieldStats, InMemoryCapabilities,
};
use querycraft::query::coerce::coerce;
use querycraft::query::cursor::{decode_cursor, encode_cursor};
use querycraft::query::logical::plan_logical;
use querycraft::query::physical::PhysicalOp;
use querycraft::query::predicate::Predicate;
use querycraft::query::schema::{EntitySchema, FieldDef, FieldType, InMemorySchema};
use querycraft::query::Value;
use querycraft::{CompiledQuery, CompilerConfig, QueryCompiler};

fn compiler() -> QueryCompiler {
    let schema = InMemorySchema::new().with_entity(
        EntitySchema::new("users")
            .with_field(FieldDef::new("id", FieldType::Integer).indexed())
            .with_field(FieldDef::new("status", FieldType::String).indexed())
            .with_field(FieldDef::new("age", FieldType::Integer))
            .with_field(FieldDef::new("score", FieldType::Float))
            .with_field(FieldDef::new("name", FieldType::String))
            .with_field(FieldDef::new("email", FieldType::String).indexed()),
    );
    let stats = EntityStats::with_rows(10_000).with_field(
        "status",
        FieldStats {
            distinct_count: 10,
            null_count: 0,
        },
    );
    let caps = InMemoryCapabilities::new()
        .with_backend(
            "docs",
            BackendProfile::full()
                .with_index("users", "id")
                .with_index("users", "status")
                .with_index("users", "email")
                .with_stats("users", stats),
        )
        .with_backend(
            "kv",
            BackendProfile::key_value()
                .with_index("users", "id")
                .with_index("users", "email"),
        )
        .with_backend("scan", BackendProfile::new());
    QueryCompiler::new(CompilerConfig::batch(), Arc::new(schema), Arc::new(caps))
}

fn arb_leaf() -> impl Strategy<Value = Filter> {
    prop_oneof![
        "[a-c]{1,3}".prop_map(|s| Filter::eq("status", s)),
        "[a-c]{1,3}".prop_map(|s| Filter::ne("status", s)),
        (0i64..100).prop_map(|n| Filter::gt("age", n)),
        (0i64..100).prop_map(|n| Filter::lte("age", n)),
        (0i64..1_000).prop_map(|n| Filter::eq("id", n)),
        (-10.0f64..10.0).prop_map(|f| Filter::gte("score", f)),
        "[a-z]{1,4}@x".prop_map(|s| Filter::eq("email", s)),
        Just(Filter::is_null("name")),
        prop::collection::vec("[a-c]{1,2}", 1..4).prop_map(|v| Filter::in_list("status", v)),
    ]
}

fn arb_filter() -> impl Strategy<Value = Filter> {
    arb_leaf().prop_recursive(4, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 1..4).prop_map(Filter::and),
            prop::collection::vec(inner.clone(), 1..4).prop_map(Filter::or),
            inner.prop_map(Filter::not),
        ]
    })
}

fn arb_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Int),
        any::<f64>().prop_map(Value::Float),
        ".{0,12}".prop_map(Value::String),
        any::<i64>().prop_map(Value::Timestamp),
    ];
    leaf.prop_recursive(3, 16, 4, |inner| {
        prop::collection::vec(inner, 0..4).prop_map(Value::List)
    })
}

/// Reverses the operands of every AND/OR in the tree.
fn mirrored(filter: &Filter) -> Filter {
    match filter {
        Filter::And(children) => Filter::and(children.iter().rev().map(mirrored)),
        Filter::Or(children) => Filter::or(children.iter().rev().map(mirrored)),
        Filter::Not(child) => Filter::not(mirrored(child)),
        leaf => leaf.clone(),
    }
}

fn compile(filter: Filter, backend: &str) -> CompiledQuery {
    let mut query = Query::new("users");
    query.filter = Some(filter);
    compiler().compile(&query, backend).expect("generated filters are valid")
}

fn assert_normal_form(predicate: &Predicate) {
    let mut stack = vec![predicate];
    while let Some(node) = stack.pop() {
        match node {
            Predicate::And(children) => {
                assert!(children.len() >= 2, "degenerate AND: {node}");
                assert!(!children.iter().any(|c| matches!(c, Predicate::And(_))));
                stack.extend(children);
            }
            Predicate::Or(children) => {
                assert!(children.len() >= 2 || node.is_never(), "degenerate OR: {node}");
                assert!(!children.iter().any(|c| matches!(c, Predicate::Or(_))));
                stack.extend(children);
            }
            Predicate::Condition(_) | Predicate::Not(_) => {}
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_normalized_filters_are_flat(filter in arb_filter()) {
        let compiled = compile(filter, "docs");
        if let Some(predicate) = &compiled.canonical.filter {
            assert_normal_form(predicate);
        }
    }

    #[test]
    fn prop_operand_order_never_changes_the_fingerprint(filter in arb_filter()) {
        let a = compile(filter.clone(), "docs");
        let b = compile(mirrored(&filter), "docs");
        prop_assert_eq!(a.canonical.fingerprint(), b.canonical.fingerprint());
        prop_assert_eq!(a.canonical.filter, b.canonical.filter);
    }

    #[test]
    fn prop_double_negation_is_transparent(filter in arb_filter()) {
        let plain = compile(filter.clone(), "docs");
        let doubled = compile(Filter::not(Filter::not(filter)), "docs");
        prop_assert_eq!(plain.canonical.fingerprint(), doubled.canonical.fingerprint());
    }

    #[test]
    fn prop_logical_planning_is_deterministic(filter in arb_filter()) {
        let compiled = compile(filter, "docs");
        prop_assert_eq!(&plan_logical(&compiled.canonical), compiled.logical.as_ref());
    }

    #[test]
    fn prop_every_conjunct_is_placed_once(
        filter in arb_filter(),
        backend in prop_oneof![Just("docs"), Just("kv"), Just("scan")],
    ) {
        let compiled = compile(filter, backend);
        let mut expected: Vec<String> = compiled
            .canonical
            .filter
            .as_ref()
            .map(|f| f.conjuncts().iter().map(|c| c.canonical_key()).collect())
            .unwrap_or_default();
        expected.sort();

        let mut placed = Vec::new();
        for node in compiled.physical.nodes() {
            match &node.op {
                PhysicalOp::IndexScan { predicate, .. } | PhysicalOp::Filter { predicate, .. } => {
                    placed.extend(predicate.conjuncts().iter().map(|c| c.canonical_key()));
                }
                _ => {}
            }
        }
        placed.sort();
        prop_assert_eq!(placed, expected);
    }

    #[test]
    fn prop_cursor_round_trip(keys in prop::collection::vec(arb_value(), 0..6)) {
        let cursor = encode_cursor(&keys);
        prop_assert_eq!(decode_cursor(&cursor).expect("decodes"), keys);
    }

    #[test]
    fn prop_float_to_integer_never_truncates(f in any::<f64>()) {
        match coerce(&Literal::Float(f), &FieldType::Integer, "n") {
            Ok(Value::Int(i)) => prop_assert_eq!(i as f64, f),
            Ok(other) => panic!("unexpected value {other:?}"),
            Err(_) => prop_assert!(
                !f.is_finite() || f.fract() != 0.0 || f < i64::MIN as f64 || f >= i64::MAX as f64
            ),
        }
    }

    #[test]
    fn prop_integer_to_float_is_exact(i in any::<i64>()) {
        match coerce(&Literal::Int(i), &FieldType::Float, "n") {
            Ok(Value::Float(f)) => prop_assert_eq!(f as i64, i),
            Ok(other) => panic!("unexpected value {other:?}"),
            Err(_) => prop_assert!(i.unsigned_abs() > 1 << 53),
        }
    }
}
