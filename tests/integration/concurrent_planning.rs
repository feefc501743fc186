//! Concurrent compilation against shared catalogs, with refreshes racing the
//! planners.

#![allow(missing_docs)]

mod support;

use std::collections::BTreeSet;
use std::sync::{Arc, Barrier};
use std::thread;

use querycraft::query::ast::{Direction, Query};
use querycraft::query::capabilities::{BackendCapabilities, BackendProfile, InMemoryCapabilities};
use querycraft::query::catalog::SharedSnapshot;
use querycraft::query::schema::{
    EntitySchema, FieldDef, FieldType, InMemorySchema, SchemaRegistry,
};
use querycraft::query::QueryBuilder;
use querycraft::{CompilerConfig, QueryCompiler};

use support::{compiler, compiler_with, DOCS};

const THREADS: usize = 8;
const ROUNDS: usize = 100;

fn queries() -> Vec<Query> {
    let by_status = |status: &str| {
        let status = status.to_owned();
        QueryBuilder::new("users")
            .filter(move |p| {
                p.eq("status", status.as_str());
            })
            .build()
            .expect("builds")
    };
    vec![
        by_status("active"),
        by_status("inactive"),
        QueryBuilder::new("users")
            .filter(|p| {
                p.gt("age", 30_i64).starts_with("name", "A");
            })
            .order_by("created_at", Direction::Desc)
            .build()
            .expect("builds"),
        QueryBuilder::new("orders")
            .join("users", "u", "user_id", "id")
            .filter(|p| {
                p.eq("u.status", "active");
            })
            .build()
            .expect("builds"),
    ]
}

#[test]
fn parallel_compilations_agree_on_fingerprints() {
    let compiler = compiler();
    let queries = queries();
    let barrier = Barrier::new(THREADS);

    let results: Vec<Vec<String>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    let mut seen = Vec::new();
                    for round in 0..ROUNDS {
                        let query = &queries[round % queries.len()];
                        let compiled = compiler.compile(query, DOCS).expect("compiles");
                        seen.push(compiled.canonical.fingerprint().to_string());
                    }
                    seen
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("worker panicked"))
            .collect()
    });

    for worker in &results[1..] {
        assert_eq!(worker, &results[0]);
    }
    let distinct: BTreeSet<&String> = results[0].iter().collect();
    assert_eq!(distinct.len(), queries.len());
    assert!(compiler.cache_stats().hits > 0);
}

#[test]
fn refreshes_never_tear_a_compilation() {
    let indexed = || Arc::new(support::capabilities()) as Arc<dyn BackendCapabilities>;
    let unindexed = || {
        Arc::new(InMemoryCapabilities::new().with_backend(DOCS, BackendProfile::full()))
            as Arc<dyn BackendCapabilities>
    };
    let compiler = compiler();
    let query = QueryBuilder::new("users")
        .filter(|p| {
            p.eq("status", "active");
        })
        .build()
        .expect("builds");
    thread::scope(|scope| {
        scope.spawn(|| {
            for round in 0..ROUNDS * 2 {
                compiler.refresh_capabilities(if round % 2 == 0 { unindexed() } else { indexed() });
                thread::yield_now();
            }
        });
        for _ in 0..THREADS {
            scope.spawn(|| {
                for _ in 0..ROUNDS {
                    let compiled = compiler.compile(&query, DOCS).expect("compiles");
                    let shape: Vec<&str> =
                        compiled.physical.nodes().iter().map(|n| n.op.name()).collect();
                    assert!(
                        shape == ["Limit", "IndexScan"] || shape == ["Limit", "Filter", "FullScan"],
                        "torn plan {shape:?}"
                    );
                }
            });
        }
    });
}

#[test]
fn compilers_sharing_snapshots_see_the_same_refresh() {
    let schema: Arc<SharedSnapshot<dyn SchemaRegistry>> = Arc::new(SharedSnapshot::from_arc(
        "schema",
        Arc::new(support::schema()) as Arc<dyn SchemaRegistry>,
    ));
    let capabilities: Arc<SharedSnapshot<dyn BackendCapabilities>> =
        Arc::new(SharedSnapshot::from_arc(
            "capabilities",
            Arc::new(support::capabilities()) as Arc<dyn BackendCapabilities>,
        ));
    let first = QueryCompiler::with_shared(
        CompilerConfig::default(),
        Arc::clone(&schema),
        Arc::clone(&capabilities),
    );
    let second = QueryCompiler::with_shared(
        CompilerConfig::batch(),
        Arc::clone(&schema),
        Arc::clone(&capabilities),
    );

    let query = QueryBuilder::new("users")
        .filter(|p| {
            p.eq("status", "active");
        })
        .build()
        .expect("builds");
    assert!(first.compile(&query, DOCS).is_ok());

    let narrowed = InMemorySchema::new().with_entity(
        EntitySchema::new("users").with_field(FieldDef::new("id", FieldType::Integer)),
    );
    assert_eq!(first.refresh_schema(Arc::new(narrowed)), 1);

    for compiler in [&first, &second] {
        let err = compiler.compile(&query, DOCS).expect_err("status is gone");
        assert_eq!(err.code(), "FIELD_NOT_FOUND");
    }
}

#[test]
fn disabled_cache_still_compiles_in_parallel() {
    let compiler = compiler_with(CompilerConfig::batch());
    let queries = queries();
    thread::scope(|scope| {
        for worker in 0..THREADS {
            let compiler = &compiler;
            let queries = &queries;
            scope.spawn(move || {
                let query = &queries[worker % queries.len()];
                let compiled = compiler.compile(query, DOCS).expect("compiles");
                assert!(!compiled.cache_hit);
            });
        }
    });
    assert_eq!(compiler.cache_stats().hits, 0);
}
