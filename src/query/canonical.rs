//! Canonical query model.
//!
//! [`build_canonical`] turns a [`ValidatedQuery`] into an immutable
//! [`CanonicalQuery`]. Construction cannot fail: every rule has already been
//! checked, so this stage only reorders, makes defaults explicit and computes
//! the [`Fingerprint`].
#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use serde::{Serialize, Serializer};
use tracing::trace;
use xxhash_rust::xxh3::xxh3_128;

use crate::query::ast::{AggregateFunction, Consistency, Direction, JoinType, NullOrdering};
use crate::query::predicate::Predicate;
use crate::query::schema::{FieldRef, FieldSource, FieldType};
use crate::query::validate::{PageRequest, ValidatedQuery};
use crate::query::value::Value;

/// 128-bit semantic fingerprint of a canonical query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint(pub u128);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Explicit null placement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NullPlacement {
    /// Nulls before every value.
    First,
    /// Nulls after every value.
    Last,
}

/// Sort key with explicit null placement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CanonicalSort {
    /// Sort field.
    pub field: Arc<FieldRef>,
    /// Direction.
    pub direction: Direction,
    /// Null placement.
    pub nulls: NullPlacement,
}

/// Row window requested by pagination.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Window {
    /// Every row.
    Unbounded,
    /// Skip `offset` rows, return at most `limit`.
    Offset {
        /// Rows skipped.
        offset: u64,
        /// Rows returned.
        limit: u32,
    },
    /// Rows strictly after `keys` in sort order, at most `limit`.
    After {
        /// Sort-key tuple of the last row already returned.
        keys: Vec<Value>,
        /// Rows returned.
        limit: u32,
    },
}

impl Window {
    /// Row limit, if any.
    pub fn limit(&self) -> Option<u32> {
        match self {
            Window::Unbounded => None,
            Window::Offset { limit, .. } | Window::After { limit, .. } => Some(*limit),
        }
    }
}

/// Aggregate output column.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CanonicalAggregate {
    /// Function.
    pub function: AggregateFunction,
    /// Target field; `None` for `COUNT(*)`.
    pub field: Option<Arc<FieldRef>>,
    /// Output column name.
    pub alias: String,
    /// Percentile rank.
    pub percentile: Option<f64>,
    /// Output column type.
    pub output_type: FieldType,
}

/// Aggregation block.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CanonicalAggregation {
    /// Group-by fields, sorted and deduplicated.
    pub group_by: Vec<Arc<FieldRef>>,
    /// Aggregates sorted by alias.
    pub aggregates: Vec<CanonicalAggregate>,
    /// HAVING predicate.
    pub having: Option<Predicate>,
}

/// Equi-join in declaration order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CanonicalJoin {
    /// Joined entity.
    pub entity: String,
    /// Alias of the joined entity.
    pub alias: String,
    /// Join flavour.
    pub join_type: JoinType,
    /// Left key.
    pub left_key: Arc<FieldRef>,
    /// Right key.
    pub right_key: Arc<FieldRef>,
}

/// Fully resolved, typed and canonically ordered query.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CanonicalQuery {
    /// Base entity.
    pub entity: String,
    /// Filter in negation-normal form.
    pub filter: Option<Predicate>,
    /// Included fields ordered by id; empty means every field.
    pub include: Vec<Arc<FieldRef>>,
    /// Excluded fields ordered by id.
    pub exclude: Vec<Arc<FieldRef>>,
    /// Sort keys, most significant first.
    pub sort: Vec<CanonicalSort>,
    /// Row window.
    pub window: Window,
    /// Aggregation block.
    pub aggregation: Option<CanonicalAggregation>,
    /// Joins.
    pub joins: Vec<CanonicalJoin>,
    /// Whether the total match count is requested.
    pub count_total: bool,
    /// Read consistency.
    pub consistency: Consistency,
    /// Compilation deadline; not part of the fingerprint.
    pub timeout_ms: Option<u64>,
    /// Explain flag; not part of the fingerprint.
    pub explain: bool,
    fingerprint: Fingerprint,
}

impl CanonicalQuery {
    /// Semantic fingerprint.
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }
}

fn by_id(fields: Vec<Arc<FieldRef>>) -> Vec<Arc<FieldRef>> {
    let mut keyed: Vec<(u32, String, Arc<FieldRef>)> = fields
        .into_iter()
        .map(|f| (f.id.0, f.sort_key(), f))
        .collect();
    keyed.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
    keyed.dedup_by(|a, b| a.1 == b.1);
    keyed.into_iter().map(|(_, _, f)| f).collect()
}

fn explicit_nulls(direction: Direction, nulls: NullOrdering) -> NullPlacement {
    match (nulls, direction) {
        (NullOrdering::NullsFirst, _) => NullPlacement::First,
        (NullOrdering::NullsLast, _) => NullPlacement::Last,
        (NullOrdering::Default, Direction::Asc) => NullPlacement::Last,
        (NullOrdering::Default, Direction::Desc) => NullPlacement::First,
    }
}

/// Builds the canonical model of a validated query.
pub fn build_canonical(validated: ValidatedQuery) -> CanonicalQuery {
    let (query, page, _) = validated.into_parts();

    let sort = query
        .sort
        .into_iter()
        .map(|s| CanonicalSort {
            nulls: explicit_nulls(s.direction, s.nulls),
            field: s.field,
            direction: s.direction,
        })
        .collect();

    let window = match page {
        PageRequest::Unbounded => Window::Unbounded,
        PageRequest::Page { page, page_size } => Window::Offset {
            offset: u64::from(page.saturating_sub(1)) * u64::from(page_size),
            limit: page_size,
        },
        PageRequest::After { keys, page_size } => Window::After {
            keys,
            limit: page_size,
        },
    };

    let aggregation = query.aggregation.map(|agg| {
        let mut group_by: Vec<(String, Arc<FieldRef>)> =
            agg.group_by.into_iter().map(|f| (f.sort_key(), f)).collect();
        group_by.sort_by(|a, b| a.0.cmp(&b.0));
        group_by.dedup_by(|a, b| a.0 == b.0);
        let mut aggregates: Vec<CanonicalAggregate> = agg
            .aggregates
            .into_iter()
            .map(|a| CanonicalAggregate {
                function: a.function,
                field: a.field,
                alias: a.alias,
                percentile: a.percentile,
                output_type: a.output_type,
            })
            .collect();
        aggregates.sort_by(|a, b| a.alias.cmp(&b.alias));
        CanonicalAggregation {
            group_by: group_by.into_iter().map(|(_, f)| f).collect(),
            aggregates,
            having: agg.having,
        }
    });

    let joins = query
        .joins
        .into_iter()
        .map(|j| CanonicalJoin {
            entity: j.entity,
            alias: j.alias,
            join_type: j.join_type,
            left_key: j.left_key,
            right_key: j.right_key,
        })
        .collect();

    let mut canonical = CanonicalQuery {
        entity: query.entity,
        filter: query.filter,
        include: by_id(query.include),
        exclude: by_id(query.exclude),
        sort,
        window,
        aggregation,
        joins,
        count_total: query.options.count_total,
        consistency: query.options.consistency,
        timeout_ms: query.options.timeout_ms,
        explain: query.options.explain,
        fingerprint: Fingerprint(0),
    };
    canonical.fingerprint = fingerprint(&canonical);
    trace!(
        entity = %canonical.entity,
        fingerprint = %canonical.fingerprint,
        "query.canonical.built"
    );
    canonical
}

const T_ENTITY: u8 = 0x01;
const T_FILTER: u8 = 0x02;
const T_INCLUDE: u8 = 0x03;
const T_EXCLUDE: u8 = 0x04;
const T_SORT: u8 = 0x05;
const T_WINDOW: u8 = 0x06;
const T_AGGREGATION: u8 = 0x07;
const T_JOINS: u8 = 0x08;
const T_OPTIONS: u8 = 0x09;
const T_NONE: u8 = 0x00;
const T_SOME: u8 = 0xff;

/// Length-prefixed, tagged byte encoding hashed into the fingerprint.
#[derive(Default)]
struct CanonicalBytes {
    buf: Vec<u8>,
}

impl CanonicalBytes {
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn str(&mut self, s: &str) {
        self.u64(s.len() as u64);
        self.buf.extend_from_slice(s.as_bytes());
    }

    fn field(&mut self, field: &FieldRef) {
        match &field.source {
            FieldSource::Entity => self.u8(0),
            FieldSource::Join { alias } => {
                self.u8(1);
                self.str(alias);
            }
            FieldSource::Aggregate => self.u8(2),
        }
        self.str(&field.entity);
        self.str(&field.path);
    }

    /// Encodes a field set in path order; ids are registry-local.
    fn field_set(&mut self, fields: &[Arc<FieldRef>]) {
        let mut keyed: Vec<(String, &FieldRef)> =
            fields.iter().map(|f| (f.sort_key(), f.as_ref())).collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        self.u64(keyed.len() as u64);
        for (_, field) in keyed {
            self.field(field);
        }
    }

    fn value(&mut self, value: &Value) {
        let mut stack = vec![value];
        while let Some(value) = stack.pop() {
            match value {
                Value::Null => self.u8(0),
                Value::Bool(v) => {
                    self.u8(1);
                    self.u8(u8::from(*v));
                }
                Value::Int(v) => {
                    self.u8(2);
                    self.u64(*v as u64);
                }
                Value::Float(v) => {
                    self.u8(3);
                    self.u64(v.to_bits());
                }
                Value::String(v) => {
                    self.u8(4);
                    self.str(v);
                }
                Value::Timestamp(v) => {
                    self.u8(5);
                    self.u64(*v as u64);
                }
                Value::List(items) => {
                    self.u8(6);
                    self.u64(items.len() as u64);
                    stack.extend(items.iter().rev());
                }
            }
        }
    }

    fn predicate(&mut self, pred: &Predicate) {
        let mut stack = vec![pred];
        while let Some(node) = stack.pop() {
            match node {
                Predicate::Condition(cond) | Predicate::Not(cond) => {
                    self.u8(if matches!(node, Predicate::Not(_)) { 2 } else { 1 });
                    self.field(&cond.field);
                    self.str(cond.operator.as_str());
                    self.u8(u8::from(cond.case_sensitive));
                    self.u64(cond.operands.len() as u64);
                    for operand in &cond.operands {
                        self.value(operand);
                    }
                }
                Predicate::And(children) | Predicate::Or(children) => {
                    self.u8(if matches!(node, Predicate::And(_)) { 3 } else { 4 });
                    self.u64(children.len() as u64);
                    stack.extend(children.iter().rev());
                }
            }
        }
    }

    fn optional_predicate(&mut self, pred: Option<&Predicate>) {
        match pred {
            Some(pred) => {
                self.u8(T_SOME);
                self.predicate(pred);
            }
            None => self.u8(T_NONE),
        }
    }
}

fn fingerprint(query: &CanonicalQuery) -> Fingerprint {
    let mut out = CanonicalBytes::default();
    out.u8(T_ENTITY);
    out.str(&query.entity);

    out.u8(T_FILTER);
    out.optional_predicate(query.filter.as_ref());

    out.u8(T_INCLUDE);
    out.field_set(&query.include);
    out.u8(T_EXCLUDE);
    out.field_set(&query.exclude);

    out.u8(T_SORT);
    out.u64(query.sort.len() as u64);
    for sort in &query.sort {
        out.field(&sort.field);
        out.u8(match sort.direction {
            Direction::Asc => 0,
            Direction::Desc => 1,
        });
        out.u8(match sort.nulls {
            NullPlacement::First => 0,
            NullPlacement::Last => 1,
        });
    }

    out.u8(T_WINDOW);
    match &query.window {
        Window::Unbounded => out.u8(0),
        Window::Offset { offset, limit } => {
            out.u8(1);
            out.u64(*offset);
            out.u64(u64::from(*limit));
        }
        Window::After { keys, limit } => {
            out.u8(2);
            out.u64(keys.len() as u64);
            for key in keys {
                out.value(key);
            }
            out.u64(u64::from(*limit));
        }
    }

    out.u8(T_AGGREGATION);
    match &query.aggregation {
        None => out.u8(T_NONE),
        Some(agg) => {
            out.u8(T_SOME);
            out.field_set(&agg.group_by);
            out.u64(agg.aggregates.len() as u64);
            for a in &agg.aggregates {
                out.str(a.function.as_str());
                match &a.field {
                    Some(field) => {
                        out.u8(T_SOME);
                        out.field(field);
                    }
                    None => out.u8(T_NONE),
                }
                out.str(&a.alias);
                match a.percentile {
                    Some(rank) => {
                        out.u8(T_SOME);
                        out.u64(rank.to_bits());
                    }
                    None => out.u8(T_NONE),
                }
            }
            out.optional_predicate(agg.having.as_ref());
        }
    }

    out.u8(T_JOINS);
    out.u64(query.joins.len() as u64);
    for join in &query.joins {
        out.str(&join.entity);
        out.str(&join.alias);
        out.str(join.join_type.as_str());
        out.field(&join.left_key);
        out.field(&join.right_key);
    }

    out.u8(T_OPTIONS);
    out.u8(u8::from(query.count_total));
    out.u8(match query.consistency {
        Consistency::Eventual => 0,
        Consistency::Strong => 1,
        Consistency::Linearizable => 2,
    });

    Fingerprint(xxh3_128(&out.buf))
}
