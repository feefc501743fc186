//! Selectivity and cost heuristics for physical lowering.
//!
//! Defaults come from the configured [`SelectivityTable`]; backend statistics
//! override them where they say something more precise (equality and null
//! fractions, row counts).

use std::collections::BTreeMap;

use crate::config::{CostModel, SelectivityTable};
use crate::query::ast::Operator;
use crate::query::capabilities::{EntityStats, FieldStats};
use crate::query::predicate::{Condition, Predicate};
use crate::query::schema::FieldSource;

/// Fraction of input rows surviving a grouping step when nothing better is known.
const GROUP_REDUCTION: f64 = 0.1;

/// Estimates selectivities and operator costs for one planning pass.
pub struct Estimator<'a> {
    table: &'a SelectivityTable,
    model: &'a CostModel,
    stats: BTreeMap<String, EntityStats>,
}

impl<'a> Estimator<'a> {
    /// Estimator over the supplied per-entity statistics.
    pub fn new(
        table: &'a SelectivityTable,
        model: &'a CostModel,
        stats: BTreeMap<String, EntityStats>,
    ) -> Self {
        Self {
            table,
            model,
            stats,
        }
    }

    /// Cost weights.
    pub fn model(&self) -> &CostModel {
        self.model
    }

    /// Estimated rows of `entity`.
    pub fn row_count(&self, entity: &str) -> f64 {
        self.stats
            .get(entity)
            .map(|s| s.row_count)
            .unwrap_or(self.model.default_row_count) as f64
    }

    fn field_stats(&self, cond: &Condition) -> Option<(&EntityStats, &FieldStats)> {
        if cond.field.source == FieldSource::Aggregate {
            return None;
        }
        let entity = self.stats.get(&cond.field.entity)?;
        let field = entity.fields.get(&cond.field.path)?;
        Some((entity, field))
    }

    fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.table.min, 1.0)
    }

    /// Selectivity of a single condition, complemented when negated.
    pub fn condition(&self, cond: &Condition, negated: bool) -> f64 {
        let t = self.table;
        let stats = self.field_stats(cond);
        let per_value = |default: f64| match stats {
            Some((_, field)) if field.distinct_count > 0 => 1.0 / field.distinct_count as f64,
            _ => default,
        };
        let null_fraction = || match stats {
            Some((entity, field)) if entity.row_count > 0 => {
                Some(field.null_count as f64 / entity.row_count as f64)
            }
            _ => None,
        };
        let operands = cond.operands.len().max(1) as f64;
        let raw = match cond.operator {
            Operator::Eq => per_value(t.eq),
            Operator::Ne => match stats {
                Some(_) => 1.0 - per_value(t.eq),
                None => t.ne,
            },
            Operator::Lt | Operator::Lte | Operator::Gt | Operator::Gte => t.range,
            Operator::In => (per_value(t.in_per_value) * operands).min(1.0),
            Operator::NotIn => match stats {
                Some(_) => 1.0 - (per_value(t.in_per_value) * operands).min(1.0),
                None => t.not_in,
            },
            Operator::Contains => t.contains,
            Operator::StartsWith => t.starts_with,
            Operator::EndsWith => t.ends_with,
            Operator::Matches => t.matches,
            Operator::IsNull => null_fraction().unwrap_or(t.is_null),
            Operator::IsNotNull => null_fraction().map(|f| 1.0 - f).unwrap_or(t.is_not_null),
            Operator::ArrayContains => t.array_contains,
            Operator::ArrayContainsAny => (t.array_contains_any_per_value * operands).min(1.0),
        };
        let value = if negated { 1.0 - raw } else { raw };
        self.clamp(value)
    }

    /// Selectivity of a predicate: AND multiplies, OR combines as `1 - Π(1 - s)`.
    pub fn selectivity(&self, predicate: &Predicate) -> f64 {
        enum Step<'p> {
            Enter(&'p Predicate),
            And(usize),
            Or(usize),
        }
        let mut values: Vec<f64> = Vec::new();
        let mut steps = vec![Step::Enter(predicate)];
        while let Some(step) = steps.pop() {
            match step {
                Step::Enter(Predicate::Condition(cond)) => values.push(self.condition(cond, false)),
                Step::Enter(Predicate::Not(cond)) => values.push(self.condition(cond, true)),
                Step::Enter(Predicate::And(children)) => {
                    steps.push(Step::And(children.len()));
                    steps.extend(children.iter().map(Step::Enter));
                }
                Step::Enter(Predicate::Or(children)) => {
                    steps.push(Step::Or(children.len()));
                    steps.extend(children.iter().map(Step::Enter));
                }
                Step::And(arity) => {
                    let parts = values.split_off(values.len() - arity);
                    values.push(parts.iter().product());
                }
                Step::Or(arity) => {
                    let parts = values.split_off(values.len() - arity);
                    let remaining: f64 = parts.iter().map(|s| 1.0 - s).product();
                    values.push(1.0 - remaining);
                }
            }
        }
        // Or([]) is FALSE and must estimate to zero rows, not the floor.
        match values.pop() {
            Some(value) if predicate.is_never() => value,
            Some(value) => self.clamp(value),
            None => 1.0,
        }
    }

    /// Rows surviving a grouping of `input_rows` by `group_keys` fields.
    pub fn group_rows(&self, input_rows: f64, group_keys: usize) -> f64 {
        if group_keys == 0 {
            1.0
        } else {
            (input_rows * GROUP_REDUCTION).max(1.0).min(input_rows.max(1.0))
        }
    }

    /// Output rows of a join.
    pub fn join_rows(&self, left_rows: f64, right_rows: f64) -> f64 {
        left_rows.max(right_rows)
    }

    /// Cost of an `n log n` sort of `rows`.
    pub fn sort_cost(&self, rows: f64) -> f64 {
        let n = rows.max(1.0);
        self.model.sort_row_cost * n * n.log2().max(1.0)
    }

    /// Applies the backend discount when `backend` is true.
    pub fn discounted(&self, cost: f64, backend: bool) -> f64 {
        if backend {
            cost * self.model.backend_discount
        } else {
            cost
        }
    }
}
