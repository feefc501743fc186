//! Logical query plan built from the canonical query before physical
//! lowering.
//!
//! The shape is fixed: `Scan → Filter → Join* → Filter → Aggregate →
//! Filter(HAVING) → Sort → Project → Limit`, with optional stages omitted.
//! Filter conjuncts are placed as low as they can go: conjuncts over the base
//! entity sit directly above its scan, conjuncts over a single INNER-joined
//! alias sit above that alias's scan, and everything else stays above the
//! joins.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::query::ast::JoinType;
use crate::query::canonical::{
    CanonicalAggregate, CanonicalJoin, CanonicalQuery, CanonicalSort, Window,
};
use crate::query::predicate::Predicate;
use crate::query::schema::{FieldRef, FieldSource};

/// Deterministic node identifier; the root is always 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Clause a filter node evaluates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterStage {
    /// Row filter before aggregation.
    Where,
    /// Group filter after aggregation.
    Having,
}

/// Logical operator tree for a query.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LogicalPlan {
    /// The root node of the logical plan tree.
    pub root: PlanNode,
}

impl LogicalPlan {
    /// Creates a plan and assigns node ids in pre-order.
    pub fn new(mut root: PlanNode) -> Self {
        assign_ids(&mut root);
        Self { root }
    }

    /// Every node in pre-order (ascending id).
    pub fn nodes(&self) -> Vec<&PlanNode> {
        let mut out = Vec::new();
        let mut stack = vec![&self.root];
        while let Some(node) = stack.pop() {
            out.push(node);
            stack.extend(node.inputs.iter().rev());
        }
        out
    }
}

/// Node within the logical plan tree.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PlanNode {
    /// Pre-order id.
    pub id: NodeId,
    /// The logical operator at this node.
    pub op: LogicalOp,
    /// Child nodes that provide input to this operator.
    pub inputs: Vec<PlanNode>,
}

impl PlanNode {
    /// Creates a new plan node with no inputs.
    pub fn new(op: LogicalOp) -> Self {
        Self {
            id: NodeId(0),
            op,
            inputs: Vec::new(),
        }
    }

    /// Creates a new plan node with the given inputs.
    pub fn with_inputs(op: LogicalOp, inputs: Vec<PlanNode>) -> Self {
        Self {
            id: NodeId(0),
            op,
            inputs,
        }
    }
}

/// Logical operators available prior to physical selection.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LogicalOp {
    /// Reads every row of an entity.
    Scan {
        /// Entity to read.
        entity: String,
        /// Join alias when this scan feeds the right side of a join.
        alias: Option<String>,
    },
    /// Keeps rows matching a predicate.
    Filter {
        /// Predicate in negation-normal form.
        predicate: Predicate,
        /// Clause the predicate came from.
        stage: FilterStage,
    },
    /// Equi-join of the left input with the right input.
    Join {
        /// Join flavour.
        join_type: JoinType,
        /// Joined entity.
        entity: String,
        /// Alias of the joined entity.
        alias: String,
        /// Key on the left input.
        left_key: Arc<FieldRef>,
        /// Key on the right input.
        right_key: Arc<FieldRef>,
    },
    /// Groups rows and computes aggregates.
    Aggregate {
        /// Group-by fields.
        group_by: Vec<Arc<FieldRef>>,
        /// Aggregate output columns.
        aggregates: Vec<CanonicalAggregate>,
    },
    /// Orders rows.
    Sort {
        /// Sort keys, most significant first.
        keys: Vec<CanonicalSort>,
    },
    /// Restricts the output columns.
    Project {
        /// Included fields; empty means every field.
        include: Vec<Arc<FieldRef>>,
        /// Excluded fields.
        exclude: Vec<Arc<FieldRef>>,
    },
    /// Applies the pagination window.
    Limit {
        /// Row window.
        window: Window,
    },
}

impl LogicalOp {
    /// Operator name used in logs and explain output.
    pub fn name(&self) -> &'static str {
        match self {
            LogicalOp::Scan { .. } => "Scan",
            LogicalOp::Filter { .. } => "Filter",
            LogicalOp::Join { .. } => "Join",
            LogicalOp::Aggregate { .. } => "Aggregate",
            LogicalOp::Sort { .. } => "Sort",
            LogicalOp::Project { .. } => "Project",
            LogicalOp::Limit { .. } => "Limit",
        }
    }
}

fn assign_ids(root: &mut PlanNode) {
    let mut next = 0u32;
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        node.id = NodeId(next);
        next += 1;
        stack.extend(node.inputs.iter_mut().rev());
    }
}

/// Where a filter conjunct is evaluated.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Placement {
    Base,
    Alias(String),
    Residual,
}

fn placement(conjunct: &Predicate, inner_aliases: &[&str]) -> Placement {
    let mut alias: Option<&str> = None;
    let mut base = false;
    for (cond, _) in conjunct.conditions() {
        match &cond.field.source {
            FieldSource::Join { alias: a } => match alias {
                Some(seen) if seen != a => return Placement::Residual,
                _ => alias = Some(a),
            },
            FieldSource::Entity | FieldSource::Aggregate => base = true,
        }
    }
    match (base, alias) {
        (true, Some(_)) => Placement::Residual,
        (_, None) => Placement::Base,
        (false, Some(a)) if inner_aliases.contains(&a) => Placement::Alias(a.to_owned()),
        (false, Some(_)) => Placement::Residual,
    }
}

fn filtered(input: PlanNode, conjuncts: Vec<Predicate>, stage: FilterStage) -> PlanNode {
    match Predicate::from_conjuncts(conjuncts) {
        Some(predicate) => {
            PlanNode::with_inputs(LogicalOp::Filter { predicate, stage }, vec![input])
        }
        None => input,
    }
}

fn join_node(left: PlanNode, join: &CanonicalJoin, right_filter: Vec<Predicate>) -> PlanNode {
    let scan = PlanNode::new(LogicalOp::Scan {
        entity: join.entity.clone(),
        alias: Some(join.alias.clone()),
    });
    let right = filtered(scan, right_filter, FilterStage::Where);
    PlanNode::with_inputs(
        LogicalOp::Join {
            join_type: join.join_type,
            entity: join.entity.clone(),
            alias: join.alias.clone(),
            left_key: Arc::clone(&join.left_key),
            right_key: Arc::clone(&join.right_key),
        },
        vec![left, right],
    )
}

/// Lowers a canonical query into its logical plan.
pub fn plan_logical(query: &CanonicalQuery) -> LogicalPlan {
    let inner_aliases: Vec<&str> = query
        .joins
        .iter()
        .filter(|j| j.join_type == JoinType::Inner)
        .map(|j| j.alias.as_str())
        .collect();

    let mut base = Vec::new();
    let mut per_alias: Vec<(String, Vec<Predicate>)> = Vec::new();
    let mut residual = Vec::new();
    if let Some(filter) = &query.filter {
        for conjunct in filter.conjuncts() {
            match placement(conjunct, &inner_aliases) {
                Placement::Base => base.push(conjunct.clone()),
                Placement::Residual => residual.push(conjunct.clone()),
                Placement::Alias(alias) => match per_alias.iter_mut().find(|(a, _)| *a == alias) {
                    Some((_, list)) => list.push(conjunct.clone()),
                    None => per_alias.push((alias, vec![conjunct.clone()])),
                },
            }
        }
    }

    let scan = PlanNode::new(LogicalOp::Scan {
        entity: query.entity.clone(),
        alias: None,
    });
    let mut node = filtered(scan, base, FilterStage::Where);

    for join in &query.joins {
        let right_filter = per_alias
            .iter()
            .position(|(a, _)| *a == join.alias)
            .map(|idx| per_alias.swap_remove(idx).1)
            .unwrap_or_default();
        node = join_node(node, join, right_filter);
    }
    node = filtered(node, residual, FilterStage::Where);

    if let Some(agg) = &query.aggregation {
        node = PlanNode::with_inputs(
            LogicalOp::Aggregate {
                group_by: agg.group_by.clone(),
                aggregates: agg.aggregates.clone(),
            },
            vec![node],
        );
        if let Some(having) = &agg.having {
            node = filtered(node, vec![having.clone()], FilterStage::Having);
        }
    }

    if !query.sort.is_empty() {
        node = PlanNode::with_inputs(
            LogicalOp::Sort {
                keys: query.sort.clone(),
            },
            vec![node],
        );
    }

    if !query.include.is_empty() || !query.exclude.is_empty() {
        node = PlanNode::with_inputs(
            LogicalOp::Project {
                include: query.include.clone(),
                exclude: query.exclude.clone(),
            },
            vec![node],
        );
    }

    if query.window != Window::Unbounded {
        node = PlanNode::with_inputs(
            LogicalOp::Limit {
                window: query.window.clone(),
            },
            vec![node],
        );
    }

    let plan = LogicalPlan::new(node);
    debug!(
        entity = %query.entity,
        nodes = plan.nodes().len(),
        root = plan.root.op.name(),
        "query.logical.planned"
    );
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Limits;
    use crate::query::ast::{Filter, JoinSpec, Query, SortSpec};
    use crate::query::canonical::build_canonical;
    use crate::query::schema::{EntitySchema, FieldDef, FieldType, InMemorySchema};
    use crate::query::pipeline::Deadline;
    use crate::query::validate::{resolve_query, validate};

    fn canonical(query: &Query) -> CanonicalQuery {
        let registry = InMemorySchema::new()
            .with_entity(
                EntitySchema::new("orders")
                    .with_field(FieldDef::new("customer_id", FieldType::Integer).indexed())
                    .with_field(FieldDef::new("status", FieldType::String).indexed())
                    .with_field(FieldDef::new("total", FieldType::Float)),
            )
            .with_entity(
                EntitySchema::new("customers")
                    .with_field(FieldDef::new("id", FieldType::Integer).indexed())
                    .with_field(FieldDef::new("tier", FieldType::String)),
            );
        let limits = Limits::default();
        let resolved =
            resolve_query(query, &registry, &limits, &Deadline::none()).expect("resolves");
        build_canonical(validate(resolved, &registry, &limits).expect("valid"))
    }

    fn shape(plan: &LogicalPlan) -> Vec<(u32, &'static str)> {
        plan.nodes().iter().map(|n| (n.id.0, n.op.name())).collect()
    }

    #[test]
    fn fixed_stage_order_with_preorder_ids() {
        let mut query = Query::new("orders");
        query.filter = Some(Filter::eq("status", "open"));
        query.sort = vec![SortSpec::desc("total")];
        query.projection.include = vec!["total".into()];
        let plan = plan_logical(&canonical(&query));
        assert_eq!(
            shape(&plan),
            vec![
                (0, "Limit"),
                (1, "Project"),
                (2, "Sort"),
                (3, "Filter"),
                (4, "Scan")
            ]
        );
    }

    #[test]
    fn planning_is_idempotent() {
        let mut query = Query::new("orders");
        query.filter = Some(Filter::and([
            Filter::eq("status", "open"),
            Filter::gt("total", 10_i64),
        ]));
        let canonical = canonical(&query);
        assert_eq!(plan_logical(&canonical), plan_logical(&canonical));
    }

    #[test]
    fn conjuncts_are_placed_by_the_entities_they_touch() {
        let mut query = Query::new("orders");
        query.joins = vec![JoinSpec::inner("customers", "c", "customer_id", "id")];
        query.filter = Some(Filter::and([
            Filter::eq("status", "open"),
            Filter::eq("c.tier", "gold"),
            Filter::or([Filter::gt("total", 100_i64), Filter::eq("c.tier", "vip")]),
        ]));
        let plan = plan_logical(&canonical(&query));
        assert_eq!(
            shape(&plan),
            vec![
                (0, "Limit"),
                (1, "Filter"),
                (2, "Join"),
                (3, "Filter"),
                (4, "Scan"),
                (5, "Filter"),
                (6, "Scan")
            ]
        );
        let nodes = plan.nodes();
        match &nodes[5].op {
            LogicalOp::Filter { predicate, .. } => {
                assert_eq!(predicate.conditions()[0].0.field.display_name(), "c.tier");
            }
            other => panic!("unexpected op: {other:?}"),
        }
        match &nodes[6].op {
            LogicalOp::Scan { alias, .. } => assert_eq!(alias.as_deref(), Some("c")),
            other => panic!("unexpected op: {other:?}"),
        }
    }

    #[test]
    fn left_join_conjuncts_stay_above_the_join() {
        let mut query = Query::new("orders");
        query.joins = vec![JoinSpec::inner("customers", "c", "customer_id", "id").left_outer()];
        query.filter = Some(Filter::eq("c.tier", "gold"));
        let plan = plan_logical(&canonical(&query));
        assert_eq!(
            shape(&plan),
            vec![(0, "Limit"), (1, "Filter"), (2, "Join"), (3, "Scan"), (4, "Scan")]
        );
    }
}
