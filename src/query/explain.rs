//! Explain tree describing a physical plan.
//!
//! Every node carries its operator name, where it runs, the cost estimates,
//! and a flat list of operator details. Details that echo client literals
//! (predicates, cursor keys) are flagged so [`ExplainNode::redact`] can mask
//! them before the tree leaves a trust boundary.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::query::ast::Direction;
use crate::query::canonical::{CanonicalAggregate, CanonicalSort, NullPlacement, Window};
use crate::query::physical::{JoinKeys, PhysicalNode, PhysicalOp, PhysicalPlan};
use crate::query::schema::FieldRef;

const REDACTED: &str = "<redacted>";

/// Explain node representing an operator with its estimates.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExplainNode {
    /// Physical operator name.
    pub node_type: String,
    /// Where the operator runs, plus the driving index for index scans.
    pub strategy: String,
    /// Estimated output rows.
    pub estimated_rows: f64,
    /// Estimated cumulative cost.
    pub estimated_cost: f64,
    /// Operator details.
    pub details: Vec<ExplainProp>,
    /// Input operators.
    pub children: Vec<ExplainNode>,
}

/// Single property associated with an [`ExplainNode`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExplainProp {
    /// Property key.
    pub key: String,
    /// Property value serialized for display.
    pub value: String,
    /// Whether this property contains literal data that may be redacted.
    pub redactable: bool,
}

impl ExplainProp {
    fn plain(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            redactable: false,
        }
    }

    fn literal(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            redactable: true,
        }
    }
}

impl ExplainNode {
    /// Value of the first detail named `key`.
    pub fn detail(&self, key: &str) -> Option<&str> {
        self.details
            .iter()
            .find(|prop| prop.key == key)
            .map(|prop| prop.value.as_str())
    }

    /// Copy of the tree with every literal-bearing detail masked.
    pub fn redact(&self) -> ExplainNode {
        let mut out = self.clone();
        let mut stack = vec![&mut out];
        while let Some(node) = stack.pop() {
            for prop in node.details.iter_mut().filter(|p| p.redactable) {
                prop.value = REDACTED.to_owned();
            }
            stack.extend(node.children.iter_mut());
        }
        out
    }

    /// JSON rendering of the tree.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl fmt::Display for ExplainNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut stack = vec![(self, 0usize)];
        while let Some((node, depth)) = stack.pop() {
            write!(
                f,
                "{:indent$}{} [{}] rows={:.1} cost={:.2}",
                "",
                node.node_type,
                node.strategy,
                node.estimated_rows,
                node.estimated_cost,
                indent = depth * 2
            )?;
            for prop in &node.details {
                write!(f, " {}={}", prop.key, prop.value)?;
            }
            writeln!(f)?;
            stack.extend(node.children.iter().rev().map(|child| (child, depth + 1)));
        }
        Ok(())
    }
}

/// Builds the explain tree of `plan`.
pub fn explain_plan(plan: &PhysicalPlan) -> ExplainNode {
    enum Task<'p> {
        Visit(&'p PhysicalNode),
        Build(&'p PhysicalNode),
    }
    let mut tasks = vec![Task::Visit(&plan.root)];
    let mut built: Vec<ExplainNode> = Vec::new();
    while let Some(task) = tasks.pop() {
        match task {
            Task::Visit(node) => {
                tasks.push(Task::Build(node));
                tasks.extend(node.inputs.iter().rev().map(Task::Visit));
            }
            Task::Build(node) => {
                let children = built.split_off(built.len() - node.inputs.len());
                built.push(ExplainNode {
                    node_type: node.op.name().to_owned(),
                    strategy: node.strategy.to_string(),
                    estimated_rows: node.strategy.estimated_rows,
                    estimated_cost: node.strategy.estimated_cost,
                    details: op_props(&node.op),
                    children,
                });
            }
        }
    }
    built.pop().unwrap_or_else(|| ExplainNode {
        node_type: plan.root.op.name().to_owned(),
        strategy: plan.root.strategy.to_string(),
        estimated_rows: plan.root.strategy.estimated_rows,
        estimated_cost: plan.root.strategy.estimated_cost,
        details: Vec::new(),
        children: Vec::new(),
    })
}

fn op_props(op: &PhysicalOp) -> Vec<ExplainProp> {
    match op {
        PhysicalOp::FullScan { entity, alias } => {
            let mut props = vec![ExplainProp::plain("entity", entity.clone())];
            if let Some(alias) = alias {
                props.push(ExplainProp::plain("alias", alias.clone()));
            }
            props
        }
        PhysicalOp::IndexScan {
            entity,
            alias,
            index,
            field,
            predicate,
            selectivity,
        } => {
            let mut props = vec![ExplainProp::plain("entity", entity.clone())];
            if let Some(alias) = alias {
                props.push(ExplainProp::plain("alias", alias.clone()));
            }
            props.extend([
                ExplainProp::plain("index", index.clone()),
                ExplainProp::plain("field", field.display_name()),
                ExplainProp::literal("predicate", predicate.to_string()),
                ExplainProp::plain("selectivity", fmt_selectivity(*selectivity)),
            ]);
            props
        }
        PhysicalOp::Filter {
            predicate,
            stage,
            selectivity,
        } => vec![
            ExplainProp::plain("stage", format!("{stage:?}").to_lowercase()),
            ExplainProp::literal("predicate", predicate.to_string()),
            ExplainProp::plain("selectivity", fmt_selectivity(*selectivity)),
        ],
        PhysicalOp::BackendJoin(keys)
        | PhysicalOp::HashJoin(keys)
        | PhysicalOp::NestedLoopJoin(keys) => join_props(keys),
        PhysicalOp::Aggregate {
            group_by,
            aggregates,
        } => vec![
            ExplainProp::plain("group_by", field_list(group_by)),
            ExplainProp::plain(
                "aggregates",
                aggregates
                    .iter()
                    .map(describe_aggregate)
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
        ],
        PhysicalOp::Sort { keys } => vec![ExplainProp::plain(
            "keys",
            keys.iter().map(describe_sort).collect::<Vec<_>>().join(", "),
        )],
        PhysicalOp::Project { include, exclude } => {
            let mut props = Vec::new();
            if !include.is_empty() {
                props.push(ExplainProp::plain("include", field_list(include)));
            }
            if !exclude.is_empty() {
                props.push(ExplainProp::plain("exclude", field_list(exclude)));
            }
            props
        }
        PhysicalOp::Limit { window } => match window {
            Window::Unbounded => Vec::new(),
            Window::Offset { offset, limit } => vec![
                ExplainProp::plain("offset", offset.to_string()),
                ExplainProp::plain("limit", limit.to_string()),
            ],
            Window::After { keys, limit } => vec![
                ExplainProp::literal(
                    "after",
                    keys.iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", "),
                ),
                ExplainProp::plain("limit", limit.to_string()),
            ],
        },
    }
}

fn join_props(keys: &JoinKeys) -> Vec<ExplainProp> {
    vec![
        ExplainProp::plain("join_type", keys.join_type.as_str()),
        ExplainProp::plain("entity", keys.entity.clone()),
        ExplainProp::plain("alias", keys.alias.clone()),
        ExplainProp::plain(
            "on",
            format!(
                "{} = {}",
                keys.left_key.display_name(),
                keys.right_key.display_name()
            ),
        ),
    ]
}

fn field_list(fields: &[Arc<FieldRef>]) -> String {
    fields
        .iter()
        .map(|f| f.display_name())
        .collect::<Vec<_>>()
        .join(", ")
}

fn describe_aggregate(agg: &CanonicalAggregate) -> String {
    let target = match (&agg.field, agg.percentile) {
        (Some(field), Some(rank)) => format!("{}, {rank}", field.display_name()),
        (Some(field), None) => field.display_name(),
        (None, _) => "*".to_owned(),
    };
    format!("{}({target}) AS {}", agg.function, agg.alias)
}

fn describe_sort(key: &CanonicalSort) -> String {
    let direction = match key.direction {
        Direction::Asc => "ASC",
        Direction::Desc => "DESC",
    };
    let nulls = match key.nulls {
        NullPlacement::First => "NULLS FIRST",
        NullPlacement::Last => "NULLS LAST",
    };
    format!("{} {direction} {nulls}", key.field.display_name())
}

fn fmt_selectivity(value: f64) -> String {
    format!("{:.4}", value.clamp(0.0, 1.0))
}
