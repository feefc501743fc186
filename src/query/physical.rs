//! Physical operator tree selected by the capability-aware planner.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::query::ast::JoinType;
use crate::query::canonical::{CanonicalAggregate, CanonicalSort, Window};
use crate::query::logical::{FilterStage, NodeId};
use crate::query::predicate::Predicate;
use crate::query::schema::FieldRef;

/// Physical plan produced by the planner.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PhysicalPlan {
    /// Backend the plan targets.
    pub backend: String,
    /// The root node of the physical plan tree.
    pub root: PhysicalNode,
}

impl PhysicalPlan {
    /// Creates a new physical plan for `backend`.
    pub fn new(backend: impl Into<String>, root: PhysicalNode) -> Self {
        Self {
            backend: backend.into(),
            root,
        }
    }

    /// Every node in pre-order.
    pub fn nodes(&self) -> Vec<&PhysicalNode> {
        let mut out = Vec::new();
        let mut stack = vec![&self.root];
        while let Some(node) = stack.pop() {
            out.push(node);
            stack.extend(node.inputs.iter().rev());
        }
        out
    }
}

/// Where an operator runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMethod {
    /// Executed natively by the storage backend.
    Backend,
    /// Executed by the engine over materialized rows.
    InMemory,
}

/// How a node is executed and what it is expected to cost.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Strategy {
    /// Backend or in-memory execution.
    pub access: AccessMethod,
    /// Index used by a scan; `None` on a scan means a full scan.
    pub index: Option<String>,
    /// Estimated output rows.
    pub estimated_rows: f64,
    /// Estimated cumulative cost, inputs included.
    pub estimated_cost: f64,
}

impl Strategy {
    /// Whether the node runs inside the backend.
    pub fn is_backend(&self) -> bool {
        self.access == AccessMethod::Backend
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.access {
            AccessMethod::Backend => f.write_str("backend")?,
            AccessMethod::InMemory => f.write_str("in_memory")?,
        }
        if let Some(index) = &self.index {
            write!(f, "/index={index}")?;
        }
        Ok(())
    }
}

/// Equi-join keys shared by every join operator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct JoinKeys {
    /// Join flavour.
    pub join_type: JoinType,
    /// Joined entity.
    pub entity: String,
    /// Alias of the joined entity.
    pub alias: String,
    /// Key on the left input.
    pub left_key: Arc<FieldRef>,
    /// Key on the right input.
    pub right_key: Arc<FieldRef>,
}

/// Physical operators.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PhysicalOp {
    /// Reads every row of an entity.
    FullScan {
        /// Entity to read.
        entity: String,
        /// Join alias for right-side scans.
        alias: Option<String>,
    },
    /// Reads rows through an index with the pushed predicate evaluated by the backend.
    IndexScan {
        /// Entity to read.
        entity: String,
        /// Join alias for right-side scans.
        alias: Option<String>,
        /// Driving index.
        index: String,
        /// Field the driving index covers.
        field: Arc<FieldRef>,
        /// Conjuncts evaluated by the backend.
        predicate: Predicate,
        /// Combined selectivity of the pushed conjuncts.
        selectivity: f64,
    },
    /// Evaluates a predicate over materialized rows.
    Filter {
        /// Predicate to apply.
        predicate: Predicate,
        /// Clause the predicate came from.
        stage: FilterStage,
        /// Estimated selectivity.
        selectivity: f64,
    },
    /// Join executed by the backend.
    BackendJoin(JoinKeys),
    /// In-memory hash join building on the right input.
    HashJoin(JoinKeys),
    /// In-memory nested-loop join for small right inputs.
    NestedLoopJoin(JoinKeys),
    /// Grouping and aggregates.
    Aggregate {
        /// Group-by fields.
        group_by: Vec<Arc<FieldRef>>,
        /// Aggregate output columns.
        aggregates: Vec<CanonicalAggregate>,
    },
    /// Ordering.
    Sort {
        /// Sort keys.
        keys: Vec<CanonicalSort>,
    },
    /// Column restriction.
    Project {
        /// Included fields; empty means every field.
        include: Vec<Arc<FieldRef>>,
        /// Excluded fields.
        exclude: Vec<Arc<FieldRef>>,
    },
    /// Pagination window.
    Limit {
        /// Row window.
        window: Window,
    },
}

impl PhysicalOp {
    /// Operator name reported as `node_type` in explain output.
    pub fn name(&self) -> &'static str {
        match self {
            PhysicalOp::FullScan { .. } => "FullScan",
            PhysicalOp::IndexScan { .. } => "IndexScan",
            PhysicalOp::Filter { .. } => "Filter",
            PhysicalOp::BackendJoin(_) => "BackendJoin",
            PhysicalOp::HashJoin(_) => "HashJoin",
            PhysicalOp::NestedLoopJoin(_) => "NestedLoopJoin",
            PhysicalOp::Aggregate { .. } => "Aggregate",
            PhysicalOp::Sort { .. } => "Sort",
            PhysicalOp::Project { .. } => "Project",
            PhysicalOp::Limit { .. } => "Limit",
        }
    }
}

/// Node within the physical plan tree.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PhysicalNode {
    /// The physical operator at this node.
    pub op: PhysicalOp,
    /// Execution strategy and estimates.
    pub strategy: Strategy,
    /// Logical nodes this operator implements.
    pub logical_ids: Vec<NodeId>,
    /// Child nodes that provide input to this operator.
    pub inputs: Vec<PhysicalNode>,
}

impl PhysicalNode {
    /// Creates a leaf node.
    pub fn new(op: PhysicalOp, strategy: Strategy, logical_ids: Vec<NodeId>) -> Self {
        Self {
            op,
            strategy,
            logical_ids,
            inputs: Vec::new(),
        }
    }

    /// Creates a node with the given inputs.
    pub fn with_inputs(
        op: PhysicalOp,
        strategy: Strategy,
        logical_ids: Vec<NodeId>,
        inputs: Vec<PhysicalNode>,
    ) -> Self {
        Self {
            op,
            strategy,
            logical_ids,
            inputs,
        }
    }
}
