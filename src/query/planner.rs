//! Capability-aware physical planner.
//!
//! Lowers a [`LogicalPlan`] bottom-up with an explicit work stack. A `WHERE`
//! filter sitting directly on a scan is lowered together with the scan: each
//! top-level conjunct the backend can evaluate on indexed fields is folded
//! into an [`PhysicalOp::IndexScan`], and the remaining conjuncts form a
//! single in-memory [`PhysicalOp::Filter`] above it. Every other operator is
//! pushed to the backend only when its input already runs there and the
//! backend supports it.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::config::CompilerConfig;
use crate::error::QueryError;
use crate::query::capabilities::{BackendCapabilities, IndexDescriptor};
use crate::query::cost::Estimator;
use crate::query::errors::PlanningError;
use crate::query::logical::{FilterStage, LogicalOp, LogicalPlan, NodeId, PlanNode};
use crate::query::physical::{
    AccessMethod, JoinKeys, PhysicalNode, PhysicalOp, PhysicalPlan, Strategy,
};
use crate::query::predicate::Predicate;
use crate::query::schema::{FieldRef, FieldSource};

/// Lowers `logical` for `backend`.
pub fn plan_physical(
    logical: &LogicalPlan,
    backend: &str,
    capabilities: &dyn BackendCapabilities,
    config: &CompilerConfig,
) -> Result<PhysicalPlan, QueryError> {
    let mut planner = PhysicalPlanner::new(logical, backend, capabilities, config)?;
    planner.plan(logical)
}

/// Planner state for one query: capability lookups and cached catalog facts.
pub struct PhysicalPlanner<'a> {
    backend: &'a str,
    capabilities: &'a dyn BackendCapabilities,
    estimator: Estimator<'a>,
    indexes: BTreeMap<String, Vec<IndexDescriptor>>,
}

struct PushedConjunct {
    predicate: Predicate,
    selectivity: f64,
    index: IndexDescriptor,
    field: Arc<FieldRef>,
}

enum Task<'p> {
    Visit(&'p PlanNode),
    Build(&'p PlanNode),
}

impl<'a> PhysicalPlanner<'a> {
    /// Loads statistics and indexes for every entity `logical` scans.
    pub fn new(
        logical: &LogicalPlan,
        backend: &'a str,
        capabilities: &'a dyn BackendCapabilities,
        config: &'a CompilerConfig,
    ) -> Result<Self, QueryError> {
        let mut stats = BTreeMap::new();
        let mut indexes = BTreeMap::new();
        for node in logical.nodes() {
            if let LogicalOp::Scan { entity, .. } = &node.op {
                if indexes.contains_key(entity) {
                    continue;
                }
                if let Some(entity_stats) = capabilities.statistics(backend, entity)? {
                    stats.insert(entity.clone(), entity_stats);
                }
                indexes.insert(entity.clone(), capabilities.indexes_for(backend, entity)?);
            }
        }
        Ok(Self {
            backend,
            capabilities,
            estimator: Estimator::new(&config.selectivity, &config.cost, stats),
            indexes,
        })
    }

    /// Lowers the whole plan.
    pub fn plan(&mut self, logical: &LogicalPlan) -> Result<PhysicalPlan, QueryError> {
        let mut tasks = vec![Task::Visit(&logical.root)];
        let mut built: Vec<PhysicalNode> = Vec::new();
        while let Some(task) = tasks.pop() {
            match task {
                Task::Visit(node) => {
                    if let Some(scan) = scan_under_where(node) {
                        built.push(self.lower_access(scan, Some(node))?);
                        continue;
                    }
                    tasks.push(Task::Build(node));
                    tasks.extend(node.inputs.iter().rev().map(Task::Visit));
                }
                Task::Build(node) => {
                    let inputs = built.split_off(built.len() - node.inputs.len());
                    built.push(self.lower_node(node, inputs)?);
                }
            }
        }
        let root = built.pop().ok_or_else(|| PlanningError::InvalidPlan {
            reason: "logical plan produced no physical root".into(),
        })?;
        debug!(
            backend = self.backend,
            root = root.op.name(),
            rows = root.strategy.estimated_rows,
            cost = root.strategy.estimated_cost,
            "query.physical.planned"
        );
        Ok(PhysicalPlan::new(self.backend, root))
    }

    fn index_for(&self, field: &FieldRef) -> Option<&IndexDescriptor> {
        if field.source == FieldSource::Aggregate {
            return None;
        }
        self.indexes
            .get(&field.entity)?
            .iter()
            .find(|index| index.path == field.path)
    }

    /// Index covering every leaf of `conjunct`, keyed by its first leaf.
    fn pushable(
        &self,
        conjunct: &Predicate,
    ) -> Result<Option<(IndexDescriptor, Arc<FieldRef>)>, QueryError> {
        let leaves = conjunct.conditions();
        let mut driving = None;
        for (cond, _) in &leaves {
            let supported = self.capabilities.supports_filter(
                self.backend,
                cond.operator,
                &cond.field.field_type,
            )?;
            let Some(index) = self.index_for(&cond.field).filter(|_| supported) else {
                return Ok(None);
            };
            if driving.is_none() {
                driving = Some((index.clone(), Arc::clone(&cond.field)));
            }
        }
        Ok(driving)
    }

    fn lower_access(
        &self,
        scan: &PlanNode,
        filter: Option<&PlanNode>,
    ) -> Result<PhysicalNode, QueryError> {
        let LogicalOp::Scan { entity, alias } = &scan.op else {
            return Err(invalid("access path lowered from a non-scan node"));
        };
        let model = self.estimator.model();
        let rows = self.estimator.row_count(entity);
        let (predicate, filter_id) = match filter.map(|node| (&node.op, node.id)) {
            Some((LogicalOp::Filter { predicate, .. }, id)) => (Some(predicate), Some(id)),
            _ => (None, None),
        };

        let mut pushed: Vec<PushedConjunct> = Vec::new();
        let mut residual: Vec<Predicate> = Vec::new();
        for conjunct in predicate.map(|p| p.conjuncts()).unwrap_or_default() {
            match self.pushable(conjunct)? {
                Some((index, field)) => pushed.push(PushedConjunct {
                    selectivity: self.estimator.selectivity(conjunct),
                    predicate: conjunct.clone(),
                    index,
                    field,
                }),
                None => residual.push(conjunct.clone()),
            }
        }

        let mut logical_ids = vec![scan.id];
        let mut node = if pushed.is_empty() {
            // A contradiction reads no rows, so the scan policy does not apply.
            let contradiction = predicate.is_some_and(Predicate::is_never);
            if !contradiction && !self.capabilities.allows_full_scan(self.backend, entity)? {
                return Err(PlanningError::FullScanForbidden {
                    backend: self.backend.to_owned(),
                    entity: entity.clone(),
                }
                .into());
            }
            let scanned = if contradiction { 0.0 } else { rows };
            PhysicalNode::new(
                PhysicalOp::FullScan {
                    entity: entity.clone(),
                    alias: alias.clone(),
                },
                Strategy {
                    access: AccessMethod::Backend,
                    index: None,
                    estimated_rows: scanned,
                    estimated_cost: scanned * model.scan_row_cost,
                },
                logical_ids,
            )
        } else {
            logical_ids.extend(filter_id);
            let mut driving = 0;
            for (idx, candidate) in pushed.iter().enumerate() {
                if candidate.selectivity < pushed[driving].selectivity {
                    driving = idx;
                }
            }
            let selectivity: f64 = pushed.iter().map(|p| p.selectivity).product();
            let estimated_rows = rows * selectivity;
            let index = pushed[driving].index.name.clone();
            let field = Arc::clone(&pushed[driving].field);
            let predicates: Vec<Predicate> = pushed.into_iter().map(|p| p.predicate).collect();
            let folded = predicates.len();
            let predicate = Predicate::from_conjuncts(predicates)
                .ok_or_else(|| invalid("index scan without predicate"))?;
            trace!(entity = %entity, index = %index, folded, "query.physical.index_scan");
            PhysicalNode::new(
                PhysicalOp::IndexScan {
                    entity: entity.clone(),
                    alias: alias.clone(),
                    index: index.clone(),
                    field,
                    predicate,
                    selectivity,
                },
                Strategy {
                    access: AccessMethod::Backend,
                    index: Some(index),
                    estimated_rows,
                    estimated_cost: estimated_rows * model.index_row_cost,
                },
                logical_ids,
            )
        };

        if let Some(predicate) = Predicate::from_conjuncts(residual) {
            debug!(
                backend = self.backend,
                entity = %entity,
                conjuncts = predicate.conjuncts().len(),
                "query.physical.fallback"
            );
            node = self.memory_filter(
                predicate,
                FilterStage::Where,
                filter_id.into_iter().collect(),
                node,
            );
        }
        Ok(node)
    }

    fn memory_filter(
        &self,
        predicate: Predicate,
        stage: FilterStage,
        logical_ids: Vec<NodeId>,
        input: PhysicalNode,
    ) -> PhysicalNode {
        let selectivity = self.estimator.selectivity(&predicate);
        let in_rows = input.strategy.estimated_rows;
        let strategy = Strategy {
            access: AccessMethod::InMemory,
            index: None,
            estimated_rows: in_rows * selectivity,
            estimated_cost: input.strategy.estimated_cost
                + in_rows * self.estimator.model().memory_row_cost,
        };
        PhysicalNode::with_inputs(
            PhysicalOp::Filter {
                predicate,
                stage,
                selectivity,
            },
            strategy,
            logical_ids,
            vec![input],
        )
    }

    fn lower_node(
        &self,
        node: &PlanNode,
        mut inputs: Vec<PhysicalNode>,
    ) -> Result<PhysicalNode, QueryError> {
        let ids = vec![node.id];
        if let LogicalOp::Scan { .. } = &node.op {
            return self.lower_access(node, None);
        }
        if let LogicalOp::Join {
            join_type,
            entity,
            alias,
            left_key,
            right_key,
        } = &node.op
        {
            let (Some(right), Some(left)) = (inputs.pop(), inputs.pop()) else {
                return Err(invalid("join needs two inputs"));
            };
            let keys = JoinKeys {
                join_type: *join_type,
                entity: entity.clone(),
                alias: alias.clone(),
                left_key: Arc::clone(left_key),
                right_key: Arc::clone(right_key),
            };
            return self.lower_join(keys, ids, left, right);
        }

        let input = inputs.pop().ok_or_else(|| invalid("operator without input"))?;
        let model = self.estimator.model();
        let in_rows = input.strategy.estimated_rows;
        let in_cost = input.strategy.estimated_cost;
        let resident = input.strategy.is_backend();

        let (op, backend, rows, cost) = match &node.op {
            LogicalOp::Filter { predicate, stage } => {
                return Ok(self.memory_filter(predicate.clone(), *stage, ids, input));
            }
            LogicalOp::Aggregate {
                group_by,
                aggregates,
            } => {
                let mut backend = resident;
                for agg in aggregates {
                    backend = backend
                        && self
                            .capabilities
                            .supports_aggregate(self.backend, agg.function)?;
                }
                let rows = self.estimator.group_rows(in_rows, group_by.len());
                let cost =
                    in_cost + self.estimator.discounted(in_rows * model.memory_row_cost, backend);
                let op = PhysicalOp::Aggregate {
                    group_by: group_by.clone(),
                    aggregates: aggregates.clone(),
                };
                (op, backend, rows, cost)
            }
            LogicalOp::Sort { keys } => {
                let mut backend = resident && self.capabilities.supports_sort(self.backend)?;
                if keys.iter().any(|k| k.field.source == FieldSource::Aggregate) {
                    backend = false;
                }
                if backend && self.capabilities.requires_sort_index(self.backend)? {
                    if let Some(key) = keys.iter().find(|k| self.index_for(&k.field).is_none()) {
                        return Err(PlanningError::SortIndexRequired {
                            backend: self.backend.to_owned(),
                            field: key.field.display_name(),
                        }
                        .into());
                    }
                }
                let sort_cost = self.estimator.sort_cost(in_rows);
                let cost = in_cost + self.estimator.discounted(sort_cost, backend);
                (PhysicalOp::Sort { keys: keys.clone() }, backend, in_rows, cost)
            }
            LogicalOp::Project { include, exclude } => {
                let cost = in_cost
                    + self
                        .estimator
                        .discounted(in_rows * model.memory_row_cost, resident);
                let op = PhysicalOp::Project {
                    include: include.clone(),
                    exclude: exclude.clone(),
                };
                (op, resident, in_rows, cost)
            }
            LogicalOp::Limit { window } => {
                let rows = window
                    .limit()
                    .map(|limit| in_rows.min(f64::from(limit)))
                    .unwrap_or(in_rows);
                let op = PhysicalOp::Limit {
                    window: window.clone(),
                };
                (op, resident, rows, in_cost)
            }
            LogicalOp::Scan { .. } | LogicalOp::Join { .. } => {
                return Err(invalid("scan or join reached the unary lowering path"));
            }
        };
        if resident && !backend {
            debug!(backend = self.backend, op = op.name(), "query.physical.fallback");
        }
        let strategy = Strategy {
            access: if backend {
                AccessMethod::Backend
            } else {
                AccessMethod::InMemory
            },
            index: None,
            estimated_rows: rows,
            estimated_cost: cost,
        };
        Ok(PhysicalNode::with_inputs(op, strategy, ids, vec![input]))
    }

    fn lower_join(
        &self,
        keys: JoinKeys,
        ids: Vec<NodeId>,
        left: PhysicalNode,
        right: PhysicalNode,
    ) -> Result<PhysicalNode, QueryError> {
        let model = self.estimator.model();
        let (l, r) = (&left.strategy, &right.strategy);
        let rows = self.estimator.join_rows(l.estimated_rows, r.estimated_rows);
        let inputs_cost = l.estimated_cost + r.estimated_cost;
        let native = l.is_backend()
            && r.is_backend()
            && self.capabilities.supports_join(self.backend, keys.join_type)?;
        let (op, access, cost) = if native {
            let cost = inputs_cost
                + self.estimator.discounted(
                    (l.estimated_rows + r.estimated_rows) * model.hash_join_row_cost,
                    true,
                );
            (PhysicalOp::BackendJoin(keys), AccessMethod::Backend, cost)
        } else if r.estimated_rows < model.nested_loop_threshold as f64 {
            let cost = inputs_cost + l.estimated_rows * r.estimated_rows * model.memory_row_cost;
            (PhysicalOp::NestedLoopJoin(keys), AccessMethod::InMemory, cost)
        } else {
            let cost =
                inputs_cost + (l.estimated_rows + r.estimated_rows) * model.hash_join_row_cost;
            (PhysicalOp::HashJoin(keys), AccessMethod::InMemory, cost)
        };
        if !native {
            debug!(backend = self.backend, op = op.name(), "query.physical.fallback");
        }
        Ok(PhysicalNode::with_inputs(
            op,
            Strategy {
                access,
                index: None,
                estimated_rows: rows,
                estimated_cost: cost,
            },
            ids,
            vec![left, right],
        ))
    }
}

fn scan_under_where(node: &PlanNode) -> Option<&PlanNode> {
    match (&node.op, node.inputs.as_slice()) {
        (
            LogicalOp::Filter {
                stage: FilterStage::Where,
                ..
            },
            [scan],
        ) if matches!(scan.op, LogicalOp::Scan { .. }) => Some(scan),
        _ => None,
    }
}

fn invalid(reason: &str) -> QueryError {
    PlanningError::InvalidPlan {
        reason: reason.to_owned(),
    }
    .into()
}
