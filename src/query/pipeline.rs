//! Compilation orchestrator.
//!
//! [`QueryCompiler`] drives a client [`Query`] through resolution, validation,
//! canonicalization, logical and physical planning, and explain. Each query
//! pins one snapshot of the schema registry and one of the capability
//! descriptor for its whole compilation, checks its deadline before every
//! stage, and records the lifecycle states it passed through.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::CompilerConfig;
use crate::error::{PipelineError, QueryError, Stage};
use crate::query::ast::Query;
use crate::query::cache::{CacheStats, CachedPlan, PlanCache, PlanKey};
use crate::query::canonical::{build_canonical, CanonicalQuery};
use crate::query::capabilities::BackendCapabilities;
use crate::query::catalog::SharedSnapshot;
use crate::query::errors::{PlanningError, ValidationWarning};
use crate::query::explain::{explain_plan, ExplainNode};
use crate::query::logical::{plan_logical, LogicalPlan};
use crate::query::physical::PhysicalPlan;
use crate::query::planner::plan_physical;
use crate::query::schema::SchemaRegistry;
use crate::query::validate::{resolve_query, validate};

/// Lifecycle of one compilation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum QueryState {
    /// Accepted for compilation.
    Received,
    /// Resolved and validated.
    Validated,
    /// Canonical query built.
    Resolved,
    /// Logical plan built.
    PlannedLogical,
    /// Physical plan built.
    PlannedPhysical,
    /// Explain tree built; the result is ready.
    Ready,
    /// Compilation failed.
    Rejected {
        /// Stage that failed.
        stage: &'static str,
        /// Failure code.
        code: &'static str,
    },
}

impl QueryState {
    fn name(&self) -> &'static str {
        match self {
            QueryState::Received => "RECEIVED",
            QueryState::Validated => "VALIDATED",
            QueryState::Resolved => "RESOLVED",
            QueryState::PlannedLogical => "PLANNED_LOGICAL",
            QueryState::PlannedPhysical => "PLANNED_PHYSICAL",
            QueryState::Ready => "READY",
            QueryState::Rejected { .. } => "REJECTED",
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, QueryState::Ready | QueryState::Rejected { .. })
    }

    fn successor(&self) -> Option<QueryState> {
        match self {
            QueryState::Received => Some(QueryState::Validated),
            QueryState::Validated => Some(QueryState::Resolved),
            QueryState::Resolved => Some(QueryState::PlannedLogical),
            QueryState::PlannedLogical => Some(QueryState::PlannedPhysical),
            QueryState::PlannedPhysical => Some(QueryState::Ready),
            QueryState::Ready | QueryState::Rejected { .. } => None,
        }
    }
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryState::Rejected { stage, code } => write!(f, "REJECTED({stage}: {code})"),
            other => f.write_str(other.name()),
        }
    }
}

/// Refused lifecycle transition.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("illegal query state transition {from} -> {to}")]
pub struct IllegalTransition {
    /// Current state.
    pub from: QueryState,
    /// Requested state.
    pub to: QueryState,
}

/// Ordered record of the states a compilation passed through.
#[derive(Clone, Debug)]
pub struct Lifecycle {
    states: Vec<QueryState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    /// Starts in [`QueryState::Received`].
    pub fn new() -> Self {
        Self {
            states: vec![QueryState::Received],
        }
    }

    /// Current state.
    pub fn current(&self) -> &QueryState {
        // `states` is never empty.
        &self.states[self.states.len() - 1]
    }

    /// Moves to `next` if it is the successor of the current state.
    pub fn advance(&mut self, next: QueryState) -> Result<(), IllegalTransition> {
        let current = self.current();
        if current.successor().as_ref() != Some(&next) {
            return Err(IllegalTransition {
                from: current.clone(),
                to: next,
            });
        }
        self.states.push(next);
        Ok(())
    }

    /// Moves to [`QueryState::Rejected`] from any non-terminal state.
    pub fn reject(&mut self, error: &PipelineError) -> Result<(), IllegalTransition> {
        let next = QueryState::Rejected {
            stage: error.stage.as_str(),
            code: error.code(),
        };
        if self.current().is_terminal() {
            return Err(IllegalTransition {
                from: self.current().clone(),
                to: next,
            });
        }
        self.states.push(next);
        Ok(())
    }

    /// Every state so far, oldest first.
    pub fn states(&self) -> &[QueryState] {
        &self.states
    }

    fn into_states(self) -> Vec<QueryState> {
        self.states
    }
}

/// Compilation time budget.
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    started: Instant,
    budget: Option<Duration>,
}

impl Deadline {
    /// No time limit.
    pub fn none() -> Self {
        Self {
            started: Instant::now(),
            budget: None,
        }
    }

    /// Expires `ms` milliseconds from now.
    pub fn after(ms: u64) -> Self {
        Self {
            started: Instant::now(),
            budget: Some(Duration::from_millis(ms)),
        }
    }

    /// Fails when the budget is spent; `stage` is the stage about to start.
    pub fn check(&self, stage: Stage) -> Result<(), QueryError> {
        match self.budget {
            Some(budget) if self.started.elapsed() >= budget => {
                Err(QueryError::DeadlineExceeded {
                    stage,
                    budget_ms: budget.as_millis() as u64,
                })
            }
            _ => Ok(()),
        }
    }
}

/// Checkpoint consulted whenever compilation enters a stage, including the
/// coercion and normalization work nested inside resolution.
pub trait StageGate {
    /// Fails when `stage` may not start.
    fn enter(&self, stage: Stage) -> Result<(), QueryError>;
}

impl StageGate for Deadline {
    fn enter(&self, stage: Stage) -> Result<(), QueryError> {
        self.check(stage)
    }
}

/// Successful compilation.
#[derive(Clone, Debug)]
pub struct CompiledQuery {
    /// Canonical query.
    pub canonical: CanonicalQuery,
    /// Logical plan.
    pub logical: Arc<LogicalPlan>,
    /// Physical plan for the requested backend.
    pub physical: Arc<PhysicalPlan>,
    /// Explain tree of the physical plan.
    pub explain: Arc<ExplainNode>,
    /// Advisory validation findings.
    pub warnings: Vec<ValidationWarning>,
    /// Lifecycle states, `RECEIVED` through `READY`.
    pub states: Vec<QueryState>,
    /// Whether the plans came from the plan cache.
    pub cache_hit: bool,
}

/// Thread-safe query compiler over shared, refreshable catalogs.
pub struct QueryCompiler {
    config: CompilerConfig,
    schema: Arc<SharedSnapshot<dyn SchemaRegistry>>,
    capabilities: Arc<SharedSnapshot<dyn BackendCapabilities>>,
    cache: PlanCache,
}

impl QueryCompiler {
    /// Compiler owning fresh snapshots of `schema` and `capabilities`.
    pub fn new(
        config: CompilerConfig,
        schema: Arc<dyn SchemaRegistry>,
        capabilities: Arc<dyn BackendCapabilities>,
    ) -> Self {
        Self::with_shared(
            config,
            Arc::new(SharedSnapshot::from_arc("schema", schema)),
            Arc::new(SharedSnapshot::from_arc("capabilities", capabilities)),
        )
    }

    /// Compiler over snapshots shared with other components.
    pub fn with_shared(
        config: CompilerConfig,
        schema: Arc<SharedSnapshot<dyn SchemaRegistry>>,
        capabilities: Arc<SharedSnapshot<dyn BackendCapabilities>>,
    ) -> Self {
        let cache = PlanCache::new(config.plan_cache_capacity);
        Self {
            config,
            schema,
            capabilities,
            cache,
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Swaps the schema registry; returns the new generation.
    pub fn refresh_schema(&self, schema: Arc<dyn SchemaRegistry>) -> u64 {
        self.schema.replace(schema)
    }

    /// Swaps the capability descriptor; returns the new generation.
    pub fn refresh_capabilities(&self, capabilities: Arc<dyn BackendCapabilities>) -> u64 {
        self.capabilities.replace(capabilities)
    }

    /// Current `(schema, capabilities)` snapshot generations.
    pub fn catalog_generations(&self) -> (u64, u64) {
        (self.schema.generation(), self.capabilities.generation())
    }

    /// Plan cache counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Drops every cached plan; counters are kept.
    pub fn clear_plan_cache(&self) {
        let dropped = self.cache.stats().len;
        self.cache.clear();
        info!(dropped, "query.cache.cleared");
    }

    /// Compiles `query` for `backend` under the query's own timeout, falling
    /// back to the configured default.
    pub fn compile(&self, query: &Query, backend: &str) -> Result<CompiledQuery, PipelineError> {
        let deadline = match query.options.timeout_ms.or(self.config.default_timeout_ms) {
            Some(ms) => Deadline::after(ms),
            None => Deadline::none(),
        };
        self.compile_with_deadline(query, backend, deadline)
    }

    /// Compiles `query` for `backend` under an explicit deadline.
    pub fn compile_with_deadline(
        &self,
        query: &Query,
        backend: &str,
        deadline: Deadline,
    ) -> Result<CompiledQuery, PipelineError> {
        let mut lifecycle = Lifecycle::new();
        match self.run(query, backend, deadline, &mut lifecycle) {
            Ok(compiled) => Ok(compiled),
            Err(err) => {
                let mut err = PipelineError::from(err);
                if let Err(illegal) = lifecycle.reject(&err) {
                    warn!(error = %illegal, "query.pipeline.lifecycle");
                }
                warn!(
                    entity = %query.entity,
                    backend,
                    stage = %err.stage,
                    code = err.code(),
                    "query.pipeline.rejected"
                );
                err.states = lifecycle.into_states();
                Err(err)
            }
        }
    }

    fn run(
        &self,
        query: &Query,
        backend: &str,
        deadline: Deadline,
        lifecycle: &mut Lifecycle,
    ) -> Result<CompiledQuery, QueryError> {
        let schema = self.schema.load();
        let capabilities = self.capabilities.load();
        let limits = &self.config.limits;

        let resolved = timed(&deadline, Stage::Resolve, || {
            resolve_query(query, schema.value.as_ref(), limits, &deadline)
        })?;
        let validated = timed(&deadline, Stage::Validate, || {
            validate(resolved, schema.value.as_ref(), limits)
        })?;
        advance(lifecycle, QueryState::Validated)?;
        let warnings = validated.warnings().to_vec();

        let canonical = timed(&deadline, Stage::Build, || Ok(build_canonical(validated)))?;
        advance(lifecycle, QueryState::Resolved)?;

        let key = PlanKey {
            fingerprint: canonical.fingerprint(),
            backend: backend.to_owned(),
            schema_version: (schema.generation, schema.value.epoch()),
            capabilities_version: (capabilities.generation, capabilities.value.epoch()),
        };
        let (plans, cache_hit) = match self.cache.get(&key) {
            Some(plans) => {
                deadline.check(Stage::LogicalPlan)?;
                (plans, true)
            }
            None => {
                let logical =
                    timed(&deadline, Stage::LogicalPlan, || Ok(plan_logical(&canonical)))?;
                let physical = timed(&deadline, Stage::PhysicalPlan, || {
                    plan_physical(&logical, backend, capabilities.value.as_ref(), &self.config)
                })?;
                let explain = timed(&deadline, Stage::Explain, || Ok(explain_plan(&physical)))?;
                let plans = CachedPlan {
                    logical: Arc::new(logical),
                    physical: Arc::new(physical),
                    explain: Arc::new(explain),
                };
                self.cache.insert(key, plans.clone());
                (plans, false)
            }
        };
        advance(lifecycle, QueryState::PlannedLogical)?;
        advance(lifecycle, QueryState::PlannedPhysical)?;
        advance(lifecycle, QueryState::Ready)?;

        info!(
            entity = %canonical.entity,
            backend,
            fingerprint = %canonical.fingerprint(),
            cache_hit,
            cost = plans.physical.root.strategy.estimated_cost,
            warnings = warnings.len(),
            "query.pipeline.compiled"
        );
        Ok(CompiledQuery {
            canonical,
            logical: plans.logical,
            physical: plans.physical,
            explain: plans.explain,
            warnings,
            states: std::mem::take(lifecycle).into_states(),
            cache_hit,
        })
    }
}

fn timed<T>(
    deadline: &Deadline,
    stage: Stage,
    run: impl FnOnce() -> Result<T, QueryError>,
) -> Result<T, QueryError> {
    deadline.check(stage)?;
    let started = Instant::now();
    let out = run();
    debug!(
        stage = %stage,
        elapsed_us = started.elapsed().as_micros() as u64,
        ok = out.is_ok(),
        "query.pipeline.stage"
    );
    out
}

fn advance(lifecycle: &mut Lifecycle, next: QueryState) -> Result<(), QueryError> {
    lifecycle.advance(next).map_err(|err| {
        PlanningError::InvalidPlan {
            reason: err.to_string(),
        }
        .into()
    })
}
