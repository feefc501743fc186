//! Crate-level error taxonomy.
//!
//! Each compilation stage fails with one kind from [`QueryError`]; the
//! orchestrator wraps the first failure in a [`PipelineError`] tagged with the
//! stage that raised it.

use std::fmt;

use thiserror::Error;

use crate::query::errors::{
    BackendCapabilityError, FieldResolutionError, OperatorIncompatibleError, PlanningError,
    TypeCoercionError, ValidationError, ValidationErrors,
};
use crate::query::pipeline::QueryState;

/// Pipeline stage names used to tag failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    /// Field path resolution.
    Resolve,
    /// Literal coercion.
    Coerce,
    /// Predicate normalization and operator legality.
    Normalize,
    /// Whole-query validation.
    Validate,
    /// Canonical query construction.
    Build,
    /// Logical plan lowering.
    LogicalPlan,
    /// Physical plan lowering.
    PhysicalPlan,
    /// Explain serialization.
    Explain,
}

impl Stage {
    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Resolve => "resolve",
            Stage::Coerce => "coerce",
            Stage::Normalize => "normalize",
            Stage::Validate => "validate",
            Stage::Build => "build",
            Stage::LogicalPlan => "logical_plan",
            Stage::PhysicalPlan => "physical_plan",
            Stage::Explain => "explain",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every way compiling a query can fail.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// Unknown or ambiguous field path.
    #[error(transparent)]
    FieldResolution(#[from] FieldResolutionError),
    /// Literal could not be converted to the field type.
    #[error(transparent)]
    TypeCoercion(#[from] TypeCoercionError),
    /// Operator used on an unsupported field type.
    #[error(transparent)]
    OperatorIncompatible(#[from] OperatorIncompatibleError),
    /// One or more whole-query rule violations.
    #[error(transparent)]
    Validation(#[from] ValidationErrors),
    /// Plan lowering failed.
    #[error(transparent)]
    Planning(#[from] PlanningError),
    /// Backend capability descriptor could not answer.
    #[error(transparent)]
    BackendCapability(#[from] BackendCapabilityError),
    /// Compilation ran past its deadline.
    #[error("deadline of {budget_ms} ms exceeded before the {stage} stage")]
    DeadlineExceeded {
        /// Stage that was about to start.
        stage: Stage,
        /// Configured budget.
        budget_ms: u64,
    },
}

impl From<ValidationError> for QueryError {
    fn from(value: ValidationError) -> Self {
        QueryError::Validation(ValidationErrors::single(value))
    }
}

impl QueryError {
    /// Machine-readable code; validation failures report their first code.
    pub fn code(&self) -> &'static str {
        match self {
            QueryError::FieldResolution(err) => err.code(),
            QueryError::TypeCoercion(err) => err.code(),
            QueryError::OperatorIncompatible(err) => err.code(),
            QueryError::Validation(errs) => errs
                .0
                .first()
                .map(|err| err.code.as_str())
                .unwrap_or("VALIDATION_FAILED"),
            QueryError::Planning(err) => err.code(),
            QueryError::BackendCapability(err) => err.code(),
            QueryError::DeadlineExceeded { .. } => "DEADLINE_EXCEEDED",
        }
    }

    /// Stage this kind of failure originates from.
    pub fn stage(&self) -> Stage {
        match self {
            QueryError::FieldResolution(_) => Stage::Resolve,
            QueryError::TypeCoercion(_) => Stage::Coerce,
            QueryError::OperatorIncompatible(_) => Stage::Normalize,
            QueryError::Validation(_) => Stage::Validate,
            QueryError::Planning(_) | QueryError::BackendCapability(_) => Stage::PhysicalPlan,
            QueryError::DeadlineExceeded { stage, .. } => *stage,
        }
    }
}

/// First failure of a compilation, tagged with its stage.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{stage} stage rejected query: [{}] {error}", .error.code())]
pub struct PipelineError {
    /// Stage that failed.
    pub stage: Stage,
    /// Underlying failure.
    #[source]
    pub error: QueryError,
    /// Lifecycle states up to and including `REJECTED`; empty when the
    /// failure did not come from a compilation.
    pub states: Vec<QueryState>,
}

impl PipelineError {
    /// Machine-readable code of the underlying failure.
    pub fn code(&self) -> &'static str {
        self.error.code()
    }
}

impl From<QueryError> for PipelineError {
    fn from(error: QueryError) -> Self {
        Self {
            stage: error.stage(),
            error,
            states: Vec::new(),
        }
    }
}

/// Result alias for stage functions.
pub type Result<T, E = QueryError> = std::result::Result<T, E>;
