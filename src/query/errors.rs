#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::fmt;

use thiserror::Error;

use crate::query::ast::Operator;

/// Failures raised while turning field paths into schema references.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FieldResolutionError {
    /// A path segment does not exist on the entity.
    #[error("field '{path}' not found on entity '{entity}'")]
    FieldNotFound { entity: String, path: String },
    /// Wildcard path matched no fields.
    #[error("wildcard '{path}' matched no fields on entity '{entity}'")]
    AmbiguousPath { entity: String, path: String },
    /// Entity is not registered.
    #[error("unknown entity '{entity}'")]
    UnknownEntity { entity: String },
    /// Path contains an empty segment.
    #[error("field path '{path}' is malformed")]
    MalformedPath { path: String },
    /// Wildcards are only accepted in projections.
    #[error("wildcard path '{path}' not allowed in {context}")]
    WildcardNotAllowed { path: String, context: &'static str },
    /// Path exists on the entity but is neither grouped nor an aggregate alias.
    #[error("field '{path}' is not a group-by field or aggregate alias")]
    NotInAggregateOutput { path: String },
}

impl FieldResolutionError {
    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            FieldResolutionError::FieldNotFound { .. } => "FIELD_NOT_FOUND",
            FieldResolutionError::AmbiguousPath { .. } => "AMBIGUOUS_PATH",
            FieldResolutionError::UnknownEntity { .. } => "UNKNOWN_ENTITY",
            FieldResolutionError::MalformedPath { .. } => "MALFORMED_PATH",
            FieldResolutionError::WildcardNotAllowed { .. } => "WILDCARD_NOT_ALLOWED",
            FieldResolutionError::NotInAggregateOutput { .. } => "FIELD_NOT_IN_AGGREGATE_OUTPUT",
        }
    }

    /// Builds a [`FieldResolutionError::FieldNotFound`].
    pub fn not_found(entity: impl Into<String>, path: impl Into<String>) -> Self {
        FieldResolutionError::FieldNotFound {
            entity: entity.into(),
            path: path.into(),
        }
    }
}

/// Failures raised while converting client literals into typed values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypeCoercionError {
    /// Literal kind cannot represent the field type.
    #[error("field '{field}' expects {expected}, got {found} literal")]
    Incompatible {
        field: String,
        expected: String,
        found: &'static str,
    },
    /// Conversion would round or truncate.
    #[error("literal {value} cannot be represented exactly as {expected} for field '{field}'")]
    Lossy {
        field: String,
        value: String,
        expected: String,
    },
    /// Timestamp string is not RFC 3339 or falls outside the supported range.
    #[error("invalid timestamp '{value}' for field '{field}': {reason}")]
    InvalidTimestamp {
        field: String,
        value: String,
        reason: String,
    },
    /// Float literal is NaN or infinite.
    #[error("float literal for field '{field}' must be finite")]
    NonFiniteFloat { field: String },
    /// Null supplied to an operator that cannot compare against null.
    #[error("{operator} on field '{field}' does not accept null")]
    NullNotAllowed { field: String, operator: Operator },
    /// MATCHES operand is not a valid regular expression.
    #[error("invalid pattern '{pattern}' for field '{field}': {reason}")]
    InvalidPattern {
        field: String,
        pattern: String,
        reason: String,
    },
}

impl TypeCoercionError {
    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            TypeCoercionError::Incompatible { .. } => "TYPE_MISMATCH",
            TypeCoercionError::Lossy { .. } => "LOSSY_COERCION",
            TypeCoercionError::InvalidTimestamp { .. } => "INVALID_TIMESTAMP",
            TypeCoercionError::NonFiniteFloat { .. } => "NON_FINITE_FLOAT",
            TypeCoercionError::NullNotAllowed { .. } => "NULL_NOT_ALLOWED",
            TypeCoercionError::InvalidPattern { .. } => "INVALID_PATTERN",
        }
    }
}

/// Operator used against a field type it is not defined for.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OperatorIncompatibleError {
    /// Operator is not legal for the field's declared type.
    #[error("{operator} is not supported on {field_type} field '{field}'")]
    IllegalForType {
        field: String,
        operator: Operator,
        field_type: String,
    },
    /// Wrong number of operands.
    #[error("{operator} on field '{field}' expects {expected} operand(s), got {found}")]
    Arity {
        field: String,
        operator: Operator,
        expected: &'static str,
        found: usize,
    },
    /// Operand set normalized to zero entries.
    #[error("{operator} on field '{field}' requires at least one non-null operand")]
    EmptyOperandSet { field: String, operator: Operator },
}

impl OperatorIncompatibleError {
    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            OperatorIncompatibleError::IllegalForType { .. } => "OPERATOR_INCOMPATIBLE",
            OperatorIncompatibleError::Arity { .. } => "OPERATOR_ARITY",
            OperatorIncompatibleError::EmptyOperandSet { .. } => "OPERAND_SET_EMPTY",
        }
    }
}

/// Machine-readable validation codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValidationCode {
    PredicateTooLarge,
    PredicateTooDeep,
    InListTooLarge,
    ProjectionOverlap,
    SortFieldNotSortable,
    SortDuplicateField,
    SortFieldNotIndexed,
    AggFieldNotAggregable,
    AggFieldRequired,
    AggFunctionTypeMismatch,
    AggPercentileInvalid,
    AggAliasEmpty,
    AggAliasDuplicate,
    AggEmpty,
    GroupByFieldNotGroupable,
    JoinKeyTypeMismatch,
    JoinKeyNotScalar,
    JoinAliasDuplicate,
    JoinAliasShadowsField,
    PageSizeOutOfRange,
    PageNumberInvalid,
    CursorRequiresSort,
    CursorInvalid,
    CursorArityMismatch,
    CursorTypeMismatch,
}

impl ValidationCode {
    /// Stable wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            ValidationCode::PredicateTooLarge => "PREDICATE_TOO_LARGE",
            ValidationCode::PredicateTooDeep => "PREDICATE_TOO_DEEP",
            ValidationCode::InListTooLarge => "IN_LIST_TOO_LARGE",
            ValidationCode::ProjectionOverlap => "PROJECTION_OVERLAP",
            ValidationCode::SortFieldNotSortable => "SORT_FIELD_NOT_SORTABLE",
            ValidationCode::SortDuplicateField => "SORT_DUPLICATE_FIELD",
            ValidationCode::SortFieldNotIndexed => "SORT_FIELD_NOT_INDEXED",
            ValidationCode::AggFieldNotAggregable => "AGG_FIELD_NOT_AGGREGABLE",
            ValidationCode::AggFieldRequired => "AGG_FIELD_REQUIRED",
            ValidationCode::AggFunctionTypeMismatch => "AGG_FUNCTION_TYPE_MISMATCH",
            ValidationCode::AggPercentileInvalid => "AGG_PERCENTILE_INVALID",
            ValidationCode::AggAliasEmpty => "AGG_ALIAS_EMPTY",
            ValidationCode::AggAliasDuplicate => "AGG_ALIAS_DUPLICATE",
            ValidationCode::AggEmpty => "AGG_EMPTY",
            ValidationCode::GroupByFieldNotGroupable => "GROUP_BY_FIELD_NOT_GROUPABLE",
            ValidationCode::JoinKeyTypeMismatch => "JOIN_KEY_TYPE_MISMATCH",
            ValidationCode::JoinKeyNotScalar => "JOIN_KEY_NOT_SCALAR",
            ValidationCode::JoinAliasDuplicate => "JOIN_ALIAS_DUPLICATE",
            ValidationCode::JoinAliasShadowsField => "JOIN_ALIAS_SHADOWS_FIELD",
            ValidationCode::PageSizeOutOfRange => "PAGE_SIZE_OUT_OF_RANGE",
            ValidationCode::PageNumberInvalid => "PAGE_NUMBER_INVALID",
            ValidationCode::CursorRequiresSort => "CURSOR_REQUIRES_SORT",
            ValidationCode::CursorInvalid => "CURSOR_INVALID",
            ValidationCode::CursorArityMismatch => "CURSOR_ARITY_MISMATCH",
            ValidationCode::CursorTypeMismatch => "CURSOR_TYPE_MISMATCH",
        }
    }
}

impl fmt::Display for ValidationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single whole-query rule violation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("[{code}] {path}: {message}")]
pub struct ValidationError {
    /// Violated rule.
    pub code: ValidationCode,
    /// Query location the rule applies to, e.g. `sort[1]` or `aggregates.revenue`.
    pub path: String,
    /// Human-readable explanation.
    pub message: String,
}

impl ValidationError {
    /// Builds a validation error.
    pub fn new(code: ValidationCode, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Every validation error found in one query, in discovery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    /// Wraps a single error.
    pub fn single(error: ValidationError) -> Self {
        Self(vec![error])
    }

    /// Returns true when any error carries `code`.
    pub fn contains(&self, code: ValidationCode) -> bool {
        self.0.iter().any(|err| err.code == code)
    }

    /// Iterates over the collected errors.
    pub fn iter(&self) -> impl Iterator<Item = &ValidationError> {
        self.0.iter()
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} validation error(s)", self.0.len())?;
        for (idx, err) in self.0.iter().enumerate() {
            let sep = if idx == 0 { ": " } else { "; " };
            write!(f, "{sep}{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

/// Advisory finding that does not reject the query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationWarning {
    /// Advisory code.
    pub code: ValidationCode,
    /// Query location.
    pub path: String,
    /// Human-readable explanation.
    pub message: String,
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.code, self.path, self.message)
    }
}

/// Failures raised while lowering plans.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanningError {
    /// No usable index and the backend refuses full scans of the entity.
    #[error("backend '{backend}' forbids full scans of '{entity}' and no index covers the filter")]
    FullScanForbidden { backend: String, entity: String },
    /// Backend sorts only through indexes and the sort field has none.
    #[error("backend '{backend}' requires an index to sort on '{field}'")]
    SortIndexRequired { backend: String, field: String },
    /// Internal plan shape invariant was violated.
    #[error("invalid plan: {reason}")]
    InvalidPlan { reason: String },
}

impl PlanningError {
    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            PlanningError::FullScanForbidden { .. } => "FULL_SCAN_FORBIDDEN",
            PlanningError::SortIndexRequired { .. } => "SORT_INDEX_REQUIRED",
            PlanningError::InvalidPlan { .. } => "INVALID_PLAN",
        }
    }
}

/// Capability descriptor could not answer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendCapabilityError {
    /// No descriptor registered under this backend id.
    #[error("unknown backend '{backend}'")]
    UnknownBackend { backend: String },
    /// Descriptor exists but is currently unavailable.
    #[error("capabilities for backend '{backend}' unavailable: {reason}")]
    Unavailable { backend: String, reason: String },
}

impl BackendCapabilityError {
    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            BackendCapabilityError::UnknownBackend { .. } => "BACKEND_UNKNOWN",
            BackendCapabilityError::Unavailable { .. } => "BACKEND_UNAVAILABLE",
        }
    }
}
