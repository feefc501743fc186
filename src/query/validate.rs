//! Resolution and whole-query validation.
//!
//! [`resolve_query`] binds every path of a client [`Query`] to a [`FieldRef`]
//! and normalizes the filter and HAVING trees. [`validate`] then applies the
//! cross-field rules, collecting every violation before failing, and is the
//! only way to obtain a [`ValidatedQuery`].
#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::debug;

use crate::config::Limits;
use crate::error::QueryError;
use crate::query::ast::{
    AggregateFunction, Direction, JoinType, NullOrdering, Pagination, Query, QueryOptions,
};
use crate::query::cursor::decode_cursor;
use crate::query::errors::{ValidationCode, ValidationError, ValidationErrors, ValidationWarning};
use crate::query::normalize::normalize;
use crate::query::pipeline::StageGate;
use crate::query::predicate::Predicate;
use crate::query::resolve::{AggregateScope, FieldResolver, FieldScope, OutputColumn};
use crate::query::schema::{FieldRef, FieldSource, FieldType, SchemaRegistry};
use crate::query::value::Value;

/// Join with both keys resolved.
#[derive(Clone, Debug)]
pub struct ResolvedJoin {
    /// Joined entity.
    pub entity: String,
    /// Alias of the joined entity.
    pub alias: String,
    /// Join flavour.
    pub join_type: JoinType,
    /// Key on the left input (base entity or an earlier alias).
    pub left_key: Arc<FieldRef>,
    /// Key on the joined entity.
    pub right_key: Arc<FieldRef>,
}

/// Sort key with a resolved field.
#[derive(Clone, Debug)]
pub struct ResolvedSort {
    /// Sort field.
    pub field: Arc<FieldRef>,
    /// Direction.
    pub direction: Direction,
    /// Requested null placement.
    pub nulls: NullOrdering,
}

/// Aggregate with its target field resolved.
#[derive(Clone, Debug)]
pub struct ResolvedAggregate {
    /// Function.
    pub function: AggregateFunction,
    /// Target field; `None` for `COUNT(*)`.
    pub field: Option<Arc<FieldRef>>,
    /// Output column name.
    pub alias: String,
    /// Percentile rank for `PERCENTILE`.
    pub percentile: Option<f64>,
    /// Type of the output column.
    pub output_type: FieldType,
}

/// Aggregation block after resolution.
#[derive(Clone, Debug, Default)]
pub struct ResolvedAggregation {
    /// Group-by fields in request order.
    pub group_by: Vec<Arc<FieldRef>>,
    /// Aggregates in request order.
    pub aggregates: Vec<ResolvedAggregate>,
    /// Normalized HAVING predicate over the aggregate output.
    pub having: Option<Predicate>,
}

/// Query with every path resolved and every predicate normalized.
#[derive(Clone, Debug)]
pub struct ResolvedQuery {
    /// Base entity.
    pub entity: String,
    /// Normalized filter; `None` when it is absent or a tautology.
    pub filter: Option<Predicate>,
    /// Expanded projection include list.
    pub include: Vec<Arc<FieldRef>>,
    /// Expanded projection exclude list.
    pub exclude: Vec<Arc<FieldRef>>,
    /// Sort keys.
    pub sort: Vec<ResolvedSort>,
    /// Raw pagination request; cursors are decoded by [`validate`].
    pub pagination: Option<Pagination>,
    /// Aggregation block.
    pub aggregation: Option<ResolvedAggregation>,
    /// Joins in declaration order.
    pub joins: Vec<ResolvedJoin>,
    /// Execution options.
    pub options: QueryOptions,
}

/// Validated pagination.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PageRequest {
    /// No row limit (aggregating queries without pagination).
    Unbounded,
    /// One-based page.
    Page {
        /// Page number, at least 1.
        page: u32,
        /// Rows per page.
        page_size: u32,
    },
    /// Keyset continuation after the decoded sort-key tuple.
    After {
        /// Sort-key tuple of the last row already returned.
        keys: Vec<Value>,
        /// Rows per page.
        page_size: u32,
    },
}

/// Query that passed every validation rule.
#[derive(Clone, Debug)]
pub struct ValidatedQuery {
    query: ResolvedQuery,
    page: PageRequest,
    warnings: Vec<ValidationWarning>,
}

impl ValidatedQuery {
    /// Resolved query.
    pub fn query(&self) -> &ResolvedQuery {
        &self.query
    }

    /// Validated pagination.
    pub fn page(&self) -> &PageRequest {
        &self.page
    }

    /// Advisory findings.
    pub fn warnings(&self) -> &[ValidationWarning] {
        &self.warnings
    }

    /// Splits into parts.
    pub fn into_parts(self) -> (ResolvedQuery, PageRequest, Vec<ValidationWarning>) {
        (self.query, self.page, self.warnings)
    }
}

/// Type of an aggregate output column.
pub fn aggregate_output_type(function: AggregateFunction, field: Option<&FieldRef>) -> FieldType {
    match function {
        AggregateFunction::Count | AggregateFunction::CountDistinct => FieldType::Integer,
        AggregateFunction::Sum => match field.map(|f| &f.field_type) {
            Some(FieldType::Integer) => FieldType::Integer,
            _ => FieldType::Float,
        },
        AggregateFunction::Min | AggregateFunction::Max => field
            .map(|f| f.field_type.clone())
            .unwrap_or(FieldType::Float),
        AggregateFunction::Avg
        | AggregateFunction::Percentile
        | AggregateFunction::Stddev
        | AggregateFunction::Variance => FieldType::Float,
    }
}

/// Resolves every path of `query` and normalizes its predicates.
///
/// Join aliases become addressable one join at a time, so a join's left key
/// may only reference the base entity or an earlier alias. `gate` is entered
/// again for every normalization and coercion pass.
pub fn resolve_query(
    query: &Query,
    registry: &dyn SchemaRegistry,
    limits: &Limits,
    gate: &dyn StageGate,
) -> Result<ResolvedQuery, QueryError> {
    let mut resolver = FieldResolver::new(registry, &query.entity)?;

    let mut joins = Vec::with_capacity(query.joins.len());
    for join in &query.joins {
        let left_key = resolver.resolve_field(&join.left_key, "join key")?;
        resolver.register_alias(&join.alias, &join.entity)?;
        let right_key = resolver.resolve_on_alias(&join.alias, &join.right_key)?;
        joins.push(ResolvedJoin {
            entity: join.entity.clone(),
            alias: join.alias.clone(),
            join_type: join.join_type,
            left_key,
            right_key,
        });
    }

    let mut aggregation = None;
    if let Some(spec) = &query.aggregation {
        let mut group_by = Vec::with_capacity(spec.group_by.len());
        for path in &spec.group_by {
            group_by.push(resolver.resolve_field(path, "group by")?);
        }
        let mut aggregates = Vec::with_capacity(spec.aggregates.len());
        for agg in &spec.aggregates {
            let field = match &agg.field {
                Some(path) => Some(resolver.resolve_field(path, "aggregate")?),
                None => None,
            };
            aggregates.push(ResolvedAggregate {
                function: agg.function,
                output_type: aggregate_output_type(agg.function, field.as_deref()),
                field,
                alias: agg.alias.clone(),
                percentile: agg.percentile,
            });
        }
        aggregation = Some(ResolvedAggregation {
            group_by,
            aggregates,
            having: None,
        });
    }

    let filter = match &query.filter {
        Some(filter) => normalize(filter, &mut resolver, limits, gate, "filter")?,
        None => None,
    };

    let (include, exclude, sort) = match aggregation.as_mut() {
        Some(agg) => {
            let outputs: Vec<OutputColumn> = agg
                .aggregates
                .iter()
                .map(|a| OutputColumn {
                    name: a.alias.clone(),
                    field_type: a.output_type.clone(),
                })
                .collect();
            let mut scope = AggregateScope::new(&mut resolver, &agg.group_by, &outputs);
            if let Some(having) = query.aggregation.as_ref().and_then(|a| a.having.as_ref()) {
                agg.having = normalize(having, &mut scope, limits, gate, "having")?;
            }
            resolve_outputs(query, &mut scope)?
        }
        None => resolve_outputs(query, &mut resolver)?,
    };

    debug!(
        entity = %query.entity,
        fields = resolver.resolved_count(),
        joins = joins.len(),
        "query.resolve.done"
    );
    Ok(ResolvedQuery {
        entity: query.entity.clone(),
        filter,
        include,
        exclude,
        sort,
        pagination: query.pagination.clone(),
        aggregation,
        joins,
        options: query.options.clone(),
    })
}

type Outputs = (Vec<Arc<FieldRef>>, Vec<Arc<FieldRef>>, Vec<ResolvedSort>);

fn resolve_outputs(query: &Query, scope: &mut dyn FieldScope) -> Result<Outputs, QueryError> {
    let mut include = Vec::new();
    for path in &query.projection.include {
        include.extend(scope.expand_field(path)?);
    }
    let mut exclude = Vec::new();
    for path in &query.projection.exclude {
        exclude.extend(scope.expand_field(path)?);
    }
    let mut sort = Vec::with_capacity(query.sort.len());
    for spec in &query.sort {
        sort.push(ResolvedSort {
            field: scope.resolve_field(&spec.field, "sort")?,
            direction: spec.direction,
            nulls: spec.nulls,
        });
    }
    Ok((include, exclude, sort))
}

/// Applies every whole-query rule to `query`.
///
/// All violations are collected; the first one decides the reported code.
pub fn validate(
    query: ResolvedQuery,
    registry: &dyn SchemaRegistry,
    limits: &Limits,
) -> Result<ValidatedQuery, QueryError> {
    let mut checker = Checker::default();
    checker.projection(&query);
    checker.sort(&query);
    if let Some(agg) = &query.aggregation {
        checker.aggregation(agg);
    }
    let base_roots: BTreeSet<String> = registry
        .catalog(&query.entity)?
        .into_iter()
        .filter_map(|meta| meta.path.split('.').next().map(str::to_owned))
        .collect();
    checker.joins(&query, &base_roots);
    let page = checker.pagination(&query, limits);

    debug!(
        entity = %query.entity,
        errors = checker.errors.len(),
        warnings = checker.warnings.len(),
        "query.validate.done"
    );
    if !checker.errors.is_empty() {
        return Err(ValidationErrors(checker.errors).into());
    }
    Ok(ValidatedQuery {
        query,
        page,
        warnings: checker.warnings,
    })
}

#[derive(Default)]
struct Checker {
    errors: Vec<ValidationError>,
    warnings: Vec<ValidationWarning>,
}

impl Checker {
    fn fail(&mut self, code: ValidationCode, path: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError::new(code, path, message));
    }

    fn projection(&mut self, query: &ResolvedQuery) {
        let included: BTreeSet<String> = query.include.iter().map(|f| f.sort_key()).collect();
        for field in &query.exclude {
            if included.contains(&field.sort_key()) {
                self.fail(
                    ValidationCode::ProjectionOverlap,
                    "projection.exclude",
                    format!("'{field}' is both included and excluded"),
                );
            }
        }
    }

    fn sort(&mut self, query: &ResolvedQuery) {
        let mut seen = BTreeSet::new();
        for (idx, spec) in query.sort.iter().enumerate() {
            let path = format!("sort[{idx}]");
            let field = &spec.field;
            if !field.field_type.is_scalar() {
                self.fail(
                    ValidationCode::SortFieldNotSortable,
                    &path,
                    format!("cannot sort on '{field}' of type {}", field.field_type),
                );
            }
            if !seen.insert(field.sort_key()) {
                self.fail(
                    ValidationCode::SortDuplicateField,
                    &path,
                    format!("'{field}' appears more than once"),
                );
            }
            if field.source != FieldSource::Aggregate && !field.indexed {
                self.warnings.push(ValidationWarning {
                    code: ValidationCode::SortFieldNotIndexed,
                    path,
                    message: format!("'{field}' has no index; sorting may be slow"),
                });
            }
        }
    }

    fn aggregation(&mut self, agg: &ResolvedAggregation) {
        if agg.group_by.is_empty() && agg.aggregates.is_empty() {
            self.fail(
                ValidationCode::AggEmpty,
                "aggregation",
                "aggregation needs a group-by field or an aggregate",
            );
        }
        let mut names: BTreeMap<String, &'static str> = BTreeMap::new();
        for (idx, field) in agg.group_by.iter().enumerate() {
            if !field.field_type.is_scalar() {
                self.fail(
                    ValidationCode::GroupByFieldNotGroupable,
                    format!("group_by[{idx}]"),
                    format!("cannot group by '{field}' of type {}", field.field_type),
                );
            }
            names.insert(field.display_name(), "group-by field");
        }
        for agg in &agg.aggregates {
            let path = format!("aggregates.{}", agg.alias);
            if agg.alias.trim().is_empty() {
                self.fail(ValidationCode::AggAliasEmpty, "aggregates", "aggregate alias is empty");
            } else if let Some(previous) = names.insert(agg.alias.clone(), "aggregate") {
                self.fail(
                    ValidationCode::AggAliasDuplicate,
                    &path,
                    format!("alias '{}' collides with a {previous}", agg.alias),
                );
            }
            self.aggregate(agg, &path);
        }
    }

    fn aggregate(&mut self, agg: &ResolvedAggregate, path: &str) {
        match (agg.function, agg.percentile) {
            (AggregateFunction::Percentile, Some(rank)) if (0.0..=100.0).contains(&rank) => {}
            (AggregateFunction::Percentile, Some(rank)) => self.fail(
                ValidationCode::AggPercentileInvalid,
                path,
                format!("percentile {rank} is outside 0..=100"),
            ),
            (AggregateFunction::Percentile, None) => self.fail(
                ValidationCode::AggPercentileInvalid,
                path,
                "PERCENTILE needs a rank",
            ),
            (function, Some(_)) => self.fail(
                ValidationCode::AggPercentileInvalid,
                path,
                format!("{function} does not take a percentile rank"),
            ),
            (_, None) => {}
        }
        let Some(field) = &agg.field else {
            if agg.function != AggregateFunction::Count {
                self.fail(
                    ValidationCode::AggFieldRequired,
                    path,
                    format!("{} needs a target field", agg.function),
                );
            }
            return;
        };
        if !field.aggregable {
            self.fail(
                ValidationCode::AggFieldNotAggregable,
                path,
                format!("'{field}' is not aggregable"),
            );
        }
        let ty = &field.field_type;
        let fits = match agg.function {
            AggregateFunction::Count => true,
            AggregateFunction::CountDistinct => ty.is_scalar(),
            AggregateFunction::Min | AggregateFunction::Max => ty.is_orderable(),
            AggregateFunction::Sum
            | AggregateFunction::Avg
            | AggregateFunction::Percentile
            | AggregateFunction::Stddev
            | AggregateFunction::Variance => ty.is_numeric(),
        };
        if !fits {
            self.fail(
                ValidationCode::AggFunctionTypeMismatch,
                path,
                format!("{} is not defined for '{field}' of type {ty}", agg.function),
            );
        }
    }

    fn joins(&mut self, query: &ResolvedQuery, base_roots: &BTreeSet<String>) {
        let mut aliases = BTreeSet::new();
        for (idx, join) in query.joins.iter().enumerate() {
            let path = format!("joins[{idx}]");
            if !aliases.insert(join.alias.as_str()) {
                self.fail(
                    ValidationCode::JoinAliasDuplicate,
                    &path,
                    format!("alias '{}' is declared twice", join.alias),
                );
            }
            if base_roots.contains(&join.alias) || join.alias == query.entity {
                self.fail(
                    ValidationCode::JoinAliasShadowsField,
                    &path,
                    format!("alias '{}' shadows a field of '{}'", join.alias, query.entity),
                );
            }
            let (left, right) = (&join.left_key.field_type, &join.right_key.field_type);
            if !left.is_scalar() || !right.is_scalar() {
                self.fail(
                    ValidationCode::JoinKeyNotScalar,
                    &path,
                    format!("join keys must be scalar, found {left} and {right}"),
                );
            } else if left != right && !(left.is_numeric() && right.is_numeric()) {
                self.fail(
                    ValidationCode::JoinKeyTypeMismatch,
                    &path,
                    format!("join key types differ: {left} vs {right}"),
                );
            }
        }
    }

    fn page_size(&mut self, page_size: u32, limits: &Limits) {
        if page_size == 0 || page_size > limits.max_page_size {
            self.fail(
                ValidationCode::PageSizeOutOfRange,
                "pagination.page_size",
                format!("page size {page_size} is outside 1..={}", limits.max_page_size),
            );
        }
    }

    fn pagination(&mut self, query: &ResolvedQuery, limits: &Limits) -> PageRequest {
        match &query.pagination {
            None if query.aggregation.is_some() => PageRequest::Unbounded,
            None => PageRequest::Page {
                page: 1,
                page_size: limits.default_page_size,
            },
            Some(Pagination::Page { page, page_size }) => {
                self.page_size(*page_size, limits);
                if *page == 0 {
                    self.fail(
                        ValidationCode::PageNumberInvalid,
                        "pagination.page",
                        "page numbers start at 1",
                    );
                }
                PageRequest::Page {
                    page: *page,
                    page_size: *page_size,
                }
            }
            Some(Pagination::Cursor { cursor, page_size }) => {
                self.page_size(*page_size, limits);
                let keys = self.cursor_keys(query, cursor);
                PageRequest::After {
                    keys,
                    page_size: *page_size,
                }
            }
        }
    }

    fn cursor_keys(&mut self, query: &ResolvedQuery, cursor: &str) -> Vec<Value> {
        if query.sort.is_empty() {
            self.fail(
                ValidationCode::CursorRequiresSort,
                "pagination.cursor",
                "cursor pagination needs at least one sort key",
            );
            return Vec::new();
        }
        let keys = match decode_cursor(cursor) {
            Ok(keys) => keys,
            Err(err) => {
                self.fail(ValidationCode::CursorInvalid, "pagination.cursor", err.to_string());
                return Vec::new();
            }
        };
        if keys.len() != query.sort.len() {
            self.fail(
                ValidationCode::CursorArityMismatch,
                "pagination.cursor",
                format!("cursor has {} keys, sort has {}", keys.len(), query.sort.len()),
            );
            return keys;
        }
        for (idx, (key, spec)) in keys.iter().zip(&query.sort).enumerate() {
            if !value_fits(key, &spec.field.field_type) {
                self.fail(
                    ValidationCode::CursorTypeMismatch,
                    format!("pagination.cursor[{idx}]"),
                    format!(
                        "cursor key is {} but '{}' is {}",
                        key.kind(),
                        spec.field,
                        spec.field.field_type
                    ),
                );
            }
        }
        keys
    }
}

fn value_fits(value: &Value, field_type: &FieldType) -> bool {
    matches!(
        (value, field_type),
        (Value::Null, _)
            | (Value::Bool(_), FieldType::Boolean)
            | (Value::Int(_), FieldType::Integer)
            | (Value::Float(_), FieldType::Float)
            | (Value::String(_), FieldType::String)
            | (Value::Timestamp(_), FieldType::Timestamp)
    )
}
