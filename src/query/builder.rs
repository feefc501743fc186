//! Fluent query builder.
//!
//! ```
//! use querycraft::query::ast::Direction;
//! use querycraft::query::builder::QueryBuilder;
//!
//! let query = QueryBuilder::new("users")
//!     .filter(|p| {
//!         p.eq("status", "active").gte("age", 18_i64);
//!     })
//!     .order_by("created_at", Direction::Desc)
//!     .page(1, 25)
//!     .build()
//!     .expect("query builds");
//! assert_eq!(query.entity, "users");
//! ```

use thiserror::Error;

use crate::error::PipelineError;
use crate::query::ast::{
    AggregateFunction, AggregateSpec, AggregationSpec, Condition, Consistency, Direction, Filter,
    JoinSpec, JoinType, Literal, NullOrdering, Operator, Pagination, Query, SortSpec,
};
use crate::query::pipeline::{CompiledQuery, QueryCompiler};

/// Misuse of the builder.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuilderError {
    /// Target entity name is empty.
    #[error("query entity must not be empty")]
    EmptyEntity,
    /// A predicate block or group emitted nothing.
    #[error("{0} block must emit at least one predicate")]
    EmptyPredicate(&'static str),
    /// `nulls` was called before any `order_by`.
    #[error("null ordering requires a preceding sort key")]
    NullsWithoutSort,
    /// `having` was called before any grouping or aggregate.
    #[error("HAVING requires group_by or an aggregate")]
    HavingWithoutAggregation,
    /// Compilation failed.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Fluent builder for [`Query`].
#[derive(Clone, Debug)]
pub struct QueryBuilder {
    query: Query,
    error: Option<BuilderError>,
}

impl QueryBuilder {
    /// Starts a query over `entity`.
    pub fn new(entity: impl Into<String>) -> Self {
        let query = Query::new(entity);
        let error = query.entity.is_empty().then_some(BuilderError::EmptyEntity);
        Self { query, error }
    }

    fn record_error(&mut self, err: BuilderError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    /// ANDs the predicates emitted by `build` into the filter.
    pub fn filter<F>(mut self, build: F) -> Self
    where
        F: FnOnce(&mut PredicateBuilder),
    {
        if self.error.is_some() {
            return self;
        }
        match PredicateBuilder::collect(PredicateMode::And, "filter", build) {
            Ok(expr) => self.query.filter = Some(append(self.query.filter.take(), expr)),
            Err(err) => self.record_error(err),
        }
        self
    }

    /// ANDs an already built filter tree into the filter.
    pub fn filter_tree(mut self, filter: Filter) -> Self {
        self.query.filter = Some(append(self.query.filter.take(), filter));
        self
    }

    /// Adds fields to the include list.
    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.query
            .projection
            .include
            .extend(fields.into_iter().map(Into::into));
        self
    }

    /// Adds fields to the exclude list.
    pub fn exclude<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.query
            .projection
            .exclude
            .extend(fields.into_iter().map(Into::into));
        self
    }

    /// Appends a sort key.
    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        let spec = match direction {
            Direction::Asc => SortSpec::asc(field),
            Direction::Desc => SortSpec::desc(field),
        };
        self.query.sort.push(spec);
        self
    }

    /// Sets null placement of the most recent sort key.
    pub fn nulls(mut self, nulls: NullOrdering) -> Self {
        match self.query.sort.last_mut() {
            Some(last) => last.nulls = nulls,
            None => self.record_error(BuilderError::NullsWithoutSort),
        }
        self
    }

    /// Requests a one-based page.
    pub fn page(mut self, page: u32, page_size: u32) -> Self {
        self.query.pagination = Some(Pagination::Page { page, page_size });
        self
    }

    /// Continues after a cursor handed out by a previous page.
    pub fn after(mut self, cursor: impl Into<String>, page_size: u32) -> Self {
        self.query.pagination = Some(Pagination::Cursor {
            cursor: cursor.into(),
            page_size,
        });
        self
    }

    fn aggregation(&mut self) -> &mut AggregationSpec {
        self.query.aggregation.get_or_insert_with(AggregationSpec::default)
    }

    /// Adds group-by fields.
    pub fn group_by<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aggregation()
            .group_by
            .extend(fields.into_iter().map(Into::into));
        self
    }

    /// Adds an aggregate output column.
    pub fn aggregate(
        mut self,
        function: AggregateFunction,
        field: impl Into<String>,
        alias: impl Into<String>,
    ) -> Self {
        self.aggregation()
            .aggregates
            .push(AggregateSpec::new(function, field, alias));
        self
    }

    /// Adds `COUNT(*) AS alias`.
    pub fn count(mut self, alias: impl Into<String>) -> Self {
        self.aggregation().aggregates.push(AggregateSpec::count(alias));
        self
    }

    /// Adds `PERCENTILE(field, rank) AS alias`.
    pub fn percentile(
        mut self,
        field: impl Into<String>,
        rank: f64,
        alias: impl Into<String>,
    ) -> Self {
        self.aggregation()
            .aggregates
            .push(AggregateSpec::percentile(field, rank, alias));
        self
    }

    /// ANDs the predicates emitted by `build` into HAVING.
    pub fn having<F>(mut self, build: F) -> Self
    where
        F: FnOnce(&mut PredicateBuilder),
    {
        if self.error.is_some() {
            return self;
        }
        let Some(aggregation) = self.query.aggregation.as_mut() else {
            self.record_error(BuilderError::HavingWithoutAggregation);
            return self;
        };
        match PredicateBuilder::collect(PredicateMode::And, "having", build) {
            Ok(expr) => aggregation.having = Some(append(aggregation.having.take(), expr)),
            Err(err) => self.record_error(err),
        }
        self
    }

    /// Inner join of `entity AS alias ON left_key = alias.right_key`.
    pub fn join(
        mut self,
        entity: impl Into<String>,
        alias: impl Into<String>,
        left_key: impl Into<String>,
        right_key: impl Into<String>,
    ) -> Self {
        self.query
            .joins
            .push(JoinSpec::inner(entity, alias, left_key, right_key));
        self
    }

    /// Left outer join of `entity AS alias ON left_key = alias.right_key`.
    pub fn left_join(
        mut self,
        entity: impl Into<String>,
        alias: impl Into<String>,
        left_key: impl Into<String>,
        right_key: impl Into<String>,
    ) -> Self {
        let mut spec = JoinSpec::inner(entity, alias, left_key, right_key);
        spec.join_type = JoinType::LeftOuter;
        self.query.joins.push(spec);
        self
    }

    /// Compilation deadline.
    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.query.options.timeout_ms = Some(ms);
        self
    }

    /// Requests the explain tree.
    pub fn explain(mut self) -> Self {
        self.query.options.explain = true;
        self
    }

    /// Requests the total match count.
    pub fn count_total(mut self) -> Self {
        self.query.options.count_total = true;
        self
    }

    /// Read consistency.
    pub fn consistency(mut self, consistency: Consistency) -> Self {
        self.query.options.consistency = consistency;
        self
    }

    /// Builds the query without compiling it.
    pub fn build(self) -> Result<Query, BuilderError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.query),
        }
    }

    /// Compiles the query for `backend`.
    pub fn compile(
        self,
        compiler: &QueryCompiler,
        backend: &str,
    ) -> Result<CompiledQuery, BuilderError> {
        let query = self.build()?;
        Ok(compiler.compile(&query, backend)?)
    }
}

fn append(existing: Option<Filter>, expr: Filter) -> Filter {
    match existing {
        Some(Filter::And(mut args)) => {
            args.push(expr);
            Filter::And(args)
        }
        Some(other) => Filter::And(vec![other, expr]),
        None => expr,
    }
}

#[derive(Clone, Copy, Debug)]
enum PredicateMode {
    And,
    Or,
}

/// Collects conditions for a filter or HAVING block.
pub struct PredicateBuilder {
    mode: PredicateMode,
    exprs: Vec<Filter>,
    error: Option<BuilderError>,
}

impl PredicateBuilder {
    fn with_mode(mode: PredicateMode) -> Self {
        Self {
            mode,
            exprs: Vec::new(),
            error: None,
        }
    }

    fn collect<F>(
        mode: PredicateMode,
        block: &'static str,
        build: F,
    ) -> Result<Filter, BuilderError>
    where
        F: FnOnce(&mut PredicateBuilder),
    {
        let mut nested = PredicateBuilder::with_mode(mode);
        build(&mut nested);
        if let Some(err) = nested.error {
            return Err(err);
        }
        nested.finish().ok_or(BuilderError::EmptyPredicate(block))
    }

    fn finish(self) -> Option<Filter> {
        match self.exprs.len() {
            0 => None,
            1 => self.exprs.into_iter().next(),
            _ => Some(match self.mode {
                PredicateMode::And => Filter::And(self.exprs),
                PredicateMode::Or => Filter::Or(self.exprs),
            }),
        }
    }

    fn push(&mut self, expr: impl Into<Filter>) -> &mut Self {
        if self.error.is_none() {
            self.exprs.push(expr.into());
        }
        self
    }

    fn group(
        &mut self,
        mode: PredicateMode,
        block: &'static str,
        build: impl FnOnce(&mut PredicateBuilder),
    ) -> Option<Filter> {
        match Self::collect(mode, block, build) {
            Ok(expr) => Some(expr),
            Err(err) => {
                if self.error.is_none() {
                    self.error = Some(err);
                }
                None
            }
        }
    }

    /// `field EQ value`.
    pub fn eq(&mut self, field: impl Into<String>, value: impl Into<Literal>) -> &mut Self {
        self.push(Condition::new(field, Operator::Eq, value))
    }

    /// `field NE value`.
    pub fn ne(&mut self, field: impl Into<String>, value: impl Into<Literal>) -> &mut Self {
        self.push(Condition::new(field, Operator::Ne, value))
    }

    /// `field LT value`.
    pub fn lt(&mut self, field: impl Into<String>, value: impl Into<Literal>) -> &mut Self {
        self.push(Condition::new(field, Operator::Lt, value))
    }

    /// `field LTE value`.
    pub fn lte(&mut self, field: impl Into<String>, value: impl Into<Literal>) -> &mut Self {
        self.push(Condition::new(field, Operator::Lte, value))
    }

    /// `field GT value`.
    pub fn gt(&mut self, field: impl Into<String>, value: impl Into<Literal>) -> &mut Self {
        self.push(Condition::new(field, Operator::Gt, value))
    }

    /// `field GTE value`.
    pub fn gte(&mut self, field: impl Into<String>, value: impl Into<Literal>) -> &mut Self {
        self.push(Condition::new(field, Operator::Gte, value))
    }

    /// `field IN (values...)`.
    pub fn in_list<I, T>(&mut self, field: impl Into<String>, values: I) -> &mut Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Literal>,
    {
        self.push(Condition::with_values(field, Operator::In, values))
    }

    /// `field NOT_IN (values...)`.
    pub fn not_in<I, T>(&mut self, field: impl Into<String>, values: I) -> &mut Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Literal>,
    {
        self.push(Condition::with_values(field, Operator::NotIn, values))
    }

    /// Substring (or list membership) match.
    pub fn contains(&mut self, field: impl Into<String>, value: impl Into<Literal>) -> &mut Self {
        self.push(Condition::new(field, Operator::Contains, value))
    }

    /// Prefix match.
    pub fn starts_with(
        &mut self,
        field: impl Into<String>,
        value: impl Into<Literal>,
    ) -> &mut Self {
        self.push(Condition::new(field, Operator::StartsWith, value))
    }

    /// Suffix match.
    pub fn ends_with(&mut self, field: impl Into<String>, value: impl Into<Literal>) -> &mut Self {
        self.push(Condition::new(field, Operator::EndsWith, value))
    }

    /// Regular-expression match.
    pub fn matches(&mut self, field: impl Into<String>, pattern: impl Into<String>) -> &mut Self {
        self.push(Condition::new(field, Operator::Matches, pattern.into()))
    }

    /// `field IS_NULL`.
    pub fn is_null(&mut self, field: impl Into<String>) -> &mut Self {
        self.push(Condition::unary(field, Operator::IsNull))
    }

    /// `field IS_NOT_NULL`.
    pub fn is_not_null(&mut self, field: impl Into<String>) -> &mut Self {
        self.push(Condition::unary(field, Operator::IsNotNull))
    }

    /// List field contains `value`.
    pub fn array_contains(
        &mut self,
        field: impl Into<String>,
        value: impl Into<Literal>,
    ) -> &mut Self {
        self.push(Condition::new(field, Operator::ArrayContains, value))
    }

    /// List field contains any of `values`.
    pub fn array_contains_any<I, T>(&mut self, field: impl Into<String>, values: I) -> &mut Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Literal>,
    {
        self.push(Condition::with_values(field, Operator::ArrayContainsAny, values))
    }

    /// Adds a prebuilt condition, for example one marked case-insensitive.
    pub fn condition(&mut self, condition: Condition) -> &mut Self {
        self.push(condition)
    }

    /// Nested conjunction.
    pub fn all<F>(&mut self, build: F) -> &mut Self
    where
        F: FnOnce(&mut PredicateBuilder),
    {
        if let Some(expr) = self.group(PredicateMode::And, "all", build) {
            self.push(expr);
        }
        self
    }

    /// Nested disjunction.
    pub fn any<F>(&mut self, build: F) -> &mut Self
    where
        F: FnOnce(&mut PredicateBuilder),
    {
        if let Some(expr) = self.group(PredicateMode::Or, "any", build) {
            self.push(expr);
        }
        self
    }

    /// Negated conjunction of the emitted predicates.
    pub fn not<F>(&mut self, build: F) -> &mut Self
    where
        F: FnOnce(&mut PredicateBuilder),
    {
        if let Some(expr) = self.group(PredicateMode::And, "not", build) {
            self.push(Filter::not(expr));
        }
        self
    }
}
