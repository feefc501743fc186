//! Client-facing query representation.
//!
//! Everything in this module is loosely typed: field paths are plain dotted
//! strings and literals carry no schema information. The resolver, coercion
//! engine, and normalizer turn these shapes into the canonical query model.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Loosely typed literal supplied by a client.
///
/// Deserializes untagged from JSON, so `18`, `"active"`, `true`, `null` and
/// arrays map directly onto the matching variant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    /// Null literal.
    Null,
    /// Boolean literal.
    Bool(bool),
    /// Integer literal.
    Int(i64),
    /// Floating point literal.
    Float(f64),
    /// String literal.
    String(String),
    /// List literal.
    List(Vec<Literal>),
}

impl Literal {
    /// Short lowercase name of the literal kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Literal::Null => "null",
            Literal::Bool(_) => "boolean",
            Literal::Int(_) => "integer",
            Literal::Float(_) => "float",
            Literal::String(_) => "string",
            Literal::List(_) => "list",
        }
    }
}

impl From<&str> for Literal {
    fn from(value: &str) -> Self {
        Literal::String(value.to_owned())
    }
}

impl From<String> for Literal {
    fn from(value: String) -> Self {
        Literal::String(value)
    }
}

impl From<bool> for Literal {
    fn from(value: bool) -> Self {
        Literal::Bool(value)
    }
}

impl From<i64> for Literal {
    fn from(value: i64) -> Self {
        Literal::Int(value)
    }
}

impl From<i32> for Literal {
    fn from(value: i32) -> Self {
        Literal::Int(i64::from(value))
    }
}

impl From<f64> for Literal {
    fn from(value: f64) -> Self {
        Literal::Float(value)
    }
}

impl<T: Into<Literal>> From<Vec<T>> for Literal {
    fn from(values: Vec<T>) -> Self {
        Literal::List(values.into_iter().map(Into::into).collect())
    }
}

/// Comparison operators accepted in filter conditions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operator {
    /// Equality.
    Eq,
    /// Inequality.
    Ne,
    /// Strictly less than.
    Lt,
    /// Less than or equal.
    Lte,
    /// Strictly greater than.
    Gt,
    /// Greater than or equal.
    Gte,
    /// Membership in a literal set.
    In,
    /// Non-membership in a literal set.
    NotIn,
    /// Substring match on strings, element match on lists.
    Contains,
    /// String prefix match.
    StartsWith,
    /// String suffix match.
    EndsWith,
    /// Regular expression match.
    Matches,
    /// Field is null or absent.
    IsNull,
    /// Field is present and non-null.
    IsNotNull,
    /// List field contains the operand.
    ArrayContains,
    /// List field contains at least one operand.
    ArrayContainsAny,
}

impl Operator {
    /// Every operator, in declaration order.
    pub const ALL: [Operator; 16] = [
        Operator::Eq,
        Operator::Ne,
        Operator::Lt,
        Operator::Lte,
        Operator::Gt,
        Operator::Gte,
        Operator::In,
        Operator::NotIn,
        Operator::Contains,
        Operator::StartsWith,
        Operator::EndsWith,
        Operator::Matches,
        Operator::IsNull,
        Operator::IsNotNull,
        Operator::ArrayContains,
        Operator::ArrayContainsAny,
    ];

    /// Wire name of the operator.
    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Eq => "EQ",
            Operator::Ne => "NE",
            Operator::Lt => "LT",
            Operator::Lte => "LTE",
            Operator::Gt => "GT",
            Operator::Gte => "GTE",
            Operator::In => "IN",
            Operator::NotIn => "NOT_IN",
            Operator::Contains => "CONTAINS",
            Operator::StartsWith => "STARTS_WITH",
            Operator::EndsWith => "ENDS_WITH",
            Operator::Matches => "MATCHES",
            Operator::IsNull => "IS_NULL",
            Operator::IsNotNull => "IS_NOT_NULL",
            Operator::ArrayContains => "ARRAY_CONTAINS",
            Operator::ArrayContainsAny => "ARRAY_CONTAINS_ANY",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_true() -> bool {
    true
}

/// Single field comparison inside a filter tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Dotted field path.
    pub field: String,
    /// Comparison operator.
    pub operator: Operator,
    /// Single operand for scalar operators.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Literal>,
    /// Operand list for set operators (`IN`, `NOT_IN`, `ARRAY_CONTAINS_ANY`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<Literal>,
    /// Case sensitivity for string operators.
    #[serde(default = "default_true")]
    pub case_sensitive: bool,
}

impl Condition {
    /// Builds a condition with a single operand.
    pub fn new(field: impl Into<String>, operator: Operator, value: impl Into<Literal>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: Some(value.into()),
            values: Vec::new(),
            case_sensitive: true,
        }
    }

    /// Builds a condition with an operand list.
    pub fn with_values<I, T>(field: impl Into<String>, operator: Operator, values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Literal>,
    {
        Self {
            field: field.into(),
            operator,
            value: None,
            values: values.into_iter().map(Into::into).collect(),
            case_sensitive: true,
        }
    }

    /// Builds a condition without operands (`IS_NULL`, `IS_NOT_NULL`).
    pub fn unary(field: impl Into<String>, operator: Operator) -> Self {
        Self {
            field: field.into(),
            operator,
            value: None,
            values: Vec::new(),
            case_sensitive: true,
        }
    }

    /// Marks the condition case-insensitive.
    pub fn ignore_case(mut self) -> Self {
        self.case_sensitive = false;
        self
    }
}

/// Nested boolean filter tree as supplied by clients.
///
/// `And(vec![])` is TRUE and `Or(vec![])` is FALSE.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Filter {
    /// Leaf comparison.
    Condition(Condition),
    /// Conjunction.
    And(Vec<Filter>),
    /// Disjunction.
    Or(Vec<Filter>),
    /// Negation.
    Not(Box<Filter>),
}

impl Filter {
    /// `field EQ value`.
    pub fn eq(field: impl Into<String>, value: impl Into<Literal>) -> Self {
        Filter::Condition(Condition::new(field, Operator::Eq, value))
    }

    /// `field NE value`.
    pub fn ne(field: impl Into<String>, value: impl Into<Literal>) -> Self {
        Filter::Condition(Condition::new(field, Operator::Ne, value))
    }

    /// `field LT value`.
    pub fn lt(field: impl Into<String>, value: impl Into<Literal>) -> Self {
        Filter::Condition(Condition::new(field, Operator::Lt, value))
    }

    /// `field LTE value`.
    pub fn lte(field: impl Into<String>, value: impl Into<Literal>) -> Self {
        Filter::Condition(Condition::new(field, Operator::Lte, value))
    }

    /// `field GT value`.
    pub fn gt(field: impl Into<String>, value: impl Into<Literal>) -> Self {
        Filter::Condition(Condition::new(field, Operator::Gt, value))
    }

    /// `field GTE value`.
    pub fn gte(field: impl Into<String>, value: impl Into<Literal>) -> Self {
        Filter::Condition(Condition::new(field, Operator::Gte, value))
    }

    /// `field IN (values...)`.
    pub fn in_list<I, T>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Literal>,
    {
        Filter::Condition(Condition::with_values(field, Operator::In, values))
    }

    /// `field IS_NULL`.
    pub fn is_null(field: impl Into<String>) -> Self {
        Filter::Condition(Condition::unary(field, Operator::IsNull))
    }

    /// Generic single-operand condition.
    pub fn cmp(field: impl Into<String>, operator: Operator, value: impl Into<Literal>) -> Self {
        Filter::Condition(Condition::new(field, operator, value))
    }

    /// Conjunction of the supplied filters.
    pub fn and(children: impl IntoIterator<Item = Filter>) -> Self {
        Filter::And(children.into_iter().collect())
    }

    /// Disjunction of the supplied filters.
    pub fn or(children: impl IntoIterator<Item = Filter>) -> Self {
        Filter::Or(children.into_iter().collect())
    }

    /// Negation of the supplied filter.
    #[allow(clippy::should_implement_trait)]
    pub fn not(child: Filter) -> Self {
        Filter::Not(Box::new(child))
    }
}

impl From<Condition> for Filter {
    fn from(value: Condition) -> Self {
        Filter::Condition(value)
    }
}

/// Projection include/exclude lists; an empty include list selects every field.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Projection {
    /// Paths to include, wildcards allowed.
    #[serde(default)]
    pub include: Vec<String>,
    /// Paths to exclude, wildcards allowed.
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// Sort direction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    /// Ascending.
    #[default]
    Asc,
    /// Descending.
    Desc,
}

/// Placement of nulls in sorted output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NullOrdering {
    /// Nulls last for ascending sorts, first for descending sorts.
    #[default]
    Default,
    /// Nulls sort before every value.
    NullsFirst,
    /// Nulls sort after every value.
    NullsLast,
}

/// One sort key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    /// Dotted field path (or aggregate alias when aggregating).
    pub field: String,
    /// Sort direction.
    #[serde(default)]
    pub direction: Direction,
    /// Null placement.
    #[serde(default)]
    pub nulls: NullOrdering,
}

impl SortSpec {
    /// Ascending sort on `field`.
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Asc,
            nulls: NullOrdering::Default,
        }
    }

    /// Descending sort on `field`.
    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Desc,
            nulls: NullOrdering::Default,
        }
    }

    /// Overrides null placement.
    pub fn nulls(mut self, nulls: NullOrdering) -> Self {
        self.nulls = nulls;
        self
    }
}

/// Client pagination request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pagination {
    /// One-based page number plus page size.
    Page {
        /// One-based page number.
        page: u32,
        /// Rows per page.
        page_size: u32,
    },
    /// Opaque continuation cursor plus page size.
    Cursor {
        /// Cursor previously handed out for the last row of a page.
        cursor: String,
        /// Rows per page.
        page_size: u32,
    },
}

/// Aggregate functions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AggregateFunction {
    /// Row count, or non-null count when a field is given.
    Count,
    /// Distinct non-null values.
    CountDistinct,
    /// Numeric sum.
    Sum,
    /// Numeric mean.
    Avg,
    /// Minimum.
    Min,
    /// Maximum.
    Max,
    /// Percentile (0-100) of a numeric field.
    Percentile,
    /// Standard deviation.
    Stddev,
    /// Variance.
    Variance,
}

impl AggregateFunction {
    /// Wire name of the function.
    pub fn as_str(self) -> &'static str {
        match self {
            AggregateFunction::Count => "COUNT",
            AggregateFunction::CountDistinct => "COUNT_DISTINCT",
            AggregateFunction::Sum => "SUM",
            AggregateFunction::Avg => "AVG",
            AggregateFunction::Min => "MIN",
            AggregateFunction::Max => "MAX",
            AggregateFunction::Percentile => "PERCENTILE",
            AggregateFunction::Stddev => "STDDEV",
            AggregateFunction::Variance => "VARIANCE",
        }
    }
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One aggregate output column.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregateSpec {
    /// Aggregate function.
    pub function: AggregateFunction,
    /// Target field; optional only for `COUNT`.
    #[serde(default)]
    pub field: Option<String>,
    /// Output column name.
    pub alias: String,
    /// Percentile rank for `PERCENTILE`.
    #[serde(default)]
    pub percentile: Option<f64>,
}

impl AggregateSpec {
    /// Aggregate over `field`.
    pub fn new(
        function: AggregateFunction,
        field: impl Into<String>,
        alias: impl Into<String>,
    ) -> Self {
        Self {
            function,
            field: Some(field.into()),
            alias: alias.into(),
            percentile: None,
        }
    }

    /// `COUNT(*)`.
    pub fn count(alias: impl Into<String>) -> Self {
        Self {
            function: AggregateFunction::Count,
            field: None,
            alias: alias.into(),
            percentile: None,
        }
    }

    /// `PERCENTILE(field, rank)`.
    pub fn percentile(field: impl Into<String>, rank: f64, alias: impl Into<String>) -> Self {
        Self {
            function: AggregateFunction::Percentile,
            field: Some(field.into()),
            alias: alias.into(),
            percentile: Some(rank),
        }
    }
}

/// Grouping and aggregate computation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregationSpec {
    /// Group-by field paths.
    #[serde(default)]
    pub group_by: Vec<String>,
    /// Aggregate output columns.
    #[serde(default)]
    pub aggregates: Vec<AggregateSpec>,
    /// Post-aggregation filter over group-by fields and aggregate aliases.
    #[serde(default)]
    pub having: Option<Filter>,
}

/// Join flavour.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JoinType {
    /// Inner join.
    #[default]
    Inner,
    /// Left outer join.
    #[serde(rename = "LEFT", alias = "LEFT_OUTER")]
    LeftOuter,
}

impl JoinType {
    /// Wire name of the join type.
    pub fn as_str(self) -> &'static str {
        match self {
            JoinType::Inner => "INNER",
            JoinType::LeftOuter => "LEFT",
        }
    }
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Explicit equi-join against another entity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinSpec {
    /// Joined entity.
    pub entity: String,
    /// Alias used to address the joined entity's fields (`alias.field`).
    pub alias: String,
    /// Join flavour.
    #[serde(default)]
    pub join_type: JoinType,
    /// Key path on the left side (base entity or an earlier alias).
    pub left_key: String,
    /// Key path on the joined entity.
    pub right_key: String,
}

impl JoinSpec {
    /// Inner join of `entity AS alias ON left_key = alias.right_key`.
    pub fn inner(
        entity: impl Into<String>,
        alias: impl Into<String>,
        left_key: impl Into<String>,
        right_key: impl Into<String>,
    ) -> Self {
        Self {
            entity: entity.into(),
            alias: alias.into(),
            join_type: JoinType::Inner,
            left_key: left_key.into(),
            right_key: right_key.into(),
        }
    }

    /// Switches the join to a left outer join.
    pub fn left_outer(mut self) -> Self {
        self.join_type = JoinType::LeftOuter;
        self
    }
}

/// Read consistency requested by the client.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    /// Replica reads allowed.
    Eventual,
    /// Read-your-writes.
    #[default]
    Strong,
    /// Linearizable reads.
    Linearizable,
}

/// Execution hints and result options.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Compilation deadline in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Whether the caller wants the explain tree.
    #[serde(default)]
    pub explain: bool,
    /// Whether the total match count should be computed.
    #[serde(default)]
    pub count_total: bool,
    /// Read consistency.
    #[serde(default)]
    pub consistency: Consistency,
}

/// Complete client query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Target entity.
    pub entity: String,
    /// Optional filter tree.
    #[serde(default)]
    pub filter: Option<Filter>,
    /// Projection lists.
    #[serde(default)]
    pub projection: Projection,
    /// Sort keys, most significant first.
    #[serde(default)]
    pub sort: Vec<SortSpec>,
    /// Pagination request.
    #[serde(default)]
    pub pagination: Option<Pagination>,
    /// Grouping and aggregates.
    #[serde(default)]
    pub aggregation: Option<AggregationSpec>,
    /// Explicit joins in evaluation order.
    #[serde(default)]
    pub joins: Vec<JoinSpec>,
    /// Execution options.
    #[serde(default)]
    pub options: QueryOptions,
}

impl Query {
    /// Query over `entity` with every other section empty.
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            filter: None,
            projection: Projection::default(),
            sort: Vec::new(),
            pagination: None,
            aggregation: None,
            joins: Vec::new(),
            options: QueryOptions::default(),
        }
    }
}
