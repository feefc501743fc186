//! Backend capability descriptors consulted by the physical planner.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::query::ast::{AggregateFunction, JoinType, Operator};
use crate::query::errors::BackendCapabilityError;
use crate::query::schema::FieldType;

/// Index maintained by a backend on one entity field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    /// Backend-specific index name.
    pub name: String,
    /// Dotted field path the index covers.
    pub path: String,
}

/// Per-field statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldStats {
    /// Number of distinct non-null values.
    pub distinct_count: u64,
    /// Number of null or absent values.
    pub null_count: u64,
}

/// Per-entity statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityStats {
    /// Total row count.
    pub row_count: u64,
    /// Statistics keyed by dotted field path.
    pub fields: BTreeMap<String, FieldStats>,
}

impl EntityStats {
    /// Statistics with only a row count.
    pub fn with_rows(row_count: u64) -> Self {
        Self {
            row_count,
            fields: BTreeMap::new(),
        }
    }

    /// Adds statistics for one field.
    pub fn with_field(mut self, path: impl Into<String>, stats: FieldStats) -> Self {
        self.fields.insert(path.into(), stats);
        self
    }
}

/// Describes what a backend can execute natively.
///
/// Every method may fail with [`BackendCapabilityError`] when the descriptor
/// for `backend` is missing or unavailable.
pub trait BackendCapabilities: Send + Sync {
    /// Whether the backend evaluates `operator` on fields of `field_type`.
    fn supports_filter(
        &self,
        backend: &str,
        operator: Operator,
        field_type: &FieldType,
    ) -> Result<bool, BackendCapabilityError>;
    /// Whether the backend executes joins of this flavour.
    fn supports_join(&self, backend: &str, join_type: JoinType)
        -> Result<bool, BackendCapabilityError>;
    /// Indexes the backend maintains on `entity`.
    fn indexes_for(
        &self,
        backend: &str,
        entity: &str,
    ) -> Result<Vec<IndexDescriptor>, BackendCapabilityError>;
    /// Whether the backend computes `function` natively.
    fn supports_aggregate(
        &self,
        backend: &str,
        function: AggregateFunction,
    ) -> Result<bool, BackendCapabilityError>;
    /// Whether the backend sorts natively.
    fn supports_sort(&self, backend: &str) -> Result<bool, BackendCapabilityError>;
    /// Whether native sorts are only possible along an index.
    fn requires_sort_index(&self, backend: &str) -> Result<bool, BackendCapabilityError>;
    /// Whether unindexed scans of `entity` are permitted.
    fn allows_full_scan(&self, backend: &str, entity: &str) -> Result<bool, BackendCapabilityError>;
    /// Optional statistics for `entity`.
    fn statistics(
        &self,
        backend: &str,
        entity: &str,
    ) -> Result<Option<EntityStats>, BackendCapabilityError>;
    /// Monotonic version, bumped whenever the descriptor changes.
    fn epoch(&self) -> u64 {
        0
    }
}

/// Capabilities of a single backend.
#[derive(Clone, Debug, Default)]
pub struct BackendProfile {
    filter_ops: BTreeSet<Operator>,
    filter_exclusions: Vec<(Operator, FieldType)>,
    joins: BTreeSet<JoinType>,
    aggregates: BTreeSet<AggregateFunction>,
    sort: bool,
    sort_requires_index: bool,
    indexes: BTreeMap<String, Vec<IndexDescriptor>>,
    no_full_scan: BTreeSet<String>,
    stats: BTreeMap<String, EntityStats>,
    unavailable: Option<String>,
}

impl BackendProfile {
    /// Backend that executes nothing natively besides scans.
    pub fn new() -> Self {
        Self::default()
    }

    /// Document-store style backend: every operator, join, aggregate, and native sort.
    pub fn full() -> Self {
        Self {
            filter_ops: Operator::ALL.into_iter().collect(),
            joins: [JoinType::Inner, JoinType::LeftOuter].into_iter().collect(),
            aggregates: [
                AggregateFunction::Count,
                AggregateFunction::CountDistinct,
                AggregateFunction::Sum,
                AggregateFunction::Avg,
                AggregateFunction::Min,
                AggregateFunction::Max,
                AggregateFunction::Percentile,
                AggregateFunction::Stddev,
                AggregateFunction::Variance,
            ]
            .into_iter()
            .collect(),
            sort: true,
            ..Self::default()
        }
    }

    /// Key-value style backend: equality lookups only, sorts need an index.
    pub fn key_value() -> Self {
        Self {
            filter_ops: [Operator::Eq, Operator::In].into_iter().collect(),
            sort: true,
            sort_requires_index: true,
            ..Self::default()
        }
    }

    /// Adds natively evaluated filter operators.
    pub fn with_filter_ops(mut self, ops: impl IntoIterator<Item = Operator>) -> Self {
        self.filter_ops.extend(ops);
        self
    }

    /// Removes a natively evaluated filter operator.
    pub fn without_filter_op(mut self, op: Operator) -> Self {
        self.filter_ops.remove(&op);
        self
    }

    /// Refuses `op` on fields of `field_type` even if otherwise supported.
    pub fn exclude_filter_type(mut self, op: Operator, field_type: FieldType) -> Self {
        self.filter_exclusions.push((op, field_type));
        self
    }

    /// Adds native join flavours.
    pub fn with_joins(mut self, joins: impl IntoIterator<Item = JoinType>) -> Self {
        self.joins.extend(joins);
        self
    }

    /// Adds native aggregate functions.
    pub fn with_aggregates(
        mut self,
        functions: impl IntoIterator<Item = AggregateFunction>,
    ) -> Self {
        self.aggregates.extend(functions);
        self
    }

    /// Toggles native sorting.
    pub fn with_sort(mut self, sort: bool) -> Self {
        self.sort = sort;
        self
    }

    /// Requires an index for native sorts.
    pub fn sort_requires_index(mut self) -> Self {
        self.sort_requires_index = true;
        self
    }

    /// Registers an index on `entity.path`.
    pub fn with_index(mut self, entity: impl Into<String>, path: impl Into<String>) -> Self {
        let entity = entity.into();
        let path = path.into();
        let name = format!("idx_{}_{}", entity, path.replace('.', "_"));
        self.indexes
            .entry(entity)
            .or_default()
            .push(IndexDescriptor { name, path });
        self
    }

    /// Forbids unindexed scans of `entity`.
    pub fn forbid_full_scan(mut self, entity: impl Into<String>) -> Self {
        self.no_full_scan.insert(entity.into());
        self
    }

    /// Attaches statistics for `entity`.
    pub fn with_stats(mut self, entity: impl Into<String>, stats: EntityStats) -> Self {
        self.stats.insert(entity.into(), stats);
        self
    }

    /// Marks the descriptor as unavailable; every lookup fails with `reason`.
    pub fn unavailable(mut self, reason: impl Into<String>) -> Self {
        self.unavailable = Some(reason.into());
        self
    }
}

/// Capability descriptors keyed by backend id.
#[derive(Clone, Debug, Default)]
pub struct InMemoryCapabilities {
    backends: BTreeMap<String, BackendProfile>,
    epoch: u64,
}

impl InMemoryCapabilities {
    /// No registered backends.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the profile for `backend`.
    pub fn with_backend(mut self, backend: impl Into<String>, profile: BackendProfile) -> Self {
        self.backends.insert(backend.into(), profile);
        self.epoch += 1;
        self
    }

    fn profile(&self, backend: &str) -> Result<&BackendProfile, BackendCapabilityError> {
        let profile =
            self.backends
                .get(backend)
                .ok_or_else(|| BackendCapabilityError::UnknownBackend {
                    backend: backend.to_owned(),
                })?;
        match &profile.unavailable {
            Some(reason) => Err(BackendCapabilityError::Unavailable {
                backend: backend.to_owned(),
                reason: reason.clone(),
            }),
            None => Ok(profile),
        }
    }
}

impl BackendCapabilities for InMemoryCapabilities {
    fn supports_filter(
        &self,
        backend: &str,
        operator: Operator,
        field_type: &FieldType,
    ) -> Result<bool, BackendCapabilityError> {
        let profile = self.profile(backend)?;
        let excluded = profile
            .filter_exclusions
            .iter()
            .any(|(op, ty)| *op == operator && ty == field_type);
        Ok(profile.filter_ops.contains(&operator) && !excluded)
    }

    fn supports_join(
        &self,
        backend: &str,
        join_type: JoinType,
    ) -> Result<bool, BackendCapabilityError> {
        Ok(self.profile(backend)?.joins.contains(&join_type))
    }

    fn indexes_for(
        &self,
        backend: &str,
        entity: &str,
    ) -> Result<Vec<IndexDescriptor>, BackendCapabilityError> {
        Ok(self
            .profile(backend)?
            .indexes
            .get(entity)
            .cloned()
            .unwrap_or_default())
    }

    fn supports_aggregate(
        &self,
        backend: &str,
        function: AggregateFunction,
    ) -> Result<bool, BackendCapabilityError> {
        Ok(self.profile(backend)?.aggregates.contains(&function))
    }

    fn supports_sort(&self, backend: &str) -> Result<bool, BackendCapabilityError> {
        Ok(self.profile(backend)?.sort)
    }

    fn requires_sort_index(&self, backend: &str) -> Result<bool, BackendCapabilityError> {
        Ok(self.profile(backend)?.sort_requires_index)
    }

    fn allows_full_scan(
        &self,
        backend: &str,
        entity: &str,
    ) -> Result<bool, BackendCapabilityError> {
        Ok(!self.profile(backend)?.no_full_scan.contains(entity))
    }

    fn statistics(
        &self,
        backend: &str,
        entity: &str,
    ) -> Result<Option<EntityStats>, BackendCapabilityError> {
        Ok(self.profile(backend)?.stats.get(entity).cloned())
    }

    fn epoch(&self) -> u64 {
        self.epoch
    }
}
