//! Field path resolution.
//!
//! [`FieldResolver`] turns dotted paths into shared [`FieldRef`]s for the base
//! entity and any join aliases. [`AggregateScope`] resolves the post-aggregation
//! output (group-by columns and aggregate aliases) used by HAVING, sort and
//! projection when a query aggregates. Both deduplicate: resolving the same
//! path twice within one query returns the same `Arc`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::trace;

use crate::query::errors::FieldResolutionError;
use crate::query::schema::{FieldId, FieldRef, FieldSource, FieldType, SchemaRegistry};

/// Path segment matching any single segment; trailing, it matches every leaf below.
pub const WILDCARD: &str = "*";

/// Something that resolves client paths to field references.
pub trait FieldScope {
    /// Resolves a concrete path. `context` labels wildcard rejections.
    fn resolve_field(
        &mut self,
        path: &str,
        context: &'static str,
    ) -> Result<Arc<FieldRef>, FieldResolutionError>;

    /// Resolves a path that may contain wildcards into every matching leaf.
    fn expand_field(&mut self, path: &str) -> Result<Vec<Arc<FieldRef>>, FieldResolutionError>;
}

fn split_path(path: &str) -> Result<Vec<&str>, FieldResolutionError> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(FieldResolutionError::MalformedPath {
            path: path.to_owned(),
        });
    }
    Ok(segments)
}

fn has_wildcard(path: &str) -> bool {
    path.split('.').any(|segment| segment == WILDCARD)
}

fn pattern_matches(pattern: &[&str], candidate: &str) -> bool {
    let segments: Vec<&str> = candidate.split('.').collect();
    let trailing = pattern.last() == Some(&WILDCARD);
    let fixed = if trailing {
        &pattern[..pattern.len() - 1]
    } else {
        pattern
    };
    if trailing {
        if segments.len() <= fixed.len() {
            return false;
        }
    } else if segments.len() != fixed.len() {
        return false;
    }
    fixed
        .iter()
        .zip(segments.iter())
        .all(|(want, have)| *want == WILDCARD || want == have)
}

/// Per-query resolver over a schema registry snapshot.
pub struct FieldResolver<'a> {
    registry: &'a dyn SchemaRegistry,
    entity: String,
    aliases: BTreeMap<String, String>,
    resolved: HashMap<String, Arc<FieldRef>>,
}

impl<'a> FieldResolver<'a> {
    /// Resolver for `entity`; fails if the entity is unknown.
    pub fn new(
        registry: &'a dyn SchemaRegistry,
        entity: &str,
    ) -> Result<Self, FieldResolutionError> {
        if !registry.has_entity(entity) {
            return Err(FieldResolutionError::UnknownEntity {
                entity: entity.to_owned(),
            });
        }
        Ok(Self {
            registry,
            entity: entity.to_owned(),
            aliases: BTreeMap::new(),
            resolved: HashMap::new(),
        })
    }

    /// Base entity name.
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Makes `alias.path` resolve against `entity`.
    pub fn register_alias(
        &mut self,
        alias: &str,
        entity: &str,
    ) -> Result<(), FieldResolutionError> {
        if !self.registry.has_entity(entity) {
            return Err(FieldResolutionError::UnknownEntity {
                entity: entity.to_owned(),
            });
        }
        self.aliases.insert(alias.to_owned(), entity.to_owned());
        Ok(())
    }

    /// Resolves `path` directly on a joined entity, bypassing alias lookup.
    pub fn resolve_on_alias(
        &mut self,
        alias: &str,
        path: &str,
    ) -> Result<Arc<FieldRef>, FieldResolutionError> {
        self.resolve_field(&format!("{alias}.{path}"), "join key")
    }

    /// Number of distinct fields resolved so far.
    pub fn resolved_count(&self) -> usize {
        self.resolved.len()
    }

    fn target_of<'p>(&self, segments: &'p [&'p str]) -> (Option<&str>, &'p [&'p str]) {
        if segments.len() > 1 {
            if let Some((alias, _)) = self.aliases.get_key_value(segments[0]) {
                return (Some(alias.as_str()), &segments[1..]);
            }
        }
        (None, segments)
    }

    fn lookup(
        &mut self,
        alias: Option<String>,
        rest: &str,
        full: &str,
    ) -> Result<Arc<FieldRef>, FieldResolutionError> {
        if let Some(hit) = self.resolved.get(full) {
            return Ok(Arc::clone(hit));
        }
        let field = match &alias {
            None => self.registry.resolve(&self.entity, rest)?,
            Some(alias) => {
                let entity = self.aliases.get(alias).cloned().unwrap_or_default();
                let mut field = self.registry.resolve(&entity, rest).map_err(|err| match err {
                    FieldResolutionError::FieldNotFound { entity, .. } => {
                        FieldResolutionError::not_found(entity, full)
                    }
                    other => other,
                })?;
                field.source = FieldSource::Join {
                    alias: alias.clone(),
                };
                field
            }
        };
        trace!(path = full, id = field.id.0, "query.resolve.field");
        let field = Arc::new(field);
        self.resolved.insert(full.to_owned(), Arc::clone(&field));
        Ok(field)
    }
}

impl FieldScope for FieldResolver<'_> {
    fn resolve_field(
        &mut self,
        path: &str,
        context: &'static str,
    ) -> Result<Arc<FieldRef>, FieldResolutionError> {
        let segments = split_path(path)?;
        if has_wildcard(path) {
            return Err(FieldResolutionError::WildcardNotAllowed {
                path: path.to_owned(),
                context,
            });
        }
        let (alias, rest) = self.target_of(&segments);
        let alias = alias.map(str::to_owned);
        let rest = rest.join(".");
        self.lookup(alias, &rest, path)
    }

    fn expand_field(&mut self, path: &str) -> Result<Vec<Arc<FieldRef>>, FieldResolutionError> {
        if !has_wildcard(path) {
            return self.resolve_field(path, "projection").map(|field| vec![field]);
        }
        let segments = split_path(path)?;
        let (alias, pattern) = self.target_of(&segments);
        let alias = alias.map(str::to_owned);
        let entity = match &alias {
            Some(alias) => self.aliases.get(alias).cloned().unwrap_or_default(),
            None => self.entity.clone(),
        };
        let catalog = self.registry.catalog(&entity)?;
        let mut out = Vec::new();
        for meta in catalog {
            if meta.field_type == FieldType::Object || !pattern_matches(pattern, &meta.path) {
                continue;
            }
            let full = match &alias {
                Some(alias) => format!("{alias}.{}", meta.path),
                None => meta.path.clone(),
            };
            out.push(self.lookup(alias.clone(), &meta.path, &full)?);
        }
        if out.is_empty() {
            return Err(FieldResolutionError::AmbiguousPath {
                entity,
                path: path.to_owned(),
            });
        }
        Ok(out)
    }
}

/// Output column produced by aggregation.
#[derive(Clone, Debug)]
pub struct OutputColumn {
    /// Column name as addressed by clients.
    pub name: String,
    /// Declared type of the column.
    pub field_type: FieldType,
}

/// Resolves paths against the post-aggregation output.
pub struct AggregateScope<'r, 'a> {
    base: &'r mut FieldResolver<'a>,
    columns: BTreeMap<String, Arc<FieldRef>>,
}

/// Aggregate output ids live above the registry's id space.
const AGGREGATE_ID_BASE: u32 = 0x8000_0000;

impl<'r, 'a> AggregateScope<'r, 'a> {
    /// Scope exposing `group_by` fields under their client names and `outputs` as aliases.
    pub fn new(
        base: &'r mut FieldResolver<'a>,
        group_by: &[Arc<FieldRef>],
        outputs: &[OutputColumn],
    ) -> Self {
        let mut columns = BTreeMap::new();
        for field in group_by {
            columns.insert(field.display_name(), Arc::clone(field));
        }
        let mut sorted: Vec<&OutputColumn> = outputs.iter().collect();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));
        for (idx, column) in sorted.into_iter().enumerate() {
            let field = FieldRef {
                id: FieldId(AGGREGATE_ID_BASE + idx as u32),
                entity: base.entity().to_owned(),
                path: column.name.clone(),
                field_type: column.field_type.clone(),
                nullable: true,
                indexed: false,
                aggregable: false,
                source: FieldSource::Aggregate,
            };
            columns
                .entry(column.name.clone())
                .or_insert_with(|| Arc::new(field));
        }
        Self { base, columns }
    }

    /// Every output column in name order.
    pub fn columns(&self) -> impl Iterator<Item = &Arc<FieldRef>> {
        self.columns.values()
    }
}

impl FieldScope for AggregateScope<'_, '_> {
    fn resolve_field(
        &mut self,
        path: &str,
        context: &'static str,
    ) -> Result<Arc<FieldRef>, FieldResolutionError> {
        split_path(path)?;
        if has_wildcard(path) {
            return Err(FieldResolutionError::WildcardNotAllowed {
                path: path.to_owned(),
                context,
            });
        }
        if let Some(column) = self.columns.get(path) {
            return Ok(Arc::clone(column));
        }
        match self.base.resolve_field(path, context) {
            Ok(_) => Err(FieldResolutionError::NotInAggregateOutput {
                path: path.to_owned(),
            }),
            Err(err) => Err(err),
        }
    }

    fn expand_field(&mut self, path: &str) -> Result<Vec<Arc<FieldRef>>, FieldResolutionError> {
        if path == WILDCARD {
            return Ok(self.columns.values().cloned().collect());
        }
        self.resolve_field(path, "projection").map(|field| vec![field])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::schema::{EntitySchema, FieldDef, InMemorySchema};

    fn registry() -> InMemorySchema {
        InMemorySchema::new()
            .with_entity(
                EntitySchema::new("orders")
                    .with_field(FieldDef::new("total", FieldType::Float).aggregable())
                    .with_field(FieldDef::new("customer_id", FieldType::Integer).indexed())
                    .with_field(FieldDef::new("shipping.city", FieldType::String))
                    .with_field(FieldDef::new("shipping.geo.lat", FieldType::Float))
                    .with_field(FieldDef::new("shipping.geo.lng", FieldType::Float)),
            )
            .with_entity(
                EntitySchema::new("customers")
                    .with_field(FieldDef::new("id", FieldType::Integer).indexed())
                    .with_field(FieldDef::new("name", FieldType::String)),
            )
    }

    #[test]
    fn repeated_paths_share_one_reference() {
        let registry = registry();
        let mut resolver = FieldResolver::new(&registry, "orders").expect("entity");
        let a = resolver.resolve_field("total", "filter").expect("resolves");
        let b = resolver.resolve_field("total", "sort").expect("resolves");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(resolver.resolved_count(), 1);
    }

    #[test]
    fn trailing_wildcard_expands_to_every_leaf() {
        let registry = registry();
        let mut resolver = FieldResolver::new(&registry, "orders").expect("entity");
        let fields = resolver.expand_field("shipping.*").expect("expands");
        let paths: Vec<&str> = fields.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["shipping.city", "shipping.geo.lat", "shipping.geo.lng"]);
        let again = resolver.resolve_field("shipping.city", "sort").expect("resolves");
        assert!(Arc::ptr_eq(&fields[0], &again));
    }

    #[test]
    fn middle_wildcard_matches_one_segment() {
        let registry = registry();
        let mut resolver = FieldResolver::new(&registry, "orders").expect("entity");
        let fields = resolver.expand_field("shipping.*.lat").expect("expands");
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].path, "shipping.geo.lat");
    }

    #[test]
    fn wildcard_with_no_match_is_ambiguous() {
        let registry = registry();
        let mut resolver = FieldResolver::new(&registry, "orders").expect("entity");
        let err = resolver.expand_field("billing.*").expect_err("no match");
        assert_eq!(err.code(), "AMBIGUOUS_PATH");
        let err = resolver.resolve_field("shipping.*", "sort").expect_err("wildcard");
        assert_eq!(err.code(), "WILDCARD_NOT_ALLOWED");
    }

    #[test]
    fn alias_prefix_resolves_against_joined_entity() {
        let registry = registry();
        let mut resolver = FieldResolver::new(&registry, "orders").expect("entity");
        resolver.register_alias("customer", "customers").expect("alias");
        let name = resolver.resolve_field("customer.name", "projection").expect("alias path");
        assert_eq!(name.entity, "customers");
        assert_eq!(name.display_name(), "customer.name");
        assert_eq!(name.join_alias(), Some("customer"));
        let err = resolver.resolve_field("customer.email", "projection").expect_err("missing");
        assert_eq!(
            err,
            FieldResolutionError::not_found("customers", "customer.email")
        );
    }

    #[test]
    fn aggregate_scope_distinguishes_ungrouped_fields() {
        let registry = registry();
        let mut resolver = FieldResolver::new(&registry, "orders").expect("entity");
        let city = resolver.resolve_field("shipping.city", "group by").expect("city");
        let outputs = [OutputColumn {
            name: "revenue".into(),
            field_type: FieldType::Float,
        }];
        let mut scope = AggregateScope::new(&mut resolver, &[city], &outputs);
        let revenue = scope.resolve_field("revenue", "having").expect("alias");
        assert_eq!(revenue.source, FieldSource::Aggregate);
        assert!(scope.resolve_field("shipping.city", "sort").is_ok());
        let err = scope.resolve_field("total", "sort").expect_err("not grouped");
        assert_eq!(err.code(), "FIELD_NOT_IN_AGGREGATE_OUTPUT");
        let err = scope.resolve_field("bogus", "sort").expect_err("unknown");
        assert_eq!(err.code(), "FIELD_NOT_FOUND");
    }
}
