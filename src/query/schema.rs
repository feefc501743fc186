//! Schema registry contract and an in-memory implementation.
//!
//! The registry hands out [`FieldRef`]s: immutable, schema-qualified
//! descriptions of a single field that every later stage keys on.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::query::errors::FieldResolutionError;

/// Schema-qualified field identifier assigned by the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldId(pub u32);

/// Declared type of a schema field.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    /// UTF-8 string.
    String,
    /// Signed 64-bit integer.
    Integer,
    /// 64-bit float.
    Float,
    /// Boolean.
    Boolean,
    /// UTC timestamp.
    Timestamp,
    /// List of the element type.
    List(Box<FieldType>),
    /// Nested message; its members are registered as dotted child paths.
    Object,
}

impl FieldType {
    /// List of `element`.
    pub fn list(element: FieldType) -> Self {
        FieldType::List(Box::new(element))
    }

    /// Integer or float.
    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Integer | FieldType::Float)
    }

    /// Everything except lists and objects.
    pub fn is_scalar(&self) -> bool {
        !matches!(self, FieldType::List(_) | FieldType::Object)
    }

    /// Scalar types with a meaningful total order.
    pub fn is_orderable(&self) -> bool {
        matches!(
            self,
            FieldType::String | FieldType::Integer | FieldType::Float | FieldType::Timestamp
        )
    }

    /// Element type of a list.
    pub fn element(&self) -> Option<&FieldType> {
        match self {
            FieldType::List(inner) => Some(inner),
            _ => None,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::String => write!(f, "string"),
            FieldType::Integer => write!(f, "integer"),
            FieldType::Float => write!(f, "float"),
            FieldType::Boolean => write!(f, "boolean"),
            FieldType::Timestamp => write!(f, "timestamp"),
            FieldType::List(inner) => write!(f, "list<{inner}>"),
            FieldType::Object => write!(f, "object"),
        }
    }
}

/// Catalog entry for one field, nested members included.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMetadata {
    /// Registry-assigned identifier.
    pub id: FieldId,
    /// Canonical dotted path relative to the entity.
    pub path: String,
    /// Declared type.
    pub field_type: FieldType,
    /// Whether the field may be null or absent.
    pub nullable: bool,
    /// Whether the storage layer keeps an index on the field.
    pub indexed: bool,
    /// Whether aggregate functions may target the field.
    pub aggregable: bool,
}

/// Where a resolved field lives relative to the query.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldSource {
    /// Field of the queried entity.
    Entity,
    /// Field of a joined entity addressed through its alias.
    Join {
        /// Join alias.
        alias: String,
    },
    /// Group-by column or aggregate alias after aggregation.
    Aggregate,
}

/// Resolved, immutable field reference.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldRef {
    /// Registry-assigned identifier.
    pub id: FieldId,
    /// Entity owning the field.
    pub entity: String,
    /// Canonical dotted path relative to `entity`.
    pub path: String,
    /// Declared type.
    pub field_type: FieldType,
    /// Whether the field may be null.
    pub nullable: bool,
    /// Whether an index exists.
    pub indexed: bool,
    /// Whether aggregates may target the field.
    pub aggregable: bool,
    /// Resolution scope.
    pub source: FieldSource,
}

impl FieldRef {
    /// Builds a reference for an entity field from its catalog entry.
    pub fn from_metadata(entity: &str, meta: &FieldMetadata) -> Self {
        Self {
            id: meta.id,
            entity: entity.to_owned(),
            path: meta.path.clone(),
            field_type: meta.field_type.clone(),
            nullable: meta.nullable,
            indexed: meta.indexed,
            aggregable: meta.aggregable,
            source: FieldSource::Entity,
        }
    }

    /// Name the client uses to address the field (`alias.path` for joins).
    pub fn display_name(&self) -> String {
        match &self.source {
            FieldSource::Join { alias } => format!("{alias}.{}", self.path),
            FieldSource::Entity | FieldSource::Aggregate => self.path.clone(),
        }
    }

    /// Join alias when the field belongs to a joined entity.
    pub fn join_alias(&self) -> Option<&str> {
        match &self.source {
            FieldSource::Join { alias } => Some(alias),
            _ => None,
        }
    }

    /// Stable textual key used for canonical ordering.
    pub fn sort_key(&self) -> String {
        match &self.source {
            FieldSource::Entity => format!("e:{}.{}", self.entity, self.path),
            FieldSource::Join { alias } => format!("j:{alias}:{}.{}", self.entity, self.path),
            FieldSource::Aggregate => format!("g:{}", self.path),
        }
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name())
    }
}

/// Provides field catalogs per entity.
pub trait SchemaRegistry: Send + Sync {
    /// Resolves a concrete (wildcard-free) dotted path segment by segment.
    fn resolve(&self, entity: &str, path: &str) -> Result<FieldRef, FieldResolutionError>;
    /// Returns every field of the entity, nested members included, in id order.
    fn catalog(&self, entity: &str) -> Result<Vec<FieldMetadata>, FieldResolutionError>;
    /// Whether the entity exists.
    fn has_entity(&self, entity: &str) -> bool;
    /// Monotonic version, bumped whenever the catalog changes.
    fn epoch(&self) -> u64 {
        0
    }
}

/// Field declaration used to build an [`EntitySchema`].
#[derive(Clone, Debug)]
pub struct FieldDef {
    path: String,
    field_type: FieldType,
    nullable: bool,
    indexed: bool,
    aggregable: bool,
}

impl FieldDef {
    /// Nullable, unindexed, non-aggregable field.
    pub fn new(path: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            path: path.into(),
            field_type,
            nullable: true,
            indexed: false,
            aggregable: false,
        }
    }

    /// Marks the field as indexed.
    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    /// Marks the field as aggregable.
    pub fn aggregable(mut self) -> Self {
        self.aggregable = true;
        self
    }

    /// Marks the field as non-nullable.
    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Field declarations of one entity.
#[derive(Clone, Debug)]
pub struct EntitySchema {
    name: String,
    fields: Vec<FieldDef>,
}

impl EntitySchema {
    /// Empty entity.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Adds a field. Missing parent segments of a dotted path become objects.
    pub fn with_field(mut self, def: FieldDef) -> Self {
        self.fields.push(def);
        self
    }
}

#[derive(Clone, Debug, Default)]
struct EntityCatalog {
    fields: BTreeMap<String, FieldMetadata>,
}

/// Registry backed by in-process maps.
#[derive(Clone, Debug, Default)]
pub struct InMemorySchema {
    entities: BTreeMap<String, EntityCatalog>,
    next_id: u32,
    epoch: u64,
}

impl InMemorySchema {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) an entity. Ids are assigned in path order.
    pub fn with_entity(mut self, schema: EntitySchema) -> Self {
        let mut defs: BTreeMap<String, FieldDef> = BTreeMap::new();
        for def in schema.fields {
            let segments: Vec<&str> = def.path.split('.').collect();
            for depth in 1..segments.len() {
                let parent = segments[..depth].join(".");
                defs.entry(parent.clone())
                    .or_insert_with(|| FieldDef::new(parent, FieldType::Object));
            }
            defs.insert(def.path.clone(), def);
        }
        let mut catalog = EntityCatalog::default();
        for (path, def) in defs {
            let id = FieldId(self.next_id);
            self.next_id += 1;
            catalog.fields.insert(
                path.clone(),
                FieldMetadata {
                    id,
                    path,
                    field_type: def.field_type,
                    nullable: def.nullable,
                    indexed: def.indexed,
                    aggregable: def.aggregable,
                },
            );
        }
        self.entities.insert(schema.name, catalog);
        self.epoch += 1;
        self
    }

    fn entity(&self, entity: &str) -> Result<&EntityCatalog, FieldResolutionError> {
        self.entities
            .get(entity)
            .ok_or_else(|| FieldResolutionError::UnknownEntity {
                entity: entity.to_owned(),
            })
    }
}

impl SchemaRegistry for InMemorySchema {
    fn resolve(&self, entity: &str, path: &str) -> Result<FieldRef, FieldResolutionError> {
        let catalog = self.entity(entity)?;
        let mut prefix = String::with_capacity(path.len());
        let mut current: Option<&FieldMetadata> = None;
        for segment in path.split('.') {
            if segment.is_empty() {
                return Err(FieldResolutionError::MalformedPath {
                    path: path.to_owned(),
                });
            }
            if let Some(parent) = current {
                if parent.field_type != FieldType::Object {
                    return Err(FieldResolutionError::not_found(entity, path));
                }
                prefix.push('.');
            }
            prefix.push_str(segment);
            current = Some(
                catalog
                    .fields
                    .get(&prefix)
                    .ok_or_else(|| FieldResolutionError::not_found(entity, path))?,
            );
        }
        match current {
            Some(meta) => Ok(FieldRef::from_metadata(entity, meta)),
            None => Err(FieldResolutionError::MalformedPath {
                path: path.to_owned(),
            }),
        }
    }

    fn catalog(&self, entity: &str) -> Result<Vec<FieldMetadata>, FieldResolutionError> {
        let mut fields: Vec<FieldMetadata> =
            self.entity(entity)?.fields.values().cloned().collect();
        fields.sort_by_key(|meta| meta.id);
        Ok(fields)
    }

    fn has_entity(&self, entity: &str) -> bool {
        self.entities.contains_key(entity)
    }

    fn epoch(&self) -> u64 {
        self.epoch
    }
}
