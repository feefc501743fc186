//! Shared, refreshable snapshots of read-mostly collaborators.
//!
//! Readers hold the lock only long enough to clone an [`Arc`], so compilation
//! never blocks on a refresh and a refresh never waits for a compilation.
//! Each query works against one snapshot from start to finish.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

/// Consistent view of a shared collaborator.
pub struct Snapshot<T: ?Sized> {
    /// Collaborator at the time of the load.
    pub value: Arc<T>,
    /// Generation counter, bumped on every replace.
    pub generation: u64,
}

impl<T: ?Sized> Clone for Snapshot<T> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            generation: self.generation,
        }
    }
}

/// Concurrent-reader cache around a schema registry or capability descriptor.
pub struct SharedSnapshot<T: ?Sized> {
    name: &'static str,
    inner: RwLock<Snapshot<T>>,
}

impl<T: ?Sized> SharedSnapshot<T> {
    /// Wraps an already shared value.
    pub fn from_arc(name: &'static str, value: Arc<T>) -> Self {
        Self {
            name,
            inner: RwLock::new(Snapshot {
                value,
                generation: 0,
            }),
        }
    }

    /// Current value and generation.
    pub fn load(&self) -> Snapshot<T> {
        self.inner.read().clone()
    }

    /// Current generation.
    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }

    /// Swaps in a new value and returns the new generation.
    pub fn replace(&self, value: Arc<T>) -> u64 {
        let generation = {
            let mut guard = self.inner.write();
            guard.generation += 1;
            guard.value = value;
            guard.generation
        };
        info!(cache = self.name, generation, "catalog.snapshot.replace");
        generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::schema::{EntitySchema, FieldDef, FieldType, InMemorySchema, SchemaRegistry};

    #[test]
    fn replace_bumps_generation_and_keeps_old_snapshots_alive() {
        let shared: SharedSnapshot<dyn SchemaRegistry> = SharedSnapshot::from_arc(
            "schema",
            Arc::new(InMemorySchema::new().with_entity(EntitySchema::new("users"))),
        );
        let before = shared.load();
        assert_eq!(before.generation, 0);

        let next = InMemorySchema::new().with_entity(
            EntitySchema::new("users").with_field(FieldDef::new("status", FieldType::String)),
        );
        assert_eq!(shared.replace(Arc::new(next)), 1);

        assert!(before.value.resolve("users", "status").is_err());
        let after = shared.load();
        assert_eq!(after.generation, 1);
        assert_eq!(shared.generation(), 1);
        assert!(after.value.resolve("users", "status").is_ok());
    }
}
