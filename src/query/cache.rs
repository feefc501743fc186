//! Bounded LRU cache of compiled plans keyed by fingerprint and catalog versions.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::query::canonical::Fingerprint;
use crate::query::explain::ExplainNode;
use crate::query::logical::LogicalPlan;
use crate::query::physical::PhysicalPlan;

/// Identity of a cached plan.
///
/// Versions combine the snapshot generation with the descriptor's own epoch,
/// so replacing either catalog makes older entries unreachable.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PlanKey {
    /// Semantic fingerprint of the canonical query.
    pub fingerprint: Fingerprint,
    /// Target backend.
    pub backend: String,
    /// Schema snapshot generation and registry epoch.
    pub schema_version: (u64, u64),
    /// Capability snapshot generation and descriptor epoch.
    pub capabilities_version: (u64, u64),
}

/// Plans shared between compilations of semantically equal queries.
#[derive(Clone, Debug)]
pub struct CachedPlan {
    /// Logical plan.
    pub logical: Arc<LogicalPlan>,
    /// Physical plan.
    pub physical: Arc<PhysicalPlan>,
    /// Explain tree of the physical plan.
    pub explain: Arc<ExplainNode>,
}

/// Hit and miss counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups that found a plan.
    pub hits: u64,
    /// Lookups that did not.
    pub misses: u64,
    /// Entries currently held.
    pub len: usize,
}

/// Thread-safe plan cache; a capacity of zero disables it.
pub struct PlanCache {
    entries: Option<Mutex<LruCache<PlanKey, CachedPlan>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PlanCache {
    /// Cache holding at most `capacity` plans.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Whether the cache stores anything at all.
    pub fn is_enabled(&self) -> bool {
        self.entries.is_some()
    }

    /// Looks up `key`, refreshing its recency on a hit.
    pub fn get(&self, key: &PlanKey) -> Option<CachedPlan> {
        let entries = self.entries.as_ref()?;
        let found = entries.lock().get(key).cloned();
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Stores `plan`, evicting the least recently used entry when full.
    pub fn insert(&self, key: PlanKey, plan: CachedPlan) {
        if let Some(entries) = &self.entries {
            entries.lock().put(key, plan);
        }
    }

    /// Drops every entry.
    pub fn clear(&self) {
        if let Some(entries) = &self.entries {
            entries.lock().clear();
        }
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            len: self.entries.as_ref().map_or(0, |e| e.lock().len()),
        }
    }
}
