//! Process-local read-through cache with explicit invalidation only.
//!
//! Entries never expire on their own. Staleness is bounded by the set of
//! mutations that invalidate each key, listed in
//! [`crate::invalidation::Mutation::invalidations`]. The cache is never the
//! source of truth: a restart empties it and reads fall back to the stores.
//!
//! No lock is held while a loader runs. Two concurrent misses on the same
//! cold key may both call their loader; the last writer wins, which is fine
//! because loads are idempotent reads.
//!
//! Every invalidation bumps a generation number for the key (or for the
//! whole family). A loader's result is stored only if no invalidation ran
//! while it was loading, so a read that started before a commit can never
//! put the pre-commit value back after the commit invalidated it.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::invalidation::Invalidation;

/// Family of cached values. Invalidation can target a whole family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheType {
    /// [`crate::types::ShiftCounter`] keyed by counter key.
    Counter,
    /// [`crate::types::Shift`] definitions keyed by counter key.
    Shift,
    /// Attendance overview aggregates keyed by event.
    AttendanceOverview,
}

impl std::fmt::Display for CacheType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Counter => write!(f, "counter"),
            Self::Shift => write!(f, "shift"),
            Self::AttendanceOverview => write!(f, "attendance_overview"),
        }
    }
}

/// Snapshot of cache effectiveness counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that ran the loader.
    pub misses: u64,
    /// Entries currently held.
    pub entries: usize,
}

impl CacheStats {
    /// Fraction of lookups that hit, or `0.0` before any lookup.
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

type Slot = Arc<dyn Any + Send + Sync>;

/// Invalidation count observed before a load: `(family, key)`.
type Generation = (u64, u64);

#[derive(Default)]
struct Family {
    entries: HashMap<String, Slot>,
    // kept after the entry is gone so an in-flight load can detect the invalidation
    key_generations: HashMap<String, u64>,
    generation: u64,
}

impl Family {
    fn generation_of(&self, key: &str) -> Generation {
        (
            self.generation,
            self.key_generations.get(key).copied().unwrap_or(0),
        )
    }
}

/// Read-through cache keyed by `(CacheType, key)`.
#[derive(Default)]
pub struct ReadThroughCache {
    families: RwLock<HashMap<CacheType, Family>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl std::fmt::Debug for ReadThroughCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadThroughCache")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl ReadThroughCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached value, or runs `loader`, stores its success and returns it.
    ///
    /// Loader errors are returned as-is and nothing is cached. A loaded value
    /// is returned but not cached when the key was invalidated while loading.
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        kind: CacheType,
        key: &str,
        loader: F,
    ) -> Result<T, E>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        let generation = match self.lookup::<T>(kind, key) {
            Ok(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(cache_type = %kind, key, "[cache.hit] served from cache");
                return Ok(value);
            }
            Err(generation) => generation,
        };

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(cache_type = %kind, key, "[cache.miss] loading value");

        let value = loader().await?;
        if !self.insert_if_current(kind, key, generation, value.clone()) {
            debug!(cache_type = %kind, key, "[cache.stale_load] invalidated while loading, not cached");
        }
        Ok(value)
    }

    /// Returns a cached value without loading.
    pub fn get<T: Clone + Send + Sync + 'static>(&self, kind: CacheType, key: &str) -> Option<T> {
        self.lookup(kind, key).ok()
    }

    /// Stores a value, replacing any previous entry.
    pub fn insert<T: Send + Sync + 'static>(&self, kind: CacheType, key: &str, value: T) {
        let slot: Slot = Arc::new(value);
        self.families
            .write()
            .entry(kind)
            .or_default()
            .entries
            .insert(key.to_string(), slot);
    }

    /// Whether an entry exists for the key.
    pub fn contains(&self, kind: CacheType, key: &str) -> bool {
        self.families
            .read()
            .get(&kind)
            .is_some_and(|family| family.entries.contains_key(key))
    }

    /// Removes one entry. Returns whether it was present.
    pub fn invalidate(&self, kind: CacheType, key: &str) -> bool {
        let removed = {
            let mut families = self.families.write();
            let family = families.entry(kind).or_default();
            *family.key_generations.entry(key.to_string()).or_insert(0) += 1;
            family.entries.remove(key).is_some()
        };
        debug!(cache_type = %kind, key, removed, "[cache.invalidate] entry invalidated");
        removed
    }

    /// Removes every entry of a family. Returns how many were dropped.
    pub fn invalidate_type(&self, kind: CacheType) -> usize {
        let removed = {
            let mut families = self.families.write();
            let family = families.entry(kind).or_default();
            family.generation += 1;
            family.key_generations.clear();
            let removed = family.entries.len();
            family.entries.clear();
            removed
        };
        debug!(cache_type = %kind, removed, "[cache.invalidate_type] family invalidated");
        removed
    }

    /// Applies a list of invalidations, as produced by the invalidation table.
    pub fn apply(&self, invalidations: &[Invalidation]) {
        for invalidation in invalidations {
            match invalidation {
                Invalidation::Entry { kind, key } => {
                    self.invalidate(*kind, key);
                }
                Invalidation::Type(kind) => {
                    self.invalidate_type(*kind);
                }
            }
        }
    }

    /// Drops every entry. Hit/miss counters are kept.
    pub fn clear(&self) {
        for family in self.families.write().values_mut() {
            family.generation += 1;
            family.key_generations.clear();
            family.entries.clear();
        }
    }

    /// Current hit/miss counters and entry count.
    pub fn stats(&self) -> CacheStats {
        let entries = self
            .families
            .read()
            .values()
            .map(|family| family.entries.len())
            .sum();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries,
        }
    }

    /// The cached value, or on a miss the generation a loader must still see when it stores.
    fn lookup<T: Clone + Send + Sync + 'static>(
        &self,
        kind: CacheType,
        key: &str,
    ) -> Result<T, Generation> {
        let families = self.families.read();
        let Some(family) = families.get(&kind) else {
            return Err((0, 0));
        };
        family
            .entries
            .get(key)
            .and_then(|slot| slot.downcast_ref::<T>().cloned())
            .ok_or_else(|| family.generation_of(key))
    }

    fn insert_if_current<T: Send + Sync + 'static>(
        &self,
        kind: CacheType,
        key: &str,
        generation: Generation,
        value: T,
    ) -> bool {
        let mut families = self.families.write();
        let family = families.entry(kind).or_default();
        if family.generation_of(key) != generation {
            return false;
        }
        let slot: Slot = Arc::new(value);
        family.entries.insert(key.to_string(), slot);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn second_lookup_is_served_without_loader() {
        let cache = ReadThroughCache::new();
        let loads = AtomicUsize::new(0);

        for _ in 0..2 {
            let value: Result<u32, ()> = cache
                .get_or_compute(CacheType::Counter, "fair/morning", || async {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                })
                .await;
            assert_eq!(value, Ok(7));
        }

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 1,
                misses: 1,
                entries: 1
            }
        );
        assert!((cache.stats().hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn loader_errors_are_not_cached() {
        let cache = ReadThroughCache::new();

        let first: Result<u32, &str> = cache
            .get_or_compute(CacheType::Shift, "fair/morning", || async { Err("boom") })
            .await;
        assert_eq!(first, Err("boom"));
        assert!(!cache.contains(CacheType::Shift, "fair/morning"));

        let second: Result<u32, &str> = cache
            .get_or_compute(CacheType::Shift, "fair/morning", || async { Ok(3) })
            .await;
        assert_eq!(second, Ok(3));
    }

    #[tokio::test]
    async fn invalidate_forces_reload() {
        let cache = ReadThroughCache::new();
        cache.insert(CacheType::Counter, "fair/morning", 1_u32);

        assert!(cache.invalidate(CacheType::Counter, "fair/morning"));
        assert!(!cache.invalidate(CacheType::Counter, "fair/morning"));

        let value: Result<u32, ()> = cache
            .get_or_compute(CacheType::Counter, "fair/morning", || async { Ok(2) })
            .await;
        assert_eq!(value, Ok(2));
    }

    #[test]
    fn invalidate_type_only_touches_that_family() {
        let cache = ReadThroughCache::new();
        cache.insert(CacheType::Counter, "fair/morning", 1_u32);
        cache.insert(CacheType::Counter, "fair/evening", 2_u32);
        cache.insert(CacheType::Shift, "fair/morning", "shift".to_string());

        assert_eq!(cache.invalidate_type(CacheType::Counter), 2);
        assert!(!cache.contains(CacheType::Counter, "fair/evening"));
        assert!(cache.contains(CacheType::Shift, "fair/morning"));
        assert_eq!(cache.stats().entries, 1);
    }

    #[test]
    fn entries_of_another_type_are_a_miss() {
        let cache = ReadThroughCache::new();
        cache.insert(CacheType::Counter, "fair/morning", 1_u32);

        assert_eq!(cache.get::<String>(CacheType::Counter, "fair/morning"), None);
        assert_eq!(cache.get::<u32>(CacheType::Counter, "fair/morning"), Some(1));
    }

    #[test]
    fn apply_runs_entry_and_type_invalidations() {
        let cache = ReadThroughCache::new();
        cache.insert(CacheType::Counter, "fair/morning", 1_u32);
        cache.insert(CacheType::Shift, "fair/morning", 10_u32);
        cache.insert(CacheType::AttendanceOverview, "fair", 0_u32);

        cache.apply(&[
            Invalidation::Entry {
                kind: CacheType::Counter,
                key: "fair/morning".to_string(),
            },
            Invalidation::Type(CacheType::Shift),
        ]);

        assert!(!cache.contains(CacheType::Counter, "fair/morning"));
        assert!(!cache.contains(CacheType::Shift, "fair/morning"));
        assert!(cache.contains(CacheType::AttendanceOverview, "fair"));
    }

    #[tokio::test]
    async fn value_loaded_across_an_invalidation_is_returned_but_not_cached() {
        let cache = ReadThroughCache::new();

        let loaded: Result<u32, ()> = cache
            .get_or_compute(CacheType::Counter, "fair/noon", || async {
                // a commit lands while the read is in flight
                cache.invalidate(CacheType::Counter, "fair/noon");
                Ok(0)
            })
            .await;
        let reloaded: Result<u32, ()> = cache
            .get_or_compute(CacheType::Counter, "fair/noon", || async { Ok(2) })
            .await;

        assert_eq!(loaded, Ok(0));
        assert_eq!(reloaded, Ok(2));
        assert_eq!(cache.get::<u32>(CacheType::Counter, "fair/noon"), Some(2));
    }

    #[tokio::test]
    async fn family_invalidation_during_a_load_also_blocks_the_store() {
        let cache = ReadThroughCache::new();
        cache.invalidate(CacheType::Shift, "fair/noon");

        let loaded: Result<u32, ()> = cache
            .get_or_compute(CacheType::Shift, "fair/noon", || async {
                cache.invalidate_type(CacheType::Shift);
                Ok(2)
            })
            .await;

        assert_eq!(loaded, Ok(2));
        assert!(!cache.contains(CacheType::Shift, "fair/noon"));
    }

    #[tokio::test]
    async fn invalidating_another_key_does_not_block_the_store() {
        let cache = ReadThroughCache::new();

        let _: Result<u32, ()> = cache
            .get_or_compute(CacheType::Counter, "fair/noon", || async {
                cache.invalidate(CacheType::Counter, "fair/morning");
                Ok(2)
            })
            .await;

        assert!(cache.contains(CacheType::Counter, "fair/noon"));
    }
}
