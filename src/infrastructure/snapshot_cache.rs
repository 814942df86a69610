// Copyright 2025 Cowboy AI, LLC.

//! In-memory snapshot cache
//!
//! Holds approximately `approximate_max_entries` serialized aggregate root
//! states, each keyed by `(aggregate_root_id, global_sequence_number_cutoff)`.
//! Lookups are point-in-time: asking for position P never yields a snapshot
//! cut after P.
//!
//! Each entry is scored `seq * hits / max(0.01, seconds_since_last_hit)`.
//! When the cache grows past its limit the lowest scored entries are removed
//! in batches of `max(10, max / 10)`. Only the decision to trim is
//! coordinated (a single flag); reads and writes of entries never wait for it.

use crate::aggregate::{Aggregate, AggregateRoot};
use crate::clock::{Clock, SystemClock};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur when reading a cache entry
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// Error serializing or deserializing snapshot data
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// The entry was written by a different aggregate type
    #[error("Snapshot holds a {actual}, not a {expected}")]
    TypeMismatch {
        /// Requested aggregate type
        expected: &'static str,
        /// Stored aggregate type
        actual: String,
    },
}

/// One cached snapshot. The serialized state never changes; only the hit
/// bookkeeping does.
struct CacheEntry {
    aggregate_root_id: String,
    aggregate_type: String,
    sequence_number: i64,
    global_sequence_number: i64,
    data: Bytes,
    hits: AtomicU64,
    last_hit_micros: AtomicI64,
}

impl CacheEntry {
    fn create<A: Aggregate>(
        root: &AggregateRoot<A>,
        now: DateTime<Utc>,
    ) -> Result<Self, SnapshotError> {
        Ok(Self {
            aggregate_root_id: root.id().to_string(),
            aggregate_type: A::AGGREGATE_TYPE.to_string(),
            sequence_number: root.current_sequence_number(),
            global_sequence_number: root.global_sequence_number_cutoff(),
            data: Bytes::from(serde_json::to_vec(root.state())?),
            hits: AtomicU64::new(0),
            last_hit_micros: AtomicI64::new(now.timestamp_micros()),
        })
    }

    fn clone_root<A: Aggregate>(&self) -> Result<AggregateRoot<A>, SnapshotError> {
        if self.aggregate_type != A::AGGREGATE_TYPE {
            return Err(SnapshotError::TypeMismatch {
                expected: A::AGGREGATE_TYPE,
                actual: self.aggregate_type.clone(),
            });
        }
        let state: A = serde_json::from_slice(&self.data)?;
        Ok(AggregateRoot::from_parts(
            self.aggregate_root_id.clone(),
            self.sequence_number,
            self.global_sequence_number,
            state,
        ))
    }

    fn register_hit(&self, now: DateTime<Utc>) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.last_hit_micros.store(now.timestamp_micros(), Ordering::Relaxed);
    }

    fn value_at(&self, now: DateTime<Utc>) -> f64 {
        let elapsed_micros = now.timestamp_micros() - self.last_hit_micros.load(Ordering::Relaxed);
        let seconds_since_last_hit = (elapsed_micros as f64 / 1_000_000.0).max(0.01);
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        self.sequence_number as f64 * hits / seconds_since_last_hit
    }
}

/// Value-scored, point-in-time snapshot cache
pub struct InMemorySnapshotCache {
    entries: DashMap<String, DashMap<i64, Arc<CacheEntry>>>,
    count: AtomicUsize,
    approximate_max_entries: AtomicUsize,
    trimming: AtomicBool,
    clock: Arc<dyn Clock>,
}

impl InMemorySnapshotCache {
    /// Create a cache holding approximately `approximate_max_entries` entries;
    /// 0 disables it
    pub fn new(approximate_max_entries: usize) -> Self {
        Self::with_clock(approximate_max_entries, Arc::new(SystemClock))
    }

    /// Create a cache that reads time from `clock`
    pub fn with_clock(approximate_max_entries: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            count: AtomicUsize::new(0),
            approximate_max_entries: AtomicUsize::new(approximate_max_entries),
            trimming: AtomicBool::new(false),
            clock,
        }
    }

    /// Configured approximate maximum
    pub fn approximate_max_entries(&self) -> usize {
        self.approximate_max_entries.load(Ordering::Relaxed)
    }

    /// Change the approximate maximum, trimming right away if needed
    pub fn set_approximate_max_entries(&self, max: usize) {
        self.approximate_max_entries.store(max, Ordering::Relaxed);
        self.possibly_trim();
    }

    /// Whether the cache is configured to hold nothing
    pub fn is_disabled(&self) -> bool {
        self.approximate_max_entries() == 0
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get a fresh copy of the newest snapshot of `aggregate_root_id` whose
    /// cutoff is at or before `global_sequence_number`
    ///
    /// Unreadable entries are logged and reported as a miss.
    pub fn get_clone_from_cache<A: Aggregate>(
        &self,
        aggregate_root_id: &str,
        global_sequence_number: i64,
    ) -> Option<AggregateRoot<A>> {
        let entry = {
            let per_root = self.entries.get(aggregate_root_id)?;
            let best = per_root
                .iter()
                .filter(|e| e.global_sequence_number <= global_sequence_number)
                .max_by_key(|e| e.global_sequence_number)
                .map(|e| Arc::clone(e.value()));
            best
        }?;

        match entry.clone_root::<A>() {
            Ok(root) => {
                entry.register_hit(self.clock.now());
                debug!(
                    aggregate_root_id = %aggregate_root_id,
                    requested = global_sequence_number,
                    cutoff = entry.global_sequence_number,
                    "Snapshot cache hit"
                );
                Some(root)
            }
            Err(error) => {
                warn!(
                    aggregate_root_id = %aggregate_root_id,
                    global_sequence_number,
                    error = %error,
                    "Could not read snapshot cache entry"
                );
                None
            }
        }
    }

    /// Store a snapshot of the root's current state
    pub fn put_clone_to_cache<A: Aggregate>(&self, root: &AggregateRoot<A>) {
        if self.is_disabled() || !root.has_history() {
            return;
        }

        let entry = match CacheEntry::create(root, self.clock.now()) {
            Ok(entry) => entry,
            Err(error) => {
                warn!(
                    aggregate_root_id = %root.id(),
                    error = %error,
                    "Could not serialize aggregate root for the snapshot cache"
                );
                return;
            }
        };

        {
            // Counted while the shard is locked, so a trim can never remove
            // the entry before it is counted
            let per_root = self.entries.entry(root.id().to_string()).or_default();
            if let Entry::Vacant(vacant) = per_root.entry(entry.global_sequence_number) {
                vacant.insert(Arc::new(entry));
                self.count.fetch_add(1, Ordering::Relaxed);
            };
        }

        self.possibly_trim();
    }

    fn possibly_trim(&self) {
        let max = self.approximate_max_entries();
        if self.len() <= max {
            return;
        }

        if self
            .trimming
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let removals_per_pass = (max / 10).max(10);
        while self.len() > max {
            let removed = self.trim_pass(removals_per_pass);
            if removed == 0 {
                break;
            }
        }

        self.entries.retain(|_, per_root| !per_root.is_empty());
        self.trimming.store(false, Ordering::Release);
    }

    fn trim_pass(&self, removals: usize) -> usize {
        let now = self.clock.now();
        let mut scored: Vec<(f64, String, i64)> = Vec::with_capacity(self.len());
        for per_root in self.entries.iter() {
            for entry in per_root.value().iter() {
                scored.push((entry.value_at(now), per_root.key().clone(), *entry.key()));
            }
        }
        scored.sort_by(|a, b| a.0.total_cmp(&b.0));

        debug!(
            entries = scored.len(),
            aggregate_roots = self.entries.len(),
            removals,
            "Trimming snapshot cache"
        );

        let mut removed = 0;
        for (_, aggregate_root_id, global_sequence_number) in scored {
            if removed >= removals {
                break;
            }
            let Some(per_root) = self.entries.get(&aggregate_root_id) else {
                continue;
            };
            if per_root.remove(&global_sequence_number).is_some() {
                removed += 1;
                self.count.fetch_sub(1, Ordering::Relaxed);
            }
        }

        if removed < removals {
            debug!(
                missing = removals - removed,
                "Fewer cache entries removed than planned, probably removed concurrently"
            );
        }
        removed
    }
}

impl Default for InMemorySnapshotCache {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl fmt::Debug for InMemorySnapshotCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemorySnapshotCache")
            .field("entries", &self.len())
            .field("approximate_max_entries", &self.approximate_max_entries())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{Counter, Incremented};
    use crate::clock::ManualClock;
    use crate::events::DomainEvent;
    use chrono::Duration;

    fn root_at(id: &str, seq: i64, global: i64, value: i64) -> AggregateRoot<Counter> {
        let mut root = AggregateRoot::<Counter>::new(id);
        let event = DomainEvent::from_typed(&Incremented { by: value }).unwrap();
        root.replay(&event, seq, global).unwrap();
        root
    }

    #[test]
    fn test_point_in_time_lookup() {
        let cache = InMemorySnapshotCache::new(100);
        cache.put_clone_to_cache(&root_at("a", 2, 5, 1));
        cache.put_clone_to_cache(&root_at("a", 4, 10, 2));

        let at_7 = cache.get_clone_from_cache::<Counter>("a", 7).unwrap();
        let at_12 = cache.get_clone_from_cache::<Counter>("a", 12).unwrap();

        assert_eq!(at_7.global_sequence_number_cutoff(), 5);
        assert_eq!(at_7.state().value, 1);
        assert_eq!(at_12.global_sequence_number_cutoff(), 10);
        assert!(cache.get_clone_from_cache::<Counter>("a", 3).is_none());
        assert!(cache.get_clone_from_cache::<Counter>("b", 100).is_none());
    }

    #[test]
    fn test_clones_are_independent() {
        let cache = InMemorySnapshotCache::new(100);
        cache.put_clone_to_cache(&root_at("a", 0, 0, 3));

        let mut first = cache.get_clone_from_cache::<Counter>("a", 0).unwrap();
        first.emit(&Incremented { by: 100 }).unwrap();
        let second = cache.get_clone_from_cache::<Counter>("a", 0).unwrap();

        assert_eq!(second.state().value, 3);
    }

    #[test]
    fn test_disabled_cache_stores_nothing() {
        let cache = InMemorySnapshotCache::new(0);
        cache.put_clone_to_cache(&root_at("a", 0, 0, 1));

        assert!(cache.is_empty());
        assert!(cache.get_clone_from_cache::<Counter>("a", 0).is_none());
    }

    #[test]
    fn test_type_mismatch_is_a_miss() {
        #[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
        struct Other;

        impl Aggregate for Other {
            const AGGREGATE_TYPE: &'static str = "Other";

            fn apply(&mut self, _event: &DomainEvent) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let cache = InMemorySnapshotCache::new(10);
        cache.put_clone_to_cache(&root_at("a", 0, 0, 1));

        assert!(cache.get_clone_from_cache::<Other>("a", 0).is_none());
    }

    #[test]
    fn test_trim_evicts_cold_entries_first() {
        let clock = ManualClock::default();
        let cache = InMemorySnapshotCache::with_clock(20, Arc::new(clock.clone()));

        for i in 0..10 {
            cache.put_clone_to_cache(&root_at(&format!("hot-{i}"), 50, i, 1));
        }
        for _ in 0..5 {
            for i in 0..10 {
                cache.get_clone_from_cache::<Counter>(&format!("hot-{i}"), i64::MAX);
            }
        }
        clock.advance(Duration::minutes(10));
        for i in 0..15 {
            cache.put_clone_to_cache(&root_at(&format!("cold-{i}"), 50, 100 + i, 1));
        }

        assert!(cache.len() <= 20);
        for i in 0..10 {
            assert!(
                cache.get_clone_from_cache::<Counter>(&format!("hot-{i}"), i64::MAX).is_some(),
                "hot entry {i} was evicted"
            );
        }
    }

    #[test]
    fn test_lowering_max_trims_immediately() {
        let cache = InMemorySnapshotCache::new(100);
        for i in 0..60 {
            cache.put_clone_to_cache(&root_at(&format!("r-{i}"), 1, i, 1));
        }

        cache.set_approximate_max_entries(15);

        assert!(cache.len() <= 15);
    }

    #[test]
    fn test_count_tracks_entries_under_concurrent_puts_and_trims() {
        let cache = Arc::new(InMemorySnapshotCache::new(25));

        let writers: Vec<_> = (0..4)
            .map(|writer| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let id = format!("w{writer}-{}", i % 10);
                        cache.put_clone_to_cache(&root_at(&id, i, i, 1));
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let stored: usize = cache.entries.iter().map(|per_root| per_root.len()).sum();
        assert_eq!(cache.len(), stored);

        cache.set_approximate_max_entries(25);
        assert!(cache.len() <= 25);
    }
}
