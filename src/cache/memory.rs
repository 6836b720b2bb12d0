//! Memory Cache - Bounded Primary Tier
//!
//! The fast tier every region owns. Capacity is an element count; when a put
//! pushes the tier over `max_objects`, victims are chosen by the eviction
//! policy and handed back to the caller, which spools them down the
//! auxiliary chain (see `CompositeCache::waterfall`).
//!
//! # Design
//!
//! - `lru::LruCache` (unbounded mode) under a `parking_lot::Mutex`; the bound
//!   is enforced here so evicted elements can be returned rather than lost
//! - Elements are stored as `Arc<CacheElement>` so readers share one copy
//!   and access-time updates are visible to every holder
//! - `get_quiet` reads without touching recency or access time, for
//!   background scanners

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use super::element::CacheElement;
use super::policy::EvictionPolicy;
use super::stats::{StatElement, Stats};

/// Bounded memory tier
pub struct MemoryCache<K: Hash + Eq, V> {
    /// Region name
    cache_name: String,
    /// Recency-ordered storage
    storage: Mutex<LruCache<K, Arc<CacheElement<K, V>>>>,
    /// Victim ordering
    policy: EvictionPolicy,
    /// Capacity in elements
    max_objects: AtomicUsize,
    /// Hit count
    hits: AtomicU64,
    /// Miss count
    misses: AtomicU64,
    /// Put count
    puts: AtomicU64,
    /// Eviction count
    evictions: AtomicU64,
}

impl<K, V> MemoryCache<K, V>
where
    K: Hash + Eq + Clone,
{
    /// Create a new memory tier
    pub fn new(cache_name: impl Into<String>, max_objects: usize, policy: EvictionPolicy) -> Self {
        Self {
            cache_name: cache_name.into(),
            storage: Mutex::new(LruCache::unbounded()),
            policy,
            max_objects: AtomicUsize::new(max_objects),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Get an element, refreshing recency (LRU) and its access time
    pub fn get(&self, key: &K) -> Option<Arc<CacheElement<K, V>>> {
        let found = {
            let mut storage = self.storage.lock();
            if self.policy.refresh_on_read() {
                storage.get(key).cloned()
            } else {
                storage.peek(key).cloned()
            }
        };

        match &found {
            Some(element) => {
                element.touch();
                self.hits.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
            }
        }
        found
    }

    /// Count a lookup that found nothing (for callers that looked up quietly)
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Get an element without refreshing recency, access time or counters
    pub fn get_quiet(&self, key: &K) -> Option<Arc<CacheElement<K, V>>> {
        self.storage.lock().peek(key).cloned()
    }

    /// Insert or replace an element. Returns the elements evicted to get
    /// back under `max_objects`, oldest first.
    pub fn put(&self, element: Arc<CacheElement<K, V>>) -> Vec<Arc<CacheElement<K, V>>> {
        self.puts.fetch_add(1, Ordering::Relaxed);
        let mut storage = self.storage.lock();
        storage.push(element.key().clone(), element);
        self.evict_over_capacity(&mut storage)
    }

    /// Insert only if the key is absent. Returns false when already present.
    pub fn put_if_absent(
        &self,
        element: Arc<CacheElement<K, V>>,
    ) -> (bool, Vec<Arc<CacheElement<K, V>>>) {
        let mut storage = self.storage.lock();
        if storage.contains(element.key()) {
            return (false, Vec::new());
        }
        self.puts.fetch_add(1, Ordering::Relaxed);
        storage.push(element.key().clone(), element);
        (true, self.evict_over_capacity(&mut storage))
    }

    fn evict_over_capacity(
        &self,
        storage: &mut LruCache<K, Arc<CacheElement<K, V>>>,
    ) -> Vec<Arc<CacheElement<K, V>>> {
        let max = self.max_objects.load(Ordering::Relaxed);
        let mut evicted = Vec::new();
        while storage.len() > max {
            match storage.pop_lru() {
                Some((_, element)) => evicted.push(element),
                None => break,
            }
        }
        if !evicted.is_empty() {
            self.evictions
                .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        }
        evicted
    }

    /// Remove an element
    pub fn remove(&self, key: &K) -> Option<Arc<CacheElement<K, V>>> {
        self.storage.lock().pop(key)
    }

    /// Evict up to `count` elements by policy, oldest first, for spooling
    pub fn free_elements(&self, count: usize) -> Vec<Arc<CacheElement<K, V>>> {
        let mut storage = self.storage.lock();
        let mut freed = Vec::with_capacity(count.min(storage.len()));
        while freed.len() < count {
            match storage.pop_lru() {
                Some((_, element)) => freed.push(element),
                None => break,
            }
        }
        if !freed.is_empty() {
            self.evictions.fetch_add(freed.len() as u64, Ordering::Relaxed);
        }
        freed
    }

    /// Snapshot of the current keys, most recent first. Safe to iterate
    /// while the tier keeps changing.
    pub fn key_set(&self) -> Vec<K> {
        self.storage.lock().iter().map(|(k, _)| k.clone()).collect()
    }

    /// Snapshot of the current elements, most recent first
    pub fn elements(&self) -> Vec<Arc<CacheElement<K, V>>> {
        self.storage.lock().iter().map(|(_, e)| Arc::clone(e)).collect()
    }

    /// Check if the tier holds a key (no recency change)
    pub fn contains(&self, key: &K) -> bool {
        self.storage.lock().contains(key)
    }

    /// Remove everything
    pub fn clear(&self) {
        self.storage.lock().clear();
    }

    /// Change the capacity. Returns elements evicted to honor a smaller bound.
    pub fn set_max_objects(&self, max_objects: usize) -> Vec<Arc<CacheElement<K, V>>> {
        self.max_objects.store(max_objects, Ordering::Relaxed);
        let mut storage = self.storage.lock();
        self.evict_over_capacity(&mut storage)
    }

    /// Capacity in elements
    pub fn max_objects(&self) -> usize {
        self.max_objects.load(Ordering::Relaxed)
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.storage.lock().len()
    }

    /// Check if the tier is empty
    pub fn is_empty(&self) -> bool {
        self.storage.lock().is_empty()
    }

    /// Eviction policy in use
    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    /// Get hit count
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Get miss count
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Get eviction count
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Reset counters
    pub fn reset_counters(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.puts.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }

    /// Memory tier stat block
    pub fn statistics(&self) -> Stats {
        Stats::new(
            format!("Memory Cache ({})", self.policy),
            vec![
                StatElement::new("List Size", self.len()),
                StatElement::new("Max Objects", self.max_objects()),
                StatElement::new("Hit Count", self.hits()),
                StatElement::new("Miss Count", self.misses()),
                StatElement::new("Put Count", self.puts.load(Ordering::Relaxed)),
                StatElement::new("Eviction Count", self.evictions()),
            ],
        )
    }

    /// Region name
    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }
}

// =============================================================================
// Tests
// =============================================================================
