//! Cache Access Facade
//!
//! The typed API callers use against one region. Cheap to clone; every
//! clone talks to the same `CompositeCache`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tracing::debug;

use super::attributes::{CompositeCacheAttributes, ElementAttributes};
use super::composite::CompositeCache;
use super::element::{CacheElement, CacheKey, CacheValue};
use super::matcher::KeyMatcher;
use super::stats::CacheStats;
use crate::error::{Error, Result};

/// Typed access to one region
pub struct CacheAccess<K: CacheKey, V: CacheValue> {
    cache: Arc<CompositeCache<K, V>>,
}

impl<K: CacheKey, V: CacheValue> Clone for CacheAccess<K, V> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
        }
    }
}

impl<K: CacheKey, V: CacheValue> CacheAccess<K, V> {
    /// Wrap a region
    pub fn new(cache: Arc<CompositeCache<K, V>>) -> Self {
        Self { cache }
    }

    /// The underlying region
    pub fn cache_control(&self) -> &Arc<CompositeCache<K, V>> {
        &self.cache
    }

    /// Region name
    pub fn cache_name(&self) -> &str {
        self.cache.cache_name()
    }

    fn new_element(&self, key: K, value: V, attributes: ElementAttributes) -> CacheElement<K, V> {
        CacheElement::new(self.cache.cache_name(), key, value, attributes)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Value for `key`, looking through every tier. A miss is `Ok(None)`.
    pub async fn get(&self, key: &K) -> Result<Option<V>> {
        Ok(self.cache.get(key).await?.map(|e| e.value().clone()))
    }

    /// Value for `key`, computing it with `supplier` on a total miss.
    ///
    /// Concurrent callers for the same key share a single supplier run. If
    /// that run fails, the caller that ran it gets the supplier's error;
    /// the others re-check the cache once and otherwise get
    /// `Error::LoaderFailed` (or `Error::LoadAbandoned` if the running
    /// caller was cancelled).
    pub async fn get_with<F, Fut>(&self, key: K, supplier: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        if let Some(value) = self.get(&key).await? {
            return Ok(value);
        }

        let loaded = self
            .cache
            .loads()
            .run(key.clone(), || async {
                // Someone may have stored it between our miss and taking the lead.
                if let Some(value) = self.get(&key).await? {
                    return Ok(value);
                }
                let value = supplier().await?;
                self.put(key.clone(), value.clone()).await?;
                Ok(value)
            })
            .await;

        match loaded {
            Err(e @ (Error::LoaderFailed(_) | Error::LoadAbandoned)) => {
                debug!(cache = %self.cache_name(), key = ?key, error = %e, "Shared load failed, re-checking cache");
                match self.get(&key).await? {
                    Some(value) => Ok(value),
                    None => Err(e),
                }
            }
            other => other,
        }
    }

    /// Values whose keys match, from memory plus any auxiliary sweep
    pub async fn get_matching(&self, matcher: &dyn KeyMatcher<K>) -> Result<HashMap<K, V>> {
        Ok(self
            .cache
            .get_matching(matcher, false)
            .await?
            .into_iter()
            .map(|(k, e)| (k, e.value().clone()))
            .collect())
    }

    /// Full element (value plus attributes) for `key`
    pub async fn get_cache_element(&self, key: &K) -> Result<Option<Arc<CacheElement<K, V>>>> {
        self.cache.get(key).await
    }

    /// Full elements for every key found
    pub async fn get_cache_elements(&self, keys: &[K]) -> Result<HashMap<K, Arc<CacheElement<K, V>>>> {
        self.cache.get_multiple(keys).await
    }

    /// Full elements whose keys match
    pub async fn get_matching_cache_elements(
        &self,
        matcher: &dyn KeyMatcher<K>,
    ) -> Result<HashMap<K, Arc<CacheElement<K, V>>>> {
        self.cache.get_matching(matcher, false).await
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Store a value with the region's default element attributes
    pub async fn put(&self, key: K, value: V) -> Result<()> {
        let attributes = self.cache.new_element_attributes();
        self.cache.update(self.new_element(key, value, attributes)).await
    }

    /// Store a value only if no tier holds the key. Returns false when it did.
    pub async fn put_safe(&self, key: K, value: V) -> Result<bool> {
        let attributes = self.cache.new_element_attributes();
        self.cache.update_if_absent(self.new_element(key, value, attributes)).await
    }

    /// Store a value with explicit element attributes
    pub async fn put_with_attributes(&self, key: K, value: V, attributes: ElementAttributes) -> Result<()> {
        self.cache.update(self.new_element(key, value, attributes.fresh_copy())).await
    }

    /// Remove a key from every tier. Removing an absent key is not an error.
    pub async fn remove(&self, key: &K) -> Result<bool> {
        self.cache.remove(key).await
    }

    /// Replace the attributes of a stored element, restarting its lifetime.
    /// Returns false when the key is not cached.
    pub async fn reset_element_attributes(&self, key: &K, attributes: ElementAttributes) -> Result<bool> {
        let Some(element) = self.cache.get(key).await? else {
            return Ok(false);
        };
        let mut updated = CacheElement::clone(&element);
        updated.set_attributes(attributes.fresh_copy());
        self.cache.update(updated).await?;
        Ok(true)
    }

    /// Attributes of a stored element
    pub async fn get_element_attributes(&self, key: &K) -> Result<Option<ElementAttributes>> {
        Ok(self.cache.get(key).await?.map(|e| e.attributes().clone()))
    }

    // =========================================================================
    // Management
    // =========================================================================

    /// Spool memory to disk tiers and shut the region down. Idempotent.
    pub async fn dispose(&self) -> Result<()> {
        self.cache.dispose().await
    }

    /// Remove everything and reset the region's counters
    pub async fn clear(&self) -> Result<()> {
        self.cache.clear().await
    }

    /// Attributes given to values put without explicit attributes
    pub fn get_default_element_attributes(&self) -> Result<ElementAttributes> {
        self.cache.get_default_element_attributes()
    }

    /// Replace the default element attributes
    pub fn set_default_element_attributes(&self, attributes: ElementAttributes) -> Result<()> {
        self.cache.set_default_element_attributes(attributes)
    }

    /// Region attributes
    pub fn get_cache_attributes(&self) -> Result<CompositeCacheAttributes> {
        self.cache.get_cache_attributes()
    }

    /// Replace the region attributes
    pub async fn set_cache_attributes(&self, attributes: CompositeCacheAttributes) -> Result<()> {
        self.cache.set_cache_attributes(attributes).await
    }

    /// Evict up to `count` elements from memory now. Returns how many went.
    pub async fn free_memory_elements(&self, count: usize) -> Result<usize> {
        self.cache.free_memory_elements(count).await
    }

    /// Structured statistics snapshot
    pub fn get_statistics(&self) -> CacheStats {
        self.cache.get_statistics()
    }

    /// Statistics rendered as text
    pub fn get_stats(&self) -> String {
        self.cache.get_stats()
    }
}

impl<K: CacheKey, V: CacheValue> std::fmt::Debug for CacheAccess<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheAccess")
            .field("cache", &self.cache)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
