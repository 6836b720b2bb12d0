//! Cache Element Types
//!
//! The unit stored in every tier: key, value and lifetime attributes.

use std::fmt::Debug;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

use super::attributes::{ElementAttributes, Expiry};

/// Bounds every region key satisfies
pub trait CacheKey: Hash + Eq + Clone + Debug + Send + Sync + 'static {}

impl<T> CacheKey for T where T: Hash + Eq + Clone + Debug + Send + Sync + 'static {}

/// Bounds every region value satisfies
pub trait CacheValue: Clone + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + Send + Sync + 'static {}

/// A cached key/value pair together with its attributes
#[derive(Clone, Serialize, Deserialize)]
pub struct CacheElement<K, V> {
    /// Owning region
    cache_name: String,
    /// Element key
    key: K,
    /// Element value
    value: V,
    /// Lifetime metadata
    attributes: ElementAttributes,
}

impl<K, V> CacheElement<K, V> {
    /// Create a new element
    pub fn new(cache_name: impl Into<String>, key: K, value: V, attributes: ElementAttributes) -> Self {
        Self {
            cache_name: cache_name.into(),
            key,
            value,
            attributes,
        }
    }

    /// Owning region name
    #[inline]
    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    /// Element key
    #[inline]
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Element value
    #[inline]
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Element attributes
    #[inline]
    pub fn attributes(&self) -> &ElementAttributes {
        &self.attributes
    }

    /// Mutable attributes
    pub fn attributes_mut(&mut self) -> &mut ElementAttributes {
        &mut self.attributes
    }

    /// Replace the attributes
    pub fn set_attributes(&mut self, attributes: ElementAttributes) {
        self.attributes = attributes;
    }

    /// Record an access
    #[inline]
    pub fn touch(&self) {
        self.attributes.touch();
    }

    /// Expiry check against `now` (epoch millis), no side effects
    #[inline]
    pub fn expiry_at(&self, now: u64) -> Option<Expiry> {
        self.attributes.expiry_at(now)
    }

    /// Split into key and value
    pub fn into_parts(self) -> (K, V) {
        (self.key, self.value)
    }
}

impl<K: std::fmt::Debug, V> std::fmt::Debug for CacheElement<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheElement")
            .field("cache_name", &self.cache_name)
            .field("key", &self.key)
            .field("attributes", &self.attributes)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_accessors() {
        let element = CacheElement::new("users", "k1".to_string(), 7u32, ElementAttributes::new());
        assert_eq!(element.cache_name(), "users");
        assert_eq!(element.key(), "k1");
        assert_eq!(*element.value(), 7);
        assert!(element.attributes().is_eternal);
    }

    #[test]
    fn test_element_json_keeps_lifetime() {
        let attrs = ElementAttributes::new().with_max_life(30);
        let element = CacheElement::new("users", 1u64, "v".to_string(), attrs);
        let json = serde_json::to_string(&element).unwrap();
        let decoded: CacheElement<u64, String> = serde_json::from_str(&json).unwrap();

        assert_eq!(decoded.attributes().max_life_seconds, Some(30));
        assert_eq!(
            decoded.attributes().create_time(),
            element.attributes().create_time()
        );
        assert!(decoded.attributes().event_handlers().is_empty());
    }

    #[test]
    fn test_element_debug_omits_value() {
        let element = CacheElement::new("r", "key", vec![0u8; 4], ElementAttributes::new());
        let debug = format!("{:?}", element);
        assert!(debug.contains("CacheElement"));
        assert!(debug.contains("key"));
    }
}
