//! Group Cache Access
//!
//! Named groups inside one region. Every entry is stored under a composite
//! `GroupAttrName { group, attr_name }` key, so a group is a view over the
//! region rather than a separate structure.
//!
//! Group enumeration scans the region's key set (memory plus auxiliaries)
//! and is linear in the region size.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::access::CacheAccess;
use super::attributes::ElementAttributes;
use super::element::{CacheKey, CacheValue};
use crate::error::Result;

/// Key of an entry stored inside a named group
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupAttrName<K> {
    /// Group name
    pub group: String,
    /// Attribute name within the group
    pub attr_name: K,
}

impl<K> GroupAttrName<K> {
    /// Key for `attr_name` inside `group`
    pub fn new(group: impl Into<String>, attr_name: K) -> Self {
        Self {
            group: group.into(),
            attr_name,
        }
    }
}

impl<K: fmt::Display> fmt::Display for GroupAttrName<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group, self.attr_name)
    }
}

/// Group-scoped access to a region
pub struct GroupCacheAccess<K: CacheKey, V: CacheValue> {
    access: CacheAccess<GroupAttrName<K>, V>,
}

impl<K: CacheKey, V: CacheValue> Clone for GroupCacheAccess<K, V> {
    fn clone(&self) -> Self {
        Self {
            access: self.access.clone(),
        }
    }
}

impl<K: CacheKey, V: CacheValue> GroupCacheAccess<K, V> {
    /// Wrap a region whose keys are group-qualified
    pub fn new(access: CacheAccess<GroupAttrName<K>, V>) -> Self {
        Self { access }
    }

    /// The plain access over the composite keys
    pub fn access(&self) -> &CacheAccess<GroupAttrName<K>, V> {
        &self.access
    }

    /// Value of `attr_name` in `group`
    pub async fn get_from_group(&self, attr_name: K, group: &str) -> Result<Option<V>> {
        self.access.get(&GroupAttrName::new(group, attr_name)).await
    }

    /// Value of `attr_name` in `group`, computed once on a total miss
    pub async fn get_with_from_group<F, Fut>(&self, attr_name: K, group: &str, supplier: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        self.access
            .get_with(GroupAttrName::new(group, attr_name), supplier)
            .await
    }

    /// Store `value` as `attr_name` in `group`
    pub async fn put_in_group(&self, attr_name: K, group: &str, value: V) -> Result<()> {
        self.access.put(GroupAttrName::new(group, attr_name), value).await
    }

    /// Store with explicit element attributes
    pub async fn put_in_group_with_attributes(
        &self,
        attr_name: K,
        group: &str,
        value: V,
        attributes: ElementAttributes,
    ) -> Result<()> {
        self.access
            .put_with_attributes(GroupAttrName::new(group, attr_name), value, attributes)
            .await
    }

    /// Remove `attr_name` from `group`
    pub async fn remove_from_group(&self, attr_name: K, group: &str) -> Result<bool> {
        self.access.remove(&GroupAttrName::new(group, attr_name)).await
    }

    /// Attribute names currently stored in `group`
    pub async fn get_group_keys(&self, group: &str) -> Result<HashSet<K>> {
        let keys = self.access.cache_control().key_set(false).await?;
        Ok(keys
            .into_iter()
            .filter(|k| k.group == group)
            .map(|k| k.attr_name)
            .collect())
    }

    /// Names of every group with at least one entry
    pub async fn get_group_names(&self) -> Result<HashSet<String>> {
        let keys = self.access.cache_control().key_set(false).await?;
        Ok(keys.into_iter().map(|k| k.group).collect())
    }

    /// Remove every entry of `group`. Returns how many keys were removed.
    pub async fn invalidate_group(&self, group: &str) -> Result<usize> {
        let attr_names = self.get_group_keys(group).await?;
        let count = attr_names.len();
        for attr_name in attr_names {
            self.remove_from_group(attr_name, group).await?;
        }
        debug!(cache = %self.access.cache_name(), group, removed = count, "Invalidated group");
        Ok(count)
    }
}

// =============================================================================
// Tests
// =============================================================================
