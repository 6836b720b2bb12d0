//! Cache Manager - Named Regions
//!
//! Creates and looks up `CompositeCache` regions by name. Regions of
//! different key/value types live side by side; each is stored type-erased
//! and downcast on lookup.
//!
//! # Design
//!
//! - Lookups go straight to a `DashMap`
//! - Creation is serialized by one mutex, re-checking the map after taking it
//! - A disposed region is replaced on the next lazy lookup
//! - `shutdown()` disposes every region once; later calls are no-ops

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::access::CacheAccess;
use super::attributes::{CompositeCacheAttributes, ElementAttributes};
use super::auxiliary::{AuxiliaryAttributes, AuxiliaryCache};
use super::composite::CompositeCache;
use super::element::{CacheKey, CacheValue};
use super::group::{GroupAttrName, GroupCacheAccess};
use super::stats::CacheStats;
use crate::error::{Error, Result};

static INSTANCE: OnceCell<CacheManager> = OnceCell::new();

// =============================================================================
// Configuration
// =============================================================================

/// Configuration of one region
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionConfig {
    /// Region policy. `cache_name` is overwritten with the region's name.
    pub cache_attributes: CompositeCacheAttributes,
    /// Attributes given to elements put without explicit attributes
    pub element_attributes: ElementAttributes,
}

/// Manager configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Used for regions without a named entry
    pub default_region: RegionConfig,
    /// Per-region overrides
    pub regions: HashMap<String, RegionConfig>,
}

impl ManagerConfig {
    /// Parse from YAML
    pub fn from_yaml(source: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(source)
            .map_err(|e| Error::Config(format!("invalid manager config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every region config
    pub fn validate(&self) -> Result<()> {
        self.region_config("default")?;
        for name in self.regions.keys() {
            self.region_config(name)?;
        }
        Ok(())
    }

    /// Effective config for `name`: its own entry, else the default
    pub fn region_config(&self, name: &str) -> Result<RegionConfig> {
        let mut config = self
            .regions
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.default_region.clone());
        config.cache_attributes.cache_name = name.to_string();
        config.cache_attributes.validate()?;
        Ok(config)
    }
}

// =============================================================================
// Type-erased regions
// =============================================================================

#[async_trait]
trait ManagedRegion: Send + Sync {
    fn is_disposed(&self) -> bool;

    async fn dispose(&self) -> Result<()>;

    fn statistics(&self) -> CacheStats;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

#[async_trait]
impl<K: CacheKey, V: CacheValue> ManagedRegion for CompositeCache<K, V> {
    fn is_disposed(&self) -> bool {
        CompositeCache::is_disposed(self)
    }

    async fn dispose(&self) -> Result<()> {
        CompositeCache::dispose(self).await
    }

    fn statistics(&self) -> CacheStats {
        self.get_statistics()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

// =============================================================================
// Manager
// =============================================================================

/// Registry of named regions
pub struct CacheManager {
    config: RwLock<ManagerConfig>,
    regions: DashMap<String, Arc<dyn ManagedRegion>>,
    creation: Mutex<()>,
    shut_down: AtomicBool,
}

impl CacheManager {
    /// Manager with default configuration
    pub fn new() -> Self {
        Self {
            config: RwLock::new(ManagerConfig::default()),
            regions: DashMap::new(),
            creation: Mutex::new(()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Manager with the given configuration
    pub fn with_config(config: ManagerConfig) -> Result<Self> {
        config.validate()?;
        let manager = Self::new();
        *manager.config.write() = config;
        Ok(manager)
    }

    /// Process-wide manager, created with defaults on first use
    pub fn instance() -> &'static CacheManager {
        INSTANCE.get_or_init(CacheManager::new)
    }

    /// Install the process-wide manager. Fails if it already exists.
    pub fn configure_instance(config: ManagerConfig) -> Result<&'static CacheManager> {
        let manager = Self::with_config(config)?;
        INSTANCE
            .set(manager)
            .map_err(|_| Error::Config("cache manager instance already initialized".into()))?;
        INSTANCE
            .get()
            .ok_or_else(|| Error::Config("cache manager instance missing".into()))
    }

    /// Current configuration
    pub fn config(&self) -> ManagerConfig {
        self.config.read().clone()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(Error::Management("cache manager is shut down".into()));
        }
        Ok(())
    }

    fn lookup<K: CacheKey, V: CacheValue>(&self, name: &str) -> Result<Option<Arc<CompositeCache<K, V>>>> {
        let Some(region) = self.regions.get(name).map(|r| Arc::clone(r.value())) else {
            return Ok(None);
        };
        if region.is_disposed() {
            return Ok(None);
        }
        region
            .into_any()
            .downcast::<CompositeCache<K, V>>()
            .map(Some)
            .map_err(|_| {
                Error::Config(format!(
                    "region '{}' exists with different key/value types",
                    name
                ))
            })
    }

    /// Access to region `name`, creating it from configuration if needed.
    /// A disposed region is replaced by a fresh one.
    pub fn get_cache<K: CacheKey, V: CacheValue>(&self, name: &str) -> Result<CacheAccess<K, V>> {
        self.ensure_running()?;
        if let Some(region) = self.lookup::<K, V>(name)? {
            return Ok(CacheAccess::new(region));
        }

        let _creating = self.creation.lock();
        self.ensure_running()?;
        if let Some(region) = self.lookup::<K, V>(name)? {
            return Ok(CacheAccess::new(region));
        }

        let config = self.config.read().region_config(name)?;
        let region = CompositeCache::<K, V>::new(config.cache_attributes, config.element_attributes)?;
        self.regions
            .insert(name.to_string(), Arc::clone(&region) as Arc<dyn ManagedRegion>);
        info!(region = %name, "Created region");
        Ok(CacheAccess::new(region))
    }

    /// Create region `name` with an explicit configuration and auxiliary
    /// chain. Fails if a live region of that name exists.
    pub fn define_region<K: CacheKey, V: CacheValue>(
        &self,
        name: &str,
        config: RegionConfig,
        auxiliaries: Vec<(Arc<dyn AuxiliaryCache<K, V>>, AuxiliaryAttributes)>,
    ) -> Result<CacheAccess<K, V>> {
        self.ensure_running()?;
        let _creating = self.creation.lock();
        // Shutdown may have drained the regions while we waited for the lock.
        self.ensure_running()?;
        if let Some(existing) = self.regions.get(name) {
            if !existing.is_disposed() {
                return Err(Error::Config(format!("region '{}' is already defined", name)));
            }
        }

        let mut cache_attributes = config.cache_attributes;
        cache_attributes.cache_name = name.to_string();
        let region = CompositeCache::<K, V>::with_auxiliaries(
            cache_attributes,
            config.element_attributes,
            auxiliaries,
        )?;
        self.regions
            .insert(name.to_string(), Arc::clone(&region) as Arc<dyn ManagedRegion>);
        info!(region = %name, auxiliaries = region.auxiliaries().len(), "Defined region");
        Ok(CacheAccess::new(region))
    }

    /// Group access to region `name`
    pub fn get_group_cache<K: CacheKey, V: CacheValue>(&self, name: &str) -> Result<GroupCacheAccess<K, V>> {
        Ok(GroupCacheAccess::new(self.get_cache::<GroupAttrName<K>, V>(name)?))
    }

    /// Names of live regions, sorted
    pub fn region_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .regions
            .iter()
            .filter(|r| !r.value().is_disposed())
            .map(|r| r.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Dispose region `name` and forget it. Returns false if unknown.
    pub async fn free_cache(&self, name: &str) -> Result<bool> {
        let Some((_, region)) = self.regions.remove(name) else {
            return Ok(false);
        };
        region.dispose().await?;
        info!(region = %name, "Freed region");
        Ok(true)
    }

    /// Dispose every region. Only the first call does the work.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(regions = self.regions.len(), "Shutting down cache manager");

        let regions: Vec<(String, Arc<dyn ManagedRegion>)> = {
            let _creating = self.creation.lock();
            let names: Vec<String> = self.regions.iter().map(|r| r.key().clone()).collect();
            names
                .into_iter()
                .filter_map(|name| self.regions.remove(&name))
                .collect()
        };

        let mut failures = Vec::new();
        for (name, region) in regions {
            if let Err(e) = region.dispose().await {
                warn!(region = %name, error = %e, "Failure disposing region");
                failures.push(format!("{}: {}", name, e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Management(format!("shutdown finished with errors: {}", failures.join("; "))))
        }
    }

    /// Whether `shutdown()` has been called
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Statistics for every live region, sorted by name
    pub fn statistics(&self) -> Vec<CacheStats> {
        let mut stats: Vec<CacheStats> = self
            .regions
            .iter()
            .filter(|r| !r.value().is_disposed())
            .map(|r| r.value().statistics())
            .collect();
        stats.sort_by(|a, b| a.region_name.cmp(&b.region_name));
        stats
    }
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("regions", &self.region_names())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
