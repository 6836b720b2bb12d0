//! Region and Element Attributes
//!
//! Plain configuration data consumed by the cache core. Region-wide policy
//! lives in [`CompositeCacheAttributes`]; per-entry lifetime metadata lives
//! in [`ElementAttributes`]. Both are loaded externally (serde) and handed
//! to the core as immutable values.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::events::ElementEventHandler;
use super::now_millis;
use super::policy::{DiskUsagePattern, EvictionPolicy};
use crate::error::{Error, Result};

/// Default memory capacity (element count)
pub const DEFAULT_MAX_OBJECTS: usize = 100;

/// Default memory idle time before the shrinker spools an element (2 hours)
pub const DEFAULT_MAX_MEMORY_IDLE_TIME_SECONDS: u64 = 60 * 120;

/// Default shrinker interval
pub const DEFAULT_SHRINKER_INTERVAL_SECONDS: u64 = 30;

// =============================================================================
// Composite Cache Attributes
// =============================================================================

/// Region-wide policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositeCacheAttributes {
    /// Region name
    pub cache_name: String,
    /// Memory tier capacity in elements
    pub max_objects: usize,
    /// Allow updates to lateral auxiliaries
    pub use_lateral: bool,
    /// Allow updates to remote auxiliaries
    pub use_remote: bool,
    /// Allow updates to disk auxiliaries
    pub use_disk: bool,
    /// Run the background shrinker for this region
    pub use_memory_shrinker: bool,
    /// Idle time after which the shrinker spools an element out of memory
    pub max_memory_idle_time_seconds: u64,
    /// Shrinker period
    pub shrinker_interval_seconds: u64,
    /// Cap on spools per shrinker run (None = unlimited)
    pub max_spool_per_run: Option<usize>,
    /// When disk auxiliaries receive writes
    pub disk_usage_pattern: DiskUsagePattern,
    /// Memory tier eviction policy
    pub eviction_policy: EvictionPolicy,
}

impl Default for CompositeCacheAttributes {
    fn default() -> Self {
        Self {
            cache_name: String::new(),
            max_objects: DEFAULT_MAX_OBJECTS,
            use_lateral: true,
            use_remote: true,
            use_disk: true,
            use_memory_shrinker: false,
            max_memory_idle_time_seconds: DEFAULT_MAX_MEMORY_IDLE_TIME_SECONDS,
            shrinker_interval_seconds: DEFAULT_SHRINKER_INTERVAL_SECONDS,
            max_spool_per_run: None,
            disk_usage_pattern: DiskUsagePattern::default(),
            eviction_policy: EvictionPolicy::default(),
        }
    }
}

impl CompositeCacheAttributes {
    /// Attributes for a named region with defaults everywhere else
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            cache_name: name.into(),
            ..Self::default()
        }
    }

    /// Set the memory capacity
    pub fn with_max_objects(mut self, max_objects: usize) -> Self {
        self.max_objects = max_objects;
        self
    }

    /// Enable the background shrinker with the given interval and idle time
    pub fn with_shrinker(mut self, interval_seconds: u64, max_idle_seconds: u64) -> Self {
        self.use_memory_shrinker = true;
        self.shrinker_interval_seconds = interval_seconds;
        self.max_memory_idle_time_seconds = max_idle_seconds;
        self
    }

    /// Check the attributes are usable
    pub fn validate(&self) -> Result<()> {
        if self.cache_name.is_empty() {
            return Err(Error::Config("cache_name must not be empty".into()));
        }
        if self.use_memory_shrinker && self.shrinker_interval_seconds == 0 {
            return Err(Error::Config(format!(
                "region '{}': shrinker_interval_seconds must be > 0",
                self.cache_name
            )));
        }
        if self.max_spool_per_run == Some(0) {
            return Err(Error::Config(format!(
                "region '{}': max_spool_per_run must be > 0 when set",
                self.cache_name
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Element Attributes
// =============================================================================

/// Per-element lifetime metadata
///
/// `last_access_time` is atomic so a shared element can be touched on every
/// read without taking a lock.
#[derive(Serialize, Deserialize)]
#[serde(default)]
pub struct ElementAttributes {
    /// May be spooled to disk on eviction
    pub is_spool: bool,
    /// May be sent to lateral caches
    pub is_lateral: bool,
    /// May be sent to remote caches
    pub is_remote: bool,
    /// Never expires by time
    pub is_eternal: bool,
    /// Maximum lifetime from creation
    pub max_life_seconds: Option<u64>,
    /// Maximum time between accesses
    pub idle_time_seconds: Option<u64>,
    /// Size metadata (not used for capacity)
    pub size_bytes: u64,
    /// Creation timestamp (epoch millis)
    create_time: u64,
    /// Last access timestamp (epoch millis)
    last_access_time: AtomicU64,
    /// Per-element listeners
    #[serde(skip)]
    event_handlers: Vec<Arc<dyn ElementEventHandler>>,
}

impl Default for ElementAttributes {
    fn default() -> Self {
        let now = now_millis();
        Self {
            is_spool: true,
            is_lateral: true,
            is_remote: true,
            is_eternal: true,
            max_life_seconds: None,
            idle_time_seconds: None,
            size_bytes: 0,
            create_time: now,
            last_access_time: AtomicU64::new(now),
            event_handlers: Vec::new(),
        }
    }
}

impl Clone for ElementAttributes {
    fn clone(&self) -> Self {
        Self {
            is_spool: self.is_spool,
            is_lateral: self.is_lateral,
            is_remote: self.is_remote,
            is_eternal: self.is_eternal,
            max_life_seconds: self.max_life_seconds,
            idle_time_seconds: self.idle_time_seconds,
            size_bytes: self.size_bytes,
            create_time: self.create_time,
            last_access_time: AtomicU64::new(self.last_access_time()),
            event_handlers: self.event_handlers.clone(),
        }
    }
}

impl std::fmt::Debug for ElementAttributes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElementAttributes")
            .field("is_spool", &self.is_spool)
            .field("is_lateral", &self.is_lateral)
            .field("is_remote", &self.is_remote)
            .field("is_eternal", &self.is_eternal)
            .field("max_life_seconds", &self.max_life_seconds)
            .field("idle_time_seconds", &self.idle_time_seconds)
            .field("size_bytes", &self.size_bytes)
            .field("create_time", &self.create_time)
            .field("last_access_time", &self.last_access_time())
            .field("event_handlers", &self.event_handlers.len())
            .finish()
    }
}

/// Why an element is no longer valid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Lived longer than `max_life_seconds`
    MaxLife,
    /// Untouched for longer than `idle_time_seconds`
    IdleTime,
}

impl ElementAttributes {
    /// Create attributes with defaults (eternal, spoolable)
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-eternal attributes with a maximum lifetime
    pub fn with_max_life(mut self, seconds: u64) -> Self {
        self.is_eternal = false;
        self.max_life_seconds = Some(seconds);
        self
    }

    /// Non-eternal attributes with an idle timeout
    pub fn with_idle_time(mut self, seconds: u64) -> Self {
        self.is_eternal = false;
        self.idle_time_seconds = Some(seconds);
        self
    }

    /// Set the eternal flag
    pub fn eternal(mut self, eternal: bool) -> Self {
        self.is_eternal = eternal;
        self
    }

    /// Set the spool flag
    pub fn spool(mut self, spool: bool) -> Self {
        self.is_spool = spool;
        self
    }

    /// Set the size metadata
    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = size_bytes;
        self
    }

    /// Register a listener for this element's lifecycle events
    pub fn add_event_handler(&mut self, handler: Arc<dyn ElementEventHandler>) {
        self.event_handlers.push(handler);
    }

    /// Builder form of [`add_event_handler`](Self::add_event_handler)
    pub fn with_event_handler(mut self, handler: Arc<dyn ElementEventHandler>) -> Self {
        self.add_event_handler(handler);
        self
    }

    /// Registered listeners
    pub fn event_handlers(&self) -> &[Arc<dyn ElementEventHandler>] {
        &self.event_handlers
    }

    /// Copy these attributes for a freshly created element
    pub fn fresh_copy(&self) -> Self {
        let mut copy = self.clone();
        let now = now_millis();
        copy.create_time = now;
        copy.last_access_time = AtomicU64::new(now);
        copy
    }

    /// Creation timestamp (epoch millis)
    #[inline]
    pub fn create_time(&self) -> u64 {
        self.create_time
    }

    /// Last access timestamp (epoch millis)
    #[inline]
    pub fn last_access_time(&self) -> u64 {
        self.last_access_time.load(Ordering::Relaxed)
    }

    /// Record an access now
    #[inline]
    pub fn touch(&self) {
        self.last_access_time.store(now_millis(), Ordering::Relaxed);
    }

    /// Override the last access timestamp
    pub fn set_last_access_time(&self, millis: u64) {
        self.last_access_time.store(millis, Ordering::Relaxed);
    }

    /// Override the creation timestamp
    pub fn set_create_time(&mut self, millis: u64) {
        self.create_time = millis;
    }

    /// Milliseconds since the last access, relative to `now`
    pub fn idle_millis(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_access_time())
    }

    /// Pure expiry check against `now` (epoch millis)
    pub fn expiry_at(&self, now: u64) -> Option<Expiry> {
        if self.is_eternal {
            return None;
        }
        if let Some(max_life) = self.max_life_seconds {
            if now.saturating_sub(self.create_time) > max_life.saturating_mul(1000) {
                return Some(Expiry::MaxLife);
            }
        }
        if let Some(idle) = self.idle_time_seconds {
            if self.idle_millis(now) > idle.saturating_mul(1000) {
                return Some(Expiry::IdleTime);
            }
        }
        None
    }
}

// =============================================================================
// Tests
// =============================================================================
