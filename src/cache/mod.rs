//! Composite Cache Engine
//!
//! Per-region coordinator fronting a bounded memory tier with an ordered
//! chain of slower auxiliary tiers.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                    CacheManager (named regions)                          │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │   CacheAccess / GroupCacheAccess  ──  single-flight computed get         │
//! │                              │                                           │
//! │                      CompositeCache (region)                             │
//! │  ┌────────────────┐   ┌─────────────────────────────────────────────┐    │
//! │  │ MemoryCache    │   │ Auxiliary chain (priority order)            │    │
//! │  │ LRU / FIFO     │──▶│ Disk ──▶ Lateral ──▶ Remote                 │    │
//! │  │ max_objects    │   │ each behind an AuxiliaryHandle (zombie buf) │    │
//! │  └────────────────┘   └─────────────────────────────────────────────┘    │
//! │          ▲                                                               │
//! │   ShrinkerThread (expire + spool idle)    ElementEventQueue (listeners)  │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Design Principles
//!
//! - The memory tier is synchronous; locks are never held across `.await`
//! - Auxiliary degradation is invisible to callers (zombie buffering)
//! - Background work (shrinker, events, no-wait writes) runs on tokio tasks
//!   that stop on `dispose()`

mod access;
mod attributes;
mod auxiliary;
mod composite;
mod disk;
mod element;
mod events;
mod group;
mod manager;
mod matcher;
mod memory;
mod policy;
mod shrinker;
mod single_flight;
mod stats;
mod zombie;

pub use access::CacheAccess;
pub use attributes::{
    CompositeCacheAttributes, ElementAttributes, Expiry, DEFAULT_MAX_MEMORY_IDLE_TIME_SECONDS,
    DEFAULT_MAX_OBJECTS, DEFAULT_SHRINKER_INTERVAL_SECONDS,
};
pub use auxiliary::{
    AuxiliaryAttributes, AuxiliaryCache, AuxiliaryKind, AuxiliaryStatus, InMemoryAuxiliary,
    Propagation, DEFAULT_OPERATION_TIMEOUT_MS, DEFAULT_ZOMBIE_QUEUE_MAX_SIZE,
};
pub use composite::{CompositeCache, RegionState};
pub use disk::{FileDiskCache, FileDiskCacheConfig};
pub use element::{CacheElement, CacheKey, CacheValue};
pub use events::{ElementEvent, ElementEventHandler, ElementEventKind, ElementEventQueue};
pub use group::{GroupAttrName, GroupCacheAccess};
pub use manager::{CacheManager, ManagerConfig, RegionConfig};
pub use matcher::{KeyMatcher, RegexKeyMatcher};
pub use memory::MemoryCache;
pub use policy::{DiskUsagePattern, EvictionPolicy};
pub use shrinker::{ShrinkReport, ShrinkerStats, ShrinkerThread};
pub use single_flight::SingleFlight;
pub use stats::{CacheStats, RegionCounters, StatElement, Stats};
pub use zombie::AuxiliaryHandle;

/// Current wall-clock time in epoch milliseconds
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
