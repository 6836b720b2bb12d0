//! Stratacache - Multi-Tier Composite Cache Engine
//!
//! Named cache regions, each fronting a bounded in-memory tier with an
//! ordered chain of slower auxiliary tiers (disk, lateral, remote).
//!
//! # Features
//!
//! - LRU / FIFO memory tier with eviction spooled into disk auxiliaries
//! - Read-through promotion from auxiliaries back into memory
//! - Element lifetimes (max life, idle time) with a background shrinker
//! - Zombie buffering while an auxiliary is unreachable, replayed on recovery
//! - Single-flight computed gets: one supplier run per missing key
//! - Groups inside a region
//! - LZ4-compressed file disk tier
//! - Structured statistics per region and per tier
//!
//! # Example
//!
//! ```no_run
//! use stratacache::CacheManager;
//!
//! # async fn demo() -> stratacache::Result<()> {
//! let manager = CacheManager::new();
//! let sessions = manager.get_cache::<String, String>("sessions")?;
//!
//! sessions.put("alice".into(), "token-1".into()).await?;
//! let token = sessions
//!     .get_with("bob".into(), || async { Ok("token-2".to_string()) })
//!     .await?;
//! assert_eq!(token, "token-2");
//!
//! manager.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Regions, tiers, facades and the manager
//! - [`error`] - Error types

pub mod cache;
pub mod error;

// Re-export commonly used types
pub use cache::{
    AuxiliaryAttributes, AuxiliaryCache, AuxiliaryKind, AuxiliaryStatus, CacheAccess, CacheManager,
    CacheStats, CompositeCache, CompositeCacheAttributes, DiskUsagePattern, ElementAttributes,
    EvictionPolicy, FileDiskCache, FileDiskCacheConfig, GroupCacheAccess, ManagerConfig,
    Propagation, RegionConfig,
};
pub use error::{Error, Result};

/// Crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
