//! Cache Eviction and Spool Policies
//!
//! Configurable policies for how the memory tier orders victims and when
//! disk auxiliaries receive data.

use serde::{Deserialize, Serialize};

/// Memory tier eviction policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Least recently used: reads refresh recency (default)
    #[default]
    Lru,
    /// First in, first out: reads never reorder, only writes do
    Fifo,
}

impl EvictionPolicy {
    /// Whether a read should move the element to the most-recent position
    #[inline]
    pub fn refresh_on_read(&self) -> bool {
        matches!(self, EvictionPolicy::Lru)
    }
}

impl std::fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvictionPolicy::Lru => write!(f, "LRU"),
            EvictionPolicy::Fifo => write!(f, "FIFO"),
        }
    }
}

/// When disk auxiliaries receive writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskUsagePattern {
    /// Disk is overflow only: elements reach it when evicted from memory
    #[default]
    Swap,
    /// Disk is written on every put, in addition to overflow
    Update,
}

impl std::fmt::Display for DiskUsagePattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiskUsagePattern::Swap => write!(f, "SWAP"),
            DiskUsagePattern::Update => write!(f, "UPDATE"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
