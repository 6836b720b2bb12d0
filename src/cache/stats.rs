//! Cache Statistics
//!
//! Region counters and the read-only snapshot handed to dashboards.
//! Snapshots are produced on demand and never retained by the cache.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// One named statistic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatElement {
    /// Stat name
    pub name: String,
    /// Rendered value
    pub value: String,
}

impl StatElement {
    /// Create a stat entry from any displayable value
    pub fn new(name: impl Into<String>, value: impl std::fmt::Display) -> Self {
        Self {
            name: name.into(),
            value: value.to_string(),
        }
    }
}

/// A block of stats for one tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    /// Tier description
    pub type_name: String,
    /// Ordered stat entries
    pub stat_elements: Vec<StatElement>,
}

impl Stats {
    /// Create a stat block
    pub fn new(type_name: impl Into<String>, stat_elements: Vec<StatElement>) -> Self {
        Self {
            type_name: type_name.into(),
            stat_elements,
        }
    }

    /// Look up a stat value by name
    pub fn get(&self, name: &str) -> Option<&str> {
        self.stat_elements
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.value.as_str())
    }
}

impl std::fmt::Display for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "  {}", self.type_name)?;
        for element in &self.stat_elements {
            writeln!(f, "    {} = {}", element.name, element.value)?;
        }
        Ok(())
    }
}

/// Region statistics snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Region name
    pub region_name: String,
    /// Region-level stats
    pub stat_elements: Vec<StatElement>,
    /// Memory tier first, then each auxiliary in chain order
    pub auxiliary_stats: Vec<Stats>,
}

impl CacheStats {
    /// Look up a region-level stat value by name
    pub fn get(&self, name: &str) -> Option<&str> {
        self.stat_elements
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.value.as_str())
    }

    /// Region-level stat parsed as a counter
    pub fn counter(&self, name: &str) -> Option<u64> {
        self.get(name).and_then(|v| v.parse().ok())
    }
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Region Name = {}", self.region_name)?;
        for element in &self.stat_elements {
            writeln!(f, "{} = {}", element.name, element.value)?;
        }
        for stats in &self.auxiliary_stats {
            write!(f, "{}", stats)?;
        }
        Ok(())
    }
}

/// Region-level counters
#[derive(Debug, Default)]
pub struct RegionCounters {
    hit_count_ram: AtomicU64,
    hit_count_aux: AtomicU64,
    miss_count_not_found: AtomicU64,
    miss_count_expired: AtomicU64,
    update_count: AtomicU64,
    remove_count: AtomicU64,
}

impl RegionCounters {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_ram_hit(&self) {
        self.hit_count_ram.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_aux_hit(&self) {
        self.hit_count_aux.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss_not_found(&self) {
        self.miss_count_not_found.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss_expired(&self) {
        self.miss_count_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_update(&self) {
        self.update_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_remove(&self) {
        self.remove_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hit_count_ram(&self) -> u64 {
        self.hit_count_ram.load(Ordering::Relaxed)
    }

    pub fn hit_count_aux(&self) -> u64 {
        self.hit_count_aux.load(Ordering::Relaxed)
    }

    pub fn miss_count_not_found(&self) -> u64 {
        self.miss_count_not_found.load(Ordering::Relaxed)
    }

    pub fn miss_count_expired(&self) -> u64 {
        self.miss_count_expired.load(Ordering::Relaxed)
    }

    pub fn update_count(&self) -> u64 {
        self.update_count.load(Ordering::Relaxed)
    }

    pub fn remove_count(&self) -> u64 {
        self.remove_count.load(Ordering::Relaxed)
    }

    /// Overall hit ratio across memory and auxiliaries
    pub fn hit_ratio(&self) -> f64 {
        let hits = (self.hit_count_ram() + self.hit_count_aux()) as f64;
        let total = hits + (self.miss_count_not_found() + self.miss_count_expired()) as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Zero every counter
    pub fn reset(&self) {
        self.hit_count_ram.store(0, Ordering::Relaxed);
        self.hit_count_aux.store(0, Ordering::Relaxed);
        self.miss_count_not_found.store(0, Ordering::Relaxed);
        self.miss_count_expired.store(0, Ordering::Relaxed);
        self.update_count.store(0, Ordering::Relaxed);
        self.remove_count.store(0, Ordering::Relaxed);
    }

    /// Render as ordered stat entries
    pub fn stat_elements(&self) -> Vec<StatElement> {
        vec![
            StatElement::new("HitCountRam", self.hit_count_ram()),
            StatElement::new("HitCountAux", self.hit_count_aux()),
            StatElement::new("MissCountNotFound", self.miss_count_not_found()),
            StatElement::new("MissCountExpired", self.miss_count_expired()),
            StatElement::new("UpdateCount", self.update_count()),
            StatElement::new("RemoveCount", self.remove_count()),
            StatElement::new("HitRatio", format!("{:.3}", self.hit_ratio())),
        ]
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_at_zero() {
        let counters = RegionCounters::new();
        assert_eq!(counters.hit_count_ram(), 0);
        assert_eq!(counters.hit_ratio(), 0.0);
    }

    #[test]
    fn test_hit_ratio() {
        let counters = RegionCounters::new();
        counters.record_ram_hit();
        counters.record_aux_hit();
        counters.record_miss_not_found();
        counters.record_miss_expired();
        assert_eq!(counters.hit_ratio(), 0.5);
    }

    #[test]
    fn test_reset() {
        let counters = RegionCounters::new();
        counters.record_update();
        counters.record_remove();
        counters.reset();
        assert_eq!(counters.update_count(), 0);
        assert_eq!(counters.remove_count(), 0);
    }

    #[test]
    fn test_snapshot_lookup_and_render() {
        let counters = RegionCounters::new();
        counters.record_ram_hit();
        let snapshot = CacheStats {
            region_name: "sessions".into(),
            stat_elements: counters.stat_elements(),
            auxiliary_stats: vec![Stats::new("Memory Cache (LRU)", vec![StatElement::new("List Size", 3)])],
        };

        assert_eq!(snapshot.counter("HitCountRam"), Some(1));
        assert_eq!(snapshot.auxiliary_stats[0].get("List Size"), Some("3"));

        let text = snapshot.to_string();
        assert!(text.contains("Region Name = sessions"));
        assert!(text.contains("HitCountRam = 1"));
        assert!(text.contains("List Size = 3"));
    }

    #[test]
    fn test_snapshot_json() {
        let snapshot = CacheStats {
            region_name: "r".into(),
            stat_elements: vec![StatElement::new("UpdateCount", 2)],
            auxiliary_stats: Vec::new(),
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["region_name"], "r");
        assert_eq!(json["stat_elements"][0]["value"], "2");
    }
}
