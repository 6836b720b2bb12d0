//! Memory Shrinker
//!
//! Background daemon, one per region, that removes expired elements from
//! the memory tier and spools elements idle longer than
//! `max_memory_idle_time_seconds` down to the disk tiers.
//!
//! # Design
//!
//! - Snapshot, decide, apply: the key set is copied, each key is examined
//!   with `get_quiet` (so the scan never refreshes recency or access time),
//!   and removals happen only after every decision is made
//! - Non-reentrant: a pass still running when the next tick fires causes that
//!   tick to be skipped, never queued
//! - A failing or panicking pass is logged and abandoned; the next tick starts
//!   from a fresh snapshot
//! - The task holds a `Weak` region reference and stops once the region is
//!   dropped or disposed

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use super::composite::CompositeCache;
use super::element::{CacheKey, CacheValue};
use super::events::ElementEventKind;
use super::now_millis;
use super::stats::StatElement;
use crate::error::{Error, Result};

/// Outcome of one shrinker pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShrinkReport {
    /// Keys examined
    pub examined: usize,
    /// Expired elements removed from memory
    pub expired: usize,
    /// Idle elements spooled out of memory
    pub spooled: usize,
    /// True when `max_spool_per_run` cut the pass short
    pub deferred: bool,
}

/// Shrinker counters, shared by scheduled and manual passes
#[derive(Debug, Default)]
pub struct ShrinkerStats {
    running: AtomicBool,
    runs: AtomicU64,
    skipped_runs: AtomicU64,
    failed_runs: AtomicU64,
    expired_removed: AtomicU64,
    spooled: AtomicU64,
}

impl ShrinkerStats {
    /// Completed passes
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    /// Passes skipped because another was running
    pub fn skipped_runs(&self) -> u64 {
        self.skipped_runs.load(Ordering::Relaxed)
    }

    /// Passes that failed or panicked
    pub fn failed_runs(&self) -> u64 {
        self.failed_runs.load(Ordering::Relaxed)
    }

    /// Expired elements removed
    pub fn expired_removed(&self) -> u64 {
        self.expired_removed.load(Ordering::Relaxed)
    }

    /// Idle elements spooled
    pub fn spooled(&self) -> u64 {
        self.spooled.load(Ordering::Relaxed)
    }

    pub(crate) fn stat_elements(&self) -> Vec<StatElement> {
        vec![
            StatElement::new("ShrinkerRuns", self.runs()),
            StatElement::new("ShrinkerSkippedRuns", self.skipped_runs()),
            StatElement::new("ShrinkerFailedRuns", self.failed_runs()),
            StatElement::new("ShrinkerExpiredRemoved", self.expired_removed()),
            StatElement::new("ShrinkerSpooled", self.spooled()),
        ]
    }
}

/// Handle to a region's scheduled shrinker task
pub struct ShrinkerThread {
    task: JoinHandle<()>,
    shutdown: Arc<AtomicBool>,
}

impl ShrinkerThread {
    /// Schedule passes every `period` on the current tokio runtime
    pub fn start<K: CacheKey, V: CacheValue>(cache: Weak<CompositeCache<K, V>>, period: Duration) -> Result<Self> {
        if period.is_zero() {
            return Err(Error::Config("shrinker interval must be > 0".into()));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Config(format!("memory shrinker needs a tokio runtime: {}", e)))?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let task = runtime.spawn(Self::run(cache, period, Arc::clone(&shutdown)));
        Ok(Self { task, shutdown })
    }

    async fn run<K: CacheKey, V: CacheValue>(
        region: Weak<CompositeCache<K, V>>,
        period: Duration,
        shutdown: Arc<AtomicBool>,
    ) {
        let mut tick = interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tick.tick().await;

        loop {
            tick.tick().await;
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            let Some(cache) = region.upgrade() else {
                break;
            };
            if cache.is_disposed() {
                break;
            }
            run_guarded(&cache, cache.shrinker_stats()).await;
        }
        debug!("Memory shrinker stopped");
    }

    /// Stop scheduling passes. A pass in progress is cancelled.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.task.abort();
    }

    /// True once the task has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ShrinkerThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Clears the running flag on every exit path, including a cancelled pass
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Run one pass unless one is already running; contain failures and panics.
pub(crate) async fn run_guarded<K: CacheKey, V: CacheValue>(
    cache: &CompositeCache<K, V>,
    stats: &ShrinkerStats,
) -> Option<ShrinkReport> {
    if stats.running.swap(true, Ordering::AcqRel) {
        stats.skipped_runs.fetch_add(1, Ordering::Relaxed);
        debug!(cache = %cache.cache_name(), "Shrinker pass already running, skipping");
        return None;
    }

    let outcome = {
        let _running = RunningGuard(&stats.running);
        AssertUnwindSafe(shrink(cache)).catch_unwind().await
    };

    match outcome {
        Ok(Ok(report)) => {
            stats.runs.fetch_add(1, Ordering::Relaxed);
            stats.expired_removed.fetch_add(report.expired as u64, Ordering::Relaxed);
            stats.spooled.fetch_add(report.spooled as u64, Ordering::Relaxed);
            if report.expired > 0 || report.spooled > 0 {
                info!(
                    cache = %cache.cache_name(),
                    examined = report.examined,
                    expired = report.expired,
                    spooled = report.spooled,
                    deferred = report.deferred,
                    "Shrinker pass complete"
                );
            }
            Some(report)
        }
        Ok(Err(e)) => {
            stats.failed_runs.fetch_add(1, Ordering::Relaxed);
            warn!(cache = %cache.cache_name(), error = %e, "Shrinker pass failed");
            None
        }
        Err(_) => {
            stats.failed_runs.fetch_add(1, Ordering::Relaxed);
            error!(cache = %cache.cache_name(), "Shrinker pass panicked");
            None
        }
    }
}

#[instrument(level = "debug", skip(cache), fields(region = %cache.cache_name()))]
async fn shrink<K: CacheKey, V: CacheValue>(cache: &CompositeCache<K, V>) -> Result<ShrinkReport> {
    let attributes = cache.attributes_snapshot();
    let max_idle_ms = attributes.max_memory_idle_time_seconds.saturating_mul(1000);
    let now = now_millis();
    let memory = cache.memory();

    // Decide
    let keys = memory.key_set();
    let mut report = ShrinkReport {
        examined: keys.len(),
        ..ShrinkReport::default()
    };
    let mut expired = Vec::new();
    let mut idle = Vec::new();
    for key in keys {
        let Some(element) = memory.get_quiet(&key) else {
            continue;
        };

        if !element.attributes().is_eternal
            && cache.is_expired(
                &element,
                now,
                ElementEventKind::ExceededMaxLifeBackground,
                ElementEventKind::ExceededIdleTimeBackground,
            )
        {
            expired.push(key);
            continue;
        }

        if element.attributes().idle_millis(now) > max_idle_ms {
            if let Some(cap) = attributes.max_spool_per_run {
                if idle.len() >= cap {
                    report.deferred = true;
                    break;
                }
            }
            idle.push(key);
        }
    }

    // Apply
    for key in expired {
        if memory.remove(&key).is_some() {
            report.expired += 1;
        }
    }
    for key in idle {
        if cache.is_disposed() {
            return Err(Error::RegionDisposed(cache.cache_name().to_string()));
        }
        // Skip anything touched since the snapshot.
        let still_idle = memory
            .get_quiet(&key)
            .map(|e| e.attributes().idle_millis(now_millis()) > max_idle_ms)
            .unwrap_or(false);
        if !still_idle {
            continue;
        }
        if let Some(element) = memory.remove(&key) {
            cache.spool_to_disk(&element).await;
            report.spooled += 1;
        }
    }

    Ok(report)
}

// =============================================================================
// Tests
// =============================================================================
