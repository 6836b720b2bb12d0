//! Composite Cache - Per-Region Coordinator
//!
//! Owns one memory tier, an ordered auxiliary chain, the region's event
//! queue, its shrinker and its counters. Every public cache operation ends
//! up here.
//!
//! # Lifecycle
//!
//! ```text
//! Created ──start──▶ Active ──dispose──▶ Disposed (terminal)
//! ```
//!
//! Operations on a disposed region fail fast with `Error::RegionDisposed`.
//! Exactly one caller performs the dispose teardown.
//!
//! # Read path
//!
//! memory → auxiliaries in priority order; the first auxiliary hit is
//! promoted into memory and short-circuits the rest. Expired hits (memory or
//! auxiliary) are removed everywhere and count as `MissCountExpired`.
//!
//! # Write path
//!
//! memory first (synchronously), then the auxiliaries the element and the
//! region allow. Elements pushed out of memory are spooled to disk tiers.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use super::attributes::{CompositeCacheAttributes, ElementAttributes, Expiry};
use super::auxiliary::{AuxiliaryAttributes, AuxiliaryCache, AuxiliaryKind};
use super::element::{CacheElement, CacheKey, CacheValue};
use super::events::{ElementEvent, ElementEventKind, ElementEventQueue};
use super::matcher::KeyMatcher;
use super::memory::MemoryCache;
use super::now_millis;
use super::policy::DiskUsagePattern;
use super::shrinker::{self, ShrinkReport, ShrinkerStats, ShrinkerThread};
use super::single_flight::SingleFlight;
use super::stats::{CacheStats, RegionCounters, StatElement};
use super::zombie::AuxiliaryHandle;
use crate::error::{Error, Result};

/// Region lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    /// Built, background work not started yet
    Created,
    /// Serving operations
    Active,
    /// Torn down; terminal
    Disposed,
}

impl RegionState {
    fn as_u8(self) -> u8 {
        match self {
            RegionState::Created => 0,
            RegionState::Active => 1,
            RegionState::Disposed => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => RegionState::Created,
            1 => RegionState::Active,
            _ => RegionState::Disposed,
        }
    }
}

impl std::fmt::Display for RegionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegionState::Created => write!(f, "CREATED"),
            RegionState::Active => write!(f, "ACTIVE"),
            RegionState::Disposed => write!(f, "DISPOSED"),
        }
    }
}

/// Per-region coordinator
pub struct CompositeCache<K: CacheKey, V: CacheValue> {
    cache_name: String,
    self_ref: Weak<Self>,
    attributes: RwLock<CompositeCacheAttributes>,
    default_element_attributes: RwLock<ElementAttributes>,
    memory: MemoryCache<K, V>,
    auxiliaries: Vec<AuxiliaryHandle<K, V>>,
    event_queue: ElementEventQueue,
    counters: RegionCounters,
    loads: SingleFlight<K, V>,
    state: AtomicU8,
    shrinker: Mutex<Option<ShrinkerThread>>,
    shrinker_stats: ShrinkerStats,
}

impl<K: CacheKey, V: CacheValue> CompositeCache<K, V> {
    /// Build and start a region with no auxiliaries
    pub fn new(attributes: CompositeCacheAttributes, element_attributes: ElementAttributes) -> Result<Arc<Self>> {
        Self::with_auxiliaries(attributes, element_attributes, Vec::new())
    }

    /// Build and start a region. Auxiliaries are consulted in the given order.
    pub fn with_auxiliaries(
        attributes: CompositeCacheAttributes,
        element_attributes: ElementAttributes,
        auxiliaries: Vec<(Arc<dyn AuxiliaryCache<K, V>>, AuxiliaryAttributes)>,
    ) -> Result<Arc<Self>> {
        attributes.validate()?;
        let cache_name = attributes.cache_name.clone();

        let mut names = HashSet::new();
        let mut handles = Vec::with_capacity(auxiliaries.len());
        for (backend, aux_attributes) in auxiliaries {
            if !names.insert(aux_attributes.name.clone()) {
                return Err(Error::Config(format!(
                    "region '{}': duplicate auxiliary name '{}'",
                    cache_name, aux_attributes.name
                )));
            }
            handles.push(AuxiliaryHandle::new(cache_name.clone(), backend, aux_attributes)?);
        }

        let event_queue = ElementEventQueue::new(cache_name.clone())?;
        let memory = MemoryCache::new(cache_name.clone(), attributes.max_objects, attributes.eviction_policy);

        let cache = Arc::new_cyclic(|self_ref| Self {
            cache_name,
            self_ref: self_ref.clone(),
            attributes: RwLock::new(attributes),
            default_element_attributes: RwLock::new(element_attributes),
            memory,
            auxiliaries: handles,
            event_queue,
            counters: RegionCounters::new(),
            loads: SingleFlight::new(),
            state: AtomicU8::new(RegionState::Created.as_u8()),
            shrinker: Mutex::new(None),
            shrinker_stats: ShrinkerStats::default(),
        });
        cache.start()?;
        Ok(cache)
    }

    fn start(&self) -> Result<()> {
        let started = self.state.compare_exchange(
            RegionState::Created.as_u8(),
            RegionState::Active.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if started.is_err() {
            return Err(Error::Management(format!(
                "region '{}' cannot start from state {}",
                self.cache_name,
                self.state()
            )));
        }
        self.restart_shrinker()?;

        let attributes = self.attributes.read();
        info!(
            cache = %self.cache_name,
            max_objects = attributes.max_objects,
            policy = %attributes.eviction_policy,
            auxiliaries = self.auxiliaries.len(),
            shrinker = attributes.use_memory_shrinker,
            "Region created"
        );
        Ok(())
    }

    fn restart_shrinker(&self) -> Result<()> {
        let (enabled, interval) = {
            let attributes = self.attributes.read();
            (
                attributes.use_memory_shrinker,
                Duration::from_secs(attributes.shrinker_interval_seconds),
            )
        };

        let mut shrinker = self.shrinker.lock();
        if let Some(previous) = shrinker.take() {
            previous.stop();
        }
        if enabled {
            *shrinker = Some(ShrinkerThread::start(self.self_ref.clone(), interval)?);
        }
        Ok(())
    }

    // =========================================================================
    // State
    // =========================================================================

    /// Region name
    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    /// Current lifecycle state
    pub fn state(&self) -> RegionState {
        RegionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// True once disposed
    pub fn is_disposed(&self) -> bool {
        self.state() == RegionState::Disposed
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::RegionDisposed(self.cache_name.clone()));
        }
        Ok(())
    }

    /// The memory tier
    pub fn memory(&self) -> &MemoryCache<K, V> {
        &self.memory
    }

    /// The auxiliary chain in priority order
    pub fn auxiliaries(&self) -> &[AuxiliaryHandle<K, V>] {
        &self.auxiliaries
    }

    /// Region-level counters
    pub fn counters(&self) -> &RegionCounters {
        &self.counters
    }

    pub(crate) fn loads(&self) -> &SingleFlight<K, V> {
        &self.loads
    }

    /// Snapshot of the region attributes
    pub(crate) fn attributes_snapshot(&self) -> CompositeCacheAttributes {
        self.attributes.read().clone()
    }

    // =========================================================================
    // Read path
    // =========================================================================

    /// Look up an element in memory, then the auxiliary chain
    pub async fn get(&self, key: &K) -> Result<Option<Arc<CacheElement<K, V>>>> {
        self.get_internal(key, false).await
    }

    /// Look up an element in memory and disk tiers only
    pub async fn local_get(&self, key: &K) -> Result<Option<Arc<CacheElement<K, V>>>> {
        self.get_internal(key, true).await
    }

    #[instrument(level = "debug", skip(self), fields(cache = %self.cache_name))]
    async fn get_internal(&self, key: &K, local_only: bool) -> Result<Option<Arc<CacheElement<K, V>>>> {
        self.ensure_alive()?;

        // Check expiry before the read refreshes the access time.
        let resident = self.memory.get_quiet(key);
        if resident.is_none() {
            self.memory.record_miss();
        }
        if let Some(element) = resident {
            if self.is_expired(
                &element,
                now_millis(),
                ElementEventKind::ExceededMaxLifeOnRequest,
                ElementEventKind::ExceededIdleTimeOnRequest,
            ) {
                self.counters.record_miss_expired();
                self.remove_internal(key, false).await;
                return Ok(None);
            }
            if let Some(element) = self.memory.get(key) {
                self.counters.record_ram_hit();
                return Ok(Some(element));
            }
        }

        for aux in self.auxiliaries.iter().filter(|a| !local_only || a.kind().is_local()) {
            let Some(element) = aux.get(key).await else {
                continue;
            };
            let element = Arc::new(element);

            if self.is_expired(
                &element,
                now_millis(),
                ElementEventKind::ExceededMaxLifeOnRequest,
                ElementEventKind::ExceededIdleTimeOnRequest,
            ) {
                debug!(auxiliary = %aux.name(), "Auxiliary hit, but element expired");
                self.counters.record_miss_expired();
                self.remove_internal(key, false).await;
                return Ok(None);
            }

            debug!(auxiliary = %aux.name(), "Auxiliary hit");
            self.counters.record_aux_hit();
            element.touch();
            self.promote(Arc::clone(&element)).await;
            return Ok(Some(element));
        }

        self.counters.record_miss_not_found();
        Ok(None)
    }

    /// Copy an auxiliary hit into memory, spooling anything it displaces
    async fn promote(&self, element: Arc<CacheElement<K, V>>) {
        if self.memory.max_objects() == 0 {
            return;
        }
        let evicted = self.memory.put(element);
        self.waterfall(evicted).await;
    }

    /// Look up several keys
    pub async fn get_multiple(&self, keys: &[K]) -> Result<HashMap<K, Arc<CacheElement<K, V>>>> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(element) = self.get(key).await? {
                found.insert(key.clone(), element);
            }
        }
        Ok(found)
    }

    /// Elements whose keys match, from memory and then any auxiliary sweep
    pub async fn get_matching(
        &self,
        matcher: &dyn KeyMatcher<K>,
        local_only: bool,
    ) -> Result<HashMap<K, Arc<CacheElement<K, V>>>> {
        self.ensure_alive()?;
        let mut found = HashMap::new();

        for key in self.memory.key_set().into_iter().filter(|k| matcher.matches(k)) {
            if let Some(element) = self.get_internal(&key, local_only).await? {
                found.insert(key, element);
            }
        }

        for aux in self.auxiliaries.iter().filter(|a| !local_only || a.kind().is_local()) {
            for element in aux.get_matching(matcher).await {
                if found.contains_key(element.key()) {
                    continue;
                }
                let element = Arc::new(element);
                if self.is_expired(
                    &element,
                    now_millis(),
                    ElementEventKind::ExceededMaxLifeOnRequest,
                    ElementEventKind::ExceededIdleTimeOnRequest,
                ) {
                    self.counters.record_miss_expired();
                    self.remove_internal(element.key(), false).await;
                    continue;
                }
                self.counters.record_aux_hit();
                element.touch();
                self.promote(Arc::clone(&element)).await;
                found.insert(element.key().clone(), element);
            }
        }
        Ok(found)
    }

    /// Union of the keys held in memory and by the auxiliaries
    pub async fn key_set(&self, local_only: bool) -> Result<HashSet<K>> {
        self.ensure_alive()?;
        let mut keys: HashSet<K> = self.memory.key_set().into_iter().collect();
        for aux in self.auxiliaries.iter().filter(|a| !local_only || a.kind().is_local()) {
            keys.extend(aux.key_set().await);
        }
        Ok(keys)
    }

    // =========================================================================
    // Write path
    // =========================================================================

    /// Store an element in memory and propagate it to the auxiliaries
    pub async fn update(&self, element: CacheElement<K, V>) -> Result<()> {
        self.update_internal(Arc::new(element), false).await
    }

    /// Store an element without telling lateral or remote tiers
    pub async fn local_update(&self, element: CacheElement<K, V>) -> Result<()> {
        self.update_internal(Arc::new(element), true).await
    }

    async fn update_internal(&self, element: Arc<CacheElement<K, V>>, local_only: bool) -> Result<()> {
        self.ensure_alive()?;
        self.counters.record_update();

        let evicted = self.memory.put(Arc::clone(&element));
        self.propagate(&element, local_only).await;
        self.waterfall(evicted).await;
        Ok(())
    }

    /// Store only if no tier currently holds the key. Returns false when it did.
    pub async fn update_if_absent(&self, element: CacheElement<K, V>) -> Result<bool> {
        if self.get(element.key()).await?.is_some() {
            return Ok(false);
        }
        self.ensure_alive()?;

        let element = Arc::new(element);
        let (inserted, evicted) = self.memory.put_if_absent(Arc::clone(&element));
        if !inserted {
            return Ok(false);
        }
        self.counters.record_update();
        self.propagate(&element, false).await;
        self.waterfall(evicted).await;
        Ok(true)
    }

    async fn propagate(&self, element: &Arc<CacheElement<K, V>>, local_only: bool) {
        let (use_remote, use_lateral, use_disk, pattern) = {
            let attributes = self.attributes.read();
            (
                attributes.use_remote,
                attributes.use_lateral,
                attributes.use_disk,
                attributes.disk_usage_pattern,
            )
        };
        let element_attributes = element.attributes();

        for aux in &self.auxiliaries {
            let send = match aux.kind() {
                AuxiliaryKind::Remote => !local_only && use_remote && element_attributes.is_remote,
                AuxiliaryKind::Lateral => !local_only && use_lateral && element_attributes.is_lateral,
                AuxiliaryKind::Disk => {
                    use_disk && pattern == DiskUsagePattern::Update && element_attributes.is_spool
                }
            };
            if send {
                aux.update(CacheElement::clone(element)).await;
            }
        }
    }

    /// Remove a key from memory and every auxiliary. Returns whether memory held it.
    pub async fn remove(&self, key: &K) -> Result<bool> {
        self.ensure_alive()?;
        self.counters.record_remove();
        Ok(self.remove_internal(key, false).await)
    }

    /// Remove a key from memory and disk tiers only
    pub async fn local_remove(&self, key: &K) -> Result<bool> {
        self.ensure_alive()?;
        self.counters.record_remove();
        Ok(self.remove_internal(key, true).await)
    }

    /// Drop a key from the tiers without touching the remove counter;
    /// expiry cleanup goes through here too.
    async fn remove_internal(&self, key: &K, local_only: bool) -> bool {
        let removed = self.memory.remove(key).is_some();
        for aux in self.auxiliaries.iter().filter(|a| !local_only || a.kind().is_local()) {
            aux.remove(key.clone()).await;
        }
        removed
    }

    /// Remove everything from memory and every auxiliary
    pub async fn remove_all(&self) -> Result<()> {
        self.ensure_alive()?;
        self.remove_all_internal(false).await;
        Ok(())
    }

    /// Remove everything from memory and disk tiers only
    pub async fn local_remove_all(&self) -> Result<()> {
        self.ensure_alive()?;
        self.remove_all_internal(true).await;
        Ok(())
    }

    async fn remove_all_internal(&self, local_only: bool) {
        self.memory.clear();
        for aux in self.auxiliaries.iter().filter(|a| !local_only || a.kind().is_local()) {
            aux.remove_all().await;
        }
    }

    /// Remove everything everywhere and reset the region counters
    pub async fn clear(&self) -> Result<()> {
        self.ensure_alive()?;
        self.remove_all_internal(false).await;
        self.counters.reset();
        self.memory.reset_counters();
        info!(cache = %self.cache_name, "Region cleared");
        Ok(())
    }

    /// Flush every memory element to every alive auxiliary, keeping the region open
    pub async fn save(&self) -> Result<()> {
        self.ensure_alive()?;
        let elements = self.memory.elements();
        for aux in self.auxiliaries.iter().filter(|a| a.is_alive()) {
            for element in &elements {
                aux.update(CacheElement::clone(element)).await;
            }
        }
        info!(cache = %self.cache_name, elements = elements.len(), "Region saved to auxiliaries");
        Ok(())
    }

    /// Evict up to `count` elements from memory now, spooling them. Returns
    /// how many were freed.
    pub async fn free_memory_elements(&self, count: usize) -> Result<usize> {
        self.ensure_alive()?;
        let freed = self.memory.free_elements(count);
        let freed_count = freed.len();
        self.waterfall(freed).await;
        Ok(freed_count)
    }

    // =========================================================================
    // Spooling and expiry
    // =========================================================================

    /// Hand elements pushed out of memory to the disk tiers
    pub(crate) async fn waterfall(&self, evicted: Vec<Arc<CacheElement<K, V>>>) {
        for element in evicted {
            self.spool_to_disk(&element).await;
        }
    }

    /// Spool one element to every disk auxiliary, if it may be spooled
    pub async fn spool_to_disk(&self, element: &CacheElement<K, V>) {
        if !element.attributes().is_spool {
            self.handle_element_event(element, ElementEventKind::SpooledNotAllowed);
            return;
        }

        let pattern = self.attributes.read().disk_usage_pattern;
        let mut disk_available = false;
        for aux in self.auxiliaries.iter().filter(|a| a.kind() == AuxiliaryKind::Disk) {
            disk_available = true;
            if pattern == DiskUsagePattern::Swap {
                self.handle_element_event(element, ElementEventKind::SpooledDiskAvailable);
                aux.update(element.clone()).await;
                debug!(cache = %self.cache_name, auxiliary = %aux.name(), key = ?element.key(), "Spooled to disk");
            }
        }

        if !disk_available {
            self.handle_element_event(element, ElementEventKind::SpooledDiskNotAvailable);
        }
    }

    /// True if the element has outlived its max life or idle time at `now`
    /// (epoch millis). Fires the matching event kind; never mutates the
    /// region, the caller decides what to remove.
    pub fn is_expired(
        &self,
        element: &CacheElement<K, V>,
        now: u64,
        max_life_event: ElementEventKind,
        idle_event: ElementEventKind,
    ) -> bool {
        match element.expiry_at(now) {
            Some(Expiry::MaxLife) => {
                debug!(cache = %self.cache_name, key = ?element.key(), "Exceeded max life");
                self.handle_element_event(element, max_life_event);
                true
            }
            Some(Expiry::IdleTime) => {
                debug!(cache = %self.cache_name, key = ?element.key(), "Exceeded idle time");
                self.handle_element_event(element, idle_event);
                true
            }
            None => false,
        }
    }

    /// Queue one event per handler registered on the element
    pub fn handle_element_event(&self, element: &CacheElement<K, V>, kind: ElementEventKind) {
        let handlers = element.attributes().event_handlers();
        if handlers.is_empty() {
            return;
        }
        if !self.event_queue.is_alive() {
            debug!(cache = %self.cache_name, kind = %kind, "Event queue gone, skipping element event");
            return;
        }

        let event = ElementEvent::new(self.cache_name.clone(), format!("{:?}", element.key()), kind);
        for handler in handlers {
            self.event_queue.add_element_event(Arc::clone(handler), event.clone());
        }
    }

    /// Run one shrinker pass now. Returns None if a pass was already running
    /// or the pass failed.
    pub async fn shrink(&self) -> Result<Option<ShrinkReport>> {
        self.ensure_alive()?;
        Ok(shrinker::run_guarded(self, &self.shrinker_stats).await)
    }

    pub(crate) fn shrinker_stats(&self) -> &ShrinkerStats {
        &self.shrinker_stats
    }

    // =========================================================================
    // Management
    // =========================================================================

    /// Current region attributes
    pub fn get_cache_attributes(&self) -> Result<CompositeCacheAttributes> {
        self.ensure_alive()?;
        Ok(self.attributes_snapshot())
    }

    /// Replace the region attributes. Capacity changes apply immediately,
    /// spooling anything over the new bound; the shrinker is rescheduled.
    pub async fn set_cache_attributes(&self, attributes: CompositeCacheAttributes) -> Result<()> {
        self.ensure_alive()?;
        attributes.validate()?;
        if attributes.cache_name != self.cache_name {
            return Err(Error::Management(format!(
                "cannot rename region '{}' to '{}'",
                self.cache_name, attributes.cache_name
            )));
        }
        if attributes.eviction_policy != self.memory.policy() {
            return Err(Error::Management(format!(
                "region '{}': eviction policy cannot change on a live region",
                self.cache_name
            )));
        }

        let max_objects = attributes.max_objects;
        *self.attributes.write() = attributes;
        let evicted = self.memory.set_max_objects(max_objects);
        self.restart_shrinker()?;
        self.waterfall(evicted).await;
        info!(cache = %self.cache_name, max_objects, "Region attributes updated");
        Ok(())
    }

    /// Attributes applied to elements put without explicit attributes
    pub fn get_default_element_attributes(&self) -> Result<ElementAttributes> {
        self.ensure_alive()?;
        Ok(self.default_element_attributes.read().clone())
    }

    /// Replace the default element attributes
    pub fn set_default_element_attributes(&self, attributes: ElementAttributes) -> Result<()> {
        self.ensure_alive()?;
        *self.default_element_attributes.write() = attributes;
        Ok(())
    }

    /// Fresh default attributes for a new element
    pub(crate) fn new_element_attributes(&self) -> ElementAttributes {
        self.default_element_attributes.read().fresh_copy()
    }

    /// Statistics snapshot: region counters, the memory block, then one
    /// block per auxiliary. Readable in every state.
    pub fn get_statistics(&self) -> CacheStats {
        let mut stat_elements = self.counters.stat_elements();
        stat_elements.push(StatElement::new("State", self.state()));
        if self.attributes.read().use_memory_shrinker {
            stat_elements.extend(self.shrinker_stats.stat_elements());
        }

        let mut auxiliary_stats = Vec::with_capacity(self.auxiliaries.len() + 1);
        auxiliary_stats.push(self.memory.statistics());
        auxiliary_stats.extend(self.auxiliaries.iter().map(|a| a.statistics()));

        CacheStats {
            region_name: self.cache_name.clone(),
            stat_elements,
            auxiliary_stats,
        }
    }

    /// Statistics rendered as text
    pub fn get_stats(&self) -> String {
        self.get_statistics().to_string()
    }

    /// Tear the region down: stop the shrinker and event queue, spool memory
    /// into disk tiers, dispose every alive auxiliary, then empty memory.
    /// Idempotent; only the first call does the work.
    pub async fn dispose(&self) -> Result<()> {
        let previous = self.state.swap(RegionState::Disposed.as_u8(), Ordering::AcqRel);
        if previous == RegionState::Disposed.as_u8() {
            return Ok(());
        }
        info!(cache = %self.cache_name, "Disposing region");

        if let Some(shrinker) = self.shrinker.lock().take() {
            shrinker.stop();
        }
        self.event_queue.dispose();

        let mut failures = Vec::new();
        for aux in &self.auxiliaries {
            if !aux.is_alive() {
                info!(cache = %self.cache_name, auxiliary = %aux.name(), status = %aux.status(), "Skipping dispose of auxiliary");
                continue;
            }
            if aux.kind() == AuxiliaryKind::Disk {
                let freed = self.memory.free_elements(self.memory.len());
                info!(cache = %self.cache_name, auxiliary = %aux.name(), spooled = freed.len(), "Spooling memory to disk before dispose");
                self.waterfall(freed).await;
            }
            if let Err(e) = aux.dispose().await {
                warn!(cache = %self.cache_name, auxiliary = %aux.name(), error = %e, "Failure disposing auxiliary");
                failures.push(e.to_string());
            }
        }

        self.memory.clear();
        info!(cache = %self.cache_name, "Region disposed");

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Management(format!(
                "region '{}' disposed with errors: {}",
                self.cache_name,
                failures.join("; ")
            )))
        }
    }
}

impl<K: CacheKey, V: CacheValue> std::fmt::Debug for CompositeCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeCache")
            .field("cache_name", &self.cache_name)
            .field("state", &self.state())
            .field("memory_size", &self.memory.len())
            .field("auxiliaries", &self.auxiliaries)
            .finish()
    }
}

impl<K: CacheKey, V: CacheValue> Drop for CompositeCache<K, V> {
    fn drop(&mut self) {
        if let Some(shrinker) = self.shrinker.get_mut().take() {
            shrinker.stop();
        }
        self.event_queue.dispose();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::auxiliary::{AuxiliaryStatus, InMemoryAuxiliary};
    use crate::cache::events::ElementEventHandler;

    type Region = Arc<CompositeCache<String, String>>;

    fn key(k: &str) -> String {
        k.to_string()
    }

    fn element(region: &Region, k: &str) -> CacheElement<String, String> {
        CacheElement::new(region.cache_name(), k.to_string(), k.to_uppercase(), region.new_element_attributes())
    }

    fn region(max_objects: usize) -> Region {
        CompositeCache::new(
            CompositeCacheAttributes::named("test").with_max_objects(max_objects),
            ElementAttributes::new(),
        )
        .unwrap()
    }

    fn region_with(
        attributes: CompositeCacheAttributes,
        backends: Vec<(Arc<InMemoryAuxiliary<String, String>>, AuxiliaryKind)>,
    ) -> Region {
        let auxiliaries = backends
            .into_iter()
            .enumerate()
            .map(|(i, (backend, kind))| {
                let backend: Arc<dyn AuxiliaryCache<String, String>> = backend;
                (backend, AuxiliaryAttributes::new(format!("aux-{}", i), kind))
            })
            .collect();
        CompositeCache::with_auxiliaries(attributes, ElementAttributes::new(), auxiliaries).unwrap()
    }

    #[tokio::test]
    async fn test_region_starts_active() {
        let cache = region(10);
        assert_eq!(cache.state(), RegionState::Active);
    }

    #[tokio::test]
    async fn test_get_hit_and_miss_counters() {
        let cache = region(10);
        cache.update(element(&cache, "a")).await.unwrap();

        assert!(cache.get(&key("a")).await.unwrap().is_some());
        assert!(cache.get(&key("b")).await.unwrap().is_none());
        assert_eq!(cache.counters().hit_count_ram(), 1);
        assert_eq!(cache.counters().miss_count_not_found(), 1);
        assert_eq!(cache.counters().update_count(), 1);
    }

    #[tokio::test]
    async fn test_memory_expiry_on_request() {
        let cache = region(10);
        let mut e = element(&cache, "a");
        e.set_attributes(ElementAttributes::new().with_max_life(1));
        e.attributes_mut().set_create_time(now_millis() - 5000);
        cache.update(e).await.unwrap();

        assert!(cache.get(&key("a")).await.unwrap().is_none());
        assert_eq!(cache.counters().miss_count_expired(), 1);
        assert!(!cache.memory().contains(&key("a")));
    }

    #[tokio::test]
    async fn test_is_expired_boundaries() {
        let cache = region(10);
        let e = CacheElement::new("test", key("a"), key("v"), ElementAttributes::new().with_max_life(1));
        let created = e.attributes().create_time();

        let life = ElementEventKind::ExceededMaxLifeBackground;
        let idle = ElementEventKind::ExceededIdleTimeBackground;
        assert!(cache.is_expired(&e, created + 2000, life, idle));
        assert!(!cache.is_expired(&e, created + 500, life, idle));
    }

    #[tokio::test]
    async fn test_aux_hit_promotes_to_memory() {
        let disk = Arc::new(InMemoryAuxiliary::new("disk"));
        let cache = region_with(CompositeCacheAttributes::named("test"), vec![(Arc::clone(&disk), AuxiliaryKind::Disk)]);
        disk.insert(CacheElement::new("test", key("k"), key("from-disk"), ElementAttributes::new()));

        let found = cache.get(&key("k")).await.unwrap().unwrap();
        assert_eq!(found.value(), "from-disk");
        assert!(cache.memory().get_quiet(&key("k")).is_some());
        assert_eq!(cache.counters().hit_count_aux(), 1);
    }

    #[tokio::test]
    async fn test_expired_aux_hit_is_removed_everywhere() {
        let disk = Arc::new(InMemoryAuxiliary::new("disk"));
        let cache = region_with(CompositeCacheAttributes::named("test"), vec![(Arc::clone(&disk), AuxiliaryKind::Disk)]);
        let mut stale = CacheElement::new("test", key("k"), key("old"), ElementAttributes::new().with_max_life(1));
        stale.attributes_mut().set_create_time(now_millis() - 10_000);
        disk.insert(stale);

        assert!(cache.get(&key("k")).await.unwrap().is_none());
        assert_eq!(cache.counters().miss_count_expired(), 1);
        assert!(!disk.contains(&key("k")));
    }

    #[tokio::test]
    async fn test_expiry_cleanup_is_not_counted_as_remove() {
        let disk = Arc::new(InMemoryAuxiliary::new("disk"));
        let cache = region_with(CompositeCacheAttributes::named("test"), vec![(Arc::clone(&disk), AuxiliaryKind::Disk)]);

        let mut in_memory = element(&cache, "mem");
        in_memory.set_attributes(ElementAttributes::new().with_max_life(1));
        in_memory.attributes_mut().set_create_time(now_millis() - 5000);
        cache.update(in_memory).await.unwrap();
        let mut on_disk = CacheElement::new("test", key("aux"), key("old"), ElementAttributes::new().with_max_life(1));
        on_disk.attributes_mut().set_create_time(now_millis() - 5000);
        disk.insert(on_disk);

        assert!(cache.get(&key("mem")).await.unwrap().is_none());
        assert!(cache.get(&key("aux")).await.unwrap().is_none());
        assert_eq!(cache.counters().miss_count_expired(), 2);
        assert_eq!(cache.counters().remove_count(), 0);

        cache.update(element(&cache, "live")).await.unwrap();
        cache.remove(&key("live")).await.unwrap();
        cache.local_remove(&key("absent")).await.unwrap();
        assert_eq!(cache.counters().remove_count(), 2);
        assert_eq!(cache.get_statistics().counter("RemoveCount"), Some(2));
    }

    #[tokio::test]
    async fn test_overflow_spools_to_disk() {
        let disk = Arc::new(InMemoryAuxiliary::new("disk"));
        let cache = region_with(
            CompositeCacheAttributes::named("test").with_max_objects(2),
            vec![(Arc::clone(&disk), AuxiliaryKind::Disk)],
        );
        for k in ["a", "b", "c", "d"] {
            cache.update(element(&cache, k)).await.unwrap();
        }

        assert_eq!(cache.memory().len(), 2);
        assert!(disk.contains(&key("a")));
        assert!(disk.contains(&key("b")));
        assert!(!disk.contains(&key("d")));
    }

    #[tokio::test]
    async fn test_update_routing_respects_flags() {
        let disk = Arc::new(InMemoryAuxiliary::new("disk"));
        let lateral = Arc::new(InMemoryAuxiliary::new("lateral"));
        let remote = Arc::new(InMemoryAuxiliary::new("remote"));
        let mut attributes = CompositeCacheAttributes::named("test");
        attributes.use_lateral = false;
        let cache = region_with(
            attributes,
            vec![
                (Arc::clone(&disk), AuxiliaryKind::Disk),
                (Arc::clone(&lateral), AuxiliaryKind::Lateral),
                (Arc::clone(&remote), AuxiliaryKind::Remote),
            ],
        );
        cache.update(element(&cache, "a")).await.unwrap();

        // Swap pattern: disk only receives spooled elements.
        assert!(!disk.contains(&key("a")));
        assert!(!lateral.contains(&key("a")));
        assert!(remote.contains(&key("a")));

        cache.local_update(element(&cache, "b")).await.unwrap();
        assert!(!remote.contains(&key("b")));
    }

    #[tokio::test]
    async fn test_update_pattern_writes_disk_on_put() {
        let disk = Arc::new(InMemoryAuxiliary::new("disk"));
        let mut attributes = CompositeCacheAttributes::named("test");
        attributes.disk_usage_pattern = DiskUsagePattern::Update;
        let cache = region_with(attributes, vec![(Arc::clone(&disk), AuxiliaryKind::Disk)]);

        cache.update(element(&cache, "a")).await.unwrap();
        assert!(disk.contains(&key("a")));
    }

    #[tokio::test]
    async fn test_local_get_skips_remote() {
        let remote = Arc::new(InMemoryAuxiliary::new("remote"));
        let cache = region_with(CompositeCacheAttributes::named("test"), vec![(Arc::clone(&remote), AuxiliaryKind::Remote)]);
        remote.insert(CacheElement::new("test", key("k"), key("v"), ElementAttributes::new()));

        assert!(cache.local_get(&key("k")).await.unwrap().is_none());
        assert!(cache.get(&key("k")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_remove_reaches_every_tier() {
        let disk = Arc::new(InMemoryAuxiliary::new("disk"));
        let remote = Arc::new(InMemoryAuxiliary::new("remote"));
        let cache = region_with(
            CompositeCacheAttributes::named("test"),
            vec![(Arc::clone(&disk), AuxiliaryKind::Disk), (Arc::clone(&remote), AuxiliaryKind::Remote)],
        );
        disk.insert(CacheElement::new("test", key("k"), key("v"), ElementAttributes::new()));
        cache.update(element(&cache, "k")).await.unwrap();

        assert!(cache.remove(&key("k")).await.unwrap());
        assert!(!cache.remove(&key("k")).await.unwrap());
        assert!(!disk.contains(&key("k")));
        assert!(!remote.contains(&key("k")));
        assert!(cache.get(&key("k")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unreachable_auxiliary_never_fails_put() {
        let remote = Arc::new(InMemoryAuxiliary::new("remote"));
        remote.set_status(AuxiliaryStatus::Error);
        let cache = region_with(CompositeCacheAttributes::named("test"), vec![(Arc::clone(&remote), AuxiliaryKind::Remote)]);

        cache.update(element(&cache, "a")).await.unwrap();
        assert!(cache.get(&key("a")).await.unwrap().is_some());
        assert_eq!(cache.auxiliaries()[0].zombie_queue_len(), 1);

        remote.set_status(AuxiliaryStatus::Alive);
        cache.update(element(&cache, "b")).await.unwrap();
        assert!(remote.contains(&key("a")));
        assert!(remote.contains(&key("b")));
    }

    #[tokio::test]
    async fn test_spool_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: Arc<dyn ElementEventHandler> = Arc::new(move |e: &ElementEvent| sink.lock().push(e.kind));

        let cache = region(1);
        let mut unspoolable = element(&cache, "a");
        unspoolable.set_attributes(ElementAttributes::new().spool(false).with_event_handler(Arc::clone(&handler)));
        let mut spoolable = element(&cache, "b");
        spoolable.set_attributes(ElementAttributes::new().with_event_handler(handler));

        cache.update(unspoolable).await.unwrap();
        cache.update(spoolable).await.unwrap();
        cache.update(element(&cache, "c")).await.unwrap();

        for _ in 0..100 {
            if seen.lock().len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            *seen.lock(),
            vec![ElementEventKind::SpooledNotAllowed, ElementEventKind::SpooledDiskNotAvailable]
        );
    }

    #[tokio::test]
    async fn test_free_memory_elements() {
        let cache = region(10);
        for k in ["a", "b", "c"] {
            cache.update(element(&cache, k)).await.unwrap();
        }
        assert_eq!(cache.free_memory_elements(2).await.unwrap(), 2);
        assert_eq!(cache.free_memory_elements(5).await.unwrap(), 1);
        assert!(cache.memory().is_empty());
    }

    #[tokio::test]
    async fn test_key_set_unions_tiers() {
        let disk = Arc::new(InMemoryAuxiliary::new("disk"));
        let cache = region_with(CompositeCacheAttributes::named("test"), vec![(Arc::clone(&disk), AuxiliaryKind::Disk)]);
        disk.insert(CacheElement::new("test", key("on-disk"), key("v"), ElementAttributes::new()));
        cache.update(element(&cache, "in-memory")).await.unwrap();

        let keys = cache.key_set(false).await.unwrap();
        assert!(keys.contains("on-disk"));
        assert!(keys.contains("in-memory"));
    }

    #[tokio::test]
    async fn test_save_flushes_memory() {
        let remote = Arc::new(InMemoryAuxiliary::new("remote"));
        let mut attributes = CompositeCacheAttributes::named("test");
        attributes.use_remote = false;
        let cache = region_with(attributes, vec![(Arc::clone(&remote), AuxiliaryKind::Remote)]);
        cache.update(element(&cache, "a")).await.unwrap();
        assert!(remote.is_empty());

        cache.save().await.unwrap();
        assert!(remote.contains(&key("a")));
    }

    #[tokio::test]
    async fn test_dispose_spools_to_disk_and_is_terminal() {
        let disk = Arc::new(InMemoryAuxiliary::new("disk"));
        let cache = region_with(CompositeCacheAttributes::named("test"), vec![(Arc::clone(&disk), AuxiliaryKind::Disk)]);
        cache.update(element(&cache, "a")).await.unwrap();

        cache.dispose().await.unwrap();
        cache.dispose().await.unwrap();

        assert!(disk.contains(&key("a")));
        assert_eq!(disk.status(), AuxiliaryStatus::Disposed);
        assert_eq!(cache.state(), RegionState::Disposed);
        assert!(matches!(cache.get(&key("a")).await, Err(Error::RegionDisposed(_))));
        assert!(matches!(cache.update(element(&cache, "b")).await, Err(Error::RegionDisposed(_))));
        assert_eq!(cache.get_statistics().get("State"), Some("DISPOSED"));
    }

    #[tokio::test]
    async fn test_set_cache_attributes_shrinks_memory() {
        let cache = region(4);
        for k in ["a", "b", "c", "d"] {
            cache.update(element(&cache, k)).await.unwrap();
        }
        let attributes = cache.get_cache_attributes().unwrap().with_max_objects(1);
        cache.set_cache_attributes(attributes).await.unwrap();

        assert_eq!(cache.memory().len(), 1);
        assert!(cache.memory().contains(&key("d")));

        let renamed = CompositeCacheAttributes::named("other");
        assert!(matches!(cache.set_cache_attributes(renamed).await, Err(Error::Management(_))));
    }

    #[tokio::test]
    async fn test_statistics_layout() {
        let disk = Arc::new(InMemoryAuxiliary::new("disk"));
        let cache = region_with(CompositeCacheAttributes::named("test"), vec![(disk, AuxiliaryKind::Disk)]);
        cache.update(element(&cache, "a")).await.unwrap();
        cache.get(&key("a")).await.unwrap();

        let stats = cache.get_statistics();
        assert_eq!(stats.region_name, "test");
        assert_eq!(stats.counter("HitCountRam"), Some(1));
        assert_eq!(stats.auxiliary_stats.len(), 2);
        assert!(stats.auxiliary_stats[0].type_name.starts_with("Memory Cache"));
        assert_eq!(stats.auxiliary_stats[1].type_name, "Disk Auxiliary 'aux-0'");
        assert!(cache.get_stats().contains("Region Name = test"));
    }

    #[tokio::test]
    async fn test_duplicate_auxiliary_names_rejected() {
        let a: Arc<dyn AuxiliaryCache<String, String>> = Arc::new(InMemoryAuxiliary::new("a"));
        let b: Arc<dyn AuxiliaryCache<String, String>> = Arc::new(InMemoryAuxiliary::new("b"));
        let result = CompositeCache::with_auxiliaries(
            CompositeCacheAttributes::named("test"),
            ElementAttributes::new(),
            vec![
                (a, AuxiliaryAttributes::new("same", AuxiliaryKind::Disk)),
                (b, AuxiliaryAttributes::new("same", AuxiliaryKind::Remote)),
            ],
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
