//! Auxiliary Cache Contract
//!
//! Slower tiers behind the memory cache: disk overflow, lateral peers and
//! remote servers. The core only ever talks to them through
//! [`AuxiliaryCache`]; any conforming implementation is interchangeable.
//!
//! # Design
//!
//! - Async trait object (`Arc<dyn AuxiliaryCache<K, V>>`) so network and disk
//!   backends never block the runtime
//! - Liveness is reported through [`AuxiliaryStatus`]; the core degrades to
//!   zombie buffering when a backend is not `Alive`
//! - Optional capabilities (key listing, pattern sweeps, stats) have
//!   defaults so minimal backends stay small

use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::element::CacheElement;
use super::matcher::KeyMatcher;
use super::stats::StatElement;
use crate::error::{Error, Result};

/// Default bound on buffered operations while an auxiliary is unreachable
pub const DEFAULT_ZOMBIE_QUEUE_MAX_SIZE: usize = 5000;

/// Default per-operation bound for auxiliary calls
pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 5000;

/// Backend liveness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuxiliaryStatus {
    /// Accepting operations
    Alive,
    /// Unreachable or failing
    Error,
    /// Shut down for good
    Disposed,
}

impl AuxiliaryStatus {
    fn as_u8(self) -> u8 {
        match self {
            AuxiliaryStatus::Alive => 0,
            AuxiliaryStatus::Error => 1,
            AuxiliaryStatus::Disposed => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => AuxiliaryStatus::Alive,
            1 => AuxiliaryStatus::Error,
            _ => AuxiliaryStatus::Disposed,
        }
    }
}

impl std::fmt::Display for AuxiliaryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuxiliaryStatus::Alive => write!(f, "ALIVE"),
            AuxiliaryStatus::Error => write!(f, "ERROR"),
            AuxiliaryStatus::Disposed => write!(f, "DISPOSED"),
        }
    }
}

/// Role of an auxiliary in the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuxiliaryKind {
    /// Local overflow store, receives spooled elements
    Disk,
    /// Peer cache
    Lateral,
    /// Central cache server
    Remote,
}

impl AuxiliaryKind {
    /// Disk tiers stay in play for local-only operations
    pub fn is_local(&self) -> bool {
        matches!(self, AuxiliaryKind::Disk)
    }
}

impl std::fmt::Display for AuxiliaryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuxiliaryKind::Disk => write!(f, "Disk"),
            AuxiliaryKind::Lateral => write!(f, "Lateral"),
            AuxiliaryKind::Remote => write!(f, "Remote"),
        }
    }
}

/// How writes reach an auxiliary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Propagation {
    /// The caller awaits the write, bounded by the operation timeout
    #[default]
    Sync,
    /// Writes go through an ordered background worker; the caller never waits
    Async,
}

/// Per-auxiliary wiring consumed by the core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuxiliaryAttributes {
    /// Auxiliary name (for logs and stats)
    pub name: String,
    /// Role in the chain
    pub kind: AuxiliaryKind,
    /// Write propagation mode
    pub propagation: Propagation,
    /// Upper bound on any single backend call
    pub operation_timeout_ms: u64,
    /// Zombie buffer bound; the oldest operation is dropped on overflow
    pub zombie_queue_max_size: usize,
    /// How often to retry the zombie buffer (None = only on the next write)
    pub zombie_retry_interval_ms: Option<u64>,
}

impl Default for AuxiliaryAttributes {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: AuxiliaryKind::Disk,
            propagation: Propagation::Sync,
            operation_timeout_ms: DEFAULT_OPERATION_TIMEOUT_MS,
            zombie_queue_max_size: DEFAULT_ZOMBIE_QUEUE_MAX_SIZE,
            zombie_retry_interval_ms: None,
        }
    }
}

impl AuxiliaryAttributes {
    /// Attributes for a named auxiliary of the given kind
    pub fn new(name: impl Into<String>, kind: AuxiliaryKind) -> Self {
        Self {
            name: name.into(),
            kind,
            ..Self::default()
        }
    }

    /// Set the propagation mode
    pub fn with_propagation(mut self, propagation: Propagation) -> Self {
        self.propagation = propagation;
        self
    }

    /// Set the operation timeout
    pub fn with_timeout_ms(mut self, millis: u64) -> Self {
        self.operation_timeout_ms = millis;
        self
    }

    /// Set the zombie buffer bound
    pub fn with_zombie_queue_max_size(mut self, size: usize) -> Self {
        self.zombie_queue_max_size = size;
        self
    }

    /// Set the zombie retry cadence
    pub fn with_zombie_retry_ms(mut self, millis: u64) -> Self {
        self.zombie_retry_interval_ms = Some(millis);
        self
    }

    /// Check the attributes are usable
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("auxiliary name must not be empty".into()));
        }
        if self.operation_timeout_ms == 0 {
            return Err(Error::Config(format!(
                "auxiliary '{}': operation_timeout_ms must be > 0",
                self.name
            )));
        }
        if self.zombie_retry_interval_ms == Some(0) {
            return Err(Error::Config(format!(
                "auxiliary '{}': zombie_retry_interval_ms must be > 0 when set",
                self.name
            )));
        }
        Ok(())
    }
}

/// Backend contract for slower tiers
#[async_trait]
pub trait AuxiliaryCache<K, V>: Send + Sync
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Backend name
    fn name(&self) -> &str;

    /// Fetch an element
    async fn get(&self, key: &K) -> Result<Option<CacheElement<K, V>>>;

    /// Store or replace an element
    async fn update(&self, element: &CacheElement<K, V>) -> Result<()>;

    /// Remove an element, reporting whether it existed
    async fn remove(&self, key: &K) -> Result<bool>;

    /// Remove every element
    async fn remove_all(&self) -> Result<()>;

    /// Release resources; the backend reports `Disposed` afterwards
    async fn dispose(&self) -> Result<()>;

    /// Current liveness
    fn status(&self) -> AuxiliaryStatus;

    /// Keys held by the backend, if it can enumerate them
    async fn key_set(&self) -> Result<Vec<K>> {
        Ok(Vec::new())
    }

    /// Elements whose keys match, if the backend supports sweeps
    async fn get_matching(&self, _matcher: &dyn KeyMatcher<K>) -> Result<Vec<CacheElement<K, V>>> {
        Ok(Vec::new())
    }

    /// Backend-specific stats
    fn statistics(&self) -> Vec<StatElement> {
        Vec::new()
    }
}

// =============================================================================
// In-memory backend
// =============================================================================

/// In-memory auxiliary for testing and as a stand-in peer/remote tier
/// Uses DashMap for lock-free concurrent access
pub struct InMemoryAuxiliary<K, V>
where
    K: Hash + Eq,
{
    name: String,
    storage: DashMap<K, CacheElement<K, V>>,
    status: AtomicU8,
    fail_operations: AtomicBool,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl<K, V> InMemoryAuxiliary<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Create a new in-memory backend
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            storage: DashMap::new(),
            status: AtomicU8::new(AuxiliaryStatus::Alive.as_u8()),
            fail_operations: AtomicBool::new(false),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }

    /// Force a liveness state (simulates outages and reconnects)
    pub fn set_status(&self, status: AuxiliaryStatus) {
        self.status.store(status.as_u8(), Ordering::Release);
    }

    /// Make every operation fail while still reporting `Alive`
    pub fn set_fail_operations(&self, fail: bool) {
        self.fail_operations.store(fail, Ordering::Release);
    }

    /// Seed an element directly, bypassing the cache
    pub fn insert(&self, element: CacheElement<K, V>) {
        self.storage.insert(element.key().clone(), element);
    }

    /// Check for a key directly
    pub fn contains(&self, key: &K) -> bool {
        self.storage.contains_key(key)
    }

    /// Stored element count
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Write operations accepted
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn check_available(&self) -> Result<()> {
        let status = AuxiliaryStatus::from_u8(self.status.load(Ordering::Acquire));
        if status != AuxiliaryStatus::Alive || self.fail_operations.load(Ordering::Acquire) {
            return Err(Error::AuxiliaryUnavailable {
                name: self.name.clone(),
                reason: format!("status {}", status),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl<K, V> AuxiliaryCache<K, V> for InMemoryAuxiliary<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &K) -> Result<Option<CacheElement<K, V>>> {
        self.check_available()?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.storage.get(key).map(|e| e.value().clone()))
    }

    async fn update(&self, element: &CacheElement<K, V>) -> Result<()> {
        self.check_available()?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.storage.insert(element.key().clone(), element.clone());
        Ok(())
    }

    async fn remove(&self, key: &K) -> Result<bool> {
        self.check_available()?;
        self.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(self.storage.remove(key).is_some())
    }

    async fn remove_all(&self) -> Result<()> {
        self.check_available()?;
        self.storage.clear();
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        self.set_status(AuxiliaryStatus::Disposed);
        Ok(())
    }

    fn status(&self) -> AuxiliaryStatus {
        AuxiliaryStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    async fn key_set(&self) -> Result<Vec<K>> {
        self.check_available()?;
        Ok(self.storage.iter().map(|e| e.key().clone()).collect())
    }

    async fn get_matching(&self, matcher: &dyn KeyMatcher<K>) -> Result<Vec<CacheElement<K, V>>> {
        self.check_available()?;
        Ok(self
            .storage
            .iter()
            .filter(|e| matcher.matches(e.key()))
            .map(|e| e.value().clone())
            .collect())
    }

    fn statistics(&self) -> Vec<StatElement> {
        vec![
            StatElement::new("Object Count", self.storage.len()),
            StatElement::new("Reads", self.reads.load(Ordering::Relaxed)),
            StatElement::new("Writes", self.writes.load(Ordering::Relaxed)),
            StatElement::new("Deletes", self.deletes.load(Ordering::Relaxed)),
        ]
    }
}

// =============================================================================
// Tests
// =============================================================================
