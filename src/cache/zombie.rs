//! Auxiliary Handle - Zombie Buffering and No-Wait Propagation
//!
//! Wraps one auxiliary backend for a region. The core never calls a backend
//! directly; it goes through this handle, which guarantees that an
//! unreachable tier cannot block or fail the memory-tier fast path.
//!
//! # Design
//!
//! - Writes issued while the backend is not `Alive` (or that fail with a
//!   transient error) go into a bounded FIFO zombie buffer; on overflow the
//!   oldest operation is dropped and counted
//! - Before a new write, buffered operations are replayed in order; a write
//!   never overtakes older buffered ones
//! - `Propagation::Async` backends get a single ordered worker task (the
//!   no-wait facade) so callers never await them
//! - An optional recovery ticker retries the buffer on a fixed cadence
//! - Every backend call is bounded by `operation_timeout_ms`

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::auxiliary::{AuxiliaryAttributes, AuxiliaryCache, AuxiliaryKind, AuxiliaryStatus, Propagation};
use super::element::CacheElement;
use super::matcher::KeyMatcher;
use super::stats::{StatElement, Stats};
use crate::error::{Error, Result};

/// A write waiting to reach the backend
enum PendingOp<K, V> {
    Update(CacheElement<K, V>),
    Remove(K),
    RemoveAll,
}

impl<K, V> PendingOp<K, V> {
    fn label(&self) -> &'static str {
        match self {
            PendingOp::Update(_) => "update",
            PendingOp::Remove(_) => "remove",
            PendingOp::RemoveAll => "remove_all",
        }
    }
}

struct HandleInner<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    cache_name: String,
    backend: Arc<dyn AuxiliaryCache<K, V>>,
    attributes: AuxiliaryAttributes,
    zombie: Mutex<VecDeque<PendingOp<K, V>>>,
    flushing: tokio::sync::Mutex<()>,
    dropped: AtomicU64,
    failed: AtomicU64,
    recovered: AtomicU64,
}

impl<K, V> HandleInner<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn timeout(&self) -> Duration {
        Duration::from_millis(self.attributes.operation_timeout_ms)
    }

    async fn timed<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        let after = self.timeout();
        tokio::time::timeout(after, call)
            .await
            .map_err(|_| Error::AuxiliaryTimeout {
                name: self.attributes.name.clone(),
                after,
            })?
    }

    fn is_alive(&self) -> bool {
        self.backend.status() == AuxiliaryStatus::Alive
    }

    async fn execute(&self, op: &PendingOp<K, V>) -> Result<()> {
        match op {
            PendingOp::Update(element) => self.timed(self.backend.update(element)).await,
            PendingOp::Remove(key) => self.timed(self.backend.remove(key)).await.map(|_| ()),
            PendingOp::RemoveAll => self.timed(self.backend.remove_all()).await,
        }
    }

    fn buffer(&self, op: PendingOp<K, V>) {
        let max = self.attributes.zombie_queue_max_size;
        let mut zombie = self.zombie.lock();
        if zombie.is_empty() {
            warn!(
                cache = %self.cache_name,
                auxiliary = %self.attributes.name,
                "Auxiliary unavailable, entering zombie mode"
            );
        }
        if max == 0 {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        while zombie.len() >= max {
            zombie.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        zombie.push_back(op);
    }

    /// Deliver one write, buffering it if the backend is unavailable
    async fn submit(&self, op: PendingOp<K, V>) {
        if !self.is_alive() {
            self.buffer(op);
            return;
        }

        self.flush().await;
        if !self.zombie.lock().is_empty() {
            self.buffer(op);
            return;
        }

        match self.execute(&op).await {
            Ok(()) => {}
            Err(e) if e.is_transient() => {
                debug!(
                    cache = %self.cache_name,
                    auxiliary = %self.attributes.name,
                    op = op.label(),
                    error = %e,
                    "Auxiliary write failed, buffering"
                );
                self.buffer(op);
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    cache = %self.cache_name,
                    auxiliary = %self.attributes.name,
                    op = op.label(),
                    error = %e,
                    "Auxiliary write rejected, dropping"
                );
            }
        }
    }

    /// Replay buffered writes in order while the backend stays alive
    async fn flush(&self) -> usize {
        let Ok(_guard) = self.flushing.try_lock() else {
            return 0;
        };

        let mut flushed = 0;
        while self.is_alive() {
            let next = self.zombie.lock().pop_front();
            let Some(op) = next else {
                break;
            };
            match self.execute(&op).await {
                Ok(()) => flushed += 1,
                Err(e) if e.is_transient() => {
                    self.zombie.lock().push_front(op);
                    break;
                }
                Err(e) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        cache = %self.cache_name,
                        auxiliary = %self.attributes.name,
                        op = op.label(),
                        error = %e,
                        "Buffered auxiliary write rejected, dropping"
                    );
                }
            }
        }

        if flushed > 0 {
            self.recovered.fetch_add(flushed as u64, Ordering::Relaxed);
            info!(
                cache = %self.cache_name,
                auxiliary = %self.attributes.name,
                flushed,
                remaining = self.zombie.lock().len(),
                "Replayed zombie buffer"
            );
        }
        flushed
    }
}

/// A region's connection to one auxiliary backend
pub struct AuxiliaryHandle<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    inner: Arc<HandleInner<K, V>>,
    no_wait: Mutex<Option<mpsc::UnboundedSender<PendingOp<K, V>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    recovery: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl<K, V> AuxiliaryHandle<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Wrap a backend. Async propagation and zombie retry need a tokio runtime.
    pub fn new(
        cache_name: impl Into<String>,
        backend: Arc<dyn AuxiliaryCache<K, V>>,
        attributes: AuxiliaryAttributes,
    ) -> Result<Self> {
        attributes.validate()?;
        let cache_name = cache_name.into();

        let needs_runtime =
            attributes.propagation == Propagation::Async || attributes.zombie_retry_interval_ms.is_some();
        let runtime = if needs_runtime {
            Some(tokio::runtime::Handle::try_current().map_err(|e| {
                Error::Config(format!(
                    "auxiliary '{}' needs a tokio runtime: {}",
                    attributes.name, e
                ))
            })?)
        } else {
            None
        };

        let inner = Arc::new(HandleInner {
            cache_name,
            backend,
            attributes,
            zombie: Mutex::new(VecDeque::new()),
            flushing: tokio::sync::Mutex::new(()),
            dropped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            recovered: AtomicU64::new(0),
        });

        let mut no_wait = None;
        let mut worker = None;
        let mut recovery = None;
        if let Some(runtime) = runtime {
            if inner.attributes.propagation == Propagation::Async {
                let (sender, receiver) = mpsc::unbounded_channel();
                worker = Some(runtime.spawn(Self::run_no_wait(Arc::clone(&inner), receiver)));
                no_wait = Some(sender);
            }
            if let Some(millis) = inner.attributes.zombie_retry_interval_ms {
                recovery = Some(runtime.spawn(Self::run_recovery(
                    Arc::downgrade(&inner),
                    Duration::from_millis(millis),
                )));
            }
        }

        Ok(Self {
            inner,
            no_wait: Mutex::new(no_wait),
            worker: Mutex::new(worker),
            recovery: Mutex::new(recovery),
            disposed: AtomicBool::new(false),
        })
    }

    async fn run_no_wait(inner: Arc<HandleInner<K, V>>, mut receiver: mpsc::UnboundedReceiver<PendingOp<K, V>>) {
        while let Some(op) = receiver.recv().await {
            inner.submit(op).await;
        }
        debug!(
            cache = %inner.cache_name,
            auxiliary = %inner.attributes.name,
            "No-wait worker stopped"
        );
    }

    async fn run_recovery(weak: Weak<HandleInner<K, V>>, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.is_alive() && !inner.zombie.lock().is_empty() {
                inner.flush().await;
            }
        }
    }

    /// Auxiliary name
    pub fn name(&self) -> &str {
        &self.inner.attributes.name
    }

    /// Role in the chain
    pub fn kind(&self) -> AuxiliaryKind {
        self.inner.attributes.kind
    }

    /// Wiring attributes
    pub fn attributes(&self) -> &AuxiliaryAttributes {
        &self.inner.attributes
    }

    /// Backend liveness
    pub fn status(&self) -> AuxiliaryStatus {
        self.inner.backend.status()
    }

    /// True when the backend reports `Alive`
    pub fn is_alive(&self) -> bool {
        self.inner.is_alive()
    }

    /// Buffered writes waiting for the backend
    pub fn zombie_queue_len(&self) -> usize {
        self.inner.zombie.lock().len()
    }

    /// Buffered writes lost to overflow
    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Read from the backend. Unavailable or failing backends read as a miss.
    pub async fn get(&self, key: &K) -> Option<CacheElement<K, V>> {
        if !self.is_alive() {
            return None;
        }
        match self.inner.timed(self.inner.backend.get(key)).await {
            Ok(found) => found,
            Err(e) => {
                warn!(
                    cache = %self.inner.cache_name,
                    auxiliary = %self.name(),
                    error = %e,
                    "Auxiliary get failed, treating as miss"
                );
                None
            }
        }
    }

    /// Matching elements from the backend, empty when unavailable
    pub async fn get_matching(&self, matcher: &dyn KeyMatcher<K>) -> Vec<CacheElement<K, V>> {
        if !self.is_alive() {
            return Vec::new();
        }
        match self.inner.timed(self.inner.backend.get_matching(matcher)).await {
            Ok(found) => found,
            Err(e) => {
                warn!(auxiliary = %self.name(), error = %e, "Auxiliary sweep failed");
                Vec::new()
            }
        }
    }

    /// Keys held by the backend, empty when unavailable
    pub async fn key_set(&self) -> Vec<K> {
        if !self.is_alive() {
            return Vec::new();
        }
        match self.inner.timed(self.inner.backend.key_set()).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(auxiliary = %self.name(), error = %e, "Auxiliary key listing failed");
                Vec::new()
            }
        }
    }

    /// Propagate an element
    pub async fn update(&self, element: CacheElement<K, V>) {
        self.dispatch(PendingOp::Update(element)).await
    }

    /// Propagate a removal
    pub async fn remove(&self, key: K) {
        self.dispatch(PendingOp::Remove(key)).await
    }

    /// Propagate a full clear
    pub async fn remove_all(&self) {
        self.dispatch(PendingOp::RemoveAll).await
    }

    async fn dispatch(&self, op: PendingOp<K, V>) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        let op = {
            let no_wait = self.no_wait.lock();
            match no_wait.as_ref() {
                Some(sender) => match sender.send(op) {
                    Ok(()) => return,
                    Err(mpsc::error::SendError(op)) => op,
                },
                None => op,
            }
        };
        self.inner.submit(op).await;
    }

    /// Replay the zombie buffer now. Returns how many writes were delivered.
    pub async fn recover(&self) -> usize {
        self.inner.flush().await
    }

    /// Stop background workers and dispose the backend. Idempotent.
    pub async fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // Closing the channel lets the worker drain what callers already queued.
        self.no_wait.lock().take();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if tokio::time::timeout(self.inner.timeout(), worker).await.is_err() {
                warn!(auxiliary = %self.name(), "No-wait worker did not drain in time");
            }
        }
        if let Some(recovery) = self.recovery.lock().take() {
            recovery.abort();
        }

        let pending = self.zombie_queue_len();
        if pending > 0 {
            warn!(
                cache = %self.inner.cache_name,
                auxiliary = %self.name(),
                pending,
                "Disposing auxiliary with buffered writes"
            );
        }

        if !self.is_alive() {
            info!(
                cache = %self.inner.cache_name,
                auxiliary = %self.name(),
                status = %self.status(),
                "Auxiliary not alive, skipping backend dispose"
            );
            return Ok(());
        }

        self.inner
            .timed(self.inner.backend.dispose())
            .await
            .map_err(|e| Error::Management(format!("dispose of auxiliary '{}' failed: {}", self.name(), e)))
    }

    /// Stat block for this auxiliary
    pub fn statistics(&self) -> Stats {
        let mut elements = vec![
            StatElement::new("Status", self.status()),
            StatElement::new("Propagation", format!("{:?}", self.inner.attributes.propagation)),
            StatElement::new("Zombie Queue Size", self.zombie_queue_len()),
            StatElement::new("Dropped Events", self.dropped_count()),
            StatElement::new("Failed Writes", self.inner.failed.load(Ordering::Relaxed)),
            StatElement::new("Recovered Writes", self.inner.recovered.load(Ordering::Relaxed)),
        ];
        elements.extend(self.inner.backend.statistics());
        Stats::new(format!("{} Auxiliary '{}'", self.kind(), self.name()), elements)
    }
}

impl<K, V> std::fmt::Debug for AuxiliaryHandle<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuxiliaryHandle")
            .field("name", &self.inner.attributes.name)
            .field("kind", &self.inner.attributes.kind)
            .field("zombie_queue", &self.inner.zombie.lock().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
