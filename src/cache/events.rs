//! Element Event Queue
//!
//! Asynchronous, ordered delivery of element lifecycle events to listeners.
//!
//! # Design
//!
//! - One queue per region, drained by exactly one tokio worker so that the
//!   events a listener sees arrive in the order they were raised
//! - Enqueueing never blocks and never fails back into the cache hot path;
//!   events raised after `dispose()` are dropped and logged
//! - A panicking listener is contained to the single delivery

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::now_millis;
use crate::error::{Error, Result};

/// Lifecycle event kinds, naming both the trigger and the outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementEventKind {
    /// Max life exceeded, detected by the shrinker
    ExceededMaxLifeBackground,
    /// Idle time exceeded, detected by the shrinker
    ExceededIdleTimeBackground,
    /// Max life exceeded, detected on a read
    ExceededMaxLifeOnRequest,
    /// Idle time exceeded, detected on a read
    ExceededIdleTimeOnRequest,
    /// Evicted from memory and a disk tier was available
    SpooledDiskAvailable,
    /// Evicted from memory but no disk tier is configured
    SpooledDiskNotAvailable,
    /// Evicted from memory but the element may not be spooled
    SpooledNotAllowed,
}

impl std::fmt::Display for ElementEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ElementEventKind::ExceededMaxLifeBackground => "EXCEEDED_MAXLIFE_BACKGROUND",
            ElementEventKind::ExceededIdleTimeBackground => "EXCEEDED_IDLETIME_BACKGROUND",
            ElementEventKind::ExceededMaxLifeOnRequest => "EXCEEDED_MAXLIFE_ONREQUEST",
            ElementEventKind::ExceededIdleTimeOnRequest => "EXCEEDED_IDLETIME_ONREQUEST",
            ElementEventKind::SpooledDiskAvailable => "SPOOLED_DISK_AVAILABLE",
            ElementEventKind::SpooledDiskNotAvailable => "SPOOLED_DISK_NOT_AVAILABLE",
            ElementEventKind::SpooledNotAllowed => "SPOOLED_NOT_ALLOWED",
        };
        write!(f, "{}", name)
    }
}

/// A lifecycle event for one element
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementEvent {
    /// Region the element belongs to
    pub cache_name: String,
    /// Debug rendering of the element key
    pub key: String,
    /// What happened
    pub kind: ElementEventKind,
    /// When it was raised (epoch millis)
    pub timestamp: u64,
}

impl ElementEvent {
    /// Create an event stamped now
    pub fn new(cache_name: impl Into<String>, key: impl Into<String>, kind: ElementEventKind) -> Self {
        Self {
            cache_name: cache_name.into(),
            key: key.into(),
            kind,
            timestamp: now_millis(),
        }
    }
}

/// Listener for element lifecycle events
pub trait ElementEventHandler: Send + Sync {
    /// Handle one event. Runs on the region's event worker.
    fn handle_element_event(&self, event: &ElementEvent);
}

impl<F> ElementEventHandler for F
where
    F: Fn(&ElementEvent) + Send + Sync,
{
    fn handle_element_event(&self, event: &ElementEvent) {
        self(event)
    }
}

struct QueuedEvent {
    handler: Arc<dyn ElementEventHandler>,
    event: ElementEvent,
}

/// Per-region single-worker event queue
pub struct ElementEventQueue {
    cache_name: String,
    sender: mpsc::UnboundedSender<QueuedEvent>,
    alive: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    enqueued: AtomicU64,
    delivered: Arc<AtomicU64>,
    dropped: AtomicU64,
}

impl ElementEventQueue {
    /// Create the queue and spawn its worker on the current tokio runtime
    pub fn new(cache_name: impl Into<String>) -> Result<Self> {
        let cache_name = cache_name.into();
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            Error::Config(format!(
                "region '{}': element event queue needs a tokio runtime: {}",
                cache_name, e
            ))
        })?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let delivered = Arc::new(AtomicU64::new(0));
        let worker = runtime.spawn(Self::run(cache_name.clone(), receiver, Arc::clone(&delivered)));

        Ok(Self {
            cache_name,
            sender,
            alive: AtomicBool::new(true),
            worker: Mutex::new(Some(worker)),
            enqueued: AtomicU64::new(0),
            delivered,
            dropped: AtomicU64::new(0),
        })
    }

    async fn run(
        cache_name: String,
        mut receiver: mpsc::UnboundedReceiver<QueuedEvent>,
        delivered: Arc<AtomicU64>,
    ) {
        while let Some(queued) = receiver.recv().await {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                queued.handler.handle_element_event(&queued.event)
            }));
            match outcome {
                Ok(()) => {
                    delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    error!(
                        cache = %cache_name,
                        kind = %queued.event.kind,
                        key = %queued.event.key,
                        "Element event handler panicked"
                    );
                }
            }
        }
        debug!(cache = %cache_name, "Element event worker stopped");
    }

    /// Queue an event for a handler. Never blocks; returns false if dropped.
    pub fn add_element_event(&self, handler: Arc<dyn ElementEventHandler>, event: ElementEvent) -> bool {
        if !self.alive.load(Ordering::Acquire) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                cache = %self.cache_name,
                kind = %event.kind,
                "Event queue disposed, dropping element event"
            );
            return false;
        }

        match self.sender.send(QueuedEvent { handler, event }) {
            Ok(()) => {
                self.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(cache = %self.cache_name, "Event worker gone, dropping element event");
                false
            }
        }
    }

    /// Stop accepting events and cancel the worker. In-flight work may be lost.
    pub fn dispose(&self) {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
        debug!(cache = %self.cache_name, "Element event queue disposed");
    }

    /// Whether the queue still accepts events
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Events accepted so far
    pub fn enqueued_count(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    /// Events delivered to handlers so far
    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Events dropped because the queue was disposed
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ElementEventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElementEventQueue")
            .field("cache_name", &self.cache_name)
            .field("alive", &self.is_alive())
            .field("enqueued", &self.enqueued_count())
            .field("delivered", &self.delivered_count())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn collector() -> (Arc<Mutex<Vec<ElementEvent>>>, Arc<dyn ElementEventHandler>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: Arc<dyn ElementEventHandler> =
            Arc::new(move |event: &ElementEvent| sink.lock().push(event.clone()));
        (seen, handler)
    }

    async fn wait_for_delivery(queue: &ElementEventQueue, count: u64) {
        for _ in 0..200 {
            if queue.delivered_count() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let queue = ElementEventQueue::new("orders").unwrap();
        let (seen, handler) = collector();

        for i in 0..50 {
            let event = ElementEvent::new("orders", format!("k{}", i), ElementEventKind::SpooledDiskAvailable);
            assert!(queue.add_element_event(Arc::clone(&handler), event));
        }
        wait_for_delivery(&queue, 50).await;

        let keys: Vec<String> = seen.lock().iter().map(|e| e.key.clone()).collect();
        let expected: Vec<String> = (0..50).map(|i| format!("k{}", i)).collect();
        assert_eq!(keys, expected);
    }

    #[tokio::test]
    async fn test_events_after_dispose_are_dropped() {
        let queue = ElementEventQueue::new("orders").unwrap();
        let (seen, handler) = collector();

        queue.dispose();
        assert!(!queue.is_alive());

        let event = ElementEvent::new("orders", "k", ElementEventKind::SpooledNotAllowed);
        assert!(!queue.add_element_event(handler, event));
        assert_eq!(queue.dropped_count(), 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let queue = ElementEventQueue::new("orders").unwrap();
        queue.dispose();
        queue.dispose();
        assert!(!queue.is_alive());
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_stop_worker() {
        let queue = ElementEventQueue::new("orders").unwrap();
        let bad: Arc<dyn ElementEventHandler> = Arc::new(|_: &ElementEvent| panic!("listener bug"));
        let (seen, good) = collector();

        queue.add_element_event(bad, ElementEvent::new("orders", "a", ElementEventKind::SpooledNotAllowed));
        queue.add_element_event(good, ElementEvent::new("orders", "b", ElementEventKind::SpooledNotAllowed));
        wait_for_delivery(&queue, 1).await;

        assert_eq!(seen.lock().len(), 1);
        assert_eq!(seen.lock()[0].key, "b");
    }

    #[test]
    fn test_queue_requires_runtime() {
        assert!(matches!(ElementEventQueue::new("orders"), Err(Error::Config(_))));
    }

    #[test]
    fn test_event_kind_display() {
        assert_eq!(
            ElementEventKind::ExceededIdleTimeBackground.to_string(),
            "EXCEEDED_IDLETIME_BACKGROUND"
        );
    }
}
