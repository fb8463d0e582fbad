//! Deduplicating, rate-limited work queue.
//!
//! This module holds the retry queue at the center of the pipeline: the
//! event router inserts reconcile keys, the worker pool drains them. The
//! queue guarantees that a key is never handed to two workers at once and
//! that duplicate adds collapse into a single pending entry, so a burst of
//! notifications for one object results in one reconcile pass over the
//! latest cached state.
//!
//! Semantics follow the classic controller work queue: a FIFO of pending
//! keys, a `dirty` set of keys awaiting a pass, and a `processing` set of
//! keys currently held by a worker. A key added while in flight is not
//! queued immediately; it is re-queued when the worker calls [`RetryQueue::done`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::backoff::Backoff;

/// Stable identifier for one unit of reconcile work: the namespace and
/// name of a primary object. Equality is structural.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReconcileKey {
    /// Namespace of the primary object
    pub namespace: String,
    /// Name of the primary object
    pub name: String,
}

impl ReconcileKey {
    /// Creates a key from a namespace and name.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ReconcileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Internal queue state, guarded by one mutex.
///
/// A logical queue entry is a key present in `dirty` plus its retry count
/// in `retries`; the backoff deadline is realized as a delayed re-add task
/// rather than stored state.
#[derive(Debug, Default)]
struct Inner {
    /// Keys ready to be handed to a worker, in arrival order
    fifo: VecDeque<ReconcileKey>,
    /// Keys with a pass pending (queued, or re-add requested while in flight)
    dirty: HashSet<ReconcileKey>,
    /// Keys currently held by a worker
    processing: HashSet<ReconcileKey>,
    /// Consecutive failure count per key, cleared by `forget`
    retries: HashMap<ReconcileKey, u32>,
    shutting_down: bool,
}

/// Deduplicating retry queue shared by the router and the worker pool.
///
/// All methods are safe to call concurrently. `get` is the only
/// suspension point; every other operation holds the internal lock for a
/// few set/map operations, so the change feed is never blocked for more
/// than enqueue latency.
pub struct RetryQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    backoff: Box<dyn Backoff>,
    max_retries: u32,
}

impl fmt::Debug for RetryQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryQueue")
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl RetryQueue {
    /// Creates a queue with the given backoff policy and retry horizon.
    ///
    /// After `max_retries` consecutive failures of one key,
    /// [`RetryQueue::add_rate_limited`] refuses to requeue it and the
    /// caller is expected to drop the key as a terminal failure.
    pub fn new(backoff: Box<dyn Backoff>, max_retries: u32) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            backoff,
            max_retries,
        }
    }

    /// Recover the guard even if a worker panicked while holding the lock;
    /// the queue state is only mutated by complete set/map operations.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts a key. Duplicate adds while the key is pending are no-ops;
    /// adds while the key is in flight are merged and re-queued when the
    /// in-flight pass completes.
    pub fn add(&self, key: ReconcileKey) {
        let mut inner = self.lock();
        if inner.shutting_down {
            return;
        }
        if inner.dirty.contains(&key) {
            return;
        }
        inner.dirty.insert(key.clone());
        if !inner.processing.contains(&key) {
            inner.fifo.push_back(key);
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Waits for the next key. Returns `None` once the queue is shutting
    /// down; remaining entries are abandoned.
    pub async fn get(&self) -> Option<ReconcileKey> {
        loop {
            // Register for wakeup before checking state so an add between
            // the check and the await is not missed.
            let notified = self.notify.notified();
            {
                let mut inner = self.lock();
                if inner.shutting_down {
                    return None;
                }
                if let Some(key) = inner.fifo.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Marks a key as no longer in flight. If the key was re-added while
    /// being processed, it goes back onto the FIFO for another pass.
    pub fn done(&self, key: &ReconcileKey) {
        let mut inner = self.lock();
        inner.processing.remove(key);
        if inner.dirty.contains(key) && !inner.shutting_down {
            inner.fifo.push_back(key.clone());
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Clears the retry count for a key, signaling successful convergence.
    pub fn forget(&self, key: &ReconcileKey) {
        self.lock().retries.remove(key);
    }

    /// Re-adds a key after a backoff delay proportional to its consecutive
    /// failure count. The receiver is the shared queue handle; the delayed
    /// re-add runs on a spawned task that keeps it alive.
    ///
    /// Returns `false` once the retry horizon is exhausted; the key is not
    /// requeued and its retry state is cleared.
    pub fn add_rate_limited(self: Arc<Self>, key: ReconcileKey) -> bool {
        let delay = {
            let mut inner = self.lock();
            if inner.shutting_down {
                return false;
            }
            let count = inner.retries.entry(key.clone()).or_insert(0);
            *count += 1;
            let count = *count;
            if count > self.max_retries {
                warn!(key = %key, retries = count, "retry horizon exhausted");
                inner.retries.remove(&key);
                return false;
            }
            self.backoff.delay_for(count)
        };
        debug!(key = %key, delay_ms = delay.as_millis() as u64, "requeue scheduled");
        let queue = self;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
        true
    }

    /// Current consecutive failure count for a key.
    pub fn retries(&self, key: &ReconcileKey) -> u32 {
        self.lock().retries.get(key).copied().unwrap_or(0)
    }

    /// Number of keys waiting to be handed to a worker.
    pub fn len(&self) -> usize {
        self.lock().fifo.len()
    }

    /// True if no keys are waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Broadcast shutdown: wakes every waiter, after which `get` returns
    /// `None` and further adds are ignored.
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::FixedBackoff;
    use std::time::Duration;

    fn test_queue() -> Arc<RetryQueue> {
        Arc::new(RetryQueue::new(Box::new(FixedBackoff(Duration::ZERO)), 3))
    }

    fn key(name: &str) -> ReconcileKey {
        ReconcileKey::new("default", name)
    }

    #[tokio::test]
    async fn test_duplicate_adds_collapse() {
        let queue = test_queue();
        queue.add(key("web"));
        queue.add(key("web"));
        queue.add(key("web"));

        assert_eq!(queue.len(), 1, "burst of adds should leave one entry");
        assert_eq!(queue.get().await, Some(key("web")));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_distinct_keys_preserve_order() {
        let queue = test_queue();
        queue.add(key("a"));
        queue.add(key("b"));

        assert_eq!(queue.get().await, Some(key("a")));
        assert_eq!(queue.get().await, Some(key("b")));
    }

    #[tokio::test]
    async fn test_add_while_processing_requeues_on_done() {
        let queue = test_queue();
        queue.add(key("web"));
        assert_eq!(queue.get().await, Some(key("web")));

        // Re-add while in flight: not queued yet, merged into dirty
        queue.add(key("web"));
        assert!(queue.is_empty(), "in-flight key must not be double-queued");

        queue.done(&key("web"));
        assert_eq!(queue.len(), 1, "merged add surfaces after done");
        assert_eq!(queue.get().await, Some(key("web")));
    }

    #[tokio::test]
    async fn test_get_blocks_until_add() {
        let queue = test_queue();
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };
        // Give the waiter a chance to park before the add
        tokio::task::yield_now().await;
        queue.add(key("late"));

        let got = waiter.await;
        assert!(matches!(got, Ok(Some(k)) if k == key("late")));
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_get() {
        let queue = test_queue();
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.shut_down();

        let got = waiter.await;
        assert!(matches!(got, Ok(None)));
        // Adds after shutdown are ignored
        queue.add(key("web"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_rate_limited_readd_and_forget() {
        let queue = test_queue();
        assert!(Arc::clone(&queue).add_rate_limited(key("web")));
        assert_eq!(queue.retries(&key("web")), 1);

        // Zero-delay backoff: the key comes back
        assert_eq!(queue.get().await, Some(key("web")));
        queue.done(&key("web"));

        queue.forget(&key("web"));
        assert_eq!(queue.retries(&key("web")), 0);
    }

    #[tokio::test]
    async fn test_retry_horizon_exhaustion() {
        let queue = test_queue();
        // max_retries = 3: three requeues succeed, the fourth is refused
        assert!(Arc::clone(&queue).add_rate_limited(key("web")));
        assert!(Arc::clone(&queue).add_rate_limited(key("web")));
        assert!(Arc::clone(&queue).add_rate_limited(key("web")));
        assert!(!Arc::clone(&queue).add_rate_limited(key("web")));

        // Retry state is cleared so a fresh notification starts over
        assert_eq!(queue.retries(&key("web")), 0);
    }
}
