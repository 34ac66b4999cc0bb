//! Rate-limited, deduplicating work queue of `namespace/name` keys.
//!
//! Decouples watch event arrival from reconcile processing. A key that is
//! already queued, or currently being processed, is coalesced so at most one
//! worker ever reconciles a given key at a time; this is the only
//! serialization protecting each tunnel's state machine.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::trace;

/// Initial requeue delay after a failed reconcile.
const BASE_DELAY: Duration = Duration::from_millis(500);
/// Ceiling for the exponential backoff.
const MAX_DELAY: Duration = Duration::from_secs(300);

#[derive(Default)]
struct Inner {
    queue: VecDeque<String>,
    /// Keys waiting in `queue`, or re-added while being processed.
    dirty: HashSet<String>,
    /// Keys currently held by a worker.
    processing: HashSet<String>,
    /// Consecutive failure count per key, reset by `forget`.
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        WorkQueue {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
        }
    }

    /// Enqueue a key. No-op if the key is already queued; if the key is
    /// being processed it will be delivered again once the worker calls
    /// [`WorkQueue::done`].
    pub fn add(&self, key: &str) {
        let mut inner = self.inner.lock().expect("queue poisoned");
        if inner.shutting_down || inner.dirty.contains(key) {
            return;
        }
        inner.dirty.insert(key.to_string());
        if !inner.processing.contains(key) {
            inner.queue.push_back(key.to_string());
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Enqueue a key after a fixed delay. Used for "still provisioning"
    /// polling, where re-delivery is wanted but no failure occurred.
    pub fn add_after(self: &Arc<Self>, key: &str, delay: Duration) {
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Re-enqueue after an exponentially increasing delay. Called on
    /// transient reconcile failure; there is no retry ceiling, only a delay
    /// cap.
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let delay = {
            let mut inner = self.inner.lock().expect("queue poisoned");
            if inner.shutting_down {
                return;
            }
            let attempts = inner.failures.entry(key.to_string()).or_insert(0);
            let delay = backoff_delay(*attempts);
            *attempts = attempts.saturating_add(1);
            delay
        };
        trace!(key, ?delay, "requeueing with backoff");
        self.add_after(key, delay);
    }

    /// Reset the backoff counter for a key. Call after a successful or
    /// permanently failed reconcile.
    pub fn forget(&self, key: &str) {
        let mut inner = self.inner.lock().expect("queue poisoned");
        inner.failures.remove(key);
    }

    /// Blocking pop. Returns `None` once the queue has been shut down and
    /// nothing is left to hand out.
    pub async fn get(&self) -> Option<String> {
        loop {
            {
                let mut inner = self.inner.lock().expect("queue poisoned");
                if let Some(key) = inner.queue.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    return Some(key);
                }
                if inner.shutting_down {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Mark a key as finished processing. If it was re-added in the
    /// meantime it goes back onto the queue.
    pub fn done(&self, key: &str) {
        let mut inner = self.inner.lock().expect("queue poisoned");
        inner.processing.remove(key);
        if inner.dirty.contains(key) && !inner.shutting_down {
            inner.queue.push_back(key.to_string());
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Stop accepting new keys and wake all waiting workers. Already-queued
    /// items are dropped, not drained.
    pub fn shut_down(&self) {
        let mut inner = self.inner.lock().expect("queue poisoned");
        inner.shutting_down = true;
        inner.queue.clear();
        inner.dirty.clear();
        drop(inner);
        self.notify.notify_waiters();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().expect("queue poisoned").queue.len()
    }
}

fn backoff_delay(attempts: u32) -> Duration {
    let exp = attempts.min(16);
    let delay = BASE_DELAY.saturating_mul(1u32 << exp);
    delay.min(MAX_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_adds_coalesce_to_one_delivery() {
        let queue = WorkQueue::new();
        queue.add("default/web");
        queue.add("default/web");
        queue.add("default/web");

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.as_deref(), Some("default/web"));
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn done_then_add_delivers_again() {
        let queue = WorkQueue::new();
        queue.add("default/web");
        let key = queue.get().await.unwrap();

        queue.done(&key);
        queue.add("default/web");
        assert_eq!(queue.get().await.as_deref(), Some("default/web"));
    }

    #[tokio::test]
    async fn add_while_processing_redelivers_after_done() {
        let queue = WorkQueue::new();
        queue.add("default/web");
        let key = queue.get().await.unwrap();

        // Re-added while in flight: must not be handed to a second worker.
        queue.add("default/web");
        assert_eq!(queue.len(), 0);

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.as_deref(), Some("default/web"));
    }

    #[tokio::test]
    async fn keys_are_delivered_fifo() {
        let queue = WorkQueue::new();
        queue.add("default/a");
        queue.add("default/b");

        assert_eq!(queue.get().await.as_deref(), Some("default/a"));
        assert_eq!(queue.get().await.as_deref(), Some("default/b"));
    }

    #[tokio::test]
    async fn shutdown_wakes_waiting_getters() {
        let queue = Arc::new(WorkQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };

        tokio::task::yield_now().await;
        queue.shut_down();

        assert_eq!(waiter.await.unwrap(), None);
        queue.add("default/web");
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_adds_back_off_exponentially() {
        let queue = Arc::new(WorkQueue::new());

        queue.add_rate_limited("default/web");
        tokio::time::sleep(BASE_DELAY).await;
        tokio::task::yield_now().await;
        assert_eq!(queue.get().await.as_deref(), Some("default/web"));
        queue.done("default/web");

        // Second failure doubles the delay.
        queue.add_rate_limited("default/web");
        tokio::time::sleep(BASE_DELAY).await;
        tokio::task::yield_now().await;
        assert_eq!(queue.len(), 0);
        tokio::time::sleep(BASE_DELAY).await;
        tokio::task::yield_now().await;
        assert_eq!(queue.len(), 1);

        // forget resets the counter.
        queue.forget("default/web");
        assert_eq!(queue.inner.lock().unwrap().failures.len(), 0);
    }

    #[test]
    fn backoff_delay_is_capped() {
        assert_eq!(backoff_delay(0), BASE_DELAY);
        assert_eq!(backoff_delay(1), BASE_DELAY * 2);
        assert_eq!(backoff_delay(32), MAX_DELAY);
    }
}
