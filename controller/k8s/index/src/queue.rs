//! A rate-limited, deduplicating work queue.
//!
//! Semantics the sync workers rely on:
//!
//! * `add` is idempotent while the key is pending.
//! * A key handed out by `get` is in-flight; `add`s arriving before `done`
//!   are coalesced into a single re-queue when `done` is called.
//! * `add_rate_limited` re-queues with per-key exponential backoff;
//!   `forget` resets the backoff.
//! * After `shut_down`, pending keys drain and `get` then returns `None`.

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use parking_lot::Mutex;
use std::{collections::VecDeque, hash::Hash, sync::Arc, time::Duration};
use tokio::sync::Notify;

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1000);

pub struct RateLimitingQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for RateLimitingQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<K> {
    state: Mutex<State<K>>,
    notify: Notify,
}

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    shut_down: bool,
}

// === impl RateLimitingQueue ===

impl<K> RateLimitingQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shut_down: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    pub fn add(&self, key: K) {
        let mut state = self.inner.state.lock();
        if state.shut_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            // Coalesced: re-queued when the in-flight round calls `done`.
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Re-queues `key` after its current backoff delay.
    pub fn add_rate_limited(&self, key: K) {
        let delay = {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                return;
            }
            let failures = state.failures.entry(key.clone()).or_insert(0);
            *failures += 1;
            backoff(*failures)
        };
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Blocks until a key is available; `None` once the queue is shut down
    /// and drained.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.inner.state.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    // Wake the next waiter if more work remains.
                    if !state.queue.is_empty() {
                        self.inner.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shut_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Releases the in-flight state; a coalesced `add` re-queues the key.
    pub fn done(&self, key: &K) {
        let mut state = self.inner.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shut_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    pub fn forget(&self, key: &K) {
        self.inner.state.lock().failures.remove(key);
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shut_down(&self) {
        self.inner.state.lock().shut_down = true;
        self.inner.notify.notify_waiters();
        self.inner.notify.notify_one();
    }
}

impl<K> Default for RateLimitingQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn backoff(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(63);
    BASE_DELAY
        .checked_mul(2u32.saturating_pow(exp))
        .map(|d| d.min(MAX_DELAY))
        .unwrap_or(MAX_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn add_deduplicates_pending_keys() {
        let q = RateLimitingQueue::new();
        q.add("a");
        q.add("a");
        q.add("b");
        assert_eq!(q.len(), 2);

        let k = q.get().await.unwrap();
        assert_eq!(k, "a");
        q.done(&k);
        assert_eq!(q.get().await.unwrap(), "b");
    }

    #[tokio::test]
    async fn add_while_in_flight_coalesces_to_one_round() {
        let q = RateLimitingQueue::new();
        q.add("a");
        let k = q.get().await.unwrap();

        // Both adds land while "a" is in flight.
        q.add("a");
        q.add("a");
        assert_eq!(q.len(), 0);

        q.done(&k);
        assert_eq!(q.len(), 1);
        let k = q.get().await.unwrap();
        assert_eq!(k, "a");
        q.done(&k);
        assert_eq!(q.len(), 0);
    }

    #[tokio::test]
    async fn rate_limited_requeues_after_backoff() {
        let q = RateLimitingQueue::new();
        q.add("a");
        let k = q.get().await.unwrap();
        q.add_rate_limited(k);
        q.done(&k);

        let k = timeout(Duration::from_secs(1), q.get()).await.unwrap().unwrap();
        assert_eq!(k, "a");
        q.forget(&k);
        q.done(&k);
    }

    #[tokio::test]
    async fn backoff_grows_and_forget_resets() {
        assert_eq!(backoff(1), Duration::from_millis(5));
        assert_eq!(backoff(2), Duration::from_millis(10));
        assert_eq!(backoff(4), Duration::from_millis(40));
        assert_eq!(backoff(60), MAX_DELAY);

        let q = RateLimitingQueue::new();
        q.add("a");
        let k = q.get().await.unwrap();
        q.add_rate_limited(k);
        q.forget(&k);
        assert!(q.inner.state.lock().failures.is_empty());
        q.done(&k);
    }

    #[tokio::test]
    async fn shutdown_drains_then_quits() {
        let q = RateLimitingQueue::new();
        q.add("a");
        q.shut_down();

        // Pending key still drains.
        let k = q.get().await.unwrap();
        assert_eq!(k, "a");
        q.done(&k);

        assert!(q.get().await.is_none());

        // Adds after shutdown are dropped.
        q.add("b");
        assert!(q.get().await.is_none());
    }

    #[tokio::test]
    async fn get_blocks_until_add() {
        let q = RateLimitingQueue::<&str>::new();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.add("a");
        let got = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(got, Some("a"));
    }
}
