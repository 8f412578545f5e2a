//! Deduplicating, rate-limited reconcile queue
//!
//! Keys are queued at most once no matter how many events arrive for them,
//! and a key handed to a worker is not handed out again until that worker is
//! finished with it. Events arriving meanwhile mark the key dirty and it is
//! queued again once the worker lets go.
//!
//! Finishing is tied to the lifetime of [`QueueItem`]: dropping the item
//! releases the key, so a worker cannot forget to do it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

use crate::retry::BackoffConfig;

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

struct Inner<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    backoff: BackoffConfig,
}

/// Work queue of reconcile keys shared by the watch layer and the workers.
pub struct ReconcileQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for ReconcileQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> ReconcileQueue<K>
where
    K: Clone + Eq + Hash + Display + Send + Sync + 'static,
{
    /// Empty queue using `backoff` for [`add_rate_limited`](Self::add_rate_limited)
    pub fn new(backoff: BackoffConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                backoff,
            }),
        }
    }

    /// Queue `key` unless it is already waiting.
    ///
    /// A key that is currently being processed is remembered and queued
    /// again when its [`QueueItem`] is dropped.
    pub fn add(&self, key: K) {
        let mut state = self.inner.state.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            trace!(key = %key, "key in flight, deferring");
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Queue `key` after `delay`
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Queue `key` after a delay that doubles with every consecutive failure.
    ///
    /// Returns the delay used.
    pub fn add_rate_limited(&self, key: K) -> Duration {
        let failures = {
            let mut state = self.inner.state.lock();
            let failures = state.failures.entry(key.clone()).or_insert(0);
            *failures = failures.saturating_add(1);
            *failures
        };
        let delay = self.inner.backoff.delay_for(failures);
        self.add_after(key, delay);
        delay
    }

    /// Reset the failure count of `key`
    pub fn forget(&self, key: &K) {
        self.inner.state.lock().failures.remove(key);
    }

    /// Consecutive failures recorded for `key`
    pub fn failures(&self, key: &K) -> u32 {
        self.inner
            .state
            .lock()
            .failures
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Wait for the next key.
    ///
    /// Returns `None` once the queue is shut down, even if keys are still
    /// waiting: no new work starts after shutdown.
    pub async fn get(&self) -> Option<QueueItem<K>> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(QueueItem {
                        queue: self.clone(),
                        key: Some(key),
                    });
                }
            }

            notified.await;
        }
    }

    /// Stop handing out keys and wake every waiting worker
    pub fn shut_down(&self) {
        self.inner.state.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    /// Whether [`shut_down`](Self::shut_down) was called
    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    /// Keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// True when no key is waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn done(&self, key: K) {
        let mut state = self.inner.state.lock();
        state.processing.remove(&key);
        if state.dirty.contains(&key) && !state.shutting_down {
            state.queue.push_back(key);
            drop(state);
            self.inner.notify.notify_one();
        }
    }
}

/// A key checked out of the queue.
///
/// While it exists no other worker receives the same key. Dropping it marks
/// the key done.
pub struct QueueItem<K>
where
    K: Clone + Eq + Hash + Display + Send + Sync + 'static,
{
    queue: ReconcileQueue<K>,
    key: Option<K>,
}

impl<K> QueueItem<K>
where
    K: Clone + Eq + Hash + Display + Send + Sync + 'static,
{
    /// The checked-out key
    pub fn key(&self) -> &K {
        self.key
            .as_ref()
            .unwrap_or_else(|| unreachable!("key is only taken on drop"))
    }

    /// Requeue the key with backoff and release it. Returns the delay.
    pub fn retry(self) -> Duration {
        self.queue.add_rate_limited(self.key().clone())
    }

    /// Clear the key's failure history and release it.
    pub fn finish(self) {
        self.queue.forget(self.key());
    }
}

impl<K> Drop for QueueItem<K>
where
    K: Clone + Eq + Hash + Display + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.queue.done(key);
        }
    }
}
