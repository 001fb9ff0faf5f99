//! Rate-limited, deduplicating work queue of object keys.
//!
//! A key is held at most once while waiting, and is never handed to two
//! workers at the same time: a key re-added while it is being processed is
//! parked until [`WorkQueue::done`] and then queued again.  Intermediate
//! adds coalesce.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::trace;

/// Per-key exponential backoff: `base * 2^(failures - 1)`, capped at `max`.
#[derive(Debug)]
pub struct ItemBackoff {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl ItemBackoff {
    /// Delays start at `base` and double up to `max`.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn failures(&self) -> MutexGuard<'_, HashMap<String, u32>> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record one more failure of `key` and return how long to wait.
    pub fn when(&self, key: &str) -> Duration {
        let mut failures = self.failures();
        let count = failures.entry(key.to_owned()).or_insert(0);
        let shift = (*count).min(31);
        *count = count.saturating_add(1);
        let factor = 1u32 << shift;
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Reset the failure count of `key`.
    pub fn forget(&self, key: &str) {
        self.failures().remove(key);
    }

    /// Failures recorded for `key` since its last success.
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.failures().get(key).copied().unwrap_or(0)
    }
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    /// Keys waiting to be processed.
    dirty: HashSet<String>,
    /// Keys currently held by a worker.
    processing: HashSet<String>,
    shutting_down: bool,
}

/// Queue of object keys shared by a controller's workers.
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    backoff: ItemBackoff,
}

impl WorkQueue {
    /// Failed keys are retried after `retry_start`, doubling up to `retry_max`.
    pub fn new(retry_start: Duration, retry_max: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            backoff: ItemBackoff::new(retry_start, retry_max),
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `key` unless it is already waiting.
    pub fn add(&self, key: &str) {
        let mut state = self.lock();
        if state.shutting_down || !state.dirty.insert(key.to_owned()) {
            return;
        }
        if state.processing.contains(key) {
            trace!(%key, "key busy, parked until done");
            return;
        }
        state.queue.push_back(key.to_owned());
        drop(state);
        self.notify.notify_one();
    }

    /// Queue `key` once `delay` has elapsed.
    pub fn add_after(self: &Arc<Self>, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        let key = key.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Queue `key` after its per-key backoff delay.
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let delay = self.backoff.when(key);
        trace!(%key, ?delay, "requeue with backoff");
        self.add_after(key, delay);
    }

    /// Reset the backoff of `key` after a successful reconcile.
    pub fn forget(&self, key: &str) {
        self.backoff.forget(key);
    }

    /// Failures recorded for `key` since its last success.
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.backoff.num_requeues(key)
    }

    /// Wait for the next key.  Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark `key` as no longer being processed, re-queueing it if it was
    /// added in the meantime.
    pub fn done(&self, key: &str) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.to_owned());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Number of keys waiting (not counting those being processed).
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Whether no key is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out keys and wake every waiting worker.
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    /// Whether [`WorkQueue::shut_down`] was called.
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}
