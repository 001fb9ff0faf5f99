//! Time-windowed backoff set.
//!
//! A key added to the [`SlowSet`] should not be retried until its entry
//! expires.  Reads never mutate: expired entries are evicted only by the
//! sweep task started with [`SlowSet::run`].

use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Keys backing off after an infeasible attempt, each with an expiry.
pub struct SlowSet {
    retention: Duration,
    sweep_interval: Duration,
    /// Expiry deadline per key.
    entries: DashMap<String, Instant>,
}

impl SlowSet {
    /// Entries live for `retention`; [`SlowSet::run`] sweeps every `sweep_interval`.
    pub fn new(retention: Duration, sweep_interval: Duration) -> Self {
        Self {
            retention,
            sweep_interval,
            entries: DashMap::new(),
        }
    }

    /// Start (or keep) suppressing retries of `key`.  An entry that is still
    /// live keeps its original expiry.
    pub fn add(&self, key: &str) {
        let now = Instant::now();
        let expiry = now + self.retention;
        self.entries
            .entry(key.to_owned())
            .and_modify(|deadline| {
                if *deadline <= now {
                    *deadline = expiry;
                }
            })
            .or_insert(expiry);
    }

    /// Whether `key` is inside its backoff window.
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .is_some_and(|deadline| *deadline > Instant::now())
    }

    /// Time left in the backoff window; zero when absent or expired.
    pub fn time_remaining(&self, key: &str) -> Duration {
        self.entries
            .get(key)
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            .unwrap_or_default()
    }

    /// Drop `key` immediately, expired or not.
    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Number of entries, expired ones included until swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entry is held.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evict every expired entry.
    pub fn sweep(&self) {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, deadline| *deadline > now);
        let evicted = before.saturating_sub(self.entries.len());
        if evicted > 0 {
            debug!(evicted, "slow set entries expired");
        }
    }

    /// Sweep on a fixed interval until `shutdown` flips to `true` or its
    /// sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("slow set sweeper stopped");
    }
}
