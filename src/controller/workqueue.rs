//! Keyed work queue
//!
//! Guarantees at most one worker per key: a key handed out by
//! [`WorkQueue::get`] is not handed out again until [`WorkQueue::done`] is
//! called for it. Keys added while in flight are remembered and requeued on
//! `done`. Adding a key that is already waiting is a no-op.
//!
//! Failed keys are requeued with exponential backoff (1s doubling, capped at
//! five minutes) until [`WorkQueue::forget`] resets them.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Backoff applied by [`WorkQueue::add_rate_limited`]
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RateLimit {
    /// Delay before retry number `attempt` (zero based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<String>,
    /// Keys waiting to be processed, whether queued or parked behind an
    /// in-flight run of the same key
    dirty: BTreeSet<String>,
    processing: BTreeSet<String>,
    shutting_down: bool,
}

/// Deduplicating queue of reconcile keys
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    failures: DashMap<String, u32>,
    rate_limit: RateLimit,
}

impl WorkQueue {
    pub fn new() -> Arc<Self> {
        Self::with_rate_limit(RateLimit::default())
    }

    pub fn with_rate_limit(rate_limit: RateLimit) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            failures: DashMap::new(),
            rate_limit,
        })
    }

    /// Enqueue `key` unless it is already waiting
    pub fn add(&self, key: &str) {
        {
            let mut state = self.state.lock();
            if state.shutting_down || !state.dirty.insert(key.to_string()) {
                return;
            }
            if state.processing.contains(key) {
                return;
            }
            state.queue.push_back(key.to_string());
        }
        self.notify.notify_one();
    }

    /// Enqueue `key` once `delay` has passed
    pub fn add_after(self: &Arc<Self>, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Enqueue `key` after its backoff delay and count the failure
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) -> Duration {
        let attempt = {
            let mut failures = self.failures.entry(key.to_string()).or_insert(0);
            let attempt = *failures;
            *failures += 1;
            attempt
        };
        let delay = self.rate_limit.delay(attempt);
        self.add_after(key, delay);
        delay
    }

    /// Clear the failure count of `key`
    pub fn forget(&self, key: &str) {
        self.failures.remove(key);
    }

    /// Consecutive failures recorded for `key`
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.failures.get(key).map(|f| *f).unwrap_or(0)
    }

    /// Wait for the next key. Returns `None` once the queue shuts down.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
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

    /// Mark `key` finished; requeue it when it was added while in flight
    pub fn done(&self, key: &str) {
        let requeued = {
            let mut state = self.state.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) && !state.shutting_down {
                state.queue.push_back(key.to_string());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Stop handing out keys and wake every waiting worker
    pub fn shutdown(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
