/*
 * Copyright (C) 2024 The vmctl Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Deduplicating, rate-limited queue of work keys.
//!
//! A key lives in at most one of two places: the pending FIFO or the
//! processing set. Adding a key that is being processed marks it dirty, and
//! [`RetryQueue::mark_done`] puts it back exactly once. Failed keys come back
//! after an exponential per-key delay computed by [`RetryPolicy`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::vmctl::logger::log_debug;

const QUEUE_COMPONENT: &str = "queue";

/// Exponential per-key backoff: `base * 2^failures`, capped at `max`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5),
            max: Duration::from_secs(1000),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, failures: u32) -> Duration {
        let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<String>,
    queued: HashSet<String>,
    processing: HashSet<String>,
    dirty: HashSet<String>,
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

struct QueueInner {
    state: Mutex<QueueState>,
    ready: Notify,
    policy: RetryPolicy,
    timers: CancellationToken,
}

#[derive(Clone)]
pub struct RetryQueue {
    inner: Arc<QueueInner>,
}

impl Default for RetryQueue {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl RetryQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                ready: Notify::new(),
                policy,
                timers: CancellationToken::new(),
            }),
        }
    }

    /// Adds `key` unless it is already pending. Ignored after shutdown.
    pub fn enqueue(&self, key: &str) {
        let mut state = self.state();
        if state.shutting_down {
            return;
        }
        if state.processing.contains(key) {
            state.dirty.insert(key.to_string());
            return;
        }
        if !state.queued.insert(key.to_string()) {
            return;
        }
        state.pending.push_back(key.to_string());
        drop(state);
        self.inner.ready.notify_one();
    }

    /// Waits for the next key. Returns `None` once the queue is shut down,
    /// even if keys were still pending.
    pub async fn dequeue(&self) -> Option<String> {
        loop {
            let notified = self.inner.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.pending.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.pending.is_empty();
                    drop(state);
                    if more {
                        // Pass the wakeup on so idle workers see the rest.
                        self.inner.ready.notify_one();
                    }
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Ends processing of `key`. A key re-added while in flight is queued
    /// again here.
    pub fn mark_done(&self, key: &str) {
        let mut state = self.state();
        state.processing.remove(key);
        if !state.dirty.remove(key) || state.shutting_down {
            return;
        }
        if state.queued.insert(key.to_string()) {
            state.pending.push_back(key.to_string());
            drop(state);
            self.inner.ready.notify_one();
        }
    }

    /// Makes `key` eligible again after its backoff delay. Never blocks; the
    /// delay runs on a timer task that shutdown cancels.
    pub fn schedule_retry(&self, key: &str) {
        let delay = {
            let mut state = self.state();
            if state.shutting_down {
                return;
            }
            let failures = state.failures.entry(key.to_string()).or_insert(0);
            let delay = self.inner.policy.delay_for(*failures);
            *failures = failures.saturating_add(1);
            delay
        };

        let delay_ms = delay.as_millis().to_string();
        log_debug(
            QUEUE_COMPONENT,
            "Scheduling retry",
            &[("key", key), ("delay_ms", delay_ms.as_str())],
        );

        let queue = self.clone();
        let key = key.to_string();
        let cancelled = self.inner.timers.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = sleep(delay) => queue.enqueue(&key),
            }
        });
    }

    /// Forgets the failure history of `key`.
    pub fn clear_backoff(&self, key: &str) {
        self.state().failures.remove(key);
    }

    pub fn retries(&self, key: &str) -> u32 {
        self.state().failures.get(key).copied().unwrap_or(0)
    }

    /// Number of keys waiting to be dequeued.
    pub fn len(&self) -> usize {
        self.state().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops accepting keys, discards pending ones, cancels retry timers and
    /// wakes every waiter. Keys already handed out still need `mark_done`.
    pub fn shutdown(&self) {
        let discarded = {
            let mut state = self.state();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            state.queued.clear();
            state.dirty.clear();
            let discarded = state.pending.len();
            state.pending.clear();
            discarded
        };
        self.inner.timers.cancel();
        self.inner.ready.notify_waiters();
        let discarded = discarded.to_string();
        log_debug(
            QUEUE_COMPONENT,
            "Queue shut down",
            &[("discarded", discarded.as_str())],
        );
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        // The state is plain bookkeeping; a panic while holding the lock
        // cannot leave it half-written in a way later calls would misread.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
