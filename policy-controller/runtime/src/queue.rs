//! A deduplicating, rate-limited work queue.
//!
//! A key is held at most once while it waits. A key that is added while it
//! is being processed is queued again once processing is marked done, so a
//! single key is never handed to two workers at the same time.

use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    hash::Hash,
    sync::Arc,
};
use thiserror::Error;
use tokio::{sync::Notify, time};

pub struct Queue<K> {
    inner: Arc<Inner<K>>,
}

/// Exponential per-key delay used when a key is requeued after a failure.
#[derive(Copy, Clone, Debug)]
pub struct Backoff {
    pub base: time::Duration,
    pub max: time::Duration,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum AddError {
    #[error("work queue is full")]
    Full,

    #[error("work queue is shut down")]
    ShutDown,
}

struct Inner<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    backoff: Backoff,
}

struct State<K> {
    capacity: usize,
    pending: VecDeque<K>,
    // Keys that must be processed: waiting in `pending`, or re-added while
    // processing.
    dirty: HashSet<K>,
    processing: HashSet<K>,
    requeues: HashMap<K, u32>,
    shutdown: bool,
}

// === impl Queue ===

impl<K> Clone for Queue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> Queue<K>
where
    K: Clone + Eq + Hash + std::fmt::Debug + Send + 'static,
{
    pub fn new(capacity: usize) -> Self {
        Self::with_backoff(capacity, Backoff::default())
    }

    pub fn with_backoff(capacity: usize, backoff: Backoff) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    capacity,
                    pending: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    requeues: HashMap::new(),
                    shutdown: false,
                }),
                notify: Notify::new(),
                backoff,
            }),
        }
    }

    /// Adds a key unless it is already waiting.
    pub fn add(&self, key: K) -> Result<(), AddError> {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            return Err(AddError::ShutDown);
        }
        if state.dirty.contains(&key) {
            return Ok(());
        }
        if state.dirty.len() >= state.capacity {
            return Err(AddError::Full);
        }

        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            // Requeued by `done`.
            return Ok(());
        }
        state.pending.push_back(key);
        drop(state);

        self.inner.notify.notify_one();
        Ok(())
    }

    /// Adds the key after its backoff delay, which grows with every requeue
    /// until the key is forgotten.
    pub fn add_rate_limited(&self, key: K) {
        let delay = {
            let mut state = self.inner.state.lock();
            let requeues = state.requeues.entry(key.clone()).or_default();
            let delay = self.inner.backoff.delay(*requeues);
            *requeues += 1;
            delay
        };

        let queue = self.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            if let Err(error) = queue.add(key.clone()) {
                tracing::warn!(?key, %error, "Failed to requeue");
            }
        });
    }

    /// The number of times the key has been requeued since it was last
    /// forgotten.
    pub fn requeues(&self, key: &K) -> u32 {
        self.inner
            .state
            .lock()
            .requeues
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Clears the key's requeue history.
    pub fn forget(&self, key: &K) {
        self.inner.state.lock().requeues.remove(key);
    }

    /// Waits for the next key. Returns `None` once the queue is shut down and
    /// drained.
    pub async fn next(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.inner.state.lock();
                if let Some(key) = state.pending.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutdown {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Marks a key returned by [`Queue::next`] as processed.
    pub fn done(&self, key: &K) {
        let mut state = self.inner.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.pending.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Stops accepting keys. Keys already waiting are still handed out.
    pub fn shutdown(&self) {
        self.inner.state.lock().shutdown = true;
        self.inner.notify.notify_waiters();
    }

    /// The number of keys waiting to be processed.
    pub fn len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// === impl Backoff ===

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: time::Duration::from_millis(5),
            max: time::Duration::from_secs(60),
        }
    }
}

impl Backoff {
    pub fn delay(&self, requeues: u32) -> time::Duration {
        let factor = 2u32.saturating_pow(requeues);
        self.base.saturating_mul(factor).min(self.max)
    }
}
