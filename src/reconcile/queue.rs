//! Deduplicating work queue
//!
//! A key is queued at most once. A key added while a worker holds it is
//! marked dirty and re-queued when the worker finishes, so one key is never
//! reconciled concurrently. Every transition between queued, processing and
//! dirty happens under one lock.

use crate::store::ObjectKey;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct QueueState {
    queued: HashSet<ObjectKey>,
    processing: HashSet<ObjectKey>,
    dirty: HashSet<ObjectKey>,
}

pub struct WorkQueue {
    tx: mpsc::UnboundedSender<ObjectKey>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<ObjectKey>>,
    state: Mutex<QueueState>,
    retries: DashMap<ObjectKey, u32>,
    base_delay: Duration,
    max_delay: Duration,
    shutdown: CancellationToken,
}

impl WorkQueue {
    pub fn new(base_delay: Duration, max_delay: Duration, shutdown: CancellationToken) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tx,
            rx: AsyncMutex::new(rx),
            state: Mutex::new(QueueState::default()),
            retries: DashMap::new(),
            base_delay,
            max_delay,
            shutdown,
        })
    }

    /// Queue a key unless it is already waiting
    pub fn add(&self, key: ObjectKey) {
        let mut state = self.state.lock();
        self.enqueue_locked(&mut state, key);
    }

    fn enqueue_locked(&self, state: &mut QueueState, key: ObjectKey) {
        if state.processing.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            // Receiver lives as long as the queue
            let _ = self.tx.send(key);
        }
    }

    /// Queue a key after a delay
    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = queue.shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => queue.add(key),
            }
        });
    }

    /// Wait for the next key; `None` once the queue is closed
    pub async fn next(&self) -> Option<ObjectKey> {
        let key = self.rx.lock().await.recv().await?;
        let mut state = self.state.lock();
        state.queued.remove(&key);
        state.processing.insert(key.clone());
        Some(key)
    }

    /// Release a key taken with [`next`](Self::next)
    pub fn done(&self, key: &ObjectKey) {
        let mut state = self.state.lock();
        state.processing.remove(key);
        if state.dirty.remove(key) {
            self.enqueue_locked(&mut state, key.clone());
        }
    }

    /// Next exponential backoff delay for a failing key
    pub fn backoff(&self, key: &ObjectKey) -> Duration {
        let mut attempts = self.retries.entry(key.clone()).or_insert(0);
        let exp = (*attempts).min(16);
        *attempts += 1;
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_delay)
    }

    /// Reset the failure count of a key
    pub fn forget(&self, key: &ObjectKey) {
        self.retries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.state.lock().queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().queued.is_empty()
    }
}
