use crate::{DequeueBatch, Error, QueueIndex, QueueItem, RequestQueue, Result};
use async_trait::async_trait;
use std::{
    collections::{BTreeSet, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::{sync::Notify, time::Instant};

/// Batch buffers kept for reuse; extra released buffers are dropped.
const MAX_POOLED_BUFFERS: usize = 64;

/// FIFO request queue shared by any number of consumers.
///
/// Every `dequeue_many` call checks a buffer out of an internal pool; `release_requests` clears
/// it and puts it back. [`MemoryQueue::stats`] exposes both counters so callers can assert that
/// nothing leaks.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    acquired: AtomicU64,
    released: AtomicU64,
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<QueueItem>,
    consumers: BTreeSet<String>,
    buffers: Vec<Vec<QueueItem>>,
    stopped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub batches_acquired: u64,
    pub batches_released: u64,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop the queue. Queued items are still handed out; once drained, dequeues fail with
    /// [`Error::stopped`].
    pub fn stop(&self) {
        let pending = {
            let mut state = self.lock();
            state.stopped = true;
            state.items.len()
        };
        tracing::debug!(event = "bloom_core.lite.queue.stopped", pending, "queue stopped");
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn consumers(&self) -> Vec<String> {
        self.lock().consumers.iter().cloned().collect()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            batches_acquired: self.acquired.load(Ordering::SeqCst),
            batches_released: self.released.load(Ordering::SeqCst),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn checkout(&self, state: &mut QueueState) -> Vec<QueueItem> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        state.buffers.pop().unwrap_or_default()
    }
}

#[async_trait]
impl RequestQueue for MemoryQueue {
    async fn enqueue(&self, tenant: &str, item: QueueItem) -> Result<()> {
        {
            let mut state = self.lock();
            if state.stopped {
                return Err(Error::stopped().context(format!("enqueue for tenant={tenant}")));
            }
            state.items.push_back(item);
        }
        self.notify.notify_one();
        Ok(())
    }

    fn register_consumer_connection(&self, consumer: &str) {
        self.lock().consumers.insert(consumer.to_string());
    }

    fn unregister_consumer_connection(&self, consumer: &str) {
        self.lock().consumers.remove(consumer);
    }

    async fn dequeue_many(
        &self,
        last: QueueIndex,
        consumer: &str,
        max_items: usize,
        max_wait: Duration,
    ) -> DequeueBatch {
        let deadline = Instant::now() + max_wait;

        loop {
            {
                let mut state = self.lock();
                if !state.consumers.contains(consumer) {
                    let items = self.checkout(&mut state);
                    return DequeueBatch {
                        items,
                        next_index: last,
                        error: Some(Error::msg(format!(
                            "consumer {consumer} is not registered"
                        ))),
                    };
                }

                if !state.items.is_empty() {
                    let mut items = self.checkout(&mut state);
                    let take = max_items.max(1).min(state.items.len());
                    items.extend(state.items.drain(..take));
                    let more = !state.items.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return DequeueBatch {
                        items,
                        next_index: QueueIndex(last.0.saturating_add(1)),
                        error: None,
                    };
                }

                if state.stopped {
                    let items = self.checkout(&mut state);
                    return DequeueBatch {
                        items,
                        next_index: last,
                        error: Some(Error::stopped()),
                    };
                }
            }

            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                let mut state = self.lock();
                let items = self.checkout(&mut state);
                return DequeueBatch {
                    items,
                    next_index: last,
                    error: None,
                };
            }
        }
    }

    fn release_requests(&self, mut items: Vec<QueueItem>) {
        self.released.fetch_add(1, Ordering::SeqCst);
        items.clear();
        let mut state = self.lock();
        if state.buffers.len() < MAX_POOLED_BUFFERS {
            state.buffers.push(items);
        }
    }
}
