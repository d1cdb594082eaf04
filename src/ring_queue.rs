//! Bounded MPMC admission queue sitting in front of the sequencer.
//!
//! Grounded on the teacher's `BatchQueue`: a mutex-guarded buffer with
//! blocking producers/consumers coordinated through `tokio::sync`
//! primitives rather than a bounded channel, because callers need to peek
//! at `size()` and `clear()` it during reconciliation — a plain
//! `mpsc::Sender` doesn't expose either. The privacy-specific shuffle is
//! dropped; ordering here is meaningful, not something to scramble.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, Notify};

#[derive(Debug, PartialEq, Eq)]
pub enum QueueError {
    Closed,
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ring queue closed")
    }
}

impl std::error::Error for QueueError {}

/// Generic bounded queue. FIFO per producer (a single producer's calls are
/// pushed in call order) and consumers are woken in arrival order —
/// `tokio::sync::Notify` wakes its longest-registered waiter first.
pub struct RingQueue<T> {
    data: Mutex<VecDeque<T>>,
    capacity: usize,
    not_empty: Notify,
    not_full: Notify,
    closed: AtomicBool,
    closed_notify: Notify,
}

impl<T> RingQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            not_empty: Notify::new(),
            not_full: Notify::new(),
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
        }
    }

    /// Blocks until there is room, then appends. Returns `Closed` once the
    /// queue has been shut down, whether or not room ever existed.
    pub async fn enqueue(&self, item: T) -> Result<(), QueueError> {
        let mut item = Some(item);
        loop {
            {
                let mut guard = self.data.lock().await;
                if self.closed.load(Ordering::Acquire) {
                    return Err(QueueError::Closed);
                }
                if guard.len() < self.capacity {
                    guard.push_back(item.take().expect("enqueue item consumed once"));
                    drop(guard);
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }
            tokio::select! {
                _ = self.not_full.notified() => {}
                _ = self.closed_notify.notified() => return Err(QueueError::Closed),
            }
        }
    }

    /// Enqueues every item contiguously: either the whole batch lands
    /// together or none of it does. Never interleaves with another
    /// producer's `enqueue`/`enqueue_batch` call.
    pub async fn enqueue_batch(&self, items: Vec<T>) -> Result<(), QueueError> {
        let mut items = VecDeque::from(items);
        loop {
            {
                let mut guard = self.data.lock().await;
                if self.closed.load(Ordering::Acquire) {
                    return Err(QueueError::Closed);
                }
                let available = self.capacity.saturating_sub(guard.len());
                if available >= items.len() {
                    let woke_any = !items.is_empty();
                    guard.extend(items.drain(..));
                    drop(guard);
                    if woke_any {
                        self.not_empty.notify_waiters();
                    }
                    return Ok(());
                }
            }
            tokio::select! {
                _ = self.not_full.notified() => {}
                _ = self.closed_notify.notified() => return Err(QueueError::Closed),
            }
        }
    }

    /// Blocks until an item is available. Returns `Closed` only once the
    /// queue is both closed and drained.
    pub async fn dequeue(&self) -> Result<T, QueueError> {
        loop {
            {
                let mut guard = self.data.lock().await;
                if let Some(item) = guard.pop_front() {
                    drop(guard);
                    self.not_full.notify_one();
                    return Ok(item);
                }
                if self.closed.load(Ordering::Acquire) {
                    return Err(QueueError::Closed);
                }
            }
            tokio::select! {
                _ = self.not_empty.notified() => {}
                _ = self.closed_notify.notified() => {}
            }
        }
    }

    /// Non-blocking: drains up to `max` currently available items. Returns
    /// an empty vec rather than blocking when none are ready.
    pub async fn dequeue_batch(&self, max: usize) -> Vec<T> {
        let mut guard = self.data.lock().await;
        let n = max.min(guard.len());
        let drained: Vec<T> = guard.drain(..n).collect();
        drop(guard);
        if n > 0 {
            self.not_full.notify_waiters();
        }
        drained
    }

    pub async fn size(&self) -> usize {
        self.data.lock().await.len()
    }

    pub async fn is_full(&self) -> bool {
        self.data.lock().await.len() >= self.capacity
    }

    pub async fn is_empty(&self) -> bool {
        self.data.lock().await.is_empty()
    }

    pub async fn clear(&self) {
        let mut guard = self.data.lock().await;
        let had_items = !guard.is_empty();
        guard.clear();
        drop(guard);
        if had_items {
            self.not_full.notify_waiters();
        }
    }

    /// Stops admitting new items. Blocked producers wake immediately with
    /// `Closed`; blocked consumers keep draining whatever remains, then
    /// get `Closed` once the queue is empty.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.closed_notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn enqueue_dequeue_preserves_fifo_order() {
        let q = RingQueue::new(8);
        q.enqueue(1).await.unwrap();
        q.enqueue(2).await.unwrap();
        q.enqueue(3).await.unwrap();
        assert_eq!(q.dequeue().await.unwrap(), 1);
        assert_eq!(q.dequeue().await.unwrap(), 2);
        assert_eq!(q.dequeue().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn enqueue_blocks_until_capacity_frees() {
        let q = Arc::new(RingQueue::new(1));
        q.enqueue(1).await.unwrap();

        let q2 = Arc::clone(&q);
        let handle = tokio::spawn(async move {
            q2.enqueue(2).await.unwrap();
        });

        tokio::task::yield_now().await;
        assert!(!handle.is_finished());

        assert_eq!(q.dequeue().await.unwrap(), 1);
        handle.await.unwrap();
        assert_eq!(q.dequeue().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn dequeue_batch_drains_up_to_max_without_blocking() {
        let q = RingQueue::new(8);
        for i in 0..5 {
            q.enqueue(i).await.unwrap();
        }
        let batch = q.dequeue_batch(3).await;
        assert_eq!(batch, vec![0, 1, 2]);
        let rest = q.dequeue_batch(10).await;
        assert_eq!(rest, vec![3, 4]);
        assert!(q.dequeue_batch(10).await.is_empty());
    }

    #[tokio::test]
    async fn close_rejects_new_enqueues_but_drains_existing() {
        let q = RingQueue::new(8);
        q.enqueue(1).await.unwrap();
        q.close();
        assert_eq!(q.enqueue(2).await, Err(QueueError::Closed));
        assert_eq!(q.dequeue().await.unwrap(), 1);
        assert_eq!(q.dequeue().await, Err(QueueError::Closed));
    }

    #[tokio::test]
    async fn close_wakes_blocked_producer() {
        let q = Arc::new(RingQueue::new(1));
        q.enqueue(1).await.unwrap();
        let q2 = Arc::clone(&q);
        let handle = tokio::spawn(async move { q2.enqueue(2).await });
        tokio::task::yield_now().await;
        q.close();
        let result = handle.await.unwrap();
        assert_eq!(result, Err(QueueError::Closed));
    }

    #[tokio::test]
    async fn enqueue_batch_is_atomic() {
        let q = RingQueue::new(3);
        q.enqueue(99).await.unwrap();
        // only 2 slots remain; a 3-item batch must not partially land
        let q = Arc::new(q);
        let q2 = Arc::clone(&q);
        let handle = tokio::spawn(async move { q2.enqueue_batch(vec![1, 2, 3]).await });
        tokio::task::yield_now().await;
        assert!(!handle.is_finished());
        q.dequeue().await.unwrap();
        assert_eq!(q.dequeue().await.unwrap(), 1);
        handle.await.unwrap().unwrap();
        assert_eq!(q.dequeue().await.unwrap(), 2);
        assert_eq!(q.dequeue().await.unwrap(), 3);
    }
}
