//! Stream Buffer
//!
//! Bounded FIFO between a producer and a consumer with a configurable
//! backpressure strategy.

use crate::domain::value_objects::BackpressureStrategy;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;

/// Result of offering an item to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Stored with room to spare
    Accepted,
    /// Stored after evicting the oldest item (DropOldest)
    Evicted,
    /// Not stored; the buffer is full (DropNewest, or Block via `try_put`)
    Rejected,
    /// Not stored; the buffer is closed
    Closed,
}

impl PutOutcome {
    pub fn is_stored(self) -> bool {
        matches!(self, PutOutcome::Accepted | PutOutcome::Evicted)
    }

    /// The buffer was full when the item arrived.
    pub fn hit_backpressure(self) -> bool {
        matches!(self, PutOutcome::Evicted | PutOutcome::Rejected)
    }
}

struct BufferInner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded queue with backpressure.
///
/// All state sits behind one mutex that is never held across an await;
/// suspended producers and consumers park on `Notify`s.
pub struct StreamBuffer<T> {
    max_size: usize,
    strategy: BackpressureStrategy,
    inner: Mutex<BufferInner<T>>,
    not_empty: Notify,
    not_full: Notify,
    /// Items rejected or evicted because the buffer was full
    dropped: AtomicU64,
    /// Items evicted from the head under DropOldest
    evicted: AtomicU64,
}

impl<T> StreamBuffer<T> {
    /// Create a buffer holding at most `max_size` items.
    ///
    /// A `max_size` of zero is treated as one.
    pub fn new(max_size: usize, strategy: BackpressureStrategy) -> Self {
        Self {
            max_size: max_size.max(1),
            strategy,
            inner: Mutex::new(BufferInner {
                items: VecDeque::new(),
                closed: false,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            dropped: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    pub fn strategy(&self) -> BackpressureStrategy {
        self.strategy
    }

    /// Offer an item without suspending.
    ///
    /// Under `Block` a full buffer reports `Rejected`.
    pub fn try_offer(&self, item: T) -> PutOutcome {
        let mut inner = self.inner.lock();
        if inner.closed {
            return PutOutcome::Closed;
        }

        if self.strategy == BackpressureStrategy::Unbounded || inner.items.len() < self.max_size {
            inner.items.push_back(item);
            drop(inner);
            self.not_empty.notify_one();
            return PutOutcome::Accepted;
        }

        match self.strategy {
            BackpressureStrategy::DropOldest => {
                inner.items.pop_front();
                inner.items.push_back(item);
                drop(inner);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                self.evicted.fetch_add(1, Ordering::Relaxed);
                self.not_empty.notify_one();
                PutOutcome::Evicted
            }
            _ => {
                drop(inner);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                PutOutcome::Rejected
            }
        }
    }

    /// Offer an item, suspending under `Block` until there is room.
    pub async fn offer(&self, item: T) -> PutOutcome {
        if self.strategy != BackpressureStrategy::Block {
            return self.try_offer(item);
        }

        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return PutOutcome::Closed;
                }
                if inner.items.len() < self.max_size {
                    inner.items.push_back(item);
                    drop(inner);
                    self.not_empty.notify_one();
                    return PutOutcome::Accepted;
                }
            }

            notified.await;
        }
    }

    /// Put an item. Returns false if it was not stored.
    pub async fn put(&self, item: T) -> bool {
        self.offer(item).await.is_stored()
    }

    /// Put without suspending. Returns false if it was not stored.
    pub fn try_put(&self, item: T) -> bool {
        self.try_offer(item).is_stored()
    }

    /// Take the oldest item, suspending while empty.
    ///
    /// Returns None once the buffer is closed and drained.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if let Some(item) = inner.items.pop_front() {
                    drop(inner);
                    self.not_full.notify_one();
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Take the oldest item if one is buffered.
    pub fn try_get(&self) -> Option<T> {
        let item = self.inner.lock().items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Take everything currently buffered.
    pub fn drain(&self) -> Vec<T> {
        let items: Vec<T> = self.inner.lock().items.drain(..).collect();
        if !items.is_empty() {
            self.not_full.notify_waiters();
        }
        items
    }

    /// Close the buffer and wake every waiter. Idempotent.
    ///
    /// Buffered items stay readable.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        drop(inner);
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn size(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Whether the next bounded put would hit backpressure.
    pub fn is_full(&self) -> bool {
        self.strategy != BackpressureStrategy::Unbounded && self.size() >= self.max_size
    }

    /// Items rejected or evicted so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}
