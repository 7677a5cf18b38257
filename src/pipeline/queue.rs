//! Bounded job queue: a fixed-capacity MPMC FIFO with non-blocking enqueue.
//!
//! Backed by a bounded `tokio::sync::mpsc` channel. The receiver sits behind
//! a mutex so any number of workers can consume; a `watch` flag lets
//! `close()` wake every waiting consumer at once.

use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Result of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Accepted,
    /// Queue at capacity; the item was dropped.
    RejectedFull,
    /// Queue closed (pipeline stopped); the item was dropped.
    RejectedClosed,
}

impl Enqueued {
    pub fn is_accepted(self) -> bool {
        self == Self::Accepted
    }
}

/// Returned by `dequeue` once the queue has been closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("queue closed")]
pub struct QueueClosed;

/// Fixed-capacity FIFO shared between producers and a worker pool.
pub struct BoundedQueue<T> {
    name: &'static str,
    capacity: usize,
    tx: mpsc::Sender<T>,
    rx: Mutex<mpsc::Receiver<T>>,
    closed: watch::Sender<bool>,
}

impl<T: Send> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(name: &'static str, capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        let (tx, rx) = mpsc::channel(capacity);
        let (closed, _) = watch::channel(false);
        Self {
            name,
            capacity,
            tx,
            rx: Mutex::new(rx),
            closed,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items currently buffered.
    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Enqueue without waiting. Never grows past capacity.
    pub fn enqueue(&self, item: T) -> Enqueued {
        if self.is_closed() {
            return Enqueued::RejectedClosed;
        }
        match self.tx.try_send(item) {
            Ok(()) => Enqueued::Accepted,
            Err(mpsc::error::TrySendError::Full(_)) => Enqueued::RejectedFull,
            Err(mpsc::error::TrySendError::Closed(_)) => Enqueued::RejectedClosed,
        }
    }

    /// Wait for the next item, or `QueueClosed` once the queue is closed.
    ///
    /// Cancel-safe: dropping the future never loses an item.
    pub async fn dequeue(&self) -> Result<T, QueueClosed> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(QueueClosed);
        }

        let mut rx = tokio::select! {
            biased;
            _ = closed.wait_for(|c| *c) => return Err(QueueClosed),
            rx = self.rx.lock() => rx,
        };

        tokio::select! {
            biased;
            _ = closed.wait_for(|c| *c) => Err(QueueClosed),
            item = rx.recv() => item.ok_or(QueueClosed),
        }
    }

    /// `dequeue` that also gives up once `cancel` fires. `None` means the
    /// worker should exit.
    pub async fn next_until(&self, cancel: &CancellationToken) -> Option<T> {
        if cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            item = self.dequeue() => item.ok(),
        }
    }

    /// Stop accepting items and wake every waiting consumer.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    /// Accept items again after a `close()`.
    pub fn reopen(&self) {
        self.closed.send_replace(false);
    }

    /// Drop everything still buffered. Returns how many items were discarded.
    pub async fn discard_pending(&self) -> usize {
        let mut rx = self.rx.lock().await;
        let mut discarded = 0;
        while rx.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }
}
