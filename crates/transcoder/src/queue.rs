//! Counting work queue
//!
//! An unbounded FIFO shared by a pool of workers that also tracks how many items
//! were enqueued but not yet marked done by their consumer. An item that has been
//! dequeued but is still being processed keeps counting as outstanding, so
//! `outstanding() == 0` means no work of this queue's kind is left anywhere.

use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};

/// Error type for queue operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// `mark_done` was called more often than items were enqueued
    #[error("mark_done called with no outstanding items")]
    NothingOutstanding,

    /// The queue's channel was closed; only possible while tearing down
    #[error("queue is closed")]
    Closed,
}

/// Consistent snapshot of a queue's counters
///
/// Both fields are updated in a single step, so a snapshot never shows an
/// enqueue reflected in one counter but not the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueCounts {
    /// Items enqueued but not yet marked done
    pub outstanding: usize,
    /// Items ever enqueued; only grows
    pub enqueued_total: u64,
}

/// FIFO work queue with an outstanding-work counter
pub struct CountingQueue<T> {
    name: &'static str,
    tx: mpsc::UnboundedSender<T>,
    rx: Mutex<mpsc::UnboundedReceiver<T>>,
    counts: watch::Sender<QueueCounts>,
    closed: AtomicBool,
}

impl<T: Send> CountingQueue<T> {
    /// Create an empty queue; `name` only shows up in log events
    pub fn new(name: &'static str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (counts, _) = watch::channel(QueueCounts::default());
        Self {
            name,
            tx,
            rx: Mutex::new(rx),
            counts,
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Append an item and count it as outstanding. Never blocks.
    pub fn enqueue(&self, item: T) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }

        // Count before the item becomes visible so a fast consumer can never
        // mark it done ahead of the increment.
        self.counts.send_modify(|c| {
            c.outstanding += 1;
            c.enqueued_total += 1;
        });

        if self.tx.send(item).is_err() {
            self.counts.send_modify(|c| c.outstanding -= 1);
            return Err(QueueError::Closed);
        }

        Ok(())
    }

    /// Wait for the next item in insertion order.
    ///
    /// Cancel-safe: dropping the future before it resolves loses no item, so it
    /// can sit inside `tokio::select!` next to a cancellation branch.
    pub async fn dequeue(&self) -> Result<T, QueueError> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(QueueError::Closed)
    }

    /// Record that one dequeued item has been fully processed
    pub fn mark_done(&self) -> Result<(), QueueError> {
        let mut result = Ok(());
        self.counts.send_modify(|c| {
            if c.outstanding == 0 {
                result = Err(QueueError::NothingOutstanding);
            } else {
                c.outstanding -= 1;
            }
        });
        if result.is_err() {
            tracing::error!(queue = self.name, "mark_done without an outstanding item");
        }
        result
    }

    /// Snapshot of the outstanding counter
    pub fn outstanding(&self) -> usize {
        self.counts.borrow().outstanding
    }

    /// Snapshot of both counters taken atomically
    pub fn counts(&self) -> QueueCounts {
        *self.counts.borrow()
    }

    /// Wait until the outstanding counter reads zero
    pub async fn join(&self) {
        let mut rx = self.counts.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|c| c.outstanding == 0).await;
    }

    /// Refuse further enqueues. Items already queued can still be dequeued.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
