//! Bounded packet queues.
//!
//! Every device, protocol, and layer communicates through pairs of these
//! queues and nothing else. A queue is a bounded crossbeam channel split
//! into a [`QueueTx`] producer endpoint and a [`QueueRx`] consumer endpoint:
//! producers block while the queue is full (backpressure), consumers block
//! while it is empty, and FIFO order is preserved end-to-end.
//!
//! Closing is terminal. Dropping the consumer fails all later pushes with
//! [`Closed`]; dropping the last producer lets the consumer drain whatever
//! is left and then report [`Closed`] as the end-of-stream signal.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError, bounded};
use std::time::Duration;
use thiserror::Error;

/// The peer endpoint is gone. For consumers this is the clean end-of-stream
/// signal after shutdown, not an error worth logging loudly.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("queue closed")]
pub struct Closed;

/// Error for the non-blocking push variant. Carries the rejected item back
/// so the caller can drop it deliberately (and count the drop).
#[derive(Debug)]
pub enum TryPushError<T> {
    /// The queue is at capacity.
    Full(T),
    /// The consumer endpoint is gone.
    Closed(T),
}

/// Create a bounded queue, returning its two endpoints.
pub fn pair<T>(capacity: usize) -> (QueueTx<T>, QueueRx<T>) {
    let (tx, rx) = bounded(capacity);
    (QueueTx { tx }, QueueRx { rx })
}

/// Producer endpoint. Cloneable so several workers can feed one consumer;
/// the queue closes for the consumer once every clone is dropped.
pub struct QueueTx<T> {
    tx: Sender<T>,
}

impl<T> Clone for QueueTx<T> {
    fn clone(&self) -> Self {
        QueueTx {
            tx: self.tx.clone(),
        }
    }
}

impl<T> QueueTx<T> {
    /// Enqueue an item, blocking only while the queue is full.
    pub fn push(&self, item: T) -> Result<(), Closed> {
        self.tx.send(item).map_err(|_| Closed)
    }

    /// Enqueue without blocking; a full queue is reported instead of waited
    /// out.
    pub fn try_push(&self, item: T) -> Result<(), TryPushError<T>> {
        self.tx.try_send(item).map_err(|e| match e {
            TrySendError::Full(item) => TryPushError::Full(item),
            TrySendError::Disconnected(item) => TryPushError::Closed(item),
        })
    }
}

/// Consumer endpoint. Exactly one consumer role per queue.
pub struct QueueRx<T> {
    rx: Receiver<T>,
}

impl<T> QueueRx<T> {
    /// Dequeue the next item, blocking until one is available. After the
    /// producers are gone, remaining items are still delivered in order;
    /// only then does this report [`Closed`].
    pub fn pop(&self) -> Result<T, Closed> {
        self.rx.recv().map_err(|_| Closed)
    }

    /// Dequeue without blocking. `Ok(None)` means the queue is currently
    /// empty but still open.
    pub fn try_pop(&self) -> Result<Option<T>, Closed> {
        match self.rx.try_recv() {
            Ok(item) => Ok(Some(item)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Closed),
        }
    }

    /// Dequeue, giving up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Result<Option<T>, Closed> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Ok(Some(item)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Closed),
        }
    }

    pub(crate) fn raw(&self) -> &Receiver<T> {
        &self.rx
    }
}
