// ========================================================================================
//
//                          THE BOUNDED HAND-OFF QUEUE
//
// ========================================================================================
//
// ### Purpose ###
//
// A fixed-capacity FIFO that moves records from the single reader thread to the
// worker pool. It provides natural backpressure (the reader blocks while the queue is
// full) and an explicit end-of-stream signal (`close`) that lets workers drain what is
// left and then stop.
//
// The queue is a thin layer over a bounded `crossbeam_channel`. The queue owns the
// one long-lived `Sender`; closing drops it, so once every in-flight push has
// finished the channel disconnects and receivers observe end-of-stream after the
// remaining items are drained. A second, never-written channel acts as the close
// signal so that pushers blocked on a full queue can be woken.

use crossbeam_channel::{Receiver, Select, Sender, TrySendError, bounded};
use std::fmt;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("A bounded queue needs a capacity of at least one item.")]
    ZeroCapacity,
}

/// Returned by [`BoundedQueue::push`] when the queue was closed before the item could
/// be accepted. The rejected item is handed back to the caller.
pub struct QueueClosed<T>(pub T);

impl<T> QueueClosed<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for QueueClosed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("QueueClosed(..)")
    }
}

impl<T> fmt::Display for QueueClosed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("push on a closed queue")
    }
}

/// The result of a [`BoundedQueue::pop`].
#[derive(Debug, PartialEq, Eq)]
pub enum Popped<T> {
    Item(T),
    EndOfStream,
}

/// A thread-safe FIFO of fixed capacity with blocking push/pop and an explicit close.
pub struct BoundedQueue<T> {
    tx: Mutex<Option<Sender<T>>>,
    rx: Receiver<T>,
    close_tx: Mutex<Option<Sender<()>>>,
    close_rx: Receiver<()>,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Result<Self, QueueError> {
        if capacity == 0 {
            return Err(QueueError::ZeroCapacity);
        }
        let (tx, rx) = bounded(capacity);
        let (close_tx, close_rx) = bounded(0);
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            rx,
            close_tx: Mutex::new(Some(close_tx)),
            close_rx,
            capacity,
        })
    }

    /// Appends `item`, blocking while the queue is full.
    ///
    /// Fails with the item handed back if the queue is closed before or while
    /// waiting for space.
    pub fn push(&self, item: T) -> Result<(), QueueClosed<T>> {
        // Cloning the sender keeps the channel connected for the duration of this
        // push, so an item accepted concurrently with `close` is still drained.
        let tx = match self.tx.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            Some(tx) => tx.clone(),
            None => return Err(QueueClosed(item)),
        };

        let item = match tx.try_send(item) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Full(item)) => item,
            Err(TrySendError::Disconnected(item)) => return Err(QueueClosed(item)),
        };

        let mut sel = Select::new();
        let send_index = sel.send(&tx);
        sel.recv(&self.close_rx);
        let oper = sel.select();
        if oper.index() == send_index {
            oper.send(&tx, item).map_err(|e| QueueClosed(e.into_inner()))
        } else {
            // The close channel never carries a message; becoming ready means closed.
            let _ = oper.recv(&self.close_rx);
            Err(QueueClosed(item))
        }
    }

    /// Removes the oldest item, blocking while the queue is empty and still open.
    ///
    /// Once the queue is closed and drained this returns [`Popped::EndOfStream`]
    /// immediately on every call.
    pub fn pop(&self) -> Popped<T> {
        match self.rx.recv() {
            Ok(item) => Popped::Item(item),
            Err(_) => Popped::EndOfStream,
        }
    }

    /// Marks the queue closed and wakes every blocked pusher and popper.
    /// Calling it more than once has no further effect.
    pub fn close(&self) {
        let sender = self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        let signal = self
            .close_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if sender.is_some() {
            log::debug!("bounded queue closed with {} item(s) pending", self.rx.len());
        }
        drop(sender);
        drop(signal);
    }

    pub fn is_closed(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// A blocking iterator that pops until end-of-stream.
    pub fn drain(&self) -> Drain<'_, T> {
        Drain { queue: self }
    }
}

pub struct Drain<'a, T> {
    queue: &'a BoundedQueue<T>,
}

impl<T> Iterator for Drain<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        match self.queue.pop() {
            Popped::Item(item) => Some(item),
            Popped::EndOfStream => None,
        }
    }
}
