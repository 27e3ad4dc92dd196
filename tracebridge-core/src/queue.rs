//! Bounded Event Queue
//!
//! A capacity-limited FIFO buffer between the event source and the
//! processing pipeline. `offer` suspends the producer when the queue is at
//! capacity (backpressure, never dropping), `take` suspends when empty.

use tokio::sync::{mpsc, Mutex};
use tracebridge_event::SessionEvent;

/// Default queue capacity.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Error offering an event to the queue.
#[derive(Debug, thiserror::Error)]
pub enum OfferError {
    #[error("Event queue is closed")]
    Closed,
}

/// Bounded FIFO event queue with backpressure.
///
/// Strict FIFO, no priorities. Capacity is fixed at construction.
///
/// Closing works by dropping the producer side, never by touching the
/// receiver: a consumer parked in [`take`](Self::take) holds the receiver
/// lock across its suspension, so `close` must not need it.
pub struct EventQueue {
    sender: Mutex<Option<mpsc::Sender<SessionEvent>>>,
    receiver: Mutex<mpsc::Receiver<SessionEvent>>,
    capacity: usize,
}

impl EventQueue {
    /// Create a queue with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(receiver),
            capacity,
        }
    }

    /// Offer an event, suspending while the queue is at capacity.
    ///
    /// The sender lock is released before the send suspends, so a
    /// backpressured producer never blocks `close`. An offer already in
    /// flight when the queue closes still delivers its event.
    pub async fn offer(&self, event: SessionEvent) -> Result<(), OfferError> {
        let sender = match self.sender.lock().await.as_ref() {
            Some(sender) => sender.clone(),
            None => return Err(OfferError::Closed),
        };
        sender.send(event).await.map_err(|_| OfferError::Closed)
    }

    /// Take the next event, suspending while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and fully drained.
    pub async fn take(&self) -> Option<SessionEvent> {
        self.receiver.lock().await.recv().await
    }

    /// Stop accepting new events. Already-buffered events remain takeable;
    /// a consumer suspended in [`take`](Self::take) observes the close
    /// once the buffer runs dry.
    pub async fn close(&self) {
        self.sender.lock().await.take();
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of events currently buffered.
    pub async fn depth(&self) -> usize {
        match self.sender.lock().await.as_ref() {
            Some(sender) => self.capacity - sender.capacity(),
            None => 0,
        }
    }
}
