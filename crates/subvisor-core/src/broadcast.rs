// ABOUTME: Fan-out of status and metric events to every connected subscriber
// ABOUTME: Thin wrapper over tokio broadcast; a lagging subscriber loses its oldest events

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use crate::event::Event;

/// Default per-subscriber queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Delivers each published event to all open subscriptions.
///
/// - **Non-blocking**: `publish` never waits on a subscriber.
/// - **Per-subscriber FIFO**: each subscription sees events in publish order.
/// - **Overflow**: a subscriber more than `capacity` events behind skips its oldest
///   ones; other subscribers are unaffected.
/// - **Pruning**: dropping a subscription removes it immediately.
#[derive(Debug)]
pub struct Broadcaster {
    tx: broadcast::Sender<Arc<Event>>,
    next_id: AtomicU64,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl Broadcaster {
    /// Minimum capacity is 1. Tokio may round the capacity up.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            next_id: AtomicU64::new(1),
        }
    }

    /// Open a new subscription. It receives events published after this call.
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(subscriber = id, "Subscriber connected");
        Subscription {
            id,
            rx: Some(self.tx.subscribe()),
            dropped: 0,
        }
    }

    /// Send `event` to every open subscription. Returns how many received it.
    pub fn publish(&self, event: Event) -> usize {
        // Errors only when nobody is subscribed.
        self.tx.send(Arc::new(event)).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Receiving end of one subscriber. Dropping it disconnects.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: Option<broadcast::Receiver<Arc<Event>>>,
    dropped: u64,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next event. Returns `None` once closed, or once the broadcaster
    /// is gone and everything queued has been received.
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        loop {
            let rx = self.rx.as_mut()?;
            match rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => self.note_lag(skipped),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next queued event without waiting.
    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        loop {
            let rx = self.rx.as_mut()?;
            match rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => self.note_lag(skipped),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Events this subscriber lost to overflow, as observed so far by `recv`/`try_recv`.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Disconnect now. Later receives return `None`.
    pub fn close(&mut self) {
        if self.rx.take().is_some() {
            tracing::debug!(subscriber = self.id, "Subscriber disconnected");
        }
    }

    fn note_lag(&mut self, skipped: u64) {
        self.dropped += skipped;
        tracing::debug!(subscriber = self.id, skipped, "Subscriber lagged, oldest events dropped");
    }
}
