use crate::error::lock_or_recover;
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Notifications raised by broadcast connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastEvent {
    /// The mount disappeared from the server; reconnection has started.
    ConnectionLost { mount: String },
    /// The mount is live again after an outage lasting `downtime`.
    ConnectionRestored { mount: String, downtime: Duration },
}

impl BroadcastEvent {
    pub fn mount(&self) -> &str {
        match self {
            BroadcastEvent::ConnectionLost { mount } => mount,
            BroadcastEvent::ConnectionRestored { mount, .. } => mount,
        }
    }
}

/// Multi-subscriber channel fan-out. Clones share the same subscriber list.
#[derive(Clone)]
pub struct EventBus<E> {
    subscribers: Arc<Mutex<Vec<Sender<E>>>>,
    relays: Arc<Mutex<Vec<EventBus<E>>>>,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            relays: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<E: Clone> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<E> {
        let (tx, rx) = unbounded::<E>();
        lock_or_recover(&self.subscribers).push(tx);
        rx
    }

    /// Re-emit everything broadcast here on `upstream` as well.
    pub fn relay_to(&self, upstream: &EventBus<E>) {
        lock_or_recover(&self.relays).push(upstream.clone());
    }

    pub fn subscriber_count(&self) -> usize {
        lock_or_recover(&self.subscribers).len()
    }

    pub fn broadcast(&self, event: E) {
        lock_or_recover(&self.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
        let relays = lock_or_recover(&self.relays).clone();
        for relay in relays {
            relay.broadcast(event.clone());
        }
    }
}
