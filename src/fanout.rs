use crate::broadcast::{
    BroadcastConnection, BroadcastDestination, ConnectionOptions, ConnectionStatus, StatusProbe,
};
use crate::engine::AudioEngine;
use crate::events::{BroadcastEvent, EventBus};
use crate::logging::LogContext;
use crossbeam_channel::Receiver;
use std::sync::Arc;

/// The same stream pushed to several destinations at once.
pub struct BroadcastFanout {
    connections: Vec<BroadcastConnection>,
    events: EventBus<BroadcastEvent>,
    log: LogContext,
}

impl BroadcastFanout {
    pub fn new(connections: Vec<BroadcastConnection>, log: &LogContext) -> Self {
        let events = EventBus::new();
        for connection in &connections {
            connection.events().relay_to(&events);
        }
        BroadcastFanout {
            connections,
            events,
            log: log.for_component("fanout"),
        }
    }

    /// One connection per destination, all fed by `engine`.
    pub fn from_destinations(
        destinations: &[BroadcastDestination],
        engine: Arc<dyn AudioEngine>,
        probe: Arc<dyn StatusProbe>,
        options: &ConnectionOptions,
        log: &LogContext,
    ) -> Self {
        let connections = destinations
            .iter()
            .map(|dest| {
                BroadcastConnection::new(
                    dest.clone(),
                    engine.clone(),
                    probe.clone(),
                    options.clone(),
                    log,
                )
            })
            .collect();
        BroadcastFanout::new(connections, log)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn connections(&self) -> &[BroadcastConnection] {
        &self.connections
    }

    /// Events of every destination, unchanged.
    pub fn subscribe(&self) -> Receiver<BroadcastEvent> {
        self.events.subscribe()
    }

    pub fn initialize(&self) {
        self.log.info(format!(
            "Starting {} broadcast destination(s)",
            self.connections.len()
        ));
        for connection in &self.connections {
            connection.initialize();
        }
    }

    /// True only when every destination is connected; false with none.
    pub fn is_connected(&self) -> bool {
        !self.connections.is_empty() && self.connections.iter().all(|c| c.is_connected())
    }

    /// Number of destinations currently connected.
    pub fn connected_count(&self) -> usize {
        self.connections.iter().filter(|c| c.is_connected()).count()
    }

    /// Push metadata everywhere. True if at least one destination took it.
    pub fn set_metadata(&self, artist: &str, title: &str) -> bool {
        let mut accepted = 0;
        for connection in &self.connections {
            if connection.set_metadata(artist, title) {
                accepted += 1;
            }
        }
        if accepted < self.connections.len() {
            self.log.debug(format!(
                "Metadata accepted by {}/{} destinations",
                accepted,
                self.connections.len()
            ));
        }
        accepted > 0
    }

    pub fn statuses(&self) -> Vec<ConnectionStatus> {
        self.connections.iter().map(|c| c.status()).collect()
    }

    pub fn total_listeners(&self) -> u32 {
        self.connections.iter().map(|c| c.listeners()).sum()
    }

    pub fn dispose(&self) {
        for connection in &self.connections {
            connection.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_fanout_is_not_connected() {
        let fanout = BroadcastFanout::new(Vec::new(), &LogContext::default());
        assert!(fanout.is_empty());
        assert!(!fanout.is_connected());
        assert!(!fanout.set_metadata("A", "T"));
        assert!(fanout.statuses().is_empty());
        assert_eq!(fanout.total_listeners(), 0);
        fanout.dispose();
    }
}
