//! Server event bus
//!
//! Sessions publish lifecycle milestones here; the facade and any external
//! observer subscribe. Delivery is best effort: publishing with no
//! subscribers is not an error, and slow subscribers may lag.

use tokio::sync::broadcast;

use bg_protocol::SessionId;

const DEFAULT_CAPACITY: usize = 256;

/// Lifecycle notifications emitted by sessions and the facade
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// A connection from an unknown address is about to be dropped
    SessionClosingImmediately { session: SessionId, address: String },
    /// The unknown connection has been dropped
    SessionClosedImmediately { session: SessionId, address: String },
    ClientStarting { session: SessionId, address: String },
    ClientRegistered {
        session: SessionId,
        address: String,
        client_id: String,
    },
    ClientExiting { session: SessionId, address: String },
    ClientException {
        session: SessionId,
        address: String,
        error: String,
    },
    ClientUnregistered { session: SessionId, address: String },
    ClientExited { session: SessionId, address: String },
    /// An agent gave up recovering the node at `address`
    SelfHealingGiveUp { address: String, sender: String },
    /// The coordinator finished applying a new topology
    TopologyReady { coordinator: String },
}

/// Broadcast channel carrying [`ServerEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ServerEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event to all current subscribers
    pub fn publish(&self, event: ServerEvent) {
        tracing::trace!("Event: {:?}", event);
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    /// Subscribe to events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        bus.publish(ServerEvent::TopologyReady {
            coordinator: "noop".into(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_events_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(ServerEvent::ClientStarting {
            session: SessionId::new(1),
            address: "10.0.0.1".into(),
        });
        bus.publish(ServerEvent::ClientExited {
            session: SessionId::new(1),
            address: "10.0.0.1".into(),
        });

        assert!(matches!(rx.recv().await.unwrap(), ServerEvent::ClientStarting { .. }));
        assert!(matches!(rx.recv().await.unwrap(), ServerEvent::ClientExited { .. }));
    }
}
