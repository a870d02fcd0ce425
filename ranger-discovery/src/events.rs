//! Discovery events
//!
//! A closed set of notifications published by the connection manager and
//! the registration service. Subscribers receive them over a tokio
//! broadcast channel.

use tokio::sync::broadcast;

/// Events published by discovery components
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// The store session completed its handshake
    Connected,
    /// The store session ended (dropped, expired, or closed by the user)
    Disconnected,
    /// External health state changed; the advertisement should be refreshed
    HealthCheckChanged,
}

impl DiscoveryEvent {
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::HealthCheckChanged => "health_check_changed",
        }
    }
}

/// Publish/subscribe hub for [`DiscoveryEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DiscoveryEvent>,
}

impl EventBus {
    pub const DEFAULT_CAPACITY: usize = 64;

    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.tx.subscribe()
    }

    /// Publish an event, returning how many subscribers received it
    pub fn publish(&self, event: DiscoveryEvent) -> usize {
        match self.tx.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                tracing::trace!(event_type = event.event_type(), "No subscribers for event");
                0
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        assert_eq!(bus.publish(DiscoveryEvent::Connected), 2);
        assert_eq!(a.recv().await.unwrap(), DiscoveryEvent::Connected);
        assert_eq!(b.recv().await.unwrap(), DiscoveryEvent::Connected);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(DiscoveryEvent::Disconnected), 0);
    }
}
