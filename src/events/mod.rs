//! Per-session event stream
//!
//! Every session owns one `EventBus`. The transport, the control handler and
//! the session controller publish into it; the UI subscribes.

pub mod types;

pub use types::SessionEvent;

use tokio::sync::broadcast;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Broadcast bus for session events
///
/// ```no_run
/// use camlink::events::{EventBus, SessionEvent};
/// use camlink::negotiation::ConnectionState;
///
/// # async fn run() {
/// let bus = EventBus::new();
/// let mut rx = bus.subscribe();
///
/// bus.publish(SessionEvent::StateChanged {
///     state: ConnectionState::Negotiating,
///     reason: None,
/// });
///
/// while let Ok(event) = rx.recv().await {
///     println!("{:?}", event);
/// }
/// # }
/// ```
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event; dropped when nobody listens
    pub fn publish(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }

    /// Receive all future events
    ///
    /// A subscriber that falls more than the channel capacity behind gets
    /// `RecvError::Lagged` and misses events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(SessionEvent::ChannelOpen {
            label: "control".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, SessionEvent::ChannelOpen { .. }));
    }

    #[test]
    fn test_no_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(SessionEvent::ControlDiagnostic {
            capability: "zoom".to_string(),
            message: "unsupported".to_string(),
        });
    }
}
