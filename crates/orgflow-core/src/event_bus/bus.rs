use super::types::ConnectionEvent;
use tokio::sync::broadcast;
use tracing::debug;

/// Broadcast-based bus for connection transitions.
///
/// Uses `tokio::broadcast` so multiple observers can receive the same events.
/// Slow observers will miss events (lagged) rather than blocking the session.
#[derive(Debug, Clone)]
pub struct ConnectionEvents {
    sender: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionEvents {
    /// Create a new bus with the given channel capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to all future events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all active subscribers.
    ///
    /// Returns the number of subscribers that received the event.
    pub fn publish(&self, event: ConnectionEvent) -> usize {
        debug!(event = ?event, "Connection event");
        // send() returns Err if there are no receivers, which is fine
        self.sender.send(event).unwrap_or(0)
    }

    /// Get the current number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ConnectionEvents {
    fn default() -> Self {
        Self::new(64)
    }
}
