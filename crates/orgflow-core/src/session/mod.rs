//! Broker Session
//!
//! A session owns one live connection to the message bus and exposes publish,
//! durable subscription, and request/reply. Two implementations exist:
//! [`NatsSession`] for NATS JetStream and [`MemoryBroker`] for tests and
//! development runs without a broker.

/// In-process broker with JetStream-like semantics.
pub mod memory;
/// NATS JetStream session.
pub mod nats;

pub use memory::MemoryBroker;
pub use nats::{JetStreamSettings, NatsConnector, NatsSession};

use crate::error::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Result of a publish attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The broker stored the message
    Accepted,
    /// The idempotency key was already seen inside the dedup window
    Duplicate,
}

/// Connection state as observed by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connected and usable
    Connected,
    /// Lost; the session is reconnecting
    Disconnected,
    /// Closed for good
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Broker-side acknowledgement handle for one delivery.
#[async_trait]
pub trait AckHandle: Send + Sync {
    /// Terminal acknowledgement: the broker will not redeliver.
    async fn ack(&self) -> Result<()>;

    /// Negative acknowledgement: redeliver after `delay`.
    async fn nak(&self, delay: Duration) -> Result<()>;

    /// Still working on it: restart the ack-wait clock without settling.
    async fn in_progress(&self) -> Result<()>;
}

/// One message fetched from a durable subscription.
pub struct Delivery {
    /// Subject the message was published on
    pub subject: String,
    /// Raw payload
    pub payload: Vec<u8>,
    /// How many times the broker has delivered this message, this one included
    pub delivered: u32,
    /// Stream sequence; stable across redeliveries of the same message
    pub sequence: u64,
    handle: Arc<dyn AckHandle>,
}

impl Delivery {
    /// Build a delivery around a broker ack handle.
    pub fn new(
        subject: impl Into<String>,
        payload: Vec<u8>,
        delivered: u32,
        sequence: u64,
        handle: Arc<dyn AckHandle>,
    ) -> Self {
        Self {
            subject: subject.into(),
            payload,
            delivered,
            sequence,
            handle,
        }
    }

    /// A handle for in-progress signals that outlives the delivery.
    #[must_use]
    pub fn progress_handle(&self) -> Arc<dyn AckHandle> {
        Arc::clone(&self.handle)
    }

    /// Acknowledge the message.
    pub async fn ack(self) -> Result<()> {
        self.handle.ack().await
    }

    /// Ask for redelivery after `delay`.
    pub async fn nak(self, delay: Duration) -> Result<()> {
        self.handle.nak(delay).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.len())
            .field("delivered", &self.delivered)
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// A named durable consumer bound to a subject pattern.
#[async_trait]
pub trait DurableSubscription: Send + Sync {
    /// Fetch up to `max` messages, waiting at most `wait` for the first one.
    async fn fetch(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>>;
}

/// A live broker connection.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a payload. With `idempotency_key`, a repeat inside the broker's
    /// dedup window returns [`PublishOutcome::Duplicate`].
    async fn publish(
        &self,
        subject: &str,
        payload: Vec<u8>,
        idempotency_key: Option<&str>,
    ) -> Result<PublishOutcome>;

    /// Bind (creating if needed) a durable consumer on `subject_pattern`.
    async fn subscribe_durable(
        &self,
        subject_pattern: &str,
        durable_name: &str,
    ) -> Result<Box<dyn DurableSubscription>>;

    /// Send a request and wait for one reply.
    async fn request(&self, subject: &str, payload: Vec<u8>, timeout: Duration)
        -> Result<Vec<u8>>;

    /// Payload of the newest message stored on exactly `subject`.
    async fn last_message(&self, subject: &str) -> Result<Option<Vec<u8>>>;

    /// Current connection state.
    fn connection_state(&self) -> ConnectionState;

    /// Drain and close the connection.
    async fn close(&self) -> Result<()>;
}

/// Something that can open a broker session.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Connect, returning a shared session.
    async fn connect(&self) -> Result<Arc<dyn Broker>>;
}

#[cfg(test)]
mod tests;
