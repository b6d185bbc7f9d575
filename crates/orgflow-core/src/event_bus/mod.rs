//! EventBus - broadcast-based connection state notifications.
//!
//! Broker sessions publish connection transitions here so the bootstrap state
//! machine (and anything else interested) can react to broker loss.

/// Core event bus implementation (broadcast channel).
pub mod bus;
/// Connection event definitions.
pub mod types;

pub use bus::ConnectionEvents;
pub use types::ConnectionEvent;
