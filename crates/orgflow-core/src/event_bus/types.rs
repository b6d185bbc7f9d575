use crate::session::ConnectionState;
use serde::Serialize;

/// Connection transitions emitted by a broker session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionEvent {
    /// Connection (re)established
    Connected {
        /// Endpoint the session is attached to
        endpoint: String,
    },
    /// Connection lost; the session keeps reconnecting
    Disconnected {
        /// Why, when known
        reason: Option<String>,
    },
    /// Session closed and will not reconnect
    Closed,
}

impl ConnectionEvent {
    /// The connection state this event moves the session into.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        match self {
            Self::Connected { .. } => ConnectionState::Connected,
            Self::Disconnected { .. } => ConnectionState::Disconnected,
            Self::Closed => ConnectionState::Closed,
        }
    }
}
