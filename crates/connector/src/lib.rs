//! relaydock Connector
//!
//! Client side of the agent server: the realtime session channel
//! (Socket.IO over WebSocket), the conversation REST API, and the health
//! probe. Inbound events are classified once here and handed to the owner as
//! [`SessionEvent`]s.

pub mod health;
pub mod rest;
pub mod session;
pub mod socketio;

#[cfg(any(test, feature = "test-util"))]
pub mod mock_server;

pub use health::{HealthProbe, HealthStatus};
pub use rest::{ApiError, ConversationApi};
pub use session::{ConnectionState, ObservationEmitter, SessionClient, SessionConfig};

use relaydock_protocol::{DelegatedAction, WireEvent};
use thiserror::Error;

/// Errors reported by the session channel
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Socket not connected")]
    NotConnected,

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Socket error: {0}")]
    Transport(String),

    #[error("Agent not responding. Please check the server or try again.")]
    ResponseTimeout,

    #[error("Session channel closed")]
    ChannelClosed,

    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),
}

/// Notifications a session delivers to its owner, in arrival order
#[derive(Debug)]
pub enum SessionEvent {
    /// Socket.IO namespace connected (initially or after a reconnect)
    Connected { conversation_id: String },

    /// The transport dropped or the server ended the session
    Disconnected {
        conversation_id: String,
        reason: String,
    },

    /// Transport failure or response timeout; the channel may still be open
    Error(SessionError),

    /// An event for display
    Display(WireEvent),

    /// An agent action that must be executed locally
    Delegated(DelegatedAction),
}
