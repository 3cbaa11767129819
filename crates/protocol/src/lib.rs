//! relaydock Protocol
//!
//! Shared types for the realtime channel between an agent server and the
//! local bridge, plus the REST shapes used to create and list conversations.
//! Everything here is serialized as JSON.

use uuid::Uuid;

pub mod client;
pub mod rest;
pub mod server;
pub mod types;

pub use client::{Observation, UserAction};
pub use server::{ActionMessage, DelegatedAction, ObservationMessage, StatusMessage, WireEvent};
pub use types::*;

/// Socket.IO event carrying agent events in both directions.
pub const EVENT_NAME: &str = "oh_event";

/// Socket.IO event carrying user messages to the server.
pub const USER_ACTION_EVENT_NAME: &str = "oh_user_action";

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Current time as an RFC 3339 UTC timestamp with millisecond precision.
pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
