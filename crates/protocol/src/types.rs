//! Core types shared across the protocol

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Identifier of a wire event.
///
/// The server assigns numeric ids to the events it streams, but delegated
/// actions may carry string ids. The original JSON type is preserved so an id
/// echoed back as `cause` matches what the server sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventId {
    Number(i64),
    Text(String),
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventId::Number(n) => write!(f, "{n}"),
            EventId::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for EventId {
    fn from(value: i64) -> Self {
        EventId::Number(value)
    }
}

impl From<&str> for EventId {
    fn from(value: &str) -> Self {
        EventId::Text(value.to_string())
    }
}

/// Who authored an action event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Agent,
    User,
    Environment,
    #[serde(other)]
    Other,
}

/// Action types the agent may delegate to the local host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Run,
    Read,
    Write,
    Mkdir,
    Rmdir,
    Rm,
    RunIpython,
    Browse,
}

impl ActionKind {
    pub const ALL: [ActionKind; 8] = [
        ActionKind::Run,
        ActionKind::Read,
        ActionKind::Write,
        ActionKind::Mkdir,
        ActionKind::Rmdir,
        ActionKind::Rm,
        ActionKind::RunIpython,
        ActionKind::Browse,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Run => "run",
            ActionKind::Read => "read",
            ActionKind::Write => "write",
            ActionKind::Mkdir => "mkdir",
            ActionKind::Rmdir => "rmdir",
            ActionKind::Rm => "rm",
            ActionKind::RunIpython => "run_ipython",
            ActionKind::Browse => "browse",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when an action name is outside the delegation allow-list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownActionKind(pub String);

impl fmt::Display for UnknownActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown action kind: {}", self.0)
    }
}

impl std::error::Error for UnknownActionKind {}

impl FromStr for ActionKind {
    type Err = UnknownActionKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownActionKind(s.to_string()))
    }
}

/// Coarse category of a wire event, as decided by [`crate::WireEvent::classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Action,
    Observation,
    Status,
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_kind_round_trips_through_names() {
        for kind in ActionKind::ALL {
            assert_eq!(kind.as_str().parse::<ActionKind>(), Ok(kind));
        }
        assert!("message".parse::<ActionKind>().is_err());
    }

    #[test]
    fn event_id_keeps_json_type() {
        let numeric: EventId = serde_json::from_str("42").unwrap();
        assert_eq!(numeric, EventId::Number(42));
        assert_eq!(serde_json::to_string(&numeric).unwrap(), "42");

        let text: EventId = serde_json::from_str("\"abc-1\"").unwrap();
        assert_eq!(text, EventId::Text("abc-1".to_string()));
        assert_eq!(serde_json::to_string(&text).unwrap(), "\"abc-1\"");
    }

    #[test]
    fn unknown_sources_do_not_fail_parsing() {
        let source: EventSource = serde_json::from_str("\"system\"").unwrap();
        assert_eq!(source, EventSource::Other);
    }
}
