//! Client → Server payloads

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{EventId, EventSource};
use crate::{new_id, now_timestamp};

/// Identifies observations produced by the local executor.
pub const EXECUTOR_SOURCE: &str = "vscode_runtime_executor";

/// A chat message typed by the user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAction {
    pub action: String,
    pub args: UserMessageArgs,
    pub source: EventSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessageArgs {
    pub content: String,
    pub image_urls: Vec<String>,
}

impl UserAction {
    pub fn message(content: impl Into<String>, image_urls: Vec<String>) -> Self {
        Self {
            action: "message".to_string(),
            args: UserMessageArgs {
                content: content.into(),
                image_urls,
            },
            source: EventSource::User,
        }
    }
}

/// Result of a delegated action, sent back on the same channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub id: String,
    /// Mirrors the action type that produced it
    pub observation: String,
    pub content: String,
    pub extras: Map<String, Value>,
    /// Id of the action event this answers
    pub cause: EventId,
    pub message: String,
    pub source: String,
    pub timestamp: String,
}

impl Observation {
    /// Mint an observation with a fresh id and the current time.
    pub fn new(
        cause: EventId,
        observation: impl Into<String>,
        content: impl Into<String>,
        extras: Map<String, Value>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("obs_{}", new_id()),
            observation: observation.into(),
            content: content.into(),
            extras,
            cause,
            message: message.into(),
            source: EXECUTOR_SOURCE.to_string(),
            timestamp: now_timestamp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn user_message_wire_shape() {
        let action = UserAction::message("hello", vec!["data:image/png;base64,AA".into()]);
        assert_eq!(
            serde_json::to_value(&action).unwrap(),
            json!({
                "action": "message",
                "args": { "content": "hello", "image_urls": ["data:image/png;base64,AA"] },
                "source": "user"
            })
        );
    }

    #[test]
    fn observation_carries_cause_and_fresh_id() {
        let mut extras = Map::new();
        extras.insert("path".into(), json!("/tmp/a.txt"));
        let first = Observation::new(EventId::Number(7), "read", "abc", extras.clone(), "ok");
        let second = Observation::new(EventId::Number(7), "read", "abc", extras, "ok");

        assert_ne!(first.id, second.id);
        assert!(first.id.starts_with("obs_"));

        let value = serde_json::to_value(&first).unwrap();
        assert_eq!(value["cause"], json!(7));
        assert_eq!(value["observation"], json!("read"));
        assert_eq!(value["source"], json!(EXECUTOR_SOURCE));
        assert_eq!(value["extras"]["path"], json!("/tmp/a.txt"));
        assert!(chrono::DateTime::parse_from_rfc3339(value["timestamp"].as_str().unwrap()).is_ok());
    }
}
