//! Server → Client events
//!
//! Events arrive without a shared type tag. The variant is decided once, at
//! the boundary, by which of `action`, `observation` or `status_update` is
//! present; everything downstream matches on [`WireEvent`].

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::types::{ActionKind, EventId, EventKind, EventSource};

/// An action taken by the agent or the user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<EventSource>,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Map<String, Value>>,
    /// Friendly text for the chat log
    #[serde(default, deserialize_with = "null_as_default")]
    pub message: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub timestamp: String,
    /// Fields the bridge does not interpret (`llm_metrics`, `tool_call_metadata`, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The result of an action, linked to it through `cause`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<EventId>,
    pub observation: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub content: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub extras: Map<String, Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub message: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub timestamp: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Out-of-band status from the server (agent state, errors, title changes)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub status_update: bool,
    #[serde(rename = "type", default, deserialize_with = "null_as_default")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<EventId>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_title: Option<String>,
}

/// A classified inbound event
#[derive(Debug, Clone, PartialEq)]
pub enum WireEvent {
    Action(ActionMessage),
    Observation(ObservationMessage),
    Status(StatusMessage),
    /// Anything that is not exactly one well-formed variant; kept verbatim.
    Unknown(Value),
}

/// An agent action the local host has to execute.
///
/// Lives only from receipt until its observation is emitted.
#[derive(Debug, Clone, PartialEq)]
pub struct DelegatedAction {
    pub id: EventId,
    pub action: String,
    pub args: Map<String, Value>,
}

impl DelegatedAction {
    pub fn new(id: impl Into<EventId>, kind: ActionKind, args: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            action: kind.as_str().to_string(),
            args,
        }
    }

    /// The allow-listed kind, or `None` if the name is outside the allow-list.
    pub fn kind(&self) -> Option<ActionKind> {
        self.action.parse().ok()
    }

    /// String argument by name
    pub fn arg_str(&self, name: &str) -> Option<&str> {
        self.args.get(name).and_then(Value::as_str)
    }
}

impl WireEvent {
    /// Classify a raw JSON payload. Total: never fails, never panics.
    pub fn classify(value: &Value) -> WireEvent {
        let Some(obj) = value.as_object() else {
            return WireEvent::Unknown(value.clone());
        };

        let has_action = obj.contains_key("action");
        let has_observation = obj.contains_key("observation");
        let has_status = obj.contains_key("status_update");

        let classified = match (has_action, has_observation, has_status) {
            (true, false, false) => ActionMessage::deserialize(value)
                .ok()
                .map(WireEvent::Action),
            (false, true, false) => ObservationMessage::deserialize(value)
                .ok()
                .map(WireEvent::Observation),
            (false, false, true) => StatusMessage::deserialize(value)
                .ok()
                .filter(|status| status.status_update)
                .map(WireEvent::Status),
            _ => None,
        };

        classified.unwrap_or_else(|| WireEvent::Unknown(value.clone()))
    }

    pub fn kind(&self) -> EventKind {
        match self {
            WireEvent::Action(_) => EventKind::Action,
            WireEvent::Observation(_) => EventKind::Observation,
            WireEvent::Status(_) => EventKind::Status,
            WireEvent::Unknown(_) => EventKind::Unknown,
        }
    }

    /// Extract the delegated action, if this event is one.
    ///
    /// Requires an agent-sourced action in the allow-list, with an id and an
    /// object `args`. User-authored actions are never delegated.
    pub fn delegated_action(&self) -> Option<DelegatedAction> {
        let WireEvent::Action(action) = self else {
            return None;
        };
        if action.source != Some(EventSource::Agent) {
            return None;
        }
        let kind: ActionKind = action.action.parse().ok()?;
        Some(DelegatedAction {
            id: action.id.clone()?,
            action: kind.as_str().to_string(),
            args: action.args.clone()?,
        })
    }

    pub fn is_delegatable(&self) -> bool {
        self.delegated_action().is_some()
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn agent_action(action: &str) -> Value {
        json!({
            "id": 42,
            "source": "agent",
            "action": action,
            "args": { "command": "ls -l" },
            "message": "Running ls",
            "timestamp": "2025-01-01T00:00:00Z"
        })
    }

    #[test]
    fn classifies_each_variant() {
        assert_eq!(
            WireEvent::classify(&agent_action("run")).kind(),
            EventKind::Action
        );

        let observation = json!({
            "id": 43,
            "cause": 42,
            "observation": "run",
            "content": "total 0",
            "extras": { "metadata": {}, "error_id": "" },
            "message": "Command finished",
            "timestamp": "2025-01-01T00:00:01Z"
        });
        assert_eq!(
            WireEvent::classify(&observation).kind(),
            EventKind::Observation
        );

        let status = json!({
            "status_update": true,
            "type": "info",
            "message": "Agent is thinking",
            "conversation_title": "Fix tests"
        });
        match WireEvent::classify(&status) {
            WireEvent::Status(s) => {
                assert_eq!(s.kind, "info");
                assert_eq!(s.conversation_title.as_deref(), Some("Fix tests"));
            }
            other => panic!("expected status, got {other:?}"),
        }
    }

    #[test]
    fn classification_is_total_over_junk() {
        let inputs = [
            json!(null),
            json!(17),
            json!("oh_event"),
            json!([1, 2, 3]),
            json!({}),
            json!({ "action": 5 }),
            json!({ "observation": null }),
            json!({ "status_update": false, "message": "x" }),
            json!({ "status_update": "yes" }),
            json!({ "action": "run", "observation": "run" }),
            json!({ "action": "run", "status_update": true }),
            json!({ "action": "run", "id": 1.5 }),
            json!({ "action": "run", "args": [1] }),
        ];
        for input in inputs {
            assert_eq!(
                WireEvent::classify(&input).kind(),
                EventKind::Unknown,
                "input: {input}"
            );
        }
    }

    #[test]
    fn null_text_fields_default_to_empty() {
        let event = json!({ "action": "message", "source": "user", "message": null, "timestamp": null });
        match WireEvent::classify(&event) {
            WireEvent::Action(a) => {
                assert_eq!(a.message, "");
                assert_eq!(a.timestamp, "");
            }
            other => panic!("expected action, got {other:?}"),
        }
    }

    #[test]
    fn unknown_fields_survive_on_actions() {
        let mut event = agent_action("run");
        event["llm_metrics"] = json!({ "accumulated_cost": 0.5 });
        let WireEvent::Action(action) = WireEvent::classify(&event) else {
            panic!("expected action");
        };
        assert_eq!(action.extra["llm_metrics"]["accumulated_cost"], json!(0.5));
    }

    #[test]
    fn agent_actions_in_allow_list_are_delegated() {
        for kind in ActionKind::ALL {
            let event = WireEvent::classify(&agent_action(kind.as_str()));
            let delegated = event.delegated_action().expect("delegated");
            assert_eq!(delegated.id, EventId::Number(42));
            assert_eq!(delegated.kind(), Some(kind));
            assert_eq!(delegated.arg_str("command"), Some("ls -l"));
        }
    }

    #[test]
    fn user_actions_are_never_delegated() {
        let mut event = agent_action("run");
        event["source"] = json!("user");
        assert!(!WireEvent::classify(&event).is_delegatable());

        let mut message = agent_action("message");
        message["source"] = json!("user");
        assert!(!WireEvent::classify(&message).is_delegatable());
    }

    #[test]
    fn delegation_requires_id_args_and_allow_list() {
        assert!(!WireEvent::classify(&agent_action("message")).is_delegatable());
        assert!(!WireEvent::classify(&agent_action("finish")).is_delegatable());

        let mut no_id = agent_action("run");
        no_id.as_object_mut().unwrap().remove("id");
        assert!(!WireEvent::classify(&no_id).is_delegatable());

        let mut null_args = agent_action("run");
        null_args["args"] = Value::Null;
        assert!(!WireEvent::classify(&null_args).is_delegatable());

        let mut no_source = agent_action("run");
        no_source.as_object_mut().unwrap().remove("source");
        assert!(!WireEvent::classify(&no_source).is_delegatable());
    }

    #[test]
    fn string_ids_are_delegated_verbatim() {
        let mut event = agent_action("read");
        event["id"] = json!("5f0c-uuid");
        let delegated = WireEvent::classify(&event).delegated_action().unwrap();
        assert_eq!(delegated.id, EventId::Text("5f0c-uuid".to_string()));
    }

    #[test]
    fn observations_and_statuses_are_never_delegated() {
        let status = json!({ "status_update": true, "type": "error", "message": "boom" });
        assert!(!WireEvent::classify(&status).is_delegatable());
        let observation = json!({ "observation": "run", "cause": 1, "content": "" });
        assert!(!WireEvent::classify(&observation).is_delegatable());
    }
}
