//! REST request/response shapes

use serde::{Deserialize, Serialize};

/// `msg_id` the server returns when no LLM settings are stored.
pub const SETTINGS_NOT_FOUND_MSG_ID: &str = "CONFIGURATION$SETTINGS_NOT_FOUND";

const SNIPPET_MAX_CHARS: usize = 100;

/// `POST /api/conversations` body
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateConversationRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_user_msg: Option<String>,
}

/// `POST /api/conversations` success body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateConversationResponse {
    #[serde(default)]
    pub conversation_id: Option<String>,
}

/// Error body with a machine-readable message id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub msg_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// One entry of `GET /api/conversations/recent`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationInfo {
    pub conversation_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub last_updated_at: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// `GET /api/conversations/recent` body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationInfoResultSet {
    pub results: Vec<ConversationInfo>,
    #[serde(default)]
    pub next_page_id: Option<String>,
}

/// Display-ready view of a recent conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub last_updated_at: Option<String>,
    pub snippet: String,
}

impl From<ConversationInfo> for ConversationSummary {
    fn from(info: ConversationInfo) -> Self {
        let title = info
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string);

        let snippet = match &title {
            Some(t) if t.chars().count() > SNIPPET_MAX_CHARS => {
                let head: String = t.chars().take(SNIPPET_MAX_CHARS).collect();
                format!("{head}...")
            }
            Some(t) => t.clone(),
            None => "No details available.".to_string(),
        };

        let title = title.unwrap_or_else(|| {
            let short: String = info.conversation_id.chars().take(8).collect();
            format!("Conversation {short}")
        });

        Self {
            id: info.conversation_id,
            title,
            last_updated_at: info.last_updated_at,
            snippet,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn create_request_omits_missing_message() {
        let empty = CreateConversationRequest::default();
        assert_eq!(serde_json::to_value(&empty).unwrap(), json!({}));

        let with_msg = CreateConversationRequest {
            initial_user_msg: Some("hi".into()),
        };
        assert_eq!(
            serde_json::to_value(&with_msg).unwrap(),
            json!({ "initial_user_msg": "hi" })
        );
    }

    #[test]
    fn summary_falls_back_to_short_id() {
        let info = ConversationInfo {
            conversation_id: "0123456789abcdef".into(),
            title: None,
            last_updated_at: Some("2025-01-01T00:00:00Z".into()),
            created_at: None,
        };
        let summary = ConversationSummary::from(info);
        assert_eq!(summary.title, "Conversation 01234567");
        assert_eq!(summary.snippet, "No details available.");
    }

    #[test]
    fn summary_truncates_long_titles_in_snippet() {
        let long = "x".repeat(150);
        let summary = ConversationSummary::from(ConversationInfo {
            conversation_id: "abc".into(),
            title: Some(long.clone()),
            last_updated_at: None,
            created_at: None,
        });
        assert_eq!(summary.title, long);
        assert_eq!(summary.snippet.len(), 103);
        assert!(summary.snippet.ends_with("..."));
    }

    #[test]
    fn parses_recent_result_set() {
        let body = json!({
            "results": [
                { "conversation_id": "c1", "title": "First", "last_updated_at": "2025-01-02T00:00:00Z", "created_at": "2025-01-01T00:00:00Z", "status": "RUNNING" }
            ],
            "next_page_id": null
        });
        let set: ConversationInfoResultSet = serde_json::from_value(body).unwrap();
        assert_eq!(set.results.len(), 1);
        assert_eq!(set.results[0].title.as_deref(), Some("First"));
        assert!(set.next_page_id.is_none());
    }
}
