//! Conversation REST API client.

use std::time::Duration;

use relaydock_protocol::rest::{
    ConversationInfoResultSet, ConversationSummary, CreateConversationRequest,
    CreateConversationResponse, ErrorBody, SETTINGS_NOT_FOUND_MSG_ID,
};
use reqwest::{StatusCode, Url};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ApiError {
    /// The server has no LLM settings stored
    #[error("LLM settings not found")]
    SettingsNotFound,

    #[error("Server error ({status}): {body}")]
    Server { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid API response: {0}")]
    InvalidResponse(String),

    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),
}

#[derive(Debug, Clone)]
pub struct ConversationApi {
    base_url: Url,
    http: reqwest::Client,
}

impl ConversationApi {
    /// Client whose requests fail with `ApiError::Network` after `request_timeout`.
    pub fn new(server_url: &str, request_timeout: Duration) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder().timeout(request_timeout).build()?;
        Self::with_client(server_url, http)
    }

    pub fn with_client(server_url: &str, http: reqwest::Client) -> Result<Self, ApiError> {
        let base_url = parse_server_url(server_url)?;
        Ok(Self { base_url, http })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// `POST /api/conversations`; returns the new conversation id.
    pub async fn create_conversation(
        &self,
        initial_user_msg: Option<&str>,
    ) -> Result<String, ApiError> {
        let url = self.endpoint("/api/conversations")?;
        let body = CreateConversationRequest {
            initial_user_msg: initial_user_msg.map(str::to_string),
        };

        let response = self.http.post(url).json(&body).send().await?;
        let status = response.status();
        let text = response.text().await?;

        if status == StatusCode::BAD_REQUEST {
            if let Ok(err) = serde_json::from_str::<ErrorBody>(&text) {
                if err.msg_id.as_deref() == Some(SETTINGS_NOT_FOUND_MSG_ID) {
                    warn!(
                        component = "api",
                        event = "api.create.settings_missing",
                        "Server has no LLM settings"
                    );
                    return Err(ApiError::SettingsNotFound);
                }
            }
        }
        if !status.is_success() {
            warn!(
                component = "api",
                event = "api.create.failed",
                status = status.as_u16(),
                "Conversation create rejected"
            );
            return Err(ApiError::Server {
                status: status.as_u16(),
                body: text,
            });
        }

        let parsed: CreateConversationResponse = serde_json::from_str(&text)
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;
        let conversation_id = parsed
            .conversation_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ApiError::InvalidResponse("missing conversation_id".to_string()))?;

        info!(
            component = "api",
            event = "api.create.ok",
            conversation_id = %conversation_id,
            "Conversation created"
        );
        Ok(conversation_id)
    }

    /// `GET /api/conversations/recent`, newest first as returned by the server.
    pub async fn recent_conversations(&self) -> Result<Vec<ConversationSummary>, ApiError> {
        let url = self.endpoint("/api/conversations/recent")?;
        let response = self.http.get(url).send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(ApiError::Server {
                status: status.as_u16(),
                body: text,
            });
        }

        let set: ConversationInfoResultSet = serde_json::from_str(&text)
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;
        Ok(set.results.into_iter().map(ConversationSummary::from).collect())
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        self.base_url
            .join(path)
            .map_err(|e| ApiError::InvalidUrl(e.to_string()))
    }
}

pub(crate) fn parse_server_url(server_url: &str) -> Result<Url, ApiError> {
    let url = Url::parse(server_url)
        .map_err(|e| ApiError::InvalidUrl(format!("{server_url}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ApiError::InvalidUrl(format!(
            "unsupported scheme '{other}'"
        ))),
    }
}
