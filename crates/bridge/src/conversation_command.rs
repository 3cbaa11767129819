//! Messages into and out of the conversation actor.

use relaydock_connector::HealthStatus;
use relaydock_protocol::rest::ConversationSummary;
use relaydock_protocol::{StatusMessage, WireEvent};

/// User intents sent to the conversation actor.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationCommand {
    /// Send a chat message, creating and connecting a conversation first if needed
    UserPrompt {
        text: String,
        image_urls: Vec<String>,
    },

    /// Drop the current conversation; the next prompt starts a fresh one
    StartNewConversation,

    CheckHealth,

    ListRecent,

    /// Attach to an existing conversation without creating one
    ResumeConversation { conversation_id: String },

    Shutdown,
}

/// What the front-end should show.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewEvent {
    Status(String),
    Error(String),
    /// The server has no LLM settings; fixable by configuration, not retry
    SettingsRequired(String),
    AgentResponse(WireEvent),
    StatusUpdate(StatusMessage),
    Health(HealthStatus),
    ClearChat,
    RecentConversations(Vec<ConversationSummary>),
}
