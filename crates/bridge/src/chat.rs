//! Line-oriented terminal chat.
//!
//! Reads prompts and slash commands from stdin, forwards them to the
//! conversation actor, and prints view events as they arrive.

use relaydock_connector::HealthStatus;
use relaydock_protocol::rest::ConversationSummary;
use relaydock_protocol::{EventSource, WireEvent};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::conversation::{ConversationHandle, LifecycleState};
use crate::conversation_command::{ConversationCommand, ViewEvent};

const HELP: &str = "\
Commands:
  /new           start a new conversation
  /health        check server health
  /recent        list recent conversations
  /resume <id>   continue an existing conversation
  /quit          exit
Anything else is sent to the agent.";

#[derive(Debug, PartialEq)]
pub enum Input {
    Command(ConversationCommand),
    Help,
    Quit,
    Empty,
    Invalid(String),
}

pub fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Input::Command(ConversationCommand::UserPrompt {
            text: line.to_string(),
            image_urls: Vec::new(),
        });
    };

    let mut parts = rest.split_whitespace();
    let name = parts.next().unwrap_or_default();
    let arg = parts.next();
    match (name, arg) {
        ("new", _) => Input::Command(ConversationCommand::StartNewConversation),
        ("health", _) => Input::Command(ConversationCommand::CheckHealth),
        ("recent", _) => Input::Command(ConversationCommand::ListRecent),
        ("resume", Some(id)) => Input::Command(ConversationCommand::ResumeConversation {
            conversation_id: id.to_string(),
        }),
        ("resume", None) => Input::Invalid("usage: /resume <conversation-id>".to_string()),
        ("quit" | "exit", _) => Input::Quit,
        ("help", _) => Input::Help,
        (other, _) => Input::Invalid(format!("unknown command '/{other}', try /help")),
    }
}

/// Text for a view event, or `None` when there is nothing worth printing.
pub fn render(event: &ViewEvent) -> Option<String> {
    match event {
        ViewEvent::Status(text) => Some(format!("[status] {text}")),
        ViewEvent::Error(text) => Some(format!("[error] {text}")),
        ViewEvent::SettingsRequired(text) => Some(format!("[settings] {text}")),
        ViewEvent::AgentResponse(event) => render_wire_event(event),
        ViewEvent::StatusUpdate(status) => {
            if status.message.is_empty() {
                None
            } else if status.kind == "error" {
                Some(format!("[agent error] {}", status.message))
            } else {
                Some(format!("[agent] {}", status.message))
            }
        }
        ViewEvent::Health(status) => Some(match status {
            HealthStatus::Healthy => "[health] server is healthy".to_string(),
            other => format!("[health] {other}"),
        }),
        ViewEvent::ClearChat => Some("--- new conversation ---".to_string()),
        ViewEvent::RecentConversations(list) => Some(format_recent(list)),
    }
}

fn render_wire_event(event: &WireEvent) -> Option<String> {
    match event {
        WireEvent::Action(action) => {
            let speaker = match action.source {
                Some(EventSource::User) => "you",
                _ => "agent",
            };
            let content = action
                .args
                .as_ref()
                .and_then(|args| args.get("content"))
                .and_then(Value::as_str)
                .filter(|_| action.action == "message");
            let text = match content {
                Some(text) => text,
                None if !action.message.is_empty() => action.message.as_str(),
                None => action.action.as_str(),
            };
            Some(format!("{speaker}: {text}"))
        }
        WireEvent::Observation(observation) => {
            let text = if observation.content.is_empty() {
                &observation.message
            } else {
                &observation.content
            };
            if text.is_empty() {
                None
            } else {
                Some(format!("[{}] {}", observation.observation, text.trim_end()))
            }
        }
        WireEvent::Status(status) => render(&ViewEvent::StatusUpdate(status.clone())),
        WireEvent::Unknown(value) => Some(format!("[event] {value}")),
    }
}

pub fn format_recent(list: &[ConversationSummary]) -> String {
    if list.is_empty() {
        return "No recent conversations.".to_string();
    }
    let mut out = String::from("Recent conversations:");
    for summary in list {
        out.push_str(&format!("\n  {}  {}", summary.id, summary.title));
        if let Some(updated) = &summary.last_updated_at {
            out.push_str(&format!("  ({updated})"));
        }
        out.push_str(&format!("\n      {}", summary.snippet));
    }
    out
}

pub async fn run(
    handle: ConversationHandle,
    mut view_rx: mpsc::Receiver<ViewEvent>,
) -> anyhow::Result<()> {
    println!("relaydock chat. Type /help for commands.");

    let printer = tokio::spawn(async move {
        while let Some(event) = view_rx.recv().await {
            if let Some(text) = render(&event) {
                println!("{text}");
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_input(&line) {
            Input::Command(command) => handle.send(command).await,
            Input::Help => {
                println!("{HELP}");
                if let LifecycleState::Active { conversation_id } = handle.state() {
                    println!("Current conversation: {conversation_id}");
                }
            }
            Input::Quit => break,
            Input::Empty => {}
            Input::Invalid(message) => println!("[error] {message}"),
        }
    }

    handle.send(ConversationCommand::Shutdown).await;
    drop(handle);
    printer.await?;
    Ok(())
}
