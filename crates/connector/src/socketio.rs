//! Engine.IO v4 / Socket.IO v5 text packet codec.
//!
//! Only the WebSocket transport with text frames is handled. Every frame is
//! one Engine.IO packet; Engine.IO `message` packets carry one Socket.IO
//! packet for the default namespace.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("empty frame")]
    Empty,

    #[error("unknown engine.io packet type '{0}'")]
    UnknownEngineType(char),

    #[error("unknown socket.io packet type '{0}'")]
    UnknownSocketType(char),

    #[error("malformed event payload: {0}")]
    InvalidEvent(String),

    #[error("unsupported packet: {0}")]
    Unsupported(&'static str),

    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Engine.IO `open` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenHandshake {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_payload: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    // Engine.IO
    Open(OpenHandshake),
    Close,
    Ping(String),
    Pong(String),
    Upgrade,
    Noop,

    // Socket.IO (inside an Engine.IO message)
    Connect(Option<Value>),
    Disconnect,
    Event {
        name: String,
        data: Value,
        ack_id: Option<u64>,
    },
    Ack {
        ack_id: u64,
        data: Value,
    },
    ConnectError(Value),
}

pub fn decode(frame: &str) -> Result<Packet, PacketError> {
    let mut chars = frame.chars();
    let kind = chars.next().ok_or(PacketError::Empty)?;
    let rest = chars.as_str();

    match kind {
        '0' => Ok(Packet::Open(serde_json::from_str(rest)?)),
        '1' => Ok(Packet::Close),
        '2' => Ok(Packet::Ping(rest.to_string())),
        '3' => Ok(Packet::Pong(rest.to_string())),
        '4' => decode_message(rest),
        '5' => Ok(Packet::Upgrade),
        '6' => Ok(Packet::Noop),
        other => Err(PacketError::UnknownEngineType(other)),
    }
}

fn decode_message(body: &str) -> Result<Packet, PacketError> {
    let mut chars = body.chars();
    let kind = chars.next().ok_or(PacketError::Empty)?;
    let rest = skip_namespace(chars.as_str());

    let digits = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    let ack_id = rest[..digits].parse::<u64>().ok();
    let payload = &rest[digits..];

    match kind {
        '0' => {
            if payload.is_empty() {
                Ok(Packet::Connect(None))
            } else {
                Ok(Packet::Connect(Some(serde_json::from_str(payload)?)))
            }
        }
        '1' => Ok(Packet::Disconnect),
        '2' => {
            let (name, data) = split_event(payload)?;
            Ok(Packet::Event { name, data, ack_id })
        }
        '3' => {
            let ack_id = ack_id.ok_or_else(|| PacketError::InvalidEvent("ack without id".into()))?;
            let mut args: Vec<Value> = serde_json::from_str(payload)?;
            let data = if args.is_empty() {
                Value::Null
            } else {
                args.swap_remove(0)
            };
            Ok(Packet::Ack { ack_id, data })
        }
        '4' => Ok(Packet::ConnectError(if payload.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(payload)?
        })),
        '5' | '6' => Err(PacketError::Unsupported("binary packets")),
        other => Err(PacketError::UnknownSocketType(other)),
    }
}

/// Drop a leading `/nsp,` prefix. Only the default namespace is used.
fn skip_namespace(rest: &str) -> &str {
    if !rest.starts_with('/') {
        return rest;
    }
    match rest.find(',') {
        Some(idx) => &rest[idx + 1..],
        None => "",
    }
}

fn split_event(payload: &str) -> Result<(String, Value), PacketError> {
    let args: Vec<Value> = serde_json::from_str(payload)?;
    let mut args = args.into_iter();
    let name = match args.next() {
        Some(Value::String(name)) => name,
        Some(other) => {
            return Err(PacketError::InvalidEvent(format!(
                "event name must be a string, got {other}"
            )))
        }
        None => return Err(PacketError::InvalidEvent("empty event".into())),
    };
    Ok((name, args.next().unwrap_or(Value::Null)))
}

pub fn encode(packet: &Packet) -> String {
    match packet {
        // OpenHandshake has only plain fields; serialization cannot fail.
        Packet::Open(open) => format!("0{}", serde_json::to_string(open).unwrap_or_default()),
        Packet::Close => "1".to_string(),
        Packet::Ping(data) => format!("2{data}"),
        Packet::Pong(data) => format!("3{data}"),
        Packet::Upgrade => "5".to_string(),
        Packet::Noop => "6".to_string(),
        Packet::Connect(None) => "40".to_string(),
        Packet::Connect(Some(data)) => format!("40{data}"),
        Packet::Disconnect => "41".to_string(),
        Packet::Event { name, data, ack_id } => {
            let args = Value::Array(vec![Value::String(name.clone()), data.clone()]);
            match ack_id {
                Some(id) => format!("42{id}{args}"),
                None => format!("42{args}"),
            }
        }
        Packet::Ack { ack_id, data } => format!("43{ack_id}{}", Value::Array(vec![data.clone()])),
        Packet::ConnectError(data) => format!("44{data}"),
    }
}

/// Shorthand for an `event` packet frame.
pub fn event_frame(name: &str, data: Value) -> String {
    encode(&Packet::Event {
        name: name.to_string(),
        data,
        ack_id: None,
    })
}
