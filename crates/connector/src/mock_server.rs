//! In-process mock agent server for tests.
//!
//! Serves the conversation REST endpoints, `/health`, and a minimal
//! Socket.IO endpoint. Tests push events to connected sockets and inspect
//! what clients sent.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use relaydock_protocol::rest::{
    ConversationInfo, ConversationInfoResultSet, CreateConversationRequest,
    SETTINGS_NOT_FOUND_MSG_ID,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::socketio::{self, OpenHandshake, Packet};

const WAIT_LIMIT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How `POST /api/conversations` answers
#[derive(Debug, Clone)]
pub enum CreateBehavior {
    /// 200 with a fresh `conversation_id`
    Succeed,
    /// 400 with the settings-not-found message id
    SettingsNotFound,
    /// Arbitrary status and raw body
    Fail { status: u16, body: String },
    /// 200 with the given JSON body
    Respond(Value),
    /// Accept the request and never answer
    Stall,
}

/// How `GET /health` answers
#[derive(Debug, Clone)]
pub enum HealthBehavior {
    Ok,
    Status(u16),
    Delay(Duration),
}

/// An event a client emitted on a socket
#[derive(Debug, Clone)]
pub struct ReceivedEvent {
    pub conversation_id: String,
    pub name: String,
    pub data: Value,
}

enum SocketCommand {
    Frame(String),
    /// Close the transport without a Socket.IO disconnect
    Drop,
}

struct MockSocket {
    id: usize,
    conversation_id: String,
    tx: mpsc::UnboundedSender<SocketCommand>,
}

struct MockState {
    create: Mutex<CreateBehavior>,
    health: Mutex<HealthBehavior>,
    recent: Mutex<Vec<ConversationInfo>>,
    created: Mutex<Vec<CreateConversationRequest>>,
    received: Mutex<Vec<ReceivedEvent>>,
    sockets: Mutex<Vec<MockSocket>>,
    connections: AtomicUsize,
    next_conversation: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct MockBackend {
    addr: SocketAddr,
    state: Arc<MockState>,
    server: JoinHandle<()>,
}

impl MockBackend {
    /// Bind to an ephemeral localhost port and start serving.
    ///
    /// # Panics
    ///
    /// Panics if the listener cannot be bound.
    pub async fn start() -> Self {
        let state = Arc::new(MockState {
            create: Mutex::new(CreateBehavior::Succeed),
            health: Mutex::new(HealthBehavior::Ok),
            recent: Mutex::new(Vec::new()),
            created: Mutex::new(Vec::new()),
            received: Mutex::new(Vec::new()),
            sockets: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            next_conversation: AtomicUsize::new(1),
        });

        let router = Router::new()
            .route("/api/conversations", post(create_conversation))
            .route("/api/conversations/recent", get(recent_conversations))
            .route("/health", get(health))
            .route("/socket.io/", get(socket_upgrade))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock server");
        let addr = listener.local_addr().expect("mock server address");
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        Self {
            addr,
            state,
            server,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn set_create(&self, behavior: CreateBehavior) {
        *lock(&self.state.create) = behavior;
    }

    pub fn set_health(&self, behavior: HealthBehavior) {
        *lock(&self.state.health) = behavior;
    }

    pub fn set_recent(&self, conversations: Vec<ConversationInfo>) {
        *lock(&self.state.recent) = conversations;
    }

    pub fn created_requests(&self) -> Vec<CreateConversationRequest> {
        lock(&self.state.created).clone()
    }

    pub fn received(&self) -> Vec<ReceivedEvent> {
        lock(&self.state.received).clone()
    }

    /// Sockets that completed the namespace connect over the server's life
    pub fn total_connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Live sockets for a conversation
    pub fn open_sockets(&self, conversation_id: &str) -> usize {
        lock(&self.state.sockets)
            .iter()
            .filter(|s| s.conversation_id == conversation_id)
            .count()
    }

    /// Emit an `oh_event` to every live socket of a conversation.
    /// Returns how many sockets it was queued for.
    pub fn push_event(&self, conversation_id: &str, event: Value) -> usize {
        let frame = socketio::event_frame(relaydock_protocol::EVENT_NAME, event);
        self.send_command(conversation_id, || SocketCommand::Frame(frame.clone()))
    }

    /// Send a Socket.IO disconnect (server-initiated, final).
    pub fn disconnect_sockets(&self, conversation_id: &str) -> usize {
        let frame = socketio::encode(&Packet::Disconnect);
        self.send_command(conversation_id, || SocketCommand::Frame(frame.clone()))
    }

    /// Close the transport abruptly, as a network drop would.
    pub fn drop_sockets(&self, conversation_id: &str) -> usize {
        self.send_command(conversation_id, || SocketCommand::Drop)
    }

    fn send_command(&self, conversation_id: &str, make: impl Fn() -> SocketCommand) -> usize {
        lock(&self.state.sockets)
            .iter()
            .filter(|s| s.conversation_id == conversation_id)
            .filter(|s| s.tx.send(make()).is_ok())
            .count()
    }

    /// Wait until at least `count` client events were received.
    ///
    /// # Panics
    ///
    /// Panics if they do not arrive within a few seconds.
    pub async fn wait_for_received(&self, count: usize) -> Vec<ReceivedEvent> {
        let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
        loop {
            let received = self.received();
            if received.len() >= count {
                return received;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected {count} received events, got {}",
                received.len()
            );
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Wait until a conversation has exactly `count` live sockets.
    ///
    /// # Panics
    ///
    /// Panics if that does not happen within a few seconds.
    pub async fn wait_for_sockets(&self, conversation_id: &str, count: usize) {
        let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
        loop {
            let open = self.open_sockets(conversation_id);
            if open == count {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected {count} sockets for {conversation_id}, got {open}"
            );
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn create_conversation(
    State(state): State<Arc<MockState>>,
    Json(request): Json<CreateConversationRequest>,
) -> Response {
    lock(&state.created).push(request);
    let behavior = lock(&state.create).clone();

    match behavior {
        CreateBehavior::Succeed => {
            let n = state.next_conversation.fetch_add(1, Ordering::SeqCst);
            Json(json!({ "status": "ok", "conversation_id": format!("conv-{n}") })).into_response()
        }
        CreateBehavior::SettingsNotFound => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "status": "error",
                "message": "Settings not found",
                "msg_id": SETTINGS_NOT_FOUND_MSG_ID,
            })),
        )
            .into_response(),
        CreateBehavior::Fail { status, body } => (
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            body,
        )
            .into_response(),
        CreateBehavior::Respond(body) => Json(body).into_response(),
        CreateBehavior::Stall => std::future::pending().await,
    }
}

async fn recent_conversations(State(state): State<Arc<MockState>>) -> Json<ConversationInfoResultSet> {
    Json(ConversationInfoResultSet {
        results: lock(&state.recent).clone(),
        next_page_id: None,
    })
}

async fn health(State(state): State<Arc<MockState>>) -> Response {
    let behavior = lock(&state.health).clone();
    match behavior {
        HealthBehavior::Ok => "OK".into_response(),
        HealthBehavior::Status(code) => StatusCode::from_u16(code)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            .into_response(),
        HealthBehavior::Delay(delay) => {
            tokio::time::sleep(delay).await;
            "OK".into_response()
        }
    }
}

async fn socket_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<MockState>>,
) -> Response {
    let conversation_id = params.get("conversation_id").cloned().unwrap_or_default();
    ws.on_upgrade(move |socket| serve_socket(socket, conversation_id, state))
}

static NEXT_SOCKET_ID: AtomicUsize = AtomicUsize::new(1);

async fn serve_socket(socket: WebSocket, conversation_id: String, state: Arc<MockState>) {
    let id = NEXT_SOCKET_ID.fetch_add(1, Ordering::SeqCst);
    let (mut ws_tx, mut ws_rx) = socket.split();

    let open = Packet::Open(OpenHandshake {
        sid: format!("sid-{id}"),
        upgrades: Vec::new(),
        ping_interval: 25_000,
        ping_timeout: 20_000,
        max_payload: Some(1_000_000),
    });
    if ws_tx
        .send(Message::Text(socketio::encode(&open).into()))
        .await
        .is_err()
    {
        return;
    }

    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
    let mut cmd_tx = Some(cmd_tx);

    loop {
        tokio::select! {
            frame = ws_rx.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                match socketio::decode(text.as_str()) {
                    Ok(Packet::Connect(_)) => {
                        let ack = socketio::encode(&Packet::Connect(Some(json!({ "sid": format!("sid-{id}") }))));
                        if ws_tx.send(Message::Text(ack.into())).await.is_err() {
                            break;
                        }
                        if let Some(tx) = cmd_tx.take() {
                            state.connections.fetch_add(1, Ordering::SeqCst);
                            lock(&state.sockets).push(MockSocket {
                                id,
                                conversation_id: conversation_id.clone(),
                                tx,
                            });
                        }
                    }
                    Ok(Packet::Event { name, data, .. }) => {
                        lock(&state.received).push(ReceivedEvent {
                            conversation_id: conversation_id.clone(),
                            name,
                            data,
                        });
                    }
                    Ok(Packet::Disconnect) => break,
                    _ => {}
                }
            }
            Some(command) = cmd_rx.recv() => {
                match command {
                    SocketCommand::Frame(frame) => {
                        let disconnect = frame == socketio::encode(&Packet::Disconnect);
                        if ws_tx.send(Message::Text(frame.into())).await.is_err() || disconnect {
                            break;
                        }
                    }
                    SocketCommand::Drop => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        }
    }

    lock(&state.sockets).retain(|s| s.id != id);
}
