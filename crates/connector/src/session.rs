//! Realtime session client.
//!
//! A `SessionClient` owns at most one live channel, bound to one
//! conversation. Each channel is a tokio task that speaks Socket.IO over a
//! WebSocket, answers heartbeats, reconnects within a bounded budget, and
//! runs the response watchdog. The owner talks to it through mpsc queues and
//! reads connection state lock-free through `ArcSwap`.
//!
//! Every channel gets its own event queue. Switching conversations drops the
//! old queue, so nothing from a previous conversation can reach the owner
//! after the switch.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::{SinkExt, StreamExt};
use relaydock_protocol::{
    Observation, UserAction, WireEvent, EVENT_NAME, USER_ACTION_EVENT_NAME,
};
use reqwest::Url;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::socketio::{self, OpenHandshake, Packet};
use crate::{SessionError, SessionEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_BUFFER: usize = 256;
const OUTBOUND_BUFFER: usize = 64;

const CLIENT_DISCONNECT_REASON: &str = "io client disconnect";
const SERVER_DISCONNECT_REASON: &str = "io server disconnect";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub server_url: String,
    /// Silence allowed after a user message before `ResponseTimeout`
    pub response_timeout: Duration,
    pub connect_timeout: Duration,
    /// Attempts after the first failure (or after a dropped connection)
    pub reconnect_attempts: u32,
    /// Base backoff; attempt `n` waits `n * reconnect_delay`
    pub reconnect_delay: Duration,
}

impl SessionConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            response_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            reconnect_attempts: 3,
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Disconnected { reason: String },
}

/// Build the Socket.IO endpoint URL for a conversation.
pub fn socket_url(server_url: &str, conversation_id: &str) -> Result<Url, SessionError> {
    let mut url =
        Url::parse(server_url).map_err(|e| SessionError::InvalidUrl(format!("{server_url}: {e}")))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SessionError::InvalidUrl(format!(
                "unsupported scheme '{other}'"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SessionError::InvalidUrl(server_url.to_string()))?;
    url.set_path("/socket.io/");
    url.query_pairs_mut()
        .clear()
        .append_pair("EIO", "4")
        .append_pair("transport", "websocket")
        .append_pair("conversation_id", conversation_id)
        .append_pair("latest_event_id", "-1");
    Ok(url)
}

enum Outbound {
    UserAction(UserAction),
    Observation(Observation),
}

struct Channel {
    conversation_id: String,
    state: Arc<ArcSwap<ConnectionState>>,
    outbound_tx: mpsc::Sender<Outbound>,
    events_rx: mpsc::Receiver<SessionEvent>,
    close_tx: Option<oneshot::Sender<()>>,
}

impl Channel {
    fn state(&self) -> ConnectionState {
        self.state.load().as_ref().clone()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Sends observations on the channel it was taken from.
///
/// The channel outlives transport reconnects: observations emitted while
/// it is reconnecting are sent once it is back. Emitting after the channel
/// is gone fails with `ChannelClosed`; the observation is never delivered
/// to a later conversation.
#[derive(Clone)]
pub struct ObservationEmitter {
    conversation_id: String,
    tx: mpsc::Sender<Outbound>,
}

impl ObservationEmitter {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub async fn emit(&self, observation: Observation) -> Result<(), SessionError> {
        self.tx
            .send(Outbound::Observation(observation))
            .await
            .map_err(|_| SessionError::ChannelClosed)
    }

    /// True once the channel has shut down for good.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves when the channel shuts down for good.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

pub struct SessionClient {
    config: SessionConfig,
    channel: Option<Channel>,
    last_state: ConnectionState,
}

impl SessionClient {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            channel: None,
            last_state: ConnectionState::Idle,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        match &self.channel {
            Some(channel) => channel.state(),
            None => self.last_state.clone(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Conversation of the current channel, if any
    pub fn conversation_id(&self) -> Option<&str> {
        self.channel.as_ref().map(|c| c.conversation_id.as_str())
    }

    /// Open a channel for `conversation_id`, replacing any existing one.
    ///
    /// Resolves once the namespace is connected or the connection budget is
    /// spent. Connecting to the conversation that is already connected is a
    /// no-op.
    pub async fn connect(&mut self, conversation_id: &str) -> Result<(), SessionError> {
        if let Some(channel) = &self.channel {
            if channel.conversation_id == conversation_id
                && channel.state() == ConnectionState::Connected
            {
                debug!(
                    component = "session",
                    event = "session.connect.noop",
                    conversation_id = %conversation_id,
                    "Already connected"
                );
                return Ok(());
            }
        }

        self.disconnect();

        let url = socket_url(&self.config.server_url, conversation_id)?;
        info!(
            component = "session",
            event = "session.connect.start",
            conversation_id = %conversation_id,
            url = %url,
            "Opening session channel"
        );

        let state = Arc::new(ArcSwap::from_pointee(ConnectionState::Connecting));
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (close_tx, close_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let task = ChannelTask {
            url,
            conversation_id: conversation_id.to_string(),
            config: self.config.clone(),
            state: state.clone(),
            events_tx,
            outbound_rx,
            close_rx,
            unsent: None,
        };
        tokio::spawn(task.run(ready_tx));

        // Stored before awaiting so a cancelled connect still leaves a
        // channel for disconnect() to tear down.
        self.channel = Some(Channel {
            conversation_id: conversation_id.to_string(),
            state,
            outbound_tx,
            events_rx,
            close_tx: Some(close_tx),
        });

        match ready_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.retire_channel();
                Err(err)
            }
            Err(_) => {
                self.retire_channel();
                Err(SessionError::ChannelClosed)
            }
        }
    }

    /// Tear down the current channel. Idempotent.
    pub fn disconnect(&mut self) {
        if let Some(channel) = self.channel.take() {
            info!(
                component = "session",
                event = "session.disconnect",
                conversation_id = %channel.conversation_id,
                "Closing session channel"
            );
            drop(channel);
            self.last_state = ConnectionState::Disconnected {
                reason: CLIENT_DISCONNECT_REASON.to_string(),
            };
        }
    }

    /// Queue a user chat message. Fails immediately unless connected.
    pub fn send_user_message(
        &self,
        content: &str,
        image_urls: Vec<String>,
    ) -> Result<(), SessionError> {
        let Some(channel) = self
            .channel
            .as_ref()
            .filter(|c| c.state() == ConnectionState::Connected)
        else {
            warn!(
                component = "session",
                event = "session.send.not_connected",
                "Dropping user message, socket not connected"
            );
            return Err(SessionError::NotConnected);
        };

        channel
            .outbound_tx
            .try_send(Outbound::UserAction(UserAction::message(content, image_urls)))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    SessionError::Transport("outbound queue full".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => SessionError::ChannelClosed,
            })
    }

    /// Observation sender bound to the current channel
    pub fn emitter(&self) -> Option<ObservationEmitter> {
        self.channel.as_ref().map(|c| ObservationEmitter {
            conversation_id: c.conversation_id.clone(),
            tx: c.outbound_tx.clone(),
        })
    }

    /// Next notification from the current channel.
    ///
    /// Pends forever while there is no channel, which makes it safe to use
    /// as a `select!` branch. Cancel safe.
    pub async fn next_event(&mut self) -> SessionEvent {
        loop {
            let Some(channel) = self.channel.as_mut() else {
                return std::future::pending().await;
            };
            if let Some(event) = channel.events_rx.recv().await {
                return event;
            }
            // Task finished and its queue is drained.
            self.retire_channel();
        }
    }

    fn retire_channel(&mut self) {
        if let Some(channel) = self.channel.take() {
            self.last_state = channel.state();
        }
    }
}

enum PumpExit {
    /// Owner asked to close
    ClientClosed,
    /// Server sent a Socket.IO disconnect; not retried
    ServerClosed,
    /// Transport dropped; eligible for reconnect
    Lost(String),
}

struct ChannelTask {
    url: Url,
    conversation_id: String,
    config: SessionConfig,
    state: Arc<ArcSwap<ConnectionState>>,
    events_tx: mpsc::Sender<SessionEvent>,
    outbound_rx: mpsc::Receiver<Outbound>,
    close_rx: oneshot::Receiver<()>,
    /// Frame whose send failed with the transport; retried after reconnect.
    /// The flag says whether it arms the watchdog.
    unsent: Option<(String, bool)>,
}

impl ChannelTask {
    async fn run(mut self, ready: oneshot::Sender<Result<(), SessionError>>) {
        let mut ready = Some(ready);
        let mut attempt: u32 = 0;

        loop {
            if attempt == 0 {
                self.set_state(ConnectionState::Connecting);
            } else {
                self.set_state(ConnectionState::Reconnecting { attempt });
                let delay = self.config.reconnect_delay * attempt;
                tokio::select! {
                    biased;
                    _ = &mut self.close_rx => return self.closed_by_client(),
                    _ = sleep(delay) => {}
                }
            }

            let opened = tokio::select! {
                biased;
                _ = &mut self.close_rx => return self.closed_by_client(),
                opened = open_socket(&self.url, self.config.connect_timeout) => opened,
            };

            let ws = match opened {
                Ok(ws) => ws,
                Err(err) => {
                    warn!(
                        component = "session",
                        event = "session.connect.failed",
                        conversation_id = %self.conversation_id,
                        attempt,
                        error = %err,
                        "Session connect attempt failed"
                    );
                    if attempt >= self.config.reconnect_attempts {
                        self.set_state(ConnectionState::Disconnected {
                            reason: err.to_string(),
                        });
                        match ready.take() {
                            Some(tx) => {
                                let _ = tx.send(Err(err));
                            }
                            None => self.emit(SessionEvent::Error(err)).await,
                        }
                        return;
                    }
                    if ready.is_none() {
                        self.emit(SessionEvent::Error(err)).await;
                    }
                    attempt += 1;
                    continue;
                }
            };

            let (socket, handshake) = ws;
            attempt = 0;
            self.set_state(ConnectionState::Connected);
            info!(
                component = "session",
                event = "session.connected",
                conversation_id = %self.conversation_id,
                sid = %handshake.sid,
                "Session connected"
            );
            if let Some(tx) = ready.take() {
                let _ = tx.send(Ok(()));
            }
            self.emit(SessionEvent::Connected {
                conversation_id: self.conversation_id.clone(),
            })
            .await;

            match self.pump(socket, &handshake).await {
                PumpExit::ClientClosed => return self.closed_by_client(),
                PumpExit::ServerClosed => {
                    info!(
                        component = "session",
                        event = "session.server_disconnect",
                        conversation_id = %self.conversation_id,
                        "Server ended the session"
                    );
                    self.set_state(ConnectionState::Disconnected {
                        reason: SERVER_DISCONNECT_REASON.to_string(),
                    });
                    self.emit_disconnected(SERVER_DISCONNECT_REASON).await;
                    return;
                }
                PumpExit::Lost(reason) => {
                    warn!(
                        component = "session",
                        event = "session.lost",
                        conversation_id = %self.conversation_id,
                        reason = %reason,
                        "Session transport lost"
                    );
                    self.emit_disconnected(&reason).await;
                    if self.config.reconnect_attempts == 0 {
                        self.set_state(ConnectionState::Disconnected { reason });
                        return;
                    }
                    attempt = 1;
                }
            }
        }
    }

    async fn pump(&mut self, socket: WsStream, handshake: &OpenHandshake) -> PumpExit {
        let (mut sink, mut stream) = socket.split();
        let heartbeat_window =
            Duration::from_millis(handshake.ping_interval + handshake.ping_timeout);
        let mut heartbeat_deadline = Instant::now() + heartbeat_window;
        let mut watchdog: Option<Instant> = None;

        if let Some((frame, arms_watchdog)) = self.unsent.take() {
            if sink.send(Message::Text(frame.clone().into())).await.is_err() {
                self.unsent = Some((frame, arms_watchdog));
                return PumpExit::Lost("transport error".to_string());
            }
            if arms_watchdog {
                watchdog = Some(Instant::now() + self.config.response_timeout);
            }
        }

        loop {
            let watchdog_at = watchdog.unwrap_or(heartbeat_deadline);

            tokio::select! {
                biased;

                _ = &mut self.close_rx => {
                    let _ = sink
                        .send(Message::Text(socketio::encode(&Packet::Disconnect).into()))
                        .await;
                    let _ = sink.close().await;
                    return PumpExit::ClientClosed;
                }

                frame = stream.next() => {
                    let text = match frame {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => {
                            return PumpExit::Lost("transport close".to_string());
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            self.emit(SessionEvent::Error(SessionError::Transport(e.to_string())))
                                .await;
                            return PumpExit::Lost("transport error".to_string());
                        }
                    };

                    match socketio::decode(text.as_str()) {
                        Ok(Packet::Ping(data)) => {
                            heartbeat_deadline = Instant::now() + heartbeat_window;
                            let pong = socketio::encode(&Packet::Pong(data));
                            if sink.send(Message::Text(pong.into())).await.is_err() {
                                return PumpExit::Lost("transport error".to_string());
                            }
                        }
                        Ok(Packet::Event { name, data, .. }) if name == EVENT_NAME => {
                            watchdog = None;
                            self.deliver(data).await;
                        }
                        Ok(Packet::Event { name, .. }) => {
                            debug!(
                                component = "session",
                                event = "session.event.ignored",
                                name = %name,
                                "Ignoring unrelated socket event"
                            );
                        }
                        Ok(Packet::Disconnect) => return PumpExit::ServerClosed,
                        Ok(Packet::Close) => return PumpExit::Lost("transport close".to_string()),
                        Ok(Packet::ConnectError(data)) => {
                            self.emit(SessionEvent::Error(SessionError::Transport(
                                connect_error_message(&data),
                            )))
                            .await;
                            return PumpExit::ServerClosed;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(
                                component = "session",
                                event = "session.frame.decode_failed",
                                conversation_id = %self.conversation_id,
                                error = %e,
                                "Failed to decode frame"
                            );
                        }
                    }
                }

                Some(outbound) = self.outbound_rx.recv() => {
                    let (name, payload, arms_watchdog) = match outbound {
                        Outbound::UserAction(action) => {
                            (USER_ACTION_EVENT_NAME, serde_json::to_value(&action), true)
                        }
                        Outbound::Observation(observation) => {
                            (EVENT_NAME, serde_json::to_value(&observation), false)
                        }
                    };
                    let data = match payload {
                        Ok(data) => data,
                        Err(e) => {
                            error!(
                                component = "session",
                                event = "session.send.serialize_failed",
                                error = %e,
                                "Failed to serialize outbound event"
                            );
                            continue;
                        }
                    };
                    let frame = socketio::event_frame(name, data);
                    if sink.send(Message::Text(frame.clone().into())).await.is_err() {
                        self.unsent = Some((frame, arms_watchdog));
                        return PumpExit::Lost("transport error".to_string());
                    }
                    if arms_watchdog {
                        watchdog = Some(Instant::now() + self.config.response_timeout);
                    }
                }

                _ = sleep_until(watchdog_at), if watchdog.is_some() => {
                    watchdog = None;
                    warn!(
                        component = "session",
                        event = "session.response_timeout",
                        conversation_id = %self.conversation_id,
                        "No agent response within timeout"
                    );
                    self.emit(SessionEvent::Error(SessionError::ResponseTimeout)).await;
                }

                _ = sleep_until(heartbeat_deadline) => {
                    return PumpExit::Lost("ping timeout".to_string());
                }
            }
        }
    }

    async fn deliver(&self, data: Value) {
        let event = WireEvent::classify(&data);
        let notification = match event.delegated_action() {
            Some(action) => SessionEvent::Delegated(action),
            None => SessionEvent::Display(event),
        };
        self.emit(notification).await;
    }

    async fn emit(&self, event: SessionEvent) {
        if self.events_tx.send(event).await.is_err() {
            debug!(
                component = "session",
                event = "session.owner_gone",
                conversation_id = %self.conversation_id,
                "Session owner dropped, event discarded"
            );
        }
    }

    async fn emit_disconnected(&self, reason: &str) {
        self.emit(SessionEvent::Disconnected {
            conversation_id: self.conversation_id.clone(),
            reason: reason.to_string(),
        })
        .await;
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(Arc::new(state));
    }

    fn closed_by_client(&self) {
        self.set_state(ConnectionState::Disconnected {
            reason: CLIENT_DISCONNECT_REASON.to_string(),
        });
    }
}

async fn open_socket(
    url: &Url,
    connect_timeout: Duration,
) -> Result<(WsStream, OpenHandshake), SessionError> {
    let (mut ws, _response) = timeout(connect_timeout, tokio_tungstenite::connect_async(url.as_str()))
        .await
        .map_err(|_| SessionError::ConnectFailed("timeout".to_string()))?
        .map_err(|e| SessionError::ConnectFailed(e.to_string()))?;

    let handshake = timeout(connect_timeout, handshake(&mut ws))
        .await
        .map_err(|_| SessionError::ConnectFailed("handshake timeout".to_string()))??;

    Ok((ws, handshake))
}

/// Engine.IO open, then Socket.IO namespace connect.
async fn handshake(ws: &mut WsStream) -> Result<OpenHandshake, SessionError> {
    let mut open = None;

    while let Some(frame) = ws.next().await {
        let frame = frame.map_err(|e| SessionError::ConnectFailed(e.to_string()))?;
        let Message::Text(text) = frame else {
            continue;
        };

        match socketio::decode(text.as_str()) {
            Ok(Packet::Open(handshake)) => {
                open = Some(handshake);
                let connect = socketio::encode(&Packet::Connect(None));
                ws.send(Message::Text(connect.into()))
                    .await
                    .map_err(|e| SessionError::ConnectFailed(e.to_string()))?;
            }
            Ok(Packet::Connect(_)) => {
                return open.ok_or_else(|| {
                    SessionError::ConnectFailed("namespace connect before open".to_string())
                });
            }
            Ok(Packet::ConnectError(data)) => {
                return Err(SessionError::ConnectFailed(connect_error_message(&data)));
            }
            Ok(Packet::Ping(data)) => {
                let pong = socketio::encode(&Packet::Pong(data));
                ws.send(Message::Text(pong.into()))
                    .await
                    .map_err(|e| SessionError::ConnectFailed(e.to_string()))?;
            }
            Ok(_) => {}
            Err(e) => return Err(SessionError::ConnectFailed(e.to_string())),
        }
    }

    Err(SessionError::ConnectFailed(
        "connection closed during handshake".to_string(),
    ))
}

fn connect_error_message(data: &Value) -> String {
    data.get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| data.to_string())
}
