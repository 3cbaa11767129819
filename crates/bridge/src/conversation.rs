//! Conversation actor: owns the session client and drives the lifecycle
//! `NoConversation → Creating → Active → (new) → NoConversation`.
//!
//! The front-end talks to it through `ConversationHandle` (mpsc commands)
//! and reads the lifecycle state lock-free through `ArcSwap`. Everything
//! that touches the session runs on this one task, so a conversation switch
//! is always disconnect-then-connect.

use std::sync::Arc;

use arc_swap::ArcSwap;
use relaydock_connector::{
    ApiError, ConversationApi, HealthProbe, SessionClient, SessionEvent,
};
use relaydock_executor::ActionExecutor;
use relaydock_protocol::WireEvent;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::conversation_command::{ConversationCommand, ViewEvent};
use crate::dispatch::ActionWorker;
use crate::health_monitor::HealthMonitor;

pub const SETTINGS_REQUIRED_MESSAGE: &str =
    "LLM settings not found. Please configure your LLM API key and model in the server settings.";

const COMMAND_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleState {
    NoConversation,
    Creating,
    Active { conversation_id: String },
}

/// Handle to the running conversation actor (cheap to Clone).
#[derive(Clone)]
pub struct ConversationHandle {
    command_tx: mpsc::Sender<ConversationCommand>,
    state: Arc<ArcSwap<LifecycleState>>,
}

impl ConversationHandle {
    pub async fn send(&self, command: ConversationCommand) {
        if self.command_tx.send(command).await.is_err() {
            warn!(
                component = "conversation",
                event = "conversation.command.dropped",
                "Conversation actor stopped, command dropped"
            );
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state.load().as_ref().clone()
    }
}

pub struct ConversationManager {
    api: ConversationApi,
    session: SessionClient,
    executor: Arc<ActionExecutor>,
    health: HealthMonitor,
    view_tx: mpsc::Sender<ViewEvent>,
    state: Arc<ArcSwap<LifecycleState>>,
    worker: Option<ActionWorker>,
}

impl ConversationManager {
    pub fn new(
        api: ConversationApi,
        session: SessionClient,
        executor: ActionExecutor,
        health: HealthMonitor,
        view_tx: mpsc::Sender<ViewEvent>,
    ) -> Self {
        Self {
            api,
            session,
            executor: Arc::new(executor),
            health,
            view_tx,
            state: Arc::new(ArcSwap::from_pointee(LifecycleState::NoConversation)),
            worker: None,
        }
    }

    pub fn from_config(config: &Config, view_tx: mpsc::Sender<ViewEvent>) -> anyhow::Result<Self> {
        let api = ConversationApi::new(&config.server_url, config.request_timeout())?;
        let session = SessionClient::new(config.session_config());
        let executor = ActionExecutor::new(config.executor_config()?);
        let probe = HealthProbe::new(&config.server_url, config.health_timeout())?;
        let health = HealthMonitor::new(probe, config.health_interval(), view_tx.clone());
        Ok(Self::new(api, session, executor, health, view_tx))
    }

    pub fn spawn(self) -> (ConversationHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let handle = ConversationHandle {
            command_tx,
            state: self.state.clone(),
        };
        let task = tokio::spawn(self.run(command_rx));
        (handle, task)
    }

    async fn run(mut self, mut command_rx: mpsc::Receiver<ConversationCommand>) {
        info!(
            component = "conversation",
            event = "conversation.actor.started",
            server_url = %self.api.base_url(),
            "Conversation actor started"
        );
        self.health.start();

        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(ConversationCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                event = self.session.next_event() => self.on_session_event(event).await,
            }
        }

        self.teardown_session();
        self.health.stop();
        info!(
            component = "conversation",
            event = "conversation.actor.stopped",
            "Conversation actor stopped"
        );
    }

    async fn handle_command(&mut self, command: ConversationCommand) {
        match command {
            ConversationCommand::UserPrompt { text, image_urls } => {
                self.on_user_prompt(&text, image_urls).await
            }
            ConversationCommand::StartNewConversation => self.on_start_new_conversation().await,
            ConversationCommand::CheckHealth => {
                self.health.check_now().await;
            }
            ConversationCommand::ListRecent => self.on_list_recent().await,
            ConversationCommand::ResumeConversation { conversation_id } => {
                self.on_resume(conversation_id).await
            }
            ConversationCommand::Shutdown => {}
        }
    }

    async fn on_user_prompt(&mut self, text: &str, image_urls: Vec<String>) {
        let conversation_id = match self.active_conversation() {
            Some(id) => id,
            None => match self.create_conversation().await {
                Some(id) => id,
                None => return,
            },
        };

        // Lazy (re)connect; a no-op when already connected.
        if let Err(err) = self.session.connect(&conversation_id).await {
            warn!(
                component = "conversation",
                event = "conversation.connect.failed",
                conversation_id = %conversation_id,
                error = %err,
                "Could not connect session"
            );
            self.view(ViewEvent::Error(err.to_string())).await;
            return;
        }
        self.ensure_worker();

        if let Err(err) = self.session.send_user_message(text, image_urls) {
            self.view(ViewEvent::Error(err.to_string())).await;
        }
    }

    async fn create_conversation(&mut self) -> Option<String> {
        self.set_state(LifecycleState::Creating);

        match self.api.create_conversation(None).await {
            Ok(conversation_id) => {
                info!(
                    component = "conversation",
                    event = "conversation.created",
                    conversation_id = %conversation_id,
                    "Conversation created"
                );
                self.set_state(LifecycleState::Active {
                    conversation_id: conversation_id.clone(),
                });
                Some(conversation_id)
            }
            Err(ApiError::SettingsNotFound) => {
                self.set_state(LifecycleState::NoConversation);
                self.view(ViewEvent::SettingsRequired(
                    SETTINGS_REQUIRED_MESSAGE.to_string(),
                ))
                .await;
                None
            }
            Err(err) => {
                warn!(
                    component = "conversation",
                    event = "conversation.create.failed",
                    error = %err,
                    "Conversation create failed"
                );
                self.set_state(LifecycleState::NoConversation);
                self.view(ViewEvent::Error(format!(
                    "Failed to create conversation: {err}"
                )))
                .await;
                None
            }
        }
    }

    async fn on_start_new_conversation(&mut self) {
        info!(
            component = "conversation",
            event = "conversation.reset",
            "Starting new conversation"
        );
        self.teardown_session();
        self.set_state(LifecycleState::NoConversation);
        self.view(ViewEvent::ClearChat).await;
        self.health.check_now().await;
    }

    async fn on_resume(&mut self, conversation_id: String) {
        let conversation_id = conversation_id.trim().to_string();
        if conversation_id.is_empty() {
            self.view(ViewEvent::Error("Conversation id is required".to_string()))
                .await;
            return;
        }
        if self.active_conversation().as_deref() == Some(conversation_id.as_str())
            && self.session.is_connected()
        {
            return;
        }

        self.teardown_session();
        self.set_state(LifecycleState::Active {
            conversation_id: conversation_id.clone(),
        });
        self.view(ViewEvent::ClearChat).await;

        match self.session.connect(&conversation_id).await {
            Ok(()) => self.ensure_worker(),
            Err(err) => self.view(ViewEvent::Error(err.to_string())).await,
        }
    }

    async fn on_list_recent(&mut self) {
        match self.api.recent_conversations().await {
            Ok(conversations) => {
                self.view(ViewEvent::RecentConversations(conversations))
                    .await
            }
            Err(err) => {
                self.view(ViewEvent::Error(format!(
                    "Failed to load recent conversations: {err}"
                )))
                .await
            }
        }
    }

    async fn on_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Connected { .. } => {
                self.ensure_worker();
                self.view(ViewEvent::Status("Agent connected".to_string()))
                    .await;
            }
            // The channel may still reconnect; its worker keeps running so
            // in-flight results go out once the transport is back.
            SessionEvent::Disconnected { reason, .. } => {
                self.view(ViewEvent::Status(format!("Agent disconnected: {reason}")))
                    .await;
            }
            SessionEvent::Error(err) => self.view(ViewEvent::Error(err.to_string())).await,
            SessionEvent::Display(WireEvent::Status(status)) => {
                self.view(ViewEvent::StatusUpdate(status)).await
            }
            SessionEvent::Display(event) => self.view(ViewEvent::AgentResponse(event)).await,
            SessionEvent::Delegated(action) => {
                self.ensure_worker();
                match &self.worker {
                    Some(worker) => {
                        worker.submit(action).await;
                    }
                    // Only reachable without a channel, so there is no one to answer.
                    None => warn!(
                        component = "conversation",
                        event = "conversation.action.no_channel",
                        action = %action.action,
                        action_id = %action.id,
                        "Delegated action without a session channel"
                    ),
                }
            }
        }
    }

    /// Worker bound to the current session channel. A worker whose channel
    /// has shut down is replaced, even for the same conversation.
    fn ensure_worker(&mut self) {
        if let (Some(worker), Some(current)) = (&self.worker, self.session.conversation_id()) {
            if worker.conversation_id() == current && !worker.is_retired() {
                return;
            }
        }
        self.worker = self
            .session
            .emitter()
            .map(|emitter| ActionWorker::spawn(self.executor.clone(), emitter));
    }

    /// Worker first, so no late observation reaches a closing channel.
    fn teardown_session(&mut self) {
        self.worker = None;
        self.session.disconnect();
    }

    fn active_conversation(&self) -> Option<String> {
        match self.state.load().as_ref() {
            LifecycleState::Active { conversation_id } => Some(conversation_id.clone()),
            _ => None,
        }
    }

    fn set_state(&self, state: LifecycleState) {
        self.state.store(Arc::new(state));
    }

    async fn view(&self, event: ViewEvent) {
        if self.view_tx.send(event).await.is_err() {
            debug!(
                component = "conversation",
                event = "conversation.view.closed",
                "View closed, event dropped"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use relaydock_connector::mock_server::{CreateBehavior, MockBackend};
    use relaydock_connector::HealthStatus;
    use relaydock_protocol::rest::ConversationInfo;
    use relaydock_protocol::EventKind;
    use serde_json::json;
    use tokio::time::timeout;

    struct Harness {
        server: MockBackend,
        handle: ConversationHandle,
        view_rx: mpsc::Receiver<ViewEvent>,
        task: JoinHandle<()>,
        _workspace: tempfile::TempDir,
    }

    async fn harness_with(server: MockBackend, tweak: impl FnOnce(&mut Config)) -> Harness {
        let workspace = tempfile::tempdir().unwrap();
        let mut config = Config {
            server_url: server.url(),
            workspace_dir: Some(workspace.path().to_path_buf()),
            health_interval_secs: 3600,
            ..Config::default()
        };
        tweak(&mut config);

        let (view_tx, view_rx) = mpsc::channel(64);
        let manager = ConversationManager::from_config(&config, view_tx).unwrap();
        let (handle, task) = manager.spawn();
        Harness {
            server,
            handle,
            view_rx,
            task,
            _workspace: workspace,
        }
    }

    async fn harness() -> Harness {
        harness_with(MockBackend::start().await, |_| {}).await
    }

    impl Harness {
        async fn prompt(&self, text: &str) {
            self.handle
                .send(ConversationCommand::UserPrompt {
                    text: text.to_string(),
                    image_urls: Vec::new(),
                })
                .await;
        }

        async fn next_view(&mut self) -> ViewEvent {
            timeout(Duration::from_secs(5), self.view_rx.recv())
                .await
                .expect("timed out waiting for view event")
                .expect("view channel closed")
        }

        /// Skips events that do not match, health included.
        async fn wait_for(&mut self, wanted: impl Fn(&ViewEvent) -> bool) -> ViewEvent {
            loop {
                let event = self.next_view().await;
                if wanted(&event) {
                    return event;
                }
            }
        }
    }

    fn active(id: &str) -> LifecycleState {
        LifecycleState::Active {
            conversation_id: id.to_string(),
        }
    }

    #[tokio::test]
    async fn first_prompt_creates_connects_then_sends() {
        let mut h = harness().await;
        h.prompt("hello").await;

        let received = h.server.wait_for_received(1).await;
        assert_eq!(received[0].conversation_id, "conv-1");
        assert_eq!(received[0].name, "oh_user_action");
        assert_eq!(received[0].data["args"]["content"], json!("hello"));

        let requests = h.server.created_requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].initial_user_msg.is_none());

        h.wait_for(|e| *e == ViewEvent::Status("Agent connected".into()))
            .await;
        assert_eq!(h.handle.state(), active("conv-1"));
    }

    #[tokio::test]
    async fn later_prompts_reuse_the_conversation() {
        let h = harness().await;
        h.prompt("one").await;
        h.prompt("two").await;

        let received = h.server.wait_for_received(2).await;
        assert_eq!(received[1].data["args"]["content"], json!("two"));
        assert_eq!(h.server.created_requests().len(), 1);
        assert_eq!(h.server.total_connections(), 1);
    }

    #[tokio::test]
    async fn missing_settings_is_not_a_generic_error() {
        let server = MockBackend::start().await;
        server.set_create(CreateBehavior::SettingsNotFound);
        let mut h = harness_with(server, |_| {}).await;
        h.prompt("hello").await;

        let event = h
            .wait_for(|e| matches!(e, ViewEvent::SettingsRequired(_) | ViewEvent::Error(_)))
            .await;
        assert_eq!(
            event,
            ViewEvent::SettingsRequired(SETTINGS_REQUIRED_MESSAGE.to_string())
        );
        assert_eq!(h.handle.state(), LifecycleState::NoConversation);
        assert_eq!(h.server.total_connections(), 0);
    }

    #[tokio::test]
    async fn create_failure_is_reported() {
        let server = MockBackend::start().await;
        server.set_create(CreateBehavior::Fail {
            status: 500,
            body: "database down".into(),
        });
        let mut h = harness_with(server, |_| {}).await;
        h.prompt("hello").await;

        match h.wait_for(|e| matches!(e, ViewEvent::Error(_))).await {
            ViewEvent::Error(message) => {
                assert!(message.starts_with("Failed to create conversation: "), "{message}");
                assert!(message.contains("database down"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.handle.state(), LifecycleState::NoConversation);
    }

    #[tokio::test]
    async fn new_conversation_fully_detaches_old_session() {
        let mut h = harness().await;
        h.prompt("first").await;
        h.server.wait_for_received(1).await;

        h.handle.send(ConversationCommand::StartNewConversation).await;
        h.wait_for(|e| *e == ViewEvent::ClearChat).await;
        h.wait_for(|e| matches!(e, ViewEvent::Health(_))).await;
        assert_eq!(h.handle.state(), LifecycleState::NoConversation);
        h.server.wait_for_sockets("conv-1", 0).await;
        assert_eq!(h.server.push_event("conv-1", json!({ "id": 1, "observation": "run" })), 0);

        h.prompt("second").await;
        let received = h.server.wait_for_received(2).await;
        assert_eq!(received[1].conversation_id, "conv-2");
        assert_eq!(h.handle.state(), active("conv-2"));
    }

    #[tokio::test]
    async fn delegated_run_round_trip() {
        let h = harness().await;
        h.prompt("list files").await;
        h.server.wait_for_received(1).await;

        h.server.push_event(
            "conv-1",
            json!({
                "id": 42,
                "source": "agent",
                "action": "run",
                "args": { "command": "echo hi" },
                "message": "Running command: echo hi"
            }),
        );

        let received = h.server.wait_for_received(2).await;
        let observation = &received[1];
        assert_eq!(observation.name, "oh_event");
        assert_eq!(observation.data["cause"], json!(42));
        assert_eq!(observation.data["observation"], json!("run"));
        assert_eq!(observation.data["extras"]["exit_code"], json!(0));
        assert!(observation.data["content"].as_str().unwrap().contains("hi"));
    }

    #[tokio::test]
    async fn in_flight_action_is_answered_after_reconnect() {
        let mut h = harness().await;
        h.prompt("build it").await;
        h.server.wait_for_received(1).await;
        h.wait_for(|e| *e == ViewEvent::Status("Agent connected".into()))
            .await;

        h.server.push_event(
            "conv-1",
            json!({
                "id": 77,
                "source": "agent",
                "action": "run",
                "args": { "command": "sleep 0.4; echo done" }
            }),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.server.drop_sockets("conv-1");

        h.wait_for(|e| matches!(e, ViewEvent::Status(s) if s.starts_with("Agent disconnected")))
            .await;
        h.wait_for(|e| *e == ViewEvent::Status("Agent connected".into()))
            .await;

        let received = h.server.wait_for_received(2).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        let answers: Vec<_> = h
            .server
            .received()
            .into_iter()
            .filter(|e| e.data["cause"] == json!(77))
            .collect();
        assert_eq!(answers.len(), 1, "{received:?}");
        assert_eq!(answers[0].conversation_id, "conv-1");
        assert_eq!(answers[0].data["extras"]["exit_code"], json!(0));
        assert!(answers[0].data["content"].as_str().unwrap().contains("done"));
        assert_eq!(h.server.total_connections(), 2);
    }

    #[tokio::test]
    async fn stalled_create_does_not_wedge_the_actor() {
        let server = MockBackend::start().await;
        server.set_create(CreateBehavior::Stall);
        let mut h = harness_with(server, |c| c.request_timeout_secs = 1).await;
        h.prompt("hello").await;

        match h.wait_for(|e| matches!(e, ViewEvent::Error(_))).await {
            ViewEvent::Error(message) => {
                assert!(message.starts_with("Failed to create conversation: "), "{message}")
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.handle.state(), LifecycleState::NoConversation);

        h.handle.send(ConversationCommand::Shutdown).await;
        timeout(Duration::from_secs(5), h.task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn display_events_are_routed_by_kind() {
        let mut h = harness().await;
        h.prompt("hi").await;
        h.server.wait_for_received(1).await;

        h.server.push_event(
            "conv-1",
            json!({ "status_update": true, "type": "info", "message": "Agent is thinking" }),
        );
        h.server.push_event(
            "conv-1",
            json!({ "id": 3, "cause": 2, "observation": "run", "content": "ok" }),
        );

        match h.wait_for(|e| matches!(e, ViewEvent::StatusUpdate(_))).await {
            ViewEvent::StatusUpdate(status) => assert_eq!(status.message, "Agent is thinking"),
            other => panic!("unexpected {other:?}"),
        }
        match h.wait_for(|e| matches!(e, ViewEvent::AgentResponse(_))).await {
            ViewEvent::AgentResponse(event) => assert_eq!(event.kind(), EventKind::Observation),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn health_check_works_without_conversation() {
        let mut h = harness().await;
        // Startup probe
        h.wait_for(|e| matches!(e, ViewEvent::Health(_))).await;

        h.handle.send(ConversationCommand::CheckHealth).await;
        let event = h.wait_for(|e| matches!(e, ViewEvent::Health(_))).await;
        assert_eq!(event, ViewEvent::Health(HealthStatus::Healthy));
        assert_eq!(h.handle.state(), LifecycleState::NoConversation);
    }

    #[tokio::test]
    async fn recent_conversations_are_listed() {
        let server = MockBackend::start().await;
        server.set_recent(vec![ConversationInfo {
            conversation_id: "abc123456789".into(),
            title: Some("Refactor parser".into()),
            last_updated_at: Some("2025-03-01T10:00:00Z".into()),
            created_at: None,
        }]);
        let mut h = harness_with(server, |_| {}).await;
        h.handle.send(ConversationCommand::ListRecent).await;

        match h.wait_for(|e| matches!(e, ViewEvent::RecentConversations(_))).await {
            ViewEvent::RecentConversations(list) => {
                assert_eq!(list.len(), 1);
                assert_eq!(list[0].id, "abc123456789");
                assert_eq!(list[0].title, "Refactor parser");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn resume_attaches_without_creating() {
        let mut h = harness().await;
        h.handle
            .send(ConversationCommand::ResumeConversation {
                conversation_id: "existing-7".into(),
            })
            .await;

        h.wait_for(|e| *e == ViewEvent::ClearChat).await;
        h.wait_for(|e| *e == ViewEvent::Status("Agent connected".into()))
            .await;
        assert_eq!(h.handle.state(), active("existing-7"));
        assert!(h.server.created_requests().is_empty());

        h.prompt("continue").await;
        let received = h.server.wait_for_received(1).await;
        assert_eq!(received[0].conversation_id, "existing-7");
    }

    #[tokio::test]
    async fn silent_agent_triggers_timeout_message() {
        let mut h = harness_with(MockBackend::start().await, |c| c.response_timeout_secs = 1).await;
        h.prompt("hello?").await;

        let event = h.wait_for(|e| matches!(e, ViewEvent::Error(_))).await;
        assert_eq!(
            event,
            ViewEvent::Error("Agent not responding. Please check the server or try again.".into())
        );
    }

    #[tokio::test]
    async fn shutdown_stops_actor_and_session() {
        let h = harness().await;
        h.prompt("hi").await;
        h.server.wait_for_received(1).await;

        h.handle.send(ConversationCommand::Shutdown).await;
        timeout(Duration::from_secs(5), h.task).await.unwrap().unwrap();
        h.server.wait_for_sockets("conv-1", 0).await;
    }
}
