//! Chat runtime: one actor task that owns the active conversation session.
//!
//! Consumers talk to the actor through a cloneable [`ChatRuntimeHandle`].
//! Transport events, page loads, sends and typing timers all come back to the
//! actor through one internal queue, tagged with the session generation they
//! were started for, so nothing addressed to a previous conversation is ever
//! applied to the current one.

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use chat_core::{
    ActiveSession, ChatChannels, ChatCommand, ChatError, ChatErrorCategory, ChatEvent,
    ChatSnapshot, EventSink, EventStream, Message, MessagePage, MessageStatus, MessageTimeline,
    OutgoingFile, PresenceEntry, PresenceEvent, PresenceRoster, SessionStateMachine,
    SessionTransition, SnapshotWatch, TEMP_ID_PREFIX, message_from_row, normalize_error,
    normalize_send_outcome, presence_payload,
};
use chat_platform::{
    Backend, BlobStore, PresenceDiff, PresenceState, ScopedBlobStore, TransportError,
    TransportEvent,
};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

mod config;
mod requests;
mod session;
mod typing;

pub use config::{ChatConfig, ConfigError};

use session::LiveSession;
use typing::TypingDebouncer;

pub(crate) const MESSAGES_TABLE: &str = "messages";

type SendReply = oneshot::Sender<Result<Message, ChatError>>;

#[derive(Clone, Debug)]
pub struct ChatRuntimeHandle {
    channels: ChatChannels,
}

impl ChatRuntimeHandle {
    pub async fn send(&self, command: ChatCommand) -> Result<(), ChatError> {
        self.channels
            .send_command(command)
            .await
            .map_err(|_| ChatError::runtime_closed())
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }

    pub fn snapshots(&self) -> SnapshotWatch {
        self.channels.snapshots()
    }

    /// Switch to `conversation_id`, or go idle with `None` (or a blank id).
    pub async fn select_conversation(
        &self,
        conversation_id: Option<String>,
    ) -> Result<(), ChatError> {
        self.send(ChatCommand::SelectConversation { conversation_id })
            .await
    }

    pub async fn load_more(&self) -> Result<(), ChatError> {
        self.send(ChatCommand::LoadMore).await
    }

    /// Send a message and wait for the backend to confirm it.
    ///
    /// The optimistic row is visible in snapshots before this resolves.
    pub async fn send_message(
        &self,
        body: Option<String>,
        files: Vec<OutgoingFile>,
    ) -> Result<Message, ChatError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(ChatCommand::SendMessage {
            body,
            files,
            reply: Some(reply_tx),
        })
        .await?;
        reply_rx.await.map_err(|_| ChatError::runtime_closed())?
    }

    pub async fn mark_as_read(&self, message_id: impl Into<String>) -> Result<(), ChatError> {
        self.send(ChatCommand::MarkAsRead {
            message_id: message_id.into(),
        })
        .await
    }

    pub async fn set_typing(&self, typing: bool) -> Result<(), ChatError> {
        self.send(ChatCommand::SetTyping { typing }).await
    }

    /// Tear down the active session and stop the runtime.
    ///
    /// Resolves once teardown finished. Calling it on a stopped runtime is a no-op.
    pub async fn shutdown(&self) -> Result<(), ChatError> {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .send(ChatCommand::Shutdown {
                done: Some(done_tx),
            })
            .await
            .is_err()
        {
            return Ok(());
        }
        let _ = done_rx.await;
        Ok(())
    }
}

pub fn spawn_runtime(backend: Backend, config: ChatConfig) -> ChatRuntimeHandle {
    let (channels, command_rx) = ChatChannels::new(config.command_buffer, config.event_buffer);
    let runtime = ChatRuntime::new(channels.sink(), command_rx, backend, config);
    tokio::spawn(async move {
        runtime.run().await;
    });

    ChatRuntimeHandle { channels }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PageKind {
    Initial,
    Older,
}

/// Work that finished outside the actor and must be applied by it.
pub(crate) enum RuntimeInput {
    Transport {
        generation: u64,
        event: TransportEvent,
    },
    PageLoaded {
        generation: u64,
        kind: PageKind,
        result: Result<MessagePage, ChatError>,
    },
    SendFinished {
        generation: u64,
        temp_id: String,
        result: Result<Message, ChatError>,
        reply: Option<SendReply>,
    },
    TypingExpired {
        generation: u64,
        token: u64,
    },
}

struct ChatRuntime {
    sink: EventSink,
    command_rx: mpsc::Receiver<ChatCommand>,
    input_tx: mpsc::UnboundedSender<RuntimeInput>,
    input_rx: mpsc::UnboundedReceiver<RuntimeInput>,
    backend: Backend,
    attachments: ScopedBlobStore<Arc<dyn BlobStore>>,
    config: ChatConfig,
    state_machine: SessionStateMachine,
    session: Option<LiveSession>,
    roster: PresenceRoster,
    timeline: Option<MessageTimeline>,
    typing: TypingDebouncer,
}

impl ChatRuntime {
    fn new(
        sink: EventSink,
        command_rx: mpsc::Receiver<ChatCommand>,
        backend: Backend,
        config: ChatConfig,
    ) -> Self {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let attachments = ScopedBlobStore::new(backend.blobs.clone(), &config.attachment_bucket);
        let typing = TypingDebouncer::new(config.typing_idle());
        Self {
            sink,
            command_rx,
            input_tx,
            input_rx,
            backend,
            attachments,
            config,
            state_machine: SessionStateMachine::default(),
            session: None,
            roster: PresenceRoster::new(),
            timeline: None,
            typing,
        }
    }

    async fn run(mut self) {
        info!(user_id = %self.config.user.id, "chat runtime started");
        let mut done = None;
        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(ChatCommand::Shutdown { done: reply }) => {
                        done = reply;
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("all runtime handles dropped");
                        break;
                    }
                },
                Some(input) = self.input_rx.recv() => self.handle_input(input).await,
            }
        }

        self.state_machine.shutdown();
        self.close_session().await;
        self.publish_snapshot();
        info!("chat runtime stopped");
        // Close the command channel before acknowledging.
        drop(self);
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    async fn handle_command(&mut self, command: ChatCommand) {
        match command {
            ChatCommand::SelectConversation { conversation_id } => {
                self.handle_select(conversation_id).await
            }
            ChatCommand::LoadMore => self.handle_load_more(),
            ChatCommand::SendMessage { body, files, reply } => {
                self.handle_send_message(body, files, reply)
            }
            ChatCommand::MarkAsRead { message_id } => self.handle_mark_as_read(message_id),
            ChatCommand::SetTyping { typing } => self.handle_set_typing(typing),
            // Intercepted by the run loop.
            ChatCommand::Shutdown { .. } => {}
        }
    }

    async fn handle_select(&mut self, conversation_id: Option<String>) {
        match self.state_machine.select(conversation_id.as_deref()) {
            SessionTransition::Unchanged => {
                debug!(?conversation_id, "conversation already selected");
            }
            SessionTransition::Activate { previous, next } => {
                self.close_session().await;
                info!(
                    previous = previous.as_ref().map(|p| p.conversation_id.as_str()),
                    conversation_id = %next.conversation_id,
                    generation = next.generation,
                    "switching conversation"
                );
                self.open_session(next).await;
            }
            SessionTransition::Deactivate { previous } => {
                self.close_session().await;
                info!(conversation_id = %previous.conversation_id, "conversation deselected");
                self.sink.emit(ChatEvent::SessionChanged {
                    conversation_id: None,
                });
                self.publish_snapshot();
            }
        }
    }

    async fn open_session(&mut self, next: ActiveSession) {
        let initial_presence = presence_payload(&self.config.user, false, now_millis());
        let (session, errors) = LiveSession::open(
            next.clone(),
            self.backend.pubsub.clone(),
            &self.config.presence_key,
            initial_presence,
            &self.input_tx,
        )
        .await;
        for err in &errors {
            self.sink.emit(normalize_error(err));
        }

        let mut timeline = MessageTimeline::new(&next.conversation_id, self.config.page_size);
        timeline.begin_initial_load();
        let page_size = timeline.page_size();
        self.timeline = Some(timeline);
        self.session = Some(session);
        self.spawn_page_load(&next, PageKind::Initial, None, page_size);

        self.sink.emit(ChatEvent::SessionChanged {
            conversation_id: Some(next.conversation_id),
        });
        self.publish_timeline();
        self.publish_presence();
    }

    /// Drop all per-conversation state and release the session's channels.
    async fn close_session(&mut self) {
        self.typing.cancel();
        self.roster.clear();
        self.timeline = None;
        let Some(session) = self.session.take() else {
            return;
        };
        let errors = session
            .close(self.backend.pubsub.as_ref(), &self.config.presence_key)
            .await;
        for err in &errors {
            self.sink.emit(normalize_error(err));
        }
    }

    fn handle_load_more(&mut self) {
        let active = match self.state_machine.require_active("load_more") {
            Ok(active) => active.clone(),
            Err(err) => return self.report(err),
        };
        let Some(timeline) = self.timeline.as_mut() else {
            return;
        };
        let Some(cursor) = timeline.begin_load_more() else {
            debug!(
                conversation_id = %active.conversation_id,
                loading = timeline.is_loading(),
                "load_more skipped"
            );
            return;
        };
        let page_size = timeline.page_size();
        self.spawn_page_load(&active, PageKind::Older, Some(cursor), page_size);
        self.publish_timeline();
    }

    fn spawn_page_load(
        &self,
        active: &ActiveSession,
        kind: PageKind,
        before_ms: Option<u64>,
        page_size: usize,
    ) {
        let rows = self.backend.rows.clone();
        let input_tx = self.input_tx.clone();
        let conversation_id = active.conversation_id.clone();
        let generation = active.generation;
        tokio::spawn(async move {
            let result =
                requests::load_page(rows.as_ref(), &conversation_id, before_ms, page_size).await;
            let _ = input_tx.send(RuntimeInput::PageLoaded {
                generation,
                kind,
                result,
            });
        });
    }

    fn handle_send_message(
        &mut self,
        body: Option<String>,
        files: Vec<OutgoingFile>,
        reply: Option<SendReply>,
    ) {
        let Some(active) = self.state_machine.active().cloned() else {
            let err = ChatError::new(
                ChatErrorCategory::Config,
                "no_conversation_selected",
                "select a conversation before sending",
            );
            warn!(code = %err.code, "send rejected");
            self.sink.emit(normalize_error(&err));
            if let Some(reply) = reply {
                let _ = reply.send(Err(err));
            }
            return;
        };

        let temp_id = format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4());
        let now = now_millis();
        let optimistic = Message {
            id: temp_id.clone(),
            conversation_id: active.conversation_id.clone(),
            sender_id: self.config.user.id.clone(),
            body: body.clone(),
            attachments: Vec::new(),
            status: MessageStatus::Sent,
            metadata: Map::new(),
            created_at_ms: now,
            updated_at_ms: Some(now),
        };
        if let Some(timeline) = self.timeline.as_mut() {
            timeline.push_optimistic(optimistic);
        }
        debug!(%temp_id, files = files.len(), "optimistic message queued");
        self.publish_timeline();

        let rows = self.backend.rows.clone();
        let blobs = self.attachments.clone();
        let sender_id = self.config.user.id.clone();
        let input_tx = self.input_tx.clone();
        tokio::spawn(async move {
            let result = requests::send_message(
                rows,
                blobs,
                active.conversation_id,
                sender_id,
                body,
                files,
            )
            .await;
            let _ = input_tx.send(RuntimeInput::SendFinished {
                generation: active.generation,
                temp_id,
                result,
                reply,
            });
        });
    }

    fn handle_mark_as_read(&mut self, message_id: String) {
        let active = match self.state_machine.require_active("mark_as_read") {
            Ok(active) => active.clone(),
            Err(err) => return self.report(err),
        };
        let rows = self.backend.rows.clone();
        tokio::spawn(async move {
            match requests::mark_as_read(rows.as_ref(), &active.conversation_id, &message_id).await
            {
                Ok(()) => debug!(%message_id, "message marked as read"),
                Err(err) => warn!(%message_id, code = %err.code, error = %err.message, "mark as read failed"),
            }
        });
    }

    fn handle_set_typing(&mut self, typing: bool) {
        let active = match self.state_machine.require_active("set_typing") {
            Ok(active) => active.clone(),
            Err(err) => return self.report(err),
        };
        self.publish_typing(typing);
        self.typing.set(typing, active.generation, &self.input_tx);
    }

    /// Publish the local typing flag and mirror it into the roster right away.
    fn publish_typing(&mut self, typing: bool) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        session.publish_presence(presence_payload(&self.config.user, typing, now_millis()));
        self.roster
            .set_local_typing(&self.config.user.id, &self.config.presence_key, typing);
        self.publish_presence();
    }

    async fn handle_input(&mut self, input: RuntimeInput) {
        match input {
            RuntimeInput::Transport { generation, event } => {
                if self.is_stale(generation, "transport event") {
                    return;
                }
                self.apply_transport_event(event);
            }
            RuntimeInput::PageLoaded {
                generation,
                kind,
                result,
            } => {
                if self.is_stale(generation, "page result") {
                    return;
                }
                self.apply_page(kind, result);
            }
            RuntimeInput::SendFinished {
                generation,
                temp_id,
                result,
                reply,
            } => {
                self.sink.emit(normalize_send_outcome(&temp_id, &result));
                if !self.is_stale(generation, "send result") {
                    self.apply_send_result(&temp_id, &result);
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            RuntimeInput::TypingExpired { generation, token } => {
                if !self.typing.expire(token) || self.is_stale(generation, "typing expiry") {
                    return;
                }
                debug!("typing idle; clearing flag");
                self.publish_typing(false);
            }
        }
    }

    fn is_stale(&self, generation: u64, what: &str) -> bool {
        if self.state_machine.is_current(generation) {
            return false;
        }
        debug!(
            generation,
            state = %self.state_machine.state(),
            "discarding stale {what}"
        );
        true
    }

    fn apply_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Presence(diff) => {
                if self.roster.apply(&presence_event(diff)) {
                    self.publish_presence();
                }
            }
            TransportEvent::RowInserted { row, .. } => {
                let changed = match (self.decode_feed_row(row), self.timeline.as_mut()) {
                    (Some(message), Some(timeline)) => timeline.insert_live(message),
                    _ => false,
                };
                if changed {
                    self.publish_timeline();
                }
            }
            TransportEvent::RowUpdated { row, .. } => {
                let changed = match (self.decode_feed_row(row), self.timeline.as_mut()) {
                    (Some(message), Some(timeline)) => timeline.update_live(message),
                    _ => false,
                };
                if changed {
                    self.publish_timeline();
                }
            }
        }
    }

    /// Decode a live row, dropping it when malformed or addressed elsewhere.
    fn decode_feed_row(&self, row: Value) -> Option<Message> {
        let message = match message_from_row(row) {
            Ok(message) => message,
            Err(err) => {
                warn!(code = %err.code, error = %err.message, "ignoring malformed live row");
                return None;
            }
        };
        let active = self.state_machine.active()?;
        if message.conversation_id != active.conversation_id {
            debug!(
                message_id = %message.id,
                conversation_id = %message.conversation_id,
                "discarding live row for another conversation"
            );
            return None;
        }
        Some(message)
    }

    fn apply_page(&mut self, kind: PageKind, result: Result<MessagePage, ChatError>) {
        let Some(timeline) = self.timeline.as_mut() else {
            return;
        };
        match result {
            Ok(page) => match kind {
                PageKind::Initial => timeline.apply_initial_page(page),
                PageKind::Older => timeline.apply_older_page(page),
            },
            Err(err) => {
                warn!(?kind, code = %err.code, error = %err.message, "message page failed");
                timeline.fail_page();
                self.sink.emit(normalize_error(&err));
            }
        }
        self.publish_timeline();
    }

    fn apply_send_result(&mut self, temp_id: &str, result: &Result<Message, ChatError>) {
        let Some(timeline) = self.timeline.as_mut() else {
            return;
        };
        let changed = match result {
            Ok(message) => {
                debug!(%temp_id, message_id = %message.id, "send confirmed");
                timeline.confirm_optimistic(temp_id, message.clone())
            }
            Err(err) => {
                warn!(%temp_id, code = %err.code, error = %err.message, "send failed");
                timeline.mark_failed(temp_id)
            }
        };
        if changed {
            self.publish_timeline();
        }
    }

    fn report(&self, err: ChatError) {
        warn!(code = %err.code, error = %err.message, "command rejected");
        self.sink.emit(normalize_error(&err));
    }

    fn snapshot(&self) -> ChatSnapshot {
        ChatSnapshot {
            conversation_id: self
                .state_machine
                .active()
                .map(|active| active.conversation_id.clone()),
            timeline: self
                .timeline
                .as_ref()
                .map(MessageTimeline::snapshot)
                .unwrap_or_default(),
            presence: self.roster.snapshot(),
        }
    }

    fn publish_snapshot(&self) {
        self.sink.publish_snapshot(self.snapshot());
    }

    fn publish_timeline(&self) {
        if let Some(timeline) = &self.timeline {
            self.sink.emit(ChatEvent::TimelineUpdated {
                conversation_id: timeline.conversation_id().to_owned(),
                snapshot: timeline.snapshot(),
            });
        }
        self.publish_snapshot();
    }

    fn publish_presence(&self) {
        if let Some(active) = self.state_machine.active() {
            self.sink.emit(ChatEvent::PresenceUpdated {
                conversation_id: active.conversation_id.clone(),
                snapshot: self.roster.snapshot(),
            });
        }
        self.publish_snapshot();
    }
}

fn presence_event(diff: PresenceDiff) -> PresenceEvent {
    fn entries(states: Vec<PresenceState>) -> Vec<PresenceEntry> {
        states
            .into_iter()
            .map(|state| PresenceEntry::new(state.key, state.metas))
            .collect()
    }

    match diff {
        PresenceDiff::Sync { state } => PresenceEvent::Sync {
            state: entries(state),
        },
        PresenceDiff::Join { new_presences } => PresenceEvent::Join {
            new_presences: entries(new_presences),
        },
        PresenceDiff::Leave { left_presences } => PresenceEvent::Leave {
            left_presences: entries(left_presences),
        },
    }
}

pub(crate) fn map_transport_error(operation: &str, err: TransportError) -> ChatError {
    match err {
        TransportError::Unavailable(message) => ChatError::transport(
            operation,
            format!("backend unavailable during {operation}: {message}"),
        ),
        TransportError::Rejected(message) => ChatError::transport(
            operation,
            format!("backend rejected {operation}: {message}"),
        ),
        TransportError::NotFound(message) => ChatError::transport(
            operation,
            format!("target missing during {operation}: {message}"),
        ),
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
