use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ChatError;

/// Prefix marking locally synthesized message ids that have not been confirmed yet.
pub const TEMP_ID_PREFIX: &str = "temp-";

/// Delivery status of a message row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Accepted by the backend.
    #[default]
    Sent,
    /// Delivered to at least one recipient device.
    Delivered,
    /// Read by the recipient.
    Read,
}

/// File attached to a message after a successful upload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    /// Public URL of the uploaded blob.
    pub url: String,
    /// Original file name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// MIME content type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    /// Size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// One message row of a conversation timeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Server-assigned id, or a `temp-` id for optimistic rows.
    pub id: String,
    /// Owning conversation.
    pub conversation_id: String,
    /// Author user id.
    pub sender_id: String,
    /// Optional text body.
    #[serde(default)]
    pub body: Option<String>,
    /// Attachments in upload order.
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Delivery status.
    #[serde(default)]
    pub status: MessageStatus,
    /// Opaque metadata; `failed: true` marks an optimistic row whose send failed.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Creation time in milliseconds since Unix epoch.
    pub created_at_ms: u64,
    /// Last update time in milliseconds since Unix epoch.
    #[serde(default)]
    pub updated_at_ms: Option<u64>,
}

impl Message {
    /// Whether this row is a local optimistic placeholder.
    pub fn is_temporary(&self) -> bool {
        self.id.starts_with(TEMP_ID_PREFIX)
    }

    /// Whether this row is an optimistic placeholder whose send failed.
    pub fn is_failed(&self) -> bool {
        self.metadata
            .get("failed")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// One entry of a conversation's presence roster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceUser {
    /// Per-connection presence key. One user may hold several.
    pub key: String,
    /// User id, `"unknown"` when the payload carried none.
    pub user_id: String,
    /// Display name, empty when unknown.
    pub display_name: String,
    /// Optional participant role.
    pub role: Option<String>,
    /// Optional avatar URL.
    pub avatar_url: Option<String>,
    /// Whether this connection reports an active typing intent.
    pub typing: bool,
    /// Optional "online since" marker as reported by the peer.
    pub online_at: Option<String>,
}

/// Identity of the local user, published as presence metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CurrentUser {
    /// User id.
    pub id: String,
    /// Optional display name.
    pub display_name: Option<String>,
    /// Optional participant role.
    pub role: Option<String>,
    /// Optional avatar URL.
    pub avatar_url: Option<String>,
}

/// Local file queued for upload as part of a send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingFile {
    /// File name, used in the storage path and attachment record.
    pub name: String,
    /// MIME content type.
    pub content_type: String,
    /// Raw bytes.
    pub data: Vec<u8>,
}

impl OutgoingFile {
    pub fn new(
        name: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            data: data.into(),
        }
    }
}

/// Raw presence state as delivered by the channel: key plus stacked metadata history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceEntry {
    /// Presence key.
    pub key: String,
    /// Metadata history for the key, oldest first.
    pub metas: Vec<Value>,
}

impl PresenceEntry {
    pub fn new(key: impl Into<String>, metas: Vec<Value>) -> Self {
        Self {
            key: key.into(),
            metas,
        }
    }
}

/// Presence channel event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum PresenceEvent {
    /// Full roster replacement.
    Sync { state: Vec<PresenceEntry> },
    /// Incremental additions.
    Join { new_presences: Vec<PresenceEntry> },
    /// Incremental removals.
    Leave { left_presences: Vec<PresenceEntry> },
}

/// Timeline state handed to the rendering layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TimelineSnapshot {
    /// Messages in display order.
    pub messages: Vec<Message>,
    /// Whether a page request is in flight.
    pub loading: bool,
    /// Whether older messages may exist.
    pub has_more: bool,
}

/// Presence state handed to the rendering layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PresenceSnapshot {
    /// Roster entries in channel order.
    pub roster: Vec<PresenceUser>,
    /// Typing flag per user id.
    pub typing_by_user_id: BTreeMap<String, bool>,
}

/// Complete state of the active session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ChatSnapshot {
    /// Active conversation, `None` when idle.
    pub conversation_id: Option<String>,
    /// Timeline state.
    pub timeline: TimelineSnapshot,
    /// Presence state.
    pub presence: PresenceSnapshot,
}

/// Commands accepted by the chat runtime.
#[derive(Debug)]
pub enum ChatCommand {
    /// Switch to a conversation, or go idle with `None`.
    SelectConversation { conversation_id: Option<String> },
    /// Fetch the next older page.
    LoadMore,
    /// Optimistically send a message; the outcome is delivered on `reply`.
    SendMessage {
        body: Option<String>,
        files: Vec<OutgoingFile>,
        reply: Option<tokio::sync::oneshot::Sender<Result<Message, ChatError>>>,
    },
    /// Mark one message as read (fire-and-forget).
    MarkAsRead { message_id: String },
    /// Publish the local typing intent.
    SetTyping { typing: bool },
    /// Tear down the active session and stop the runtime; `done` fires after teardown.
    Shutdown {
        done: Option<tokio::sync::oneshot::Sender<()>>,
    },
}

/// Acknowledgement for a send, keyed by the optimistic id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendAck {
    /// Temporary id of the optimistic row.
    pub temp_id: String,
    /// Confirmed message id on success.
    pub message_id: Option<String>,
    /// Stable error code on failure.
    pub error_code: Option<String>,
}

/// Events emitted by the chat runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ChatEvent {
    /// The active conversation changed.
    SessionChanged { conversation_id: Option<String> },
    /// The timeline of the active conversation changed.
    TimelineUpdated {
        conversation_id: String,
        snapshot: TimelineSnapshot,
    },
    /// The roster of the active conversation changed.
    PresenceUpdated {
        conversation_id: String,
        snapshot: PresenceSnapshot,
    },
    /// A send finished.
    SendAck(SendAck),
    /// A non-fatal failure surfaced for display.
    Error { code: String, message: String },
}
