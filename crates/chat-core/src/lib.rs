//! Core conversation state shared between the runtime and rendering consumers.
//!
//! This crate defines the message and presence data model, the presence roster
//! and typing projection, the message timeline reconciliation buffer, the
//! session lifecycle state machine, and the command/event channel set.

/// Async command/event/snapshot channel primitives.
pub mod channel;
/// Stable chat error types.
pub mod error;
/// Payload normalization (presence metadata, message rows, send acknowledgements).
pub mod normalization;
/// Presence roster and typing projection.
pub mod presence;
/// Conversation session state machine.
pub mod state_machine;
/// Message timeline reconciliation buffer.
pub mod timeline;
/// Data model and frontend-facing protocol types.
pub mod types;

pub use channel::{ChatChannelError, ChatChannels, EventSink, EventStream, SnapshotWatch};
pub use error::{ChatError, ChatErrorCategory};
pub use normalization::{
    message_from_row, normalize_error, normalize_send_outcome, presence_payload,
    presence_user_from_entry,
};
pub use presence::{PresenceRoster, typing_by_user_id};
pub use state_machine::{ActiveSession, SessionState, SessionStateMachine, SessionTransition};
pub use timeline::{DEFAULT_PAGE_SIZE, MessagePage, MessageTimeline};
pub use types::{
    Attachment, ChatCommand, ChatEvent, ChatSnapshot, CurrentUser, Message, MessageStatus,
    OutgoingFile, PresenceEntry, PresenceEvent, PresenceSnapshot, PresenceUser, SendAck,
    TEMP_ID_PREFIX, TimelineSnapshot,
};
