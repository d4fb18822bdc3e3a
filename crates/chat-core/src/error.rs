use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state_machine::SessionState;

/// Broad error category used for user-facing handling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatErrorCategory {
    /// Subscribe, publish, query, insert or update failed.
    Transport,
    /// One or more attachment uploads failed.
    PartialUpload,
    /// An event or row was missing expected fields.
    MalformedPayload,
    /// Invalid input or unsupported state.
    Config,
    /// Internal bug or invariant break.
    Internal,
}

/// Stable error payload emitted across the command/event boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct ChatError {
    /// High-level error category.
    pub category: ChatErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl ChatError {
    /// Construct a new error.
    pub fn new(
        category: ChatErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Transport failure for the named operation.
    pub fn transport(operation: &str, message: impl Into<String>) -> Self {
        Self::new(
            ChatErrorCategory::Transport,
            format!("{operation}_failed"),
            message,
        )
    }

    /// Payload that could not be interpreted.
    pub fn malformed(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ChatErrorCategory::MalformedPayload, code, message)
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: &SessionState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            ChatErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while session is {current}"),
        )
    }

    /// The runtime is gone and can no longer accept commands.
    pub fn runtime_closed() -> Self {
        Self::new(
            ChatErrorCategory::Internal,
            "runtime_closed",
            "chat runtime is no longer running",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_invalid_state_error_code_stable() {
        let err = ChatError::invalid_state(&SessionState::Idle, "load_more");
        assert_eq!(err.code, "invalid_state_transition");
        assert_eq!(err.category, ChatErrorCategory::Internal);
        assert!(err.message.contains("idle"));
    }

    #[test]
    fn transport_codes_are_derived_from_operation() {
        let err = ChatError::transport("insert", "connection reset");
        assert_eq!(err.code, "insert_failed");
        assert_eq!(err.category, ChatErrorCategory::Transport);
        assert_eq!(
            err.to_string(),
            "Transport:insert_failed: connection reset"
        );
    }
}
