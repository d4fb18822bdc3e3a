use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ChatError;

/// One activation of a conversation. The generation increases on every activation,
/// so re-selecting a conversation never revives results addressed to an older one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActiveSession {
    pub conversation_id: String,
    pub generation: u64,
}

/// Session lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No conversation selected.
    #[default]
    Idle,
    /// Exactly one conversation is bound to live subscriptions.
    Active(ActiveSession),
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Active(session) => write!(
                f,
                "active({}#{})",
                session.conversation_id, session.generation
            ),
        }
    }
}

/// Work the caller must perform to realize a state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTransition {
    /// Already in the requested state.
    Unchanged,
    /// Tear down `previous` (when present), then subscribe `next`.
    Activate {
        previous: Option<ActiveSession>,
        next: ActiveSession,
    },
    /// Tear down `previous` and stay idle.
    Deactivate { previous: ActiveSession },
}

#[derive(Debug, Clone, Default)]
pub struct SessionStateMachine {
    state: SessionState,
    last_generation: u64,
}

impl SessionStateMachine {
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn active(&self) -> Option<&ActiveSession> {
        match &self.state {
            SessionState::Active(session) => Some(session),
            SessionState::Idle => None,
        }
    }

    /// Select a conversation, or go idle with `None` or a blank id.
    pub fn select(&mut self, conversation_id: Option<&str>) -> SessionTransition {
        let target = conversation_id
            .map(str::trim)
            .filter(|value| !value.is_empty());

        match (target, self.state.clone()) {
            (None, SessionState::Idle) => SessionTransition::Unchanged,
            (None, SessionState::Active(previous)) => {
                self.state = SessionState::Idle;
                SessionTransition::Deactivate { previous }
            }
            (Some(id), SessionState::Active(current)) if current.conversation_id == id => {
                SessionTransition::Unchanged
            }
            (Some(id), state) => {
                let previous = match state {
                    SessionState::Active(previous) => Some(previous),
                    SessionState::Idle => None,
                };
                self.last_generation = self.last_generation.saturating_add(1);
                let next = ActiveSession {
                    conversation_id: id.to_owned(),
                    generation: self.last_generation,
                };
                self.state = SessionState::Active(next.clone());
                SessionTransition::Activate { previous, next }
            }
        }
    }

    /// Force the idle state, returning the session that was active.
    pub fn shutdown(&mut self) -> Option<ActiveSession> {
        match std::mem::take(&mut self.state) {
            SessionState::Active(previous) => Some(previous),
            SessionState::Idle => None,
        }
    }

    /// Return the active session or an invalid-state error naming `action`.
    pub fn require_active(&self, action: &str) -> Result<&ActiveSession, ChatError> {
        self.active()
            .ok_or_else(|| ChatError::invalid_state(&self.state, action))
    }

    /// Whether a result tagged with `generation` still belongs to the active session.
    pub fn is_current(&self, generation: u64) -> bool {
        self.active()
            .is_some_and(|session| session.generation == generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_select_switch_deselect_path() {
        let mut sm = SessionStateMachine::default();

        let first = sm.select(Some("conv-a"));
        let SessionTransition::Activate { previous, next } = first else {
            panic!("first select must activate");
        };
        assert_eq!(previous, None);
        assert_eq!(next.conversation_id, "conv-a");
        assert_eq!(next.generation, 1);

        let second = sm.select(Some("conv-b"));
        let SessionTransition::Activate { previous, next } = second else {
            panic!("switch must activate");
        };
        assert_eq!(
            previous.map(|session| session.conversation_id),
            Some("conv-a".to_owned())
        );
        assert_eq!(next.generation, 2);

        let third = sm.select(None);
        assert!(matches!(third, SessionTransition::Deactivate { .. }));
        assert_eq!(sm.state(), &SessionState::Idle);
    }

    #[test]
    fn reselecting_active_conversation_is_a_no_op() {
        let mut sm = SessionStateMachine::default();
        sm.select(Some("conv-a"));
        assert_eq!(sm.select(Some("conv-a")), SessionTransition::Unchanged);
        assert_eq!(sm.active().map(|s| s.generation), Some(1));
    }

    #[test]
    fn blank_id_deselects() {
        let mut sm = SessionStateMachine::default();
        assert_eq!(sm.select(Some("   ")), SessionTransition::Unchanged);
        sm.select(Some("conv-a"));
        assert!(matches!(
            sm.select(Some("")),
            SessionTransition::Deactivate { .. }
        ));
    }

    #[test]
    fn returning_to_a_conversation_bumps_generation() {
        let mut sm = SessionStateMachine::default();
        sm.select(Some("conv-a"));
        sm.select(Some("conv-b"));
        sm.select(Some("conv-a"));

        assert!(!sm.is_current(1));
        assert!(!sm.is_current(2));
        assert!(sm.is_current(3));
    }

    #[test]
    fn rejects_session_commands_while_idle() {
        let sm = SessionStateMachine::default();
        let err = sm
            .require_active("send_message")
            .expect_err("idle session must reject send");
        assert_eq!(err.code, "invalid_state_transition");
    }

    #[test]
    fn shutdown_returns_active_session() {
        let mut sm = SessionStateMachine::default();
        assert_eq!(sm.shutdown(), None);
        sm.select(Some("conv-a"));
        let previous = sm.shutdown().expect("active session should be returned");
        assert_eq!(previous.conversation_id, "conv-a");
        assert_eq!(sm.state(), &SessionState::Idle);
    }
}
