use std::time::Duration;

use tokio::{sync::mpsc, task::JoinHandle};
use tracing::trace;

use crate::RuntimeInput;

#[derive(Debug)]
struct PendingTimer {
    token: u64,
    task: JoinHandle<()>,
}

/// Single-slot inactivity timer for the local typing flag.
///
/// At most one timer is pending. Arming a new one aborts the previous one, and
/// every timer carries a token so an expiry that raced with a re-arm is ignored.
#[derive(Debug)]
pub(crate) struct TypingDebouncer {
    idle: Duration,
    pending: Option<PendingTimer>,
    next_token: u64,
}

impl TypingDebouncer {
    pub(crate) fn new(idle: Duration) -> Self {
        Self {
            idle,
            pending: None,
            next_token: 0,
        }
    }

    /// Cancel the pending timer and, when `typing`, arm a fresh one that posts
    /// `TypingExpired` for `generation` after the idle delay.
    pub(crate) fn set(
        &mut self,
        typing: bool,
        generation: u64,
        input_tx: &mpsc::UnboundedSender<RuntimeInput>,
    ) {
        self.cancel();
        if !typing {
            return;
        }

        self.next_token += 1;
        let token = self.next_token;
        let idle = self.idle;
        let input_tx = input_tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            let _ = input_tx.send(RuntimeInput::TypingExpired { generation, token });
        });
        self.pending = Some(PendingTimer { token, task });
    }

    /// Consume an expiry. Returns `false` for a token that is no longer pending.
    pub(crate) fn expire(&mut self, token: u64) -> bool {
        match &self.pending {
            Some(pending) if pending.token == token => {
                self.pending = None;
                true
            }
            _ => {
                trace!(token, "stale typing expiry ignored");
                false
            }
        }
    }

    pub(crate) fn cancel(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.task.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn is_armed(&self) -> bool {
        self.pending.is_some()
    }
}

impl Drop for TypingDebouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}
