use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};

use crate::types::{ChatCommand, ChatEvent, ChatSnapshot};

/// Event receiver handed to each rendering subscriber.
pub type EventStream = broadcast::Receiver<ChatEvent>;

/// Latest-snapshot receiver used by renderers.
pub type SnapshotWatch = watch::Receiver<ChatSnapshot>;

/// Errors returned by chat channel operations.
#[derive(Debug, Error)]
pub enum ChatChannelError {
    /// The runtime dropped its command receiver.
    #[error("command channel is closed")]
    CommandChannelClosed,
}

/// Output half of the channel set: events and snapshots.
///
/// The runtime holds only this half so that dropping every handle closes the
/// command channel.
#[derive(Clone, Debug)]
pub struct EventSink {
    event_tx: broadcast::Sender<ChatEvent>,
    snapshot_tx: watch::Sender<ChatSnapshot>,
}

impl EventSink {
    /// Fan an event out to current subscribers. Having none is not an error.
    pub fn emit(&self, event: ChatEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Replace the latest snapshot, even when nobody is watching.
    pub fn publish_snapshot(&self, snapshot: ChatSnapshot) {
        self.snapshot_tx.send_replace(snapshot);
    }
}

/// Command/event/snapshot channel set shared by the runtime and its handles.
#[derive(Clone, Debug)]
pub struct ChatChannels {
    command_tx: mpsc::Sender<ChatCommand>,
    sink: EventSink,
}

impl ChatChannels {
    /// Build the channel set; the runtime keeps the returned receiver.
    pub fn new(
        command_buffer: usize,
        event_buffer: usize,
    ) -> (Self, mpsc::Receiver<ChatCommand>) {
        let (command_tx, command_rx) = mpsc::channel(command_buffer.max(1));
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));
        let (snapshot_tx, _) = watch::channel(ChatSnapshot::default());

        (
            Self {
                command_tx,
                sink: EventSink {
                    event_tx,
                    snapshot_tx,
                },
            },
            command_rx,
        )
    }

    /// Subscribe to emitted chat events.
    pub fn subscribe(&self) -> EventStream {
        self.sink.event_tx.subscribe()
    }

    /// Watch the latest published snapshot.
    pub fn snapshots(&self) -> SnapshotWatch {
        self.sink.snapshot_tx.subscribe()
    }

    /// Queue a command, waiting for capacity.
    pub async fn send_command(&self, command: ChatCommand) -> Result<(), ChatChannelError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| ChatChannelError::CommandChannelClosed)
    }

    /// Clone the output half for the runtime.
    pub fn sink(&self) -> EventSink {
        self.sink.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queued_command_reaches_runtime_side() {
        let (channels, mut rx) = ChatChannels::new(8, 8);
        channels
            .send_command(ChatCommand::SelectConversation {
                conversation_id: Some("c1".into()),
            })
            .await
            .expect("select should enqueue");

        let cmd = rx.recv().await.expect("runtime side should receive the select");
        match cmd {
            ChatCommand::SelectConversation { conversation_id } => {
                assert_eq!(conversation_id.as_deref(), Some("c1"))
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn every_subscriber_gets_each_event() {
        let (channels, _) = ChatChannels::new(4, 16);
        let mut a = channels.subscribe();
        let mut b = channels.subscribe();

        channels.sink().emit(ChatEvent::SessionChanged {
            conversation_id: None,
        });

        let event_a = a.recv().await.expect("subscriber a should receive event");
        let event_b = b.recv().await.expect("subscriber b should receive event");
        assert_eq!(event_a, event_b);
    }

    #[tokio::test]
    async fn snapshot_watchers_see_latest_value() {
        let (channels, _) = ChatChannels::new(4, 4);
        let watcher = channels.snapshots();
        channels.sink().publish_snapshot(ChatSnapshot {
            conversation_id: Some("c1".into()),
            ..ChatSnapshot::default()
        });
        assert_eq!(watcher.borrow().conversation_id.as_deref(), Some("c1"));
    }
}
