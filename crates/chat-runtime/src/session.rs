use std::sync::Arc;

use chat_core::{ActiveSession, ChatError};
use chat_platform::{EventFilter, Filter, PubSub, Subscription};
use serde_json::Value;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{MESSAGES_TABLE, RuntimeInput, map_transport_error};

pub(crate) fn presence_topic(conversation_id: &str) -> String {
    format!("presence:conversation:{conversation_id}")
}

pub(crate) fn feed_topic(conversation_id: &str) -> String {
    format!("public:messages:conversation={conversation_id}")
}

/// Channel subscriptions and background tasks owned by one active conversation.
///
/// Every transport event is forwarded to the runtime tagged with the session
/// generation. Presence publishes go through one sequential task so a typing
/// `true` can never overtake the `false` that follows it.
pub(crate) struct LiveSession {
    active: ActiveSession,
    presence_topic: String,
    feed_topic: String,
    stop: CancellationToken,
    pumps: Vec<JoinHandle<()>>,
    publish_tx: mpsc::UnboundedSender<Value>,
    publisher: JoinHandle<()>,
}

impl LiveSession {
    /// Subscribe to the presence channel and the message feed, then queue the
    /// initial presence track.
    ///
    /// Subscription failures are returned for reporting; the session stays
    /// usable with whatever channels did come up.
    pub(crate) async fn open(
        active: ActiveSession,
        pubsub: Arc<dyn PubSub>,
        presence_key: &str,
        initial_presence: Value,
        input_tx: &mpsc::UnboundedSender<RuntimeInput>,
    ) -> (Self, Vec<ChatError>) {
        let presence_topic = presence_topic(&active.conversation_id);
        let feed_topic = feed_topic(&active.conversation_id);
        let stop = CancellationToken::new();
        let mut pumps = Vec::with_capacity(2);
        let mut errors = Vec::new();

        match pubsub.subscribe(&presence_topic, EventFilter::Presence).await {
            Ok(subscription) => pumps.push(spawn_pump(
                subscription,
                active.generation,
                stop.child_token(),
                input_tx.clone(),
            )),
            Err(err) => {
                warn!(topic = %presence_topic, error = %err, "presence subscribe failed");
                errors.push(map_transport_error("subscribe", err));
            }
        }

        let feed_filter = EventFilter::Rows {
            table: MESSAGES_TABLE.to_owned(),
            filter: Filter::eq("conversation_id", active.conversation_id.as_str()),
        };
        match pubsub.subscribe(&feed_topic, feed_filter).await {
            Ok(subscription) => pumps.push(spawn_pump(
                subscription,
                active.generation,
                stop.child_token(),
                input_tx.clone(),
            )),
            Err(err) => {
                warn!(topic = %feed_topic, error = %err, "message feed subscribe failed");
                errors.push(map_transport_error("subscribe", err));
            }
        }

        let (publish_tx, publish_rx) = mpsc::unbounded_channel();
        let publisher = spawn_presence_publisher(
            pubsub,
            presence_topic.clone(),
            presence_key.to_owned(),
            publish_rx,
        );
        let _ = publish_tx.send(initial_presence);

        info!(
            conversation_id = %active.conversation_id,
            generation = active.generation,
            "conversation session opened"
        );
        (
            Self {
                active,
                presence_topic,
                feed_topic,
                stop,
                pumps,
                publish_tx,
                publisher,
            },
            errors,
        )
    }

    /// Queue a presence payload behind any earlier ones.
    pub(crate) fn publish_presence(&self, payload: Value) {
        if self.publish_tx.send(payload).is_err() {
            warn!(topic = %self.presence_topic, "presence publisher stopped; payload dropped");
        }
    }

    /// Stop forwarding, untrack presence and unsubscribe both channels.
    ///
    /// Each step runs even when an earlier one fails; failures are logged and
    /// returned.
    pub(crate) async fn close(self, pubsub: &dyn PubSub, presence_key: &str) -> Vec<ChatError> {
        let Self {
            active,
            presence_topic,
            feed_topic,
            stop,
            pumps,
            publish_tx,
            publisher,
        } = self;
        let mut errors = Vec::new();

        stop.cancel();
        for pump in pumps {
            let _ = pump.await;
        }
        drop(publish_tx);
        publisher.abort();
        let _ = publisher.await;

        if let Err(err) = pubsub.untrack(&presence_topic, presence_key).await {
            warn!(topic = %presence_topic, error = %err, "presence untrack failed");
            errors.push(map_transport_error("untrack", err));
        }
        if let Err(err) = pubsub.unsubscribe(&presence_topic).await {
            warn!(topic = %presence_topic, error = %err, "presence unsubscribe failed");
            errors.push(map_transport_error("unsubscribe", err));
        }
        if let Err(err) = pubsub.unsubscribe(&feed_topic).await {
            warn!(topic = %feed_topic, error = %err, "message feed unsubscribe failed");
            errors.push(map_transport_error("unsubscribe", err));
        }

        info!(
            conversation_id = %active.conversation_id,
            generation = active.generation,
            failures = errors.len(),
            "conversation session closed"
        );
        errors
    }
}

fn spawn_pump(
    mut subscription: Subscription,
    generation: u64,
    stop: CancellationToken,
    input_tx: mpsc::UnboundedSender<RuntimeInput>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                event = subscription.next_event() => {
                    let Some(event) = event else {
                        debug!(topic = %subscription.topic(), "subscription closed");
                        break;
                    };
                    if input_tx.send(RuntimeInput::Transport { generation, event }).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

fn spawn_presence_publisher(
    pubsub: Arc<dyn PubSub>,
    topic: String,
    key: String,
    mut publish_rx: mpsc::UnboundedReceiver<Value>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(payload) = publish_rx.recv().await {
            let typing = payload.get("typing").and_then(Value::as_bool);
            match pubsub.publish_presence(&topic, &key, payload).await {
                Ok(()) => debug!(%topic, ?typing, "presence published"),
                Err(err) => warn!(%topic, ?typing, error = %err, "presence publish failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_platform::{FailPoint, InMemoryBackend};
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn active(id: &str, generation: u64) -> ActiveSession {
        ActiveSession {
            conversation_id: id.to_owned(),
            generation,
        }
    }

    #[test]
    fn topics_follow_conversation_id() {
        assert_eq!(presence_topic("c1"), "presence:conversation:c1");
        assert_eq!(feed_topic("c1"), "public:messages:conversation=c1");
    }

    #[tokio::test]
    async fn forwards_events_tagged_with_generation() {
        let backend = InMemoryBackend::new();
        let (input_tx, mut input_rx) = mpsc::unbounded_channel();

        let (session, errors) = LiveSession::open(
            active("c1", 7),
            Arc::new(backend.clone()),
            "alice:1",
            json!({ "user_id": "alice", "typing": false }),
            &input_tx,
        )
        .await;
        assert!(errors.is_empty());

        let input = timeout(Duration::from_secs(2), input_rx.recv())
            .await
            .expect("input timeout")
            .expect("pump should forward the initial sync");
        match input {
            RuntimeInput::Transport { generation, .. } => assert_eq!(generation, 7),
            _ => panic!("expected a transport event"),
        }

        session.close(&backend, "alice:1").await;
    }

    #[tokio::test]
    async fn close_runs_every_step_when_untrack_fails() {
        let backend = InMemoryBackend::new();
        let (input_tx, _input_rx) = mpsc::unbounded_channel();
        let (session, _) = LiveSession::open(
            active("c1", 1),
            Arc::new(backend.clone()),
            "alice:1",
            json!({ "user_id": "alice" }),
            &input_tx,
        )
        .await;

        backend.fail(FailPoint::Untrack);
        let errors = session.close(&backend, "alice:1").await;

        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, "untrack_failed");
        let calls = backend.calls();
        assert!(calls.contains(&"unsubscribe:presence:conversation:c1".to_owned()));
        assert!(calls.contains(&"unsubscribe:public:messages:conversation=c1".to_owned()));
    }

    #[tokio::test]
    async fn unsubscribe_failure_does_not_skip_the_feed() {
        let backend = InMemoryBackend::new();
        let (input_tx, _input_rx) = mpsc::unbounded_channel();
        let (session, _) = LiveSession::open(
            active("c1", 1),
            Arc::new(backend.clone()),
            "alice:1",
            json!({ "user_id": "alice" }),
            &input_tx,
        )
        .await;

        backend.fail(FailPoint::Unsubscribe);
        let errors = session.close(&backend, "alice:1").await;

        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|err| err.code == "unsubscribe_failed"));
        assert!(
            backend
                .calls()
                .contains(&"unsubscribe:public:messages:conversation=c1".to_owned())
        );
    }

    #[tokio::test]
    async fn subscribe_failure_is_reported_not_fatal() {
        let backend = InMemoryBackend::new();
        backend.fail(FailPoint::Subscribe);
        let (input_tx, _input_rx) = mpsc::unbounded_channel();

        let (session, errors) = LiveSession::open(
            active("c1", 1),
            Arc::new(backend.clone()),
            "alice:1",
            json!({ "user_id": "alice" }),
            &input_tx,
        )
        .await;

        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|err| err.code == "subscribe_failed"));
        session.close(&backend, "alice:1").await;
        assert!(
            backend
                .calls()
                .contains(&"untrack:presence:conversation:c1:alice:1".to_owned())
        );
    }
}
