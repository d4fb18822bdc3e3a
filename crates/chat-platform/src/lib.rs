//! Backend collaborator contract consumed by the chat runtime.
//!
//! The runtime treats the backend as three opaque services: a pub/sub channel
//! with presence tracking, a row store, and a blob store. Rows and presence
//! metadata travel as `serde_json::Value` so the contract stays independent of
//! the chat data model.

use std::{cmp::Ordering, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;

/// In-memory backend used by tests and the smoke app.
pub mod memory;

pub use memory::{FailPoint, InMemoryBackend};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("not found: {0}")]
    NotFound(String),
}

/// Row predicate evaluated by the store (and by subscription filters).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Filter {
    /// `column == value`.
    Eq { column: String, value: Value },
    /// `column < value`, numbers numerically and strings lexicographically.
    Lt { column: String, value: Value },
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn lt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Lt {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, row: &Value) -> bool {
        match self {
            Self::Eq { column, value } => row.get(column) == Some(value),
            Self::Lt { column, value } => row
                .get(column)
                .and_then(|actual| compare_values(actual, value))
                .is_some_and(|ordering| ordering == Ordering::Less),
        }
    }
}

/// Sort order of a query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

/// Row store query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RowQuery {
    pub table: String,
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    pub limit: Option<usize>,
}

impl RowQuery {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filters: Vec::new(),
            order: None,
            limit: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.order = Some(Order {
            column: column.into(),
            ascending,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, row: &Value) -> bool {
        self.filters.iter().all(|filter| filter.matches(row))
    }
}

/// Presence state of one key: its metadata history, oldest first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceState {
    pub key: String,
    pub metas: Vec<Value>,
}

/// Presence change delivered on a channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum PresenceDiff {
    Sync { state: Vec<PresenceState> },
    Join { new_presences: Vec<PresenceState> },
    Leave { left_presences: Vec<PresenceState> },
}

/// Event delivered to a subscription.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TransportEvent {
    Presence(PresenceDiff),
    RowInserted { table: String, row: Value },
    RowUpdated { table: String, row: Value },
}

/// Which events a subscription wants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum EventFilter {
    /// Presence sync/join/leave for the topic.
    Presence,
    /// Row changes on `table` that satisfy `filter`.
    Rows { table: String, filter: Filter },
}

impl EventFilter {
    pub fn matches(&self, event: &TransportEvent) -> bool {
        match (self, event) {
            (Self::Presence, TransportEvent::Presence(_)) => true,
            (
                Self::Rows { table, filter },
                TransportEvent::RowInserted { table: t, row }
                | TransportEvent::RowUpdated { table: t, row },
            ) => table == t && filter.matches(row),
            _ => false,
        }
    }
}

/// Live subscription to one topic, filtered on the delivering side.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    filter: EventFilter,
    rx: broadcast::Receiver<TransportEvent>,
}

impl Subscription {
    pub fn new(
        topic: impl Into<String>,
        filter: EventFilter,
        rx: broadcast::Receiver<TransportEvent>,
    ) -> Self {
        Self {
            topic: topic.into(),
            filter,
            rx,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next matching event, or `None` once the topic is closed.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(topic = %self.topic, skipped, "subscription lagged; events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[async_trait]
pub trait PubSub: Send + Sync {
    async fn subscribe(
        &self,
        topic: &str,
        filter: EventFilter,
    ) -> Result<Subscription, TransportError>;

    /// Track (or re-track) presence metadata for `key` on `topic`.
    async fn publish_presence(
        &self,
        topic: &str,
        key: &str,
        payload: Value,
    ) -> Result<(), TransportError>;

    /// Stop tracking presence for `key` on `topic`.
    async fn untrack(&self, topic: &str, key: &str) -> Result<(), TransportError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;
}

#[async_trait]
pub trait RowStore: Send + Sync {
    async fn query(&self, query: RowQuery) -> Result<Vec<Value>, TransportError>;

    /// Insert a row and return it as stored (with server-assigned fields).
    async fn insert(&self, table: &str, row: Value) -> Result<Value, TransportError>;

    /// Merge `patch` into every row matching all `filters`.
    async fn update(
        &self,
        table: &str,
        filters: Vec<Filter>,
        patch: Value,
    ) -> Result<(), TransportError>;
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<(), TransportError>;

    fn public_url(&self, bucket: &str, path: &str) -> String;
}

#[async_trait]
impl<T: BlobStore + ?Sized> BlobStore for Arc<T> {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<(), TransportError> {
        (**self).upload(bucket, path, data, content_type).await
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        (**self).public_url(bucket, path)
    }
}

/// Blob store bound to one bucket.
#[derive(Clone)]
pub struct ScopedBlobStore<S: BlobStore> {
    inner: S,
    bucket: String,
}

impl<S: BlobStore> ScopedBlobStore<S> {
    pub fn new(inner: S, bucket: impl Into<String>) -> Self {
        Self {
            inner,
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub async fn upload(
        &self,
        path: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<(), TransportError> {
        self.inner
            .upload(&self.bucket, path, data, content_type)
            .await
    }

    pub fn public_url(&self, path: &str) -> String {
        self.inner.public_url(&self.bucket, path)
    }
}

/// Bundle of the three collaborators.
#[derive(Clone)]
pub struct Backend {
    pub pubsub: Arc<dyn PubSub>,
    pub rows: Arc<dyn RowStore>,
    pub blobs: Arc<dyn BlobStore>,
}

impl Backend {
    pub fn new(
        pubsub: Arc<dyn PubSub>,
        rows: Arc<dyn RowStore>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            pubsub,
            rows,
            blobs,
        }
    }

    /// Use one in-memory backend for all three roles.
    pub fn in_memory(backend: InMemoryBackend) -> Self {
        let shared = Arc::new(backend);
        Self {
            pubsub: shared.clone(),
            rows: shared.clone(),
            blobs: shared,
        }
    }
}

/// Compare two JSON scalars: numbers numerically, strings lexicographically.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn filters_match_eq_and_lt() {
        let row = json!({"conversation_id": "c1", "created_at_ms": 50});

        assert!(Filter::eq("conversation_id", "c1").matches(&row));
        assert!(!Filter::eq("conversation_id", "c2").matches(&row));
        assert!(Filter::lt("created_at_ms", 60).matches(&row));
        assert!(!Filter::lt("created_at_ms", 50).matches(&row));
        assert!(!Filter::lt("missing", 50).matches(&row));
    }

    #[test]
    fn event_filter_scopes_rows_by_table_and_predicate() {
        let filter = EventFilter::Rows {
            table: "messages".into(),
            filter: Filter::eq("conversation_id", "c1"),
        };
        let ours = TransportEvent::RowInserted {
            table: "messages".into(),
            row: json!({"conversation_id": "c1"}),
        };
        let other_conversation = TransportEvent::RowUpdated {
            table: "messages".into(),
            row: json!({"conversation_id": "c2"}),
        };
        let other_table = TransportEvent::RowInserted {
            table: "participants".into(),
            row: json!({"conversation_id": "c1"}),
        };

        assert!(filter.matches(&ours));
        assert!(!filter.matches(&other_conversation));
        assert!(!filter.matches(&other_table));
        assert!(!filter.matches(&TransportEvent::Presence(PresenceDiff::Sync {
            state: Vec::new()
        })));
    }

    #[tokio::test]
    async fn subscription_skips_unmatched_events() {
        let (tx, rx) = broadcast::channel(8);
        let mut sub = Subscription::new("t", EventFilter::Presence, rx);

        tx.send(TransportEvent::RowInserted {
            table: "messages".into(),
            row: json!({}),
        })
        .expect("send row event");
        tx.send(TransportEvent::Presence(PresenceDiff::Sync { state: Vec::new() }))
            .expect("send presence event");

        let event = sub.next_event().await.expect("presence event expected");
        assert!(matches!(event, TransportEvent::Presence(_)));

        drop(tx);
        assert_eq!(sub.next_event().await, None);
    }

    #[tokio::test]
    async fn scoped_store_isolates_buckets() {
        let base = Arc::new(InMemoryBackend::default());
        let a = ScopedBlobStore::new(base.clone(), "bucket-a");
        let b = ScopedBlobStore::new(base.clone(), "bucket-b");

        a.upload("x.txt", b"one".to_vec(), "text/plain")
            .await
            .expect("upload a");
        b.upload("x.txt", b"two".to_vec(), "text/plain")
            .await
            .expect("upload b");

        assert_eq!(base.blob("bucket-a", "x.txt"), Some(b"one".to_vec()));
        assert_eq!(base.blob("bucket-b", "x.txt"), Some(b"two".to_vec()));
        assert_ne!(a.public_url("x.txt"), b.public_url("x.txt"));
    }
}
