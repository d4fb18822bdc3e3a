use std::{
    cmp::Ordering,
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::{
    BlobStore, EventFilter, Filter, PresenceDiff, PresenceState, PubSub, RowQuery, RowStore,
    Subscription, TransportError, TransportEvent, compare_values,
};

const TOPIC_BUFFER: usize = 256;
const PUBLIC_URL_BASE: &str = "memory://storage";

/// Operation that can be made to fail on demand.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Subscribe,
    Publish,
    Untrack,
    Unsubscribe,
    Query,
    Insert,
    Update,
    /// Uploads whose path ends with `-<name>`.
    UploadNamed(String),
}

#[derive(Default)]
struct MemoryState {
    tables: HashMap<String, Vec<Value>>,
    blobs: HashMap<(String, String), Vec<u8>>,
    topics: HashMap<String, broadcast::Sender<TransportEvent>>,
    presence: HashMap<String, Vec<PresenceState>>,
    published: Vec<(String, String, Value)>,
    calls: Vec<String>,
    failures: HashSet<FailPoint>,
    last_created_at_ms: u64,
    latency: Option<Duration>,
}

impl MemoryState {
    fn topic(&mut self, topic: &str) -> broadcast::Sender<TransportEvent> {
        self.topics
            .entry(topic.to_owned())
            .or_insert_with(|| broadcast::channel(TOPIC_BUFFER).0)
            .clone()
    }

    fn check(&self, point: &FailPoint) -> Result<(), TransportError> {
        if self.failures.contains(point) {
            return Err(TransportError::Unavailable(format!(
                "injected failure: {point:?}"
            )));
        }
        Ok(())
    }

    fn broadcast_row(&self, event: TransportEvent) {
        for tx in self.topics.values() {
            let _ = tx.send(event.clone());
        }
    }

    fn broadcast_presence(&mut self, topic: &str, diff: PresenceDiff) {
        let tx = self.topic(topic);
        let _ = tx.send(TransportEvent::Presence(diff));
        let state = self.presence.get(topic).cloned().unwrap_or_default();
        let _ = tx.send(TransportEvent::Presence(PresenceDiff::Sync { state }));
    }

    fn next_created_at_ms(&mut self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_millis() as u64)
            .unwrap_or(0);
        self.last_created_at_ms = now.max(self.last_created_at_ms + 1);
        self.last_created_at_ms
    }
}

/// Process-local backend: rows, blobs and presence channels kept in memory.
///
/// Cloning shares the same state. Intended for tests and local smoke runs.
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, TransportError> {
        self.state
            .lock()
            .map_err(|_| TransportError::Unavailable("poisoned lock".to_owned()))
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MemoryState) -> R) -> Option<R> {
        self.state.lock().ok().map(|mut state| f(&mut state))
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.with_state(|s| s.latency).flatten() {
            tokio::time::sleep(latency).await;
        }
    }

    /// Make `point` fail until healed.
    pub fn fail(&self, point: FailPoint) {
        self.with_state(|s| s.failures.insert(point));
    }

    pub fn heal(&self, point: &FailPoint) {
        self.with_state(|s| s.failures.remove(point));
    }

    /// Delay every query and insert by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.with_state(|s| s.latency = latency);
    }

    /// Store rows without notifying subscribers.
    pub fn seed_rows(&self, table: &str, rows: impl IntoIterator<Item = Value>) {
        self.with_state(|s| {
            s.tables
                .entry(table.to_owned())
                .or_default()
                .extend(rows)
        });
    }

    /// Deliver a raw event to every subscriber of `topic`.
    pub fn emit(&self, topic: &str, event: TransportEvent) {
        self.with_state(|s| {
            let _ = s.topic(topic).send(event);
        });
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.with_state(|s| s.tables.get(table).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn blob(&self, bucket: &str, path: &str) -> Option<Vec<u8>> {
        self.with_state(|s| s.blobs.get(&(bucket.to_owned(), path.to_owned())).cloned())
            .flatten()
    }

    /// Presence payloads published on `topic`, in publish order.
    pub fn published(&self, topic: &str) -> Vec<Value> {
        self.with_state(|s| {
            s.published
                .iter()
                .filter(|(t, _, _)| t == topic)
                .map(|(_, _, payload)| payload.clone())
                .collect()
        })
        .unwrap_or_default()
    }

    /// Log of backend calls such as `subscribe:<topic>` or `untrack:<topic>:<key>`.
    pub fn calls(&self) -> Vec<String> {
        self.with_state(|s| s.calls.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl PubSub for InMemoryBackend {
    async fn subscribe(
        &self,
        topic: &str,
        filter: EventFilter,
    ) -> Result<Subscription, TransportError> {
        let mut state = self.lock()?;
        state.calls.push(format!("subscribe:{topic}"));
        state.check(&FailPoint::Subscribe)?;

        let tx = state.topic(topic);
        let rx = tx.subscribe();
        if filter == EventFilter::Presence {
            let current = state.presence.get(topic).cloned().unwrap_or_default();
            let _ = tx.send(TransportEvent::Presence(PresenceDiff::Sync { state: current }));
        }
        debug!(%topic, "memory subscribe");
        Ok(Subscription::new(topic, filter, rx))
    }

    async fn publish_presence(
        &self,
        topic: &str,
        key: &str,
        payload: Value,
    ) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        state.calls.push(format!("publish:{topic}:{key}"));
        state.check(&FailPoint::Publish)?;
        state
            .published
            .push((topic.to_owned(), key.to_owned(), payload.clone()));

        let entries = state.presence.entry(topic.to_owned()).or_default();
        let tracked = PresenceState {
            key: key.to_owned(),
            metas: vec![payload],
        };
        match entries.iter_mut().find(|entry| entry.key == key) {
            Some(existing) => *existing = tracked.clone(),
            None => entries.push(tracked.clone()),
        }
        state.broadcast_presence(
            topic,
            PresenceDiff::Join {
                new_presences: vec![tracked],
            },
        );
        Ok(())
    }

    async fn untrack(&self, topic: &str, key: &str) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        state.calls.push(format!("untrack:{topic}:{key}"));
        state.check(&FailPoint::Untrack)?;

        let entries = state.presence.entry(topic.to_owned()).or_default();
        let Some(idx) = entries.iter().position(|entry| entry.key == key) else {
            return Ok(());
        };
        let left = entries.remove(idx);
        state.broadcast_presence(
            topic,
            PresenceDiff::Leave {
                left_presences: vec![left],
            },
        );
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        state.calls.push(format!("unsubscribe:{topic}"));
        state.check(&FailPoint::Unsubscribe)
    }
}

#[async_trait]
impl RowStore for InMemoryBackend {
    async fn query(&self, query: RowQuery) -> Result<Vec<Value>, TransportError> {
        self.simulate_latency().await;
        let mut state = self.lock()?;
        state.calls.push(format!("query:{}", query.table));
        state.check(&FailPoint::Query)?;

        let mut rows: Vec<Value> = state
            .tables
            .get(&query.table)
            .map(|rows| rows.iter().filter(|row| query.matches(row)).cloned().collect())
            .unwrap_or_default();

        if let Some(order) = &query.order {
            // Stable sort keeps insertion order for equal keys.
            rows.sort_by(|a, b| {
                let ordering = match (a.get(&order.column), b.get(&order.column)) {
                    (Some(a), Some(b)) => compare_values(a, b).unwrap_or(Ordering::Equal),
                    _ => Ordering::Equal,
                };
                if order.ascending {
                    ordering
                } else {
                    ordering.reverse()
                }
            });
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn insert(&self, table: &str, row: Value) -> Result<Value, TransportError> {
        self.simulate_latency().await;
        let mut state = self.lock()?;
        state.calls.push(format!("insert:{table}"));
        state.check(&FailPoint::Insert)?;

        let Value::Object(mut fields) = row else {
            return Err(TransportError::Rejected("row must be a JSON object".to_owned()));
        };
        fields
            .entry("id")
            .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
        let created_at_ms = state.next_created_at_ms();
        fields
            .entry("created_at_ms")
            .or_insert_with(|| Value::from(created_at_ms));
        fields
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));

        let stored = Value::Object(fields);
        state
            .tables
            .entry(table.to_owned())
            .or_default()
            .push(stored.clone());
        state.broadcast_row(TransportEvent::RowInserted {
            table: table.to_owned(),
            row: stored.clone(),
        });
        Ok(stored)
    }

    async fn update(
        &self,
        table: &str,
        filters: Vec<Filter>,
        patch: Value,
    ) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        state.calls.push(format!("update:{table}"));
        state.check(&FailPoint::Update)?;

        let Value::Object(patch) = patch else {
            return Err(TransportError::Rejected("patch must be a JSON object".to_owned()));
        };
        let updated_at_ms = state.next_created_at_ms();

        let mut changed = Vec::new();
        if let Some(rows) = state.tables.get_mut(table) {
            for row in rows.iter_mut() {
                if !filters.iter().all(|filter| filter.matches(row)) {
                    continue;
                }
                if let Value::Object(fields) = row {
                    for (column, value) in &patch {
                        fields.insert(column.clone(), value.clone());
                    }
                    fields.insert("updated_at_ms".to_owned(), Value::from(updated_at_ms));
                }
                changed.push(row.clone());
            }
        }
        for row in changed {
            state.broadcast_row(TransportEvent::RowUpdated {
                table: table.to_owned(),
                row,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for InMemoryBackend {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        data: Vec<u8>,
        _content_type: &str,
    ) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        state.calls.push(format!("upload:{bucket}/{path}"));
        let failing = state.failures.iter().any(|point| match point {
            FailPoint::UploadNamed(name) => path.ends_with(&format!("-{name}")),
            _ => false,
        });
        if failing {
            return Err(TransportError::Unavailable(format!(
                "injected upload failure: {path}"
            )));
        }
        state
            .blobs
            .insert((bucket.to_owned(), path.to_owned()), data);
        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("{PUBLIC_URL_BASE}/{bucket}/{path}")
    }
}
