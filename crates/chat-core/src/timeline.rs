use std::collections::HashSet;

use serde_json::Value;
use tracing::{debug, trace};

use crate::types::{Message, TimelineSnapshot};

/// Default number of rows requested per page.
pub const DEFAULT_PAGE_SIZE: usize = 30;

/// One page of decoded rows, newest first.
///
/// `fetched` counts the rows the store returned, including any that failed to
/// decode, and alone decides whether older rows may exist.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub fetched: usize,
}

impl From<Vec<Message>> for MessagePage {
    fn from(messages: Vec<Message>) -> Self {
        let fetched = messages.len();
        Self { messages, fetched }
    }
}

/// Ordered, id-deduplicated message history for one conversation.
///
/// Pages arrive newest-first from the row store and are reversed into display
/// order. Live inserts and optimistic sends append; confirmations and updates
/// replace in place so positions never shift under the reader.
#[derive(Debug, Clone)]
pub struct MessageTimeline {
    conversation_id: String,
    messages: Vec<Message>,
    cursor_ms: Option<u64>,
    has_more: bool,
    loading: bool,
    page_size: usize,
}

impl MessageTimeline {
    /// Create an empty timeline (`page_size >= 1`).
    pub fn new(conversation_id: impl Into<String>, page_size: usize) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            messages: Vec::new(),
            cursor_ms: None,
            has_more: true,
            loading: false,
            page_size: page_size.max(1),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Messages in display order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Timestamp of the earliest loaded message, used to request older pages.
    pub fn cursor_ms(&self) -> Option<u64> {
        self.cursor_ms
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Mark the initial page request as started.
    pub fn begin_initial_load(&mut self) {
        self.loading = true;
    }

    /// Start a backward page request.
    ///
    /// Returns the cursor to query below, or `None` when there is nothing to
    /// page from or a page request is already in flight.
    pub fn begin_load_more(&mut self) -> Option<u64> {
        if self.loading {
            trace!(conversation_id = %self.conversation_id, "load_more ignored: page in flight");
            return None;
        }
        let cursor = self.cursor_ms?;
        self.loading = true;
        Some(cursor)
    }

    /// Apply the newest page, given newest-first.
    pub fn apply_initial_page(&mut self, page: MessagePage) {
        let MessagePage {
            messages: mut rows_desc,
            fetched,
        } = page;
        rows_desc.reverse();

        let mut seen = HashSet::new();
        rows_desc.retain(|m| seen.insert(m.id.clone()));
        // Rows that arrived live (or optimistically) while the page was in flight stay after it.
        let trailing: Vec<Message> = std::mem::take(&mut self.messages)
            .into_iter()
            .filter(|m| !seen.contains(&m.id))
            .collect();

        self.cursor_ms = rows_desc.first().map(|m| m.created_at_ms);
        self.messages = rows_desc;
        self.messages.extend(trailing);
        self.has_more = fetched == self.page_size;
        self.loading = false;
        debug!(
            conversation_id = %self.conversation_id,
            fetched,
            has_more = self.has_more,
            "initial page applied"
        );
    }

    /// Prepend an older page, given newest-first.
    pub fn apply_older_page(&mut self, page: MessagePage) {
        let MessagePage {
            messages: mut rows_desc,
            fetched,
        } = page;
        rows_desc.reverse();

        if let Some(earliest) = rows_desc.first() {
            self.cursor_ms = Some(earliest.created_at_ms);
        }

        let mut seen: HashSet<String> = self.messages.iter().map(|m| m.id.clone()).collect();
        rows_desc.retain(|m| seen.insert(m.id.clone()));
        rows_desc.append(&mut self.messages);
        self.messages = rows_desc;
        self.has_more = fetched == self.page_size;
        self.loading = false;
        debug!(
            conversation_id = %self.conversation_id,
            fetched,
            has_more = self.has_more,
            "older page applied"
        );
    }

    /// A page request failed; keep prior state and stop the loading indicator.
    pub fn fail_page(&mut self) {
        self.loading = false;
    }

    /// Append a live row unless its id is already present.
    pub fn insert_live(&mut self, message: Message) -> bool {
        if self.contains(&message.id) {
            trace!(message_id = %message.id, "duplicate live insert ignored");
            return false;
        }
        self.messages.push(message);
        true
    }

    /// Replace the row with the same id in place. No-op when absent.
    pub fn update_live(&mut self, message: Message) -> bool {
        match self.position(&message.id) {
            Some(idx) => {
                self.messages[idx] = message;
                true
            }
            None => {
                trace!(message_id = %message.id, "live update for unknown message ignored");
                false
            }
        }
    }

    /// Append a locally synthesized row.
    pub fn push_optimistic(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Replace the optimistic row with the server-confirmed one, keeping its index.
    ///
    /// When the live feed already delivered the confirmed row, that echo is
    /// dropped so the id stays unique.
    pub fn confirm_optimistic(&mut self, temp_id: &str, confirmed: Message) -> bool {
        let Some(idx) = self.position(temp_id) else {
            return self.insert_live(confirmed);
        };
        if let Some(echo) = self.position(&confirmed.id) {
            self.messages.remove(echo);
            let idx = if echo < idx { idx - 1 } else { idx };
            self.messages[idx] = confirmed;
        } else {
            self.messages[idx] = confirmed;
        }
        true
    }

    /// Flag the optimistic row as failed; it stays visible.
    pub fn mark_failed(&mut self, temp_id: &str) -> bool {
        let Some(idx) = self.position(temp_id) else {
            return false;
        };
        self.messages[idx]
            .metadata
            .insert("failed".to_owned(), Value::Bool(true));
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    pub fn snapshot(&self) -> TimelineSnapshot {
        TimelineSnapshot {
            messages: self.messages.clone(),
            loading: self.loading,
            has_more: self.has_more,
        }
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.id == id)
    }
}
