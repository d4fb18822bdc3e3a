use std::sync::Arc;

use chat_core::{Attachment, ChatError, Message, MessagePage, OutgoingFile, message_from_row};
use chat_platform::{BlobStore, Filter, RowQuery, RowStore, ScopedBlobStore};
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{MESSAGES_TABLE, map_transport_error};

/// Fetch up to `page_size` rows of `conversation_id`, newest first, strictly
/// older than `before_ms` when given.
///
/// Rows that fail to decode are skipped but still counted in `fetched`.
pub(crate) async fn load_page(
    rows: &dyn RowStore,
    conversation_id: &str,
    before_ms: Option<u64>,
    page_size: usize,
) -> Result<MessagePage, ChatError> {
    let mut query =
        RowQuery::new(MESSAGES_TABLE).filter(Filter::eq("conversation_id", conversation_id));
    if let Some(before_ms) = before_ms {
        query = query.filter(Filter::lt("created_at_ms", before_ms));
    }
    let query = query.order_by("created_at_ms", false).limit(page_size);

    let rows_fetched = rows
        .query(query)
        .await
        .map_err(|err| map_transport_error("query", err))?;
    let fetched = rows_fetched.len();
    let messages = rows_fetched
        .into_iter()
        .filter_map(|row| match message_from_row(row) {
            Ok(message) => Some(message),
            Err(err) => {
                warn!(%conversation_id, error = %err, "skipping malformed message row");
                None
            }
        })
        .collect::<Vec<_>>();
    debug!(
        %conversation_id,
        ?before_ms,
        fetched,
        decoded = messages.len(),
        "message page fetched"
    );
    Ok(MessagePage { messages, fetched })
}

/// Upload `files` one after another, then insert the message row.
///
/// A failed upload is logged and dropped from the attachment list; only the
/// insert decides the outcome of the send.
pub(crate) async fn send_message(
    rows: Arc<dyn RowStore>,
    blobs: ScopedBlobStore<Arc<dyn BlobStore>>,
    conversation_id: String,
    sender_id: String,
    body: Option<String>,
    files: Vec<OutgoingFile>,
) -> Result<Message, ChatError> {
    let attachments = upload_attachments(&blobs, &conversation_id, files).await;
    let row = json!({
        "conversation_id": conversation_id,
        "sender_id": sender_id,
        "body": body,
        "attachments": attachments,
        "status": "sent",
    });

    let stored = rows
        .insert(MESSAGES_TABLE, row)
        .await
        .map_err(|err| map_transport_error("send", err))?;
    message_from_row(stored)
}

async fn upload_attachments(
    blobs: &ScopedBlobStore<Arc<dyn BlobStore>>,
    conversation_id: &str,
    files: Vec<OutgoingFile>,
) -> Vec<Attachment> {
    let mut attachments = Vec::with_capacity(files.len());
    for file in files {
        let path = attachment_path(conversation_id, &file.name);
        let size = file.data.len() as u64;
        match blobs.upload(&path, file.data, &file.content_type).await {
            Ok(()) => attachments.push(Attachment {
                url: blobs.public_url(&path),
                mime: Some(file.content_type).filter(|mime| !mime.is_empty()),
                name: Some(file.name),
                size: Some(size),
            }),
            Err(err) => {
                let err = map_transport_error("upload", err);
                warn!(
                    bucket = %blobs.bucket(),
                    %path,
                    file = %file.name,
                    code = %err.code,
                    error = %err.message,
                    "attachment upload failed; sending without it"
                );
            }
        }
    }
    attachments
}

fn attachment_path(conversation_id: &str, file_name: &str) -> String {
    format!("conversations/{conversation_id}/{}-{file_name}", Uuid::new_v4())
}

/// Flag one message of `conversation_id` as read.
pub(crate) async fn mark_as_read(
    rows: &dyn RowStore,
    conversation_id: &str,
    message_id: &str,
) -> Result<(), ChatError> {
    rows.update(
        MESSAGES_TABLE,
        vec![
            Filter::eq("id", message_id),
            Filter::eq("conversation_id", conversation_id),
        ],
        json!({ "status": "read" }),
    )
    .await
    .map_err(|err| map_transport_error("mark_as_read", err))
}

#[cfg(test)]
pub(crate) fn message_row(id: &str, conversation_id: &str, created_at_ms: u64) -> serde_json::Value {
    json!({
        "id": id,
        "conversation_id": conversation_id,
        "sender_id": "bob",
        "body": format!("body {id}"),
        "created_at_ms": created_at_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_core::MessageStatus;
    use chat_platform::{FailPoint, InMemoryBackend};

    fn blobs(backend: &InMemoryBackend) -> ScopedBlobStore<Arc<dyn BlobStore>> {
        ScopedBlobStore::new(Arc::new(backend.clone()) as Arc<dyn BlobStore>, "chat-attachments")
    }

    #[tokio::test]
    async fn pages_newest_first_below_cursor() {
        let backend = InMemoryBackend::new();
        backend.seed_rows(
            MESSAGES_TABLE,
            (1..=10)
                .map(|i| message_row(&format!("m{i}"), "c1", i * 100))
                .chain([message_row("other", "c2", 550)]),
        );

        let page = load_page(&backend, "c1", Some(600), 3)
            .await
            .expect("page should load");
        let ids: Vec<_> = page.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["m5", "m4", "m3"]);
    }

    #[tokio::test]
    async fn skips_malformed_rows_but_counts_them() {
        let backend = InMemoryBackend::new();
        backend.seed_rows(
            MESSAGES_TABLE,
            [
                message_row("m1", "c1", 100),
                json!({ "id": "broken", "conversation_id": "c1", "created_at_ms": "soon" }),
            ],
        );

        let page = load_page(&backend, "c1", None, 30)
            .await
            .expect("page should load");
        assert_eq!(page.fetched, 2);
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.messages[0].id, "m1");
    }

    #[tokio::test]
    async fn query_failure_maps_to_transport_error() {
        let backend = InMemoryBackend::new();
        backend.fail(FailPoint::Query);

        let err = load_page(&backend, "c1", None, 30)
            .await
            .expect_err("query should fail");
        assert_eq!(err.code, "query_failed");
    }

    #[tokio::test]
    async fn failed_upload_is_dropped_from_attachments() {
        let backend = InMemoryBackend::new();
        backend.fail(FailPoint::UploadNamed("a.png".to_owned()));

        let message = send_message(
            Arc::new(backend.clone()),
            blobs(&backend),
            "c1".to_owned(),
            "alice".to_owned(),
            None,
            vec![
                OutgoingFile::new("a.png", "image/png", vec![1, 2, 3]),
                OutgoingFile::new("b.txt", "text/plain", b"hello".to_vec()),
            ],
        )
        .await
        .expect("send should succeed without the failed file");

        assert_eq!(message.attachments.len(), 1);
        let attachment = &message.attachments[0];
        assert_eq!(attachment.name.as_deref(), Some("b.txt"));
        assert_eq!(attachment.mime.as_deref(), Some("text/plain"));
        assert_eq!(attachment.size, Some(5));
        assert!(
            attachment
                .url
                .starts_with("memory://storage/chat-attachments/conversations/c1/")
        );
        assert!(attachment.url.ends_with("-b.txt"));
        assert_eq!(message.status, MessageStatus::Sent);
        assert_eq!(message.body, None);
    }

    #[tokio::test]
    async fn insert_failure_is_a_send_failure() {
        let backend = InMemoryBackend::new();
        backend.fail(FailPoint::Insert);

        let err = send_message(
            Arc::new(backend.clone()),
            blobs(&backend),
            "c1".to_owned(),
            "alice".to_owned(),
            Some("hi".to_owned()),
            Vec::new(),
        )
        .await
        .expect_err("insert failure should fail the send");
        assert_eq!(err.code, "send_failed");
    }

    #[tokio::test]
    async fn mark_as_read_updates_only_the_target_row() {
        let backend = InMemoryBackend::new();
        backend.seed_rows(
            MESSAGES_TABLE,
            [message_row("m1", "c1", 100), message_row("m2", "c1", 200)],
        );

        mark_as_read(&backend, "c1", "m2")
            .await
            .expect("update should succeed");

        let rows = backend.rows(MESSAGES_TABLE);
        assert_eq!(rows[0].get("status"), None);
        assert_eq!(rows[1]["status"], "read");
    }

    #[tokio::test]
    async fn mark_as_read_failure_keeps_row_unchanged() {
        let backend = InMemoryBackend::new();
        backend.seed_rows(MESSAGES_TABLE, [message_row("m1", "c1", 100)]);
        backend.fail(FailPoint::Update);

        let err = mark_as_read(&backend, "c1", "m1")
            .await
            .expect_err("update should fail");
        assert_eq!(err.code, "mark_as_read_failed");
        assert_eq!(backend.rows(MESSAGES_TABLE)[0].get("status"), None);
    }
}
