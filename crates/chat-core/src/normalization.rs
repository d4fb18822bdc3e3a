use serde_json::{Map, Value, json};
use tracing::warn;

use crate::{
    error::ChatError,
    types::{ChatEvent, CurrentUser, Message, PresenceEntry, PresenceUser, SendAck},
};

const USER_ID_FIELDS: [&str; 4] = ["user_id", "userId", "uid", "id"];
const DISPLAY_NAME_FIELDS: [&str; 2] = ["displayName", "name"];
const UNKNOWN_USER_ID: &str = "unknown";

/// Convert one presence entry into a roster row.
///
/// Only the last element of the metadata history is used. Missing or mistyped
/// fields fall back to defaults and are logged; this never fails.
pub fn presence_user_from_entry(entry: &PresenceEntry) -> PresenceUser {
    let empty = Map::new();
    let meta = match entry.metas.last() {
        Some(Value::Object(meta)) => meta,
        Some(other) => {
            warn!(key = %entry.key, kind = json_kind(other), "presence meta is not an object; using defaults");
            &empty
        }
        None => {
            warn!(key = %entry.key, "presence entry has empty metadata history; using defaults");
            &empty
        }
    };

    let user_id = USER_ID_FIELDS
        .iter()
        .find_map(|field| scalar_string(meta.get(*field)))
        .unwrap_or_else(|| {
            warn!(key = %entry.key, "presence meta has no user id; using placeholder");
            UNKNOWN_USER_ID.to_owned()
        });

    let display_name = DISPLAY_NAME_FIELDS
        .iter()
        .find_map(|field| non_empty_string(meta.get(*field)))
        .unwrap_or_default();

    PresenceUser {
        key: entry.key.clone(),
        user_id,
        display_name,
        role: non_empty_string(meta.get("role")),
        avatar_url: non_empty_string(meta.get("avatarUrl")),
        typing: meta.get("typing").is_some_and(truthy),
        online_at: scalar_string(meta.get("online_at")),
    }
}

/// Decode a message row returned by the row store or a feed event.
pub fn message_from_row(row: Value) -> Result<Message, ChatError> {
    serde_json::from_value(row)
        .map_err(|err| ChatError::malformed("malformed_message_row", err.to_string()))
}

/// Presence payload tracked for the local user.
pub fn presence_payload(user: &CurrentUser, typing: bool, online_at_ms: u64) -> Value {
    json!({
        "user_id": user.id,
        "displayName": user.display_name.clone().unwrap_or_default(),
        "role": user.role.clone().unwrap_or_default(),
        "avatarUrl": user.avatar_url.clone().unwrap_or_default(),
        "typing": typing,
        "online_at": online_at_ms,
    })
}

/// Convert a send outcome to a stable `ChatEvent::SendAck`.
pub fn normalize_send_outcome(
    temp_id: impl Into<String>,
    outcome: &Result<Message, ChatError>,
) -> ChatEvent {
    let temp_id = temp_id.into();
    match outcome {
        Ok(message) => ChatEvent::SendAck(SendAck {
            temp_id,
            message_id: Some(message.id.clone()),
            error_code: None,
        }),
        Err(error) => ChatEvent::SendAck(SendAck {
            temp_id,
            message_id: None,
            error_code: Some(error.code.clone()),
        }),
    }
}

/// Convert an error into an `Error` event for display.
pub fn normalize_error(error: &ChatError) -> ChatEvent {
    ChatEvent::Error {
        code: error.code.clone(),
        message: error.message.clone(),
    }
}

fn scalar_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn non_empty_string(value: Option<&Value>) -> Option<String> {
    scalar_string(value).filter(|s| !s.is_empty())
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChatErrorCategory;

    fn entry(key: &str, metas: Vec<Value>) -> PresenceEntry {
        PresenceEntry::new(key, metas)
    }

    #[test]
    fn uses_last_meta_in_history() {
        let user = presence_user_from_entry(&entry(
            "k1",
            vec![
                json!({"user_id": "alice", "typing": true}),
                json!({"user_id": "alice", "typing": false, "displayName": "Alice"}),
            ],
        ));
        assert_eq!(user.user_id, "alice");
        assert_eq!(user.display_name, "Alice");
        assert!(!user.typing);
    }

    #[test]
    fn user_id_falls_back_through_aliases() {
        let by_user_id = presence_user_from_entry(&entry("a", vec![json!({"userId": "u1"})]));
        let by_uid = presence_user_from_entry(&entry("b", vec![json!({"uid": "u2"})]));
        let by_id = presence_user_from_entry(&entry("c", vec![json!({"id": 42})]));
        let missing = presence_user_from_entry(&entry("d", vec![json!({})]));

        assert_eq!(by_user_id.user_id, "u1");
        assert_eq!(by_uid.user_id, "u2");
        assert_eq!(by_id.user_id, "42");
        assert_eq!(missing.user_id, "unknown");
    }

    #[test]
    fn display_name_skips_empty_values() {
        let user = presence_user_from_entry(&entry(
            "k",
            vec![json!({"user_id": "u", "displayName": "", "name": "Bob"})],
        ));
        assert_eq!(user.display_name, "Bob");

        let none = presence_user_from_entry(&entry("k", vec![json!({"user_id": "u"})]));
        assert_eq!(none.display_name, "");
    }

    #[test]
    fn malformed_meta_falls_back_to_defaults() {
        let not_object = presence_user_from_entry(&entry("k", vec![json!("oops")]));
        let empty_history = presence_user_from_entry(&entry("k2", Vec::new()));

        assert_eq!(not_object.user_id, "unknown");
        assert!(!not_object.typing);
        assert_eq!(empty_history.key, "k2");
        assert_eq!(empty_history.user_id, "unknown");
    }

    #[test]
    fn typing_is_truthy_coerced() {
        let t = |v: Value| presence_user_from_entry(&entry("k", vec![json!({"typing": v})])).typing;
        assert!(t(json!(true)));
        assert!(t(json!(1)));
        assert!(t(json!("yes")));
        assert!(!t(json!(0)));
        assert!(!t(json!("")));
        assert!(!t(Value::Null));
    }

    #[test]
    fn rejects_rows_missing_required_fields() {
        let err = message_from_row(json!({"id": "m1"})).expect_err("row must be rejected");
        assert_eq!(err.code, "malformed_message_row");
        assert_eq!(err.category, ChatErrorCategory::MalformedPayload);
    }

    #[test]
    fn decodes_rows_with_defaults() {
        let message = message_from_row(json!({
            "id": "m1",
            "conversation_id": "c1",
            "sender_id": "alice",
            "created_at_ms": 10,
        }))
        .expect("minimal row should decode");
        assert!(message.attachments.is_empty());
        assert!(message.metadata.is_empty());
        assert_eq!(message.body, None);
    }

    #[test]
    fn maps_failure_to_send_ack_with_stable_error_code() {
        let event = normalize_send_outcome(
            "temp-1",
            &Err(ChatError::transport("insert", "connection reset")),
        );

        match event {
            ChatEvent::SendAck(ack) => {
                assert_eq!(ack.temp_id, "temp-1");
                assert_eq!(ack.message_id, None);
                assert_eq!(ack.error_code.as_deref(), Some("insert_failed"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn presence_payload_carries_identity_and_flag() {
        let user = CurrentUser {
            id: "alice".into(),
            display_name: Some("Alice".into()),
            role: None,
            avatar_url: None,
        };
        let payload = presence_payload(&user, true, 99);
        assert_eq!(payload["user_id"], "alice");
        assert_eq!(payload["displayName"], "Alice");
        assert_eq!(payload["role"], "");
        assert_eq!(payload["typing"], true);
        assert_eq!(payload["online_at"], 99);
    }
}
