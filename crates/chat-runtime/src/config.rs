//! Environment-backed runtime configuration.

use std::{env, time::Duration};

use chat_core::{CurrentUser, DEFAULT_PAGE_SIZE};
use thiserror::Error;
use uuid::Uuid;

const DEFAULT_TYPING_IDLE_MS: u64 = 3_000;
const DEFAULT_ATTACHMENT_BUCKET: &str = "chat-attachments";
const DEFAULT_COMMAND_BUFFER: usize = 128;
const DEFAULT_EVENT_BUFFER: usize = 512;

/// Runtime configuration for one signed-in user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatConfig {
    /// Identity published in presence metadata and used as message sender.
    pub user: CurrentUser,
    /// Presence key this connection tracks under.
    pub presence_key: String,
    /// Rows requested per timeline page.
    pub page_size: usize,
    /// Inactivity delay after which a typing flag is cleared.
    pub typing_idle_ms: u64,
    /// Blob bucket for message attachments.
    pub attachment_bucket: String,
    /// Command channel capacity.
    pub command_buffer: usize,
    /// Event broadcast capacity.
    pub event_buffer: usize,
}

impl ChatConfig {
    /// Defaults for `user`, with a fresh per-connection presence key.
    pub fn new(user: CurrentUser) -> Self {
        let presence_key = default_presence_key(&user.id);
        Self {
            user,
            presence_key,
            page_size: DEFAULT_PAGE_SIZE,
            typing_idle_ms: DEFAULT_TYPING_IDLE_MS,
            attachment_bucket: DEFAULT_ATTACHMENT_BUCKET.to_owned(),
            command_buffer: DEFAULT_COMMAND_BUFFER,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }

    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let user_id = optional_trimmed_env("CHAT_USER_ID", &mut lookup)
            .ok_or(ConfigError::Missing { key: "CHAT_USER_ID" })?;
        let user = CurrentUser {
            display_name: optional_trimmed_env("CHAT_DISPLAY_NAME", &mut lookup),
            role: optional_trimmed_env("CHAT_ROLE", &mut lookup),
            avatar_url: optional_trimmed_env("CHAT_AVATAR_URL", &mut lookup),
            id: user_id,
        };

        let presence_key = optional_trimmed_env("CHAT_PRESENCE_KEY", &mut lookup)
            .unwrap_or_else(|| default_presence_key(&user.id));
        let page_size = parse_with_default("CHAT_PAGE_SIZE", DEFAULT_PAGE_SIZE, &mut lookup)?;
        let typing_idle_ms =
            parse_with_default("CHAT_TYPING_IDLE_MS", DEFAULT_TYPING_IDLE_MS, &mut lookup)?;
        let attachment_bucket = optional_trimmed_env("CHAT_ATTACHMENT_BUCKET", &mut lookup)
            .unwrap_or_else(|| DEFAULT_ATTACHMENT_BUCKET.to_owned());
        let command_buffer =
            parse_with_default("CHAT_COMMAND_BUFFER", DEFAULT_COMMAND_BUFFER, &mut lookup)?;
        let event_buffer =
            parse_with_default("CHAT_EVENT_BUFFER", DEFAULT_EVENT_BUFFER, &mut lookup)?;

        if page_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CHAT_PAGE_SIZE",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        if typing_idle_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CHAT_TYPING_IDLE_MS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        Ok(Self {
            user,
            presence_key,
            page_size,
            typing_idle_ms,
            attachment_bucket,
            command_buffer,
            event_buffer,
        })
    }

    pub fn typing_idle(&self) -> Duration {
        Duration::from_millis(self.typing_idle_ms)
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A required environment variable is unset or blank.
    #[error("missing {key}")]
    Missing { key: &'static str },
    /// An environment variable could not be parsed.
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn default_presence_key(user_id: &str) -> String {
    format!("{user_id}:{}", Uuid::new_v4())
}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_with_default<T, F>(key: &'static str, default: T, lookup: &mut F) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value.parse::<T>().map_err(|err| ConfigError::InvalidValue {
        key,
        value,
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<ChatConfig, ConfigError> {
        let map = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        ChatConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn parses_identity_and_defaults() {
        let cfg = config_from_pairs(&[
            ("CHAT_USER_ID", "alice"),
            ("CHAT_DISPLAY_NAME", "Alice"),
            ("CHAT_ROLE", "buyer"),
        ])
        .expect("config should parse");

        assert_eq!(cfg.user.id, "alice");
        assert_eq!(cfg.user.display_name.as_deref(), Some("Alice"));
        assert_eq!(cfg.user.role.as_deref(), Some("buyer"));
        assert_eq!(cfg.user.avatar_url, None);
        assert!(cfg.presence_key.starts_with("alice:"));
        assert_eq!(cfg.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(cfg.typing_idle(), Duration::from_millis(3_000));
        assert_eq!(cfg.attachment_bucket, "chat-attachments");
    }

    #[test]
    fn requires_user_id() {
        let err = config_from_pairs(&[("CHAT_USER_ID", "  ")]).expect_err("blank user must fail");
        assert_eq!(err, ConfigError::Missing { key: "CHAT_USER_ID" });
    }

    #[test]
    fn honors_overrides() {
        let cfg = config_from_pairs(&[
            ("CHAT_USER_ID", "alice"),
            ("CHAT_PRESENCE_KEY", "alice-laptop"),
            ("CHAT_PAGE_SIZE", "50"),
            ("CHAT_TYPING_IDLE_MS", "1500"),
            ("CHAT_ATTACHMENT_BUCKET", "files"),
        ])
        .expect("config should parse");

        assert_eq!(cfg.presence_key, "alice-laptop");
        assert_eq!(cfg.page_size, 50);
        assert_eq!(cfg.typing_idle_ms, 1_500);
        assert_eq!(cfg.attachment_bucket, "files");
    }

    #[test]
    fn rejects_invalid_numeric_values() {
        let err = config_from_pairs(&[("CHAT_USER_ID", "alice"), ("CHAT_PAGE_SIZE", "abc")])
            .expect_err("invalid page size should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "CHAT_PAGE_SIZE",
                ..
            }
        ));

        let err = config_from_pairs(&[("CHAT_USER_ID", "alice"), ("CHAT_TYPING_IDLE_MS", "0")])
            .expect_err("zero idle should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "CHAT_TYPING_IDLE_MS",
                ..
            }
        ));
    }
}
