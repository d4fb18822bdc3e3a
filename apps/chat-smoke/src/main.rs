//! Local smoke run of the chat runtime against the in-memory backend.
//!
//! Two users join one conversation, one types and sends a message with an
//! attachment, and the final snapshot is printed as JSON.

mod logging;

use std::{env, process, time::Duration};

use chat_core::{ChatEvent, ChatSnapshot, CurrentUser, OutgoingFile, SnapshotWatch};
use chat_platform::{Backend, InMemoryBackend};
use chat_runtime::{ChatConfig, ConfigError, spawn_runtime};
use tokio::time::timeout;
use tracing::{error, info, warn};

const DEFAULT_CONVERSATION: &str = "smoke";
const WAIT_LIMIT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    logging::init();

    let config = match ChatConfig::from_env() {
        Ok(config) => config,
        Err(ConfigError::Missing { key }) => {
            info!(%key, "no identity configured; using the smoke user");
            ChatConfig::new(CurrentUser {
                id: "smoke-user".to_owned(),
                display_name: Some("Smoke User".to_owned()),
                role: None,
                avatar_url: None,
            })
        }
        Err(err) => {
            error!(error = %err, "invalid configuration");
            process::exit(2);
        }
    };
    let conversation_id = env::var("CHAT_SMOKE_CONVERSATION")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_CONVERSATION.to_owned());

    if let Err(err) = run(config, conversation_id).await {
        error!(error = %err, "smoke run failed");
        process::exit(1);
    }
}

async fn run(config: ChatConfig, conversation_id: String) -> Result<(), String> {
    let backend = InMemoryBackend::new();
    let local_user_id = config.user.id.clone();
    let local = spawn_runtime(Backend::in_memory(backend.clone()), config);
    let peer = spawn_runtime(
        Backend::in_memory(backend),
        ChatConfig::new(CurrentUser {
            id: "smoke-peer".to_owned(),
            display_name: Some("Peer".to_owned()),
            role: None,
            avatar_url: None,
        }),
    );

    let mut events = local.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ChatEvent::SendAck(ack) => info!(?ack, "send acknowledged"),
                ChatEvent::Error { code, message } => warn!(%code, %message, "runtime error"),
                _ => {}
            }
        }
    });

    let mut snapshots = local.snapshots();
    for handle in [&local, &peer] {
        handle
            .select_conversation(Some(conversation_id.clone()))
            .await
            .map_err(|err| err.to_string())?;
    }
    wait_for(&mut snapshots, |s| s.presence.roster.len() == 2).await?;

    peer.set_typing(true).await.map_err(|err| err.to_string())?;
    let typing = wait_for(&mut snapshots, |s| {
        s.presence.typing_by_user_id.get("smoke-peer") == Some(&true)
    })
    .await?;
    info!(activity = %typing.presence.activity_line(&local_user_id), "peer activity");

    let sent = peer
        .send_message(
            Some("hello from the smoke run".to_owned()),
            vec![OutgoingFile::new("notes.txt", "text/plain", b"smoke".to_vec())],
        )
        .await
        .map_err(|err| err.to_string())?;
    peer.set_typing(false).await.map_err(|err| err.to_string())?;

    let snapshot = wait_for(&mut snapshots, |s| {
        s.timeline.messages.iter().any(|m| m.id == sent.id)
    })
    .await?;
    local
        .mark_as_read(sent.id.clone())
        .await
        .map_err(|err| err.to_string())?;

    let rendered = serde_json::to_string_pretty(&snapshot).map_err(|err| err.to_string())?;
    println!("{rendered}");

    peer.shutdown().await.map_err(|err| err.to_string())?;
    local.shutdown().await.map_err(|err| err.to_string())?;
    Ok(())
}

async fn wait_for(
    snapshots: &mut SnapshotWatch,
    mut predicate: impl FnMut(&ChatSnapshot) -> bool,
) -> Result<ChatSnapshot, String> {
    let snapshot = timeout(WAIT_LIMIT, snapshots.wait_for(|s| predicate(s)))
        .await
        .map_err(|_| "timed out waiting for runtime state".to_owned())?
        .map_err(|err| err.to_string())?;
    Ok(snapshot.clone())
}
