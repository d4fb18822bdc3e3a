//! Tracing bootstrap for the smoke binary.

use std::env;

use tracing_subscriber::EnvFilter;

/// Debug level for the smoke binary and the runtime, so a plain run traces
/// every session step without `RUST_LOG`; other crates stay at `info`.
const DEFAULT_FILTER: &str = "info,chat_smoke=debug,chat_runtime=debug";

/// Install the global subscriber.
///
/// Filter precedence: `RUST_LOG`, then `CHAT_SMOKE_LOG`, then `CHAT_LOG`,
/// then the built-in default.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_thread_ids(true)
        .with_env_filter(filter_from_env())
        .try_init();
}

fn filter_from_env() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    for key in ["CHAT_SMOKE_LOG", "CHAT_LOG"] {
        if let Some(value) = env::var(key).ok().filter(|v| !v.trim().is_empty())
            && let Ok(filter) = EnvFilter::try_new(value)
        {
            return filter;
        }
    }

    EnvFilter::new(DEFAULT_FILTER)
}
