//! Structured logging init. Per-session context (`session_id`, `browser_id`,
//! `browser_profile`) rides as `tracing::Span` fields rather than a manual
//! context-value hook, so every log line underneath a span inherits the tags.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggerConfig;

pub fn init(config: &LoggerConfig) {
    let filter = EnvFilter::try_new(&config.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);

    match config.log_output.as_deref() {
        Some("json") => registry.with(fmt::layer().json()).init(),
        _ => registry.with(fmt::layer().compact()).init(),
    }
}
