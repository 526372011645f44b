//! Structured logging for the respawn server.
//!
//! Logs are JSON lines on standard error, so a daemon started with
//! `--stderr-log` keeps them in that file.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn default_filter() -> EnvFilter {
    EnvFilter::new("info,waddle_respawn=debug,waddle_respawn_server=debug")
}

/// `RUST_LOG` wins, then `WADDLE_LOG_LEVEL` (a bare level or a full
/// directive), then the default.
fn build_log_filter() -> EnvFilter {
    if let Ok(filter) = std::env::var("RUST_LOG") {
        return EnvFilter::try_new(filter).unwrap_or_else(|_| default_filter());
    }

    if let Ok(level_or_filter) = std::env::var("WADDLE_LOG_LEVEL") {
        let level_or_filter = level_or_filter.trim();
        if !level_or_filter.is_empty() {
            return EnvFilter::try_new(directive(level_or_filter))
                .unwrap_or_else(|_| default_filter());
        }
    }

    default_filter()
}

fn directive(level_or_filter: &str) -> String {
    if level_or_filter.contains('=') || level_or_filter.contains(',') {
        level_or_filter.to_string()
    } else {
        format!(
            "{level},waddle_respawn={level},waddle_respawn_server={level}",
            level = level_or_filter
        )
    }
}

/// Install the global subscriber.
pub fn init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_target(true)
        .with_thread_ids(false)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(build_log_filter())
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}
