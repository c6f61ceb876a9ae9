//! Logging setup.
//!
//! Console output through `tracing-subscriber` (plain or JSON) and, when a log
//! directory is configured, a non-blocking daily rolling file.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::Result;
use crate::config::LoggingConfig;

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "billing_notify=info,sqlx=warn";

const LOG_FILE_PREFIX: &str = "billing-notify.log";

fn filter(config: &LoggingConfig) -> EnvFilter {
    config
        .filter
        .as_deref()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Install the global subscriber. Keep the returned guard alive for the
/// lifetime of the process, or buffered file output is lost.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let console = if config.json {
        fmt::layer().json().with_current_span(false).boxed()
    } else {
        fmt::layer().with_ansi(true).boxed()
    };

    let (file, guard) = match config.dir.as_deref() {
        Some(dir) => {
            let path = PathBuf::from(dir);
            std::fs::create_dir_all(&path)?;
            let appender = tracing_appender::rolling::daily(&path, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false).boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter(config))
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| crate::Error::Other(format!("Failed to set global default subscriber: {}", e)))?;

    Ok(guard)
}
