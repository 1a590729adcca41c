// ABOUTME: Tracing subscriber setup: env filter, stderr output and an optional log file
// ABOUTME: The returned guard must live as long as the process so file writes are flushed

use anyhow::{Context, Result};
use saltbot_core::config::LogsConfig;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// RUST_LOG wins over the configured filter.
fn log_filter(logs: &LogsConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&logs.filter)
            .with_context(|| format!("Invalid logs.filter: {}", logs.filter)),
    }
}

pub fn init_logging(logs: &LogsConfig, json: bool) -> Result<Option<WorkerGuard>> {
    let (file_layer, guard) = match &logs.file {
        Some(file) => {
            let path = Path::new(file);
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .with_context(|| format!("logs.file must name a file, got: {}", file))?;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry()
        .with(log_filter(logs)?)
        .with(file_layer);

    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
            .context("Failed to initialize logging")?;
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()
            .context("Failed to initialize logging")?;
    }

    Ok(guard)
}
