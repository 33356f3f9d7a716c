//! Structured logging setup.
//!
//! Installs a `tracing-subscriber` pipeline from [`LoggingConfig`]. Level
//! filtering is configuration: `RUST_LOG`, when set, overrides the configured
//! level, so per-module filters such as `geco_dispatch::protocol=trace` work
//! without code changes.

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Where formatted events go: the log file, the console, or both.
fn writer(config: &LoggingConfig) -> Result<BoxMakeWriter> {
    if !config.log_to_file {
        return Ok(if config.log_to_console {
            BoxMakeWriter::new(std::io::stderr)
        } else {
            BoxMakeWriter::new(std::io::sink)
        });
    }
    let path = config.log_file_path.as_deref().ok_or_else(|| {
        ProtocolError::ConfigError(
            "log_file_path must be specified when log_to_file is true".to_string(),
        )
    })?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| ProtocolError::ConfigError(format!("Failed to open log file {path}: {e}")))?;
    let file = Mutex::new(file);
    if config.log_to_console {
        Ok(BoxMakeWriter::new(file.and(std::io::stderr)))
    } else {
        Ok(BoxMakeWriter::new(file))
    }
}

/// Install the global subscriber.
///
/// Returns an error when another subscriber is already installed; callers
/// that may initialize more than once (tests) can ignore it.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let level = config.log_level.to_string().to_lowercase();
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::registry().with(env_filter);
    let make_writer = writer(config)?;

    if config.json_format {
        let layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .with_writer(make_writer);
        subscriber
            .with(layer)
            .try_init()
            .map_err(|e| ProtocolError::ConfigError(format!("Logging init failed: {e}")))?;
    } else {
        let layer = fmt::layer()
            .with_target(true)
            .with_ansi(!config.log_to_file)
            .with_writer(make_writer);
        subscriber
            .with(layer)
            .try_init()
            .map_err(|e| ProtocolError::ConfigError(format!("Logging init failed: {e}")))?;
    }

    tracing::info!(app = %config.app_name, level = %config.log_level, "Logging initialized");
    Ok(())
}
