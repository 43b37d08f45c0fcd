// ABOUTME: tracing-subscriber setup for whichever composition root owns the pool
//
// The library itself only emits `tracing` events. Binaries embedding the pool
// call `init_logging` once at startup to get either JSON Lines in a log
// directory or human-readable output on stderr.

//! Logging setup.

use std::fs::OpenOptions;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;
use tracing_subscriber::prelude::*;

/// Default filter when RUST_LOG is not set
pub const DEFAULT_FILTER: &str = "mgmt_pool=info";

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for JSONL log files; stderr when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,

    /// Filter directive used when RUST_LOG is absent
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            filter: DEFAULT_FILTER.to_string(),
        }
    }
}

/// Install the global subscriber
///
/// Returns the log file path when logging to a directory. Calling this twice
/// leaves the first subscriber in place.
pub fn init_logging(config: &LoggingConfig) -> std::io::Result<Option<PathBuf>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.filter.as_str().into());

    let Some(log_dir) = config.log_dir.as_ref() else {
        if let Err(e) = tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .with(filter)
            .try_init()
        {
            debug!(error = %e, "Global subscriber already installed, keeping it");
        }
        return Ok(None);
    };

    std::fs::create_dir_all(log_dir)?;

    let log_file = log_dir.join(format!(
        "mgmt-pool-{}.jsonl",
        chrono::Local::now().format("%Y%m%d-%H%M%S")
    ));

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file)?;

    if let Err(e) = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()             // Output in JSON Lines format
                .with_target(true)  // Include target module in JSON
                .with_writer(file)
                .with_ansi(false),
        )
        .with(filter)
        .try_init()
    {
        debug!(
            log_file = %log_file.display(),
            error = %e,
            "Global subscriber already installed, keeping it"
        );
    }

    Ok(Some(log_file))
}
