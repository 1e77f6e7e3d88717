//! Tracing setup for the CLI and the tmux hook handlers.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Diagnostics via `RUST_LOG`, output to stderr.
//!   Hook handlers run detached from any terminal, so their output can also be
//!   appended to a log file.
//!
//! - **State files (`io/store`)**: The registry, generation and resize markers
//!   and the breadcrumb. Always written, unaffected by `RUST_LOG`.

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// File the hook handlers log to, relative to the state directory.
pub const LOG_FILE_NAME: &str = "panefleet.log";

/// Set to a non-empty value to also log to [`LOG_FILE_NAME`].
pub const LOG_FILE_ENV: &str = "PANEFLEET_LOG_FILE";

/// Initialize tracing with stderr output only.
///
/// Reads `RUST_LOG` env var. Defaults to `warn` if unset.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=panefleet=debug panefleet layout main
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}

/// Like [`init`], additionally appending plain-text records to `path`.
pub fn init_with_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open log file {}", path.display()))?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .with(fmt::layer().with_writer(Mutex::new(file)).with_ansi(false))
        .try_init();
    Ok(())
}
