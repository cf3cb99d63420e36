//! Logging setup for sitewatchd
//!
//! stderr always, plus a plain-text file layer when the self log can be
//! opened. `RUST_LOG` overrides the default `info` filter.

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber.
///
/// Returns the file error, if any, so the caller can report it through the
/// subscriber that did get installed.
pub fn init(log_file: Option<&Path>) -> Option<String> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, file_error) = match log_file.map(open_log_file) {
        Some(Ok(file)) => (
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Mutex::new(file)),
            ),
            None,
        ),
        Some(Err(e)) => (None, Some(e)),
        None => (None, None),
    };

    // A subscriber may already be installed (tests); keep the first
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(file_layer)
        .try_init();

    file_error
}

fn open_log_file(path: &Path) -> Result<fs::File, String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("{}: {}", parent.display(), e))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| format!("{}: {}", path.display(), e))
}
