//! Tracing subscriber setup shared by every subcommand.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Log file name for one invocation of `command`.
pub fn log_file_name(command: &str, now: chrono::DateTime<chrono::Utc>) -> String {
    format!("teuthology-metrics-{command}-{}.log", now.format("%Y%m%d-%H%M%S"))
}

/// Install the global subscriber.
///
/// `level` is an explicit filter directive; when absent `RUST_LOG` applies,
/// else `info`. With `dir` set, a plain-text copy of the log goes to a
/// per-command file in that directory, whose path is returned.
pub fn init(level: Option<&str>, dir: Option<&Path>, json: bool, command: &str) -> Result<Option<PathBuf>> {
    let filter = match level {
        Some(directive) => {
            EnvFilter::try_new(directive).with_context(|| format!("invalid log level '{directive}'"))?
        }
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let stderr: Box<dyn Layer<Registry> + Send + Sync> = if json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).boxed()
    };

    let (file_layer, file_path) = match dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            let path = dir.join(log_file_name(command, chrono::Utc::now()));
            let file =
                File::create(&path).with_context(|| format!("failed to create log file {}", path.display()))?;
            let layer = fmt::layer().with_ansi(false).with_writer(Mutex::new(file));
            (Some(layer), Some(path))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr)
        .with(file_layer)
        .with(filter)
        .try_init()
        .context("failed to install tracing subscriber")?;

    if let Some(path) = &file_path {
        tracing::debug!(path = %path.display(), "logging to file");
    }
    Ok(file_path)
}
