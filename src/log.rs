//! Structured logging for debugging mesh runs.
//!
//! Log levels:
//! - ERROR: Critical failures that prevent an orchestration from completing
//! - WARN: Unexpected conditions that are recoverable (fallback agents, dead letters)
//! - INFO: High-level operation notifications (session start/finish, strategy choice)
//! - DEBUG: Detailed operation traces (per-task execution, deliveries, retries)
//! - TRACE: Very detailed traces (message payloads, turn records)
//!
//! Debug mode can be enabled with `--debug` flag or `MESH_DEBUG=1` env var.
//! `RUST_LOG` overrides the level entirely when set.

use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::EnvFilter;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Initialize logging to ~/.mesh/mesh.log
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_with_debug(debug: bool) {
    let env_debug = std::env::var("MESH_DEBUG")
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false);

    let debug_enabled = debug || env_debug;
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let Some(mesh_dir) = dirs::home_dir().map(|h| h.join(".mesh")) else {
        return;
    };
    if std::fs::create_dir_all(&mesh_dir).is_err() {
        return;
    }
    let path = mesh_dir.join("mesh.log");
    // Truncate file on startup
    let Ok(file) = File::create(&path) else {
        return;
    };
    LOG_PATH.set(path).ok();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter_for(debug_enabled))
        .with_target(true)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .try_init();
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// Path of the active log file, if logging was initialized.
pub fn log_path() -> Option<&'static PathBuf> {
    LOG_PATH.get()
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "mesh=debug"
    } else {
        "mesh=info"
    }
}

fn filter_for(debug: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(debug)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive(false), "mesh=info");
        assert_eq!(default_directive(true), "mesh=debug");
    }
}
