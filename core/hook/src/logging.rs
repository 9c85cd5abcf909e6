//! File logging for the hook.
//!
//! The hook runs inside the user's prompt, so it never writes to the
//! terminal. Logs go to `~/.devpulse/logs/hook.log.<date>`.

use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_FILE_PREFIX: &str = "hook.log";

fn log_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".devpulse").join("logs"))
}

/// Returns the guard that flushes the background writer on drop, or `None`
/// when no log directory is usable (the hook then runs silently).
pub fn init() -> Option<WorkerGuard> {
    let dir = log_dir()?;
    fs_err::create_dir_all(&dir).ok()?;

    let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let filter = EnvFilter::try_from_env("DEVPULSE_HOOK_LOG")
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .ok()?;
    Some(guard)
}
