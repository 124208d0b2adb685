//! # Tracing Setup
//!
//! Configures the `tracing` subscriber for a server process.
//!
//! Logging is set up to:
//! - Take the level from `RUST_LOG` when set, otherwise from the configured level.
//! - Write human-readable (or JSON) lines to the console.
//! - Write JSON lines to a daily rotating file under the log directory.
//!
//! The returned `WorkerGuard` must be held for the life of the process so the
//! non-blocking file writer flushes on exit.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Where and how to log.
#[derive(Debug, Clone)]
pub struct LogSettings {
    pub dir: PathBuf,
    /// File name prefix; the appender adds the date.
    pub file_prefix: String,
    /// Default filter directive, e.g. `info` or `lib_heatmap=debug,info`.
    pub level: String,
    /// JSON lines on the console instead of the pretty format.
    pub json_console: bool,
    /// How many log files to keep at startup, newest first.
    pub keep_files: usize,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            file_prefix: "server_heatmap".to_string(),
            level: "info".to_string(),
            json_console: false,
            keep_files: 7,
        }
    }
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init_tracing(settings: &LogSettings) -> io::Result<WorkerGuard> {
    fs::create_dir_all(&settings.dir)?;

    let removed = cleanup_old_logs(&settings.dir, &settings.file_prefix, settings.keep_files)?;

    let file_appender = rolling::daily(&settings.dir, &settings.file_prefix);
    let (non_blocking_appender, guard) = non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

    let console_pretty = (!settings.json_console).then(|| fmt::layer().with_target(true).with_ansi(true));
    let console_json = settings.json_console.then(|| fmt::layer().json());

    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking_appender)
        .json();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_pretty)
        .with(console_json)
        .with(file_layer)
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::AlreadyExists, e.to_string()))?;

    tracing::info!(
        level = %settings.level,
        dir = %settings.dir.display(),
        removed_old_files = removed,
        "logging initialized"
    );
    Ok(guard)
}

/// Deletes all but the `keep` most recently modified files in `dir` whose
/// name starts with `prefix`. Returns how many were deleted.
pub fn cleanup_old_logs(dir: &Path, prefix: &str, keep: usize) -> io::Result<usize> {
    let mut entries: Vec<_> = fs::read_dir(dir)?
        .filter_map(|res| res.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with(prefix))
        .filter_map(|e| {
            let meta = e.metadata().ok()?;
            if !meta.is_file() {
                return None;
            }
            Some((meta.modified().ok()?, e.path()))
        })
        .collect();

    // Newest first.
    entries.sort_by(|a, b| b.0.cmp(&a.0));

    let mut removed = 0;
    for (_, path) in entries.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("Failed to delete old log file {:?}: {}", path, e),
        }
    }
    Ok(removed)
}
