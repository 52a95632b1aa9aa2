//! Logging initialisation for alchemy.
//!
//! Everything goes to stderr, filtered by `RUST_LOG` (default `info`). When
//! `ALCHEMY_LOG=1` is set, the same events are also written without colour
//! to `alchemy.log` in the given log directory (normally `<cache>/logs`).
//!
//! Returns a guard that must be kept alive for the duration of the process
//! so that buffered log lines are flushed on exit.

use std::path::Path;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FILE: &str = "alchemy.log";

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Whether the file log is requested through the environment.
#[must_use]
pub fn file_logging_requested() -> bool {
    std::env::var("ALCHEMY_LOG").as_deref() == Ok("1")
}

/// Initialise the global tracing subscriber.
///
/// Call once from `main`. `log_dir` is only used when file logging is
/// requested; if it cannot be created, logging falls back to stderr only.
pub fn init(log_dir: Option<&Path>) -> LogGuard {
    let file_dir = log_dir
        .filter(|_| file_logging_requested())
        .filter(|dir| std::fs::create_dir_all(dir).is_ok());

    let file_guard = if let Some(dir) = file_dir {
        let file_appender = tracing_appender::rolling::never(dir, LOG_FILE);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();

        None
    };

    LogGuard { _file_guard: file_guard }
}
