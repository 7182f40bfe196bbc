//! Logging setup
//!
//! Two outputs: the console, whose level follows `-v` flags (or the config
//! file when none are given), and a log file that always records debug and
//! above.

use crate::config::LoggingConfig;
use std::fs::{File, OpenOptions};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Keeps the file writer alive; drop it only at process exit
#[must_use]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Console level for the given `-v` count and configured level name.
///
/// `-v` shows warnings, `-vv` info, `-vvv` and beyond debug. Without flags
/// the config level applies, defaulting to errors only.
pub fn console_level(verbosity: u8, configured: &str) -> LevelFilter {
    match verbosity {
        0 => match configured.to_ascii_uppercase().as_str() {
            "DEBUG" => LevelFilter::DEBUG,
            "INFO" => LevelFilter::INFO,
            "WARNING" | "WARN" => LevelFilter::WARN,
            _ => LevelFilter::ERROR,
        },
        1 => LevelFilter::WARN,
        2 => LevelFilter::INFO,
        _ => LevelFilter::DEBUG,
    }
}

fn open_log_file(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Install the global subscriber. `RUST_LOG` overrides the console level.
pub fn init(config: &LoggingConfig, verbosity: u8) -> LoggingGuard {
    let level = console_level(verbosity, &config.level);
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::default().add_directive(level.into()));

    let console = fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(false)
        .with_filter(console_filter);

    let (file_layer, guard) = match open_log_file(&config.file) {
        Ok(file) => {
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(LevelFilter::DEBUG);
            (Some(layer), Some(guard))
        }
        Err(e) => {
            eprintln!(
                "Warning: cannot open log file {}: {}; logging to console only",
                config.file.display(),
                e
            );
            (None, None)
        }
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .init();

    LoggingGuard { _file: guard }
}
