// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tracing setup: stderr always, plus an optional daily-rotating log file
//! under `{dataDir}/logs` capped at `logging.maxFiles` when the directory
//! is writable. A logging-setup failure never aborts the daemon — it falls
//! back to stderr-only and prints a warning to stderr directly, since no
//! subscriber may yet be installed at that point.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{Builder, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{Config, LoggingConfig};

/// Install the global tracing subscriber. The returned guard must be held
/// for the life of the process when file logging is active — dropping it
/// stops the non-blocking writer thread and truncates in-flight log lines.
pub fn init(config: &Config) -> Option<WorkerGuard> {
    match file_writer(&config.logging, &config.data_dir) {
        Some((writer, guard)) => {
            let filter = env_filter(&config.logging);
            let result = tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .try_init();
            if result.is_err() {
                eprintln!("tracing subscriber already initialized");
            }
            Some(guard)
        }
        None => {
            let filter = env_filter(&config.logging);
            if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_err() {
                eprintln!("tracing subscriber already initialized");
            }
            None
        }
    }
}

fn env_filter(logging: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(logging.level.clone()))
}

fn file_writer(
    logging: &LoggingConfig,
    data_dir: &std::path::Path,
) -> Option<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    if logging.max_files == 0 {
        return None;
    }
    let log_dir = data_dir.join("logs");
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("failed to create log directory {}: {e}, falling back to stderr-only logging", log_dir.display());
        return None;
    }
    let appender = Builder::new()
        .rotation(Rotation::DAILY)
        .filename_prefix("klf200-bridge")
        .filename_suffix("log")
        .max_log_files(logging.max_files)
        .build(&log_dir);
    match appender {
        Ok(appender) => Some(tracing_appender::non_blocking(appender)),
        Err(e) => {
            eprintln!("failed to initialize rolling log file: {e}, falling back to stderr-only logging");
            None
        }
    }
}
