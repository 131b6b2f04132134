//! Logging module for authproxy
//!
//! This module provides logging functionality using tracing and tracing-subscriber.
//! It supports:
//! - Configurable log levels via verbose/quiet flags
//! - JSONL file output for per-session records
//! - Stderr output for human-readable logs

pub mod jsonl;

pub use jsonl::{JsonlWriter, LogEvent, LogEventKind};

use std::path::Path;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Logging configuration
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Verbosity level adjustment: -1 for quiet, 0 for normal, +1 for verbose
    pub verbosity: i8,
    /// Optional path to JSONL session log
    pub jsonl_path: Option<String>,
}

impl LogConfig {
    /// Create a new log configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set verbose mode (+1 verbosity)
    pub fn verbose(mut self) -> Self {
        self.verbosity = 1;
        self
    }

    /// Set quiet mode (-1 verbosity)
    pub fn quiet(mut self) -> Self {
        self.verbosity = -1;
        self
    }

    /// Set JSONL output path
    pub fn with_jsonl_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.jsonl_path = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Get the minimum log level based on verbosity
    fn min_level(&self) -> Level {
        match self.verbosity {
            v if v < 0 => Level::WARN, // quiet: only warnings and errors
            0 => Level::INFO,          // normal: info and above
            _ => Level::DEBUG,         // verbose: debug and above
        }
    }
}

/// Initialize the stderr subscriber
///
/// `RUST_LOG` overrides the level picked from the verbose/quiet flags.
/// Calling this more than once is harmless; later calls are ignored.
pub fn init(verbose: bool, quiet: bool) {
    let config = LogConfig {
        verbosity: if quiet {
            -1
        } else if verbose {
            1
        } else {
            0
        },
        jsonl_path: None,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(config.min_level().into())
        .from_env_lossy();

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer);

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::debug!("Global tracing subscriber already set");
    }
}

/// Open the session log described by `config`
///
/// A log file that cannot be opened is reported and skipped rather than
/// aborting start-up.
pub fn open_session_log(config: &LogConfig) -> SessionLog {
    let writer = config.jsonl_path.as_ref().and_then(|path| {
        JsonlWriter::new(path)
            .map_err(|e| {
                tracing::warn!(path = %path, error = %e, "Failed to open JSONL session log");
            })
            .ok()
            .map(Arc::new)
    });

    SessionLog { writer }
}

/// Handle to the optional JSONL session log
///
/// Cheap to clone; every listener task holds one.
#[derive(Clone, Default)]
pub struct SessionLog {
    writer: Option<Arc<JsonlWriter>>,
}

impl SessionLog {
    /// A log that discards every event
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn from_writer(writer: JsonlWriter) -> Self {
        Self {
            writer: Some(Arc::new(writer)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.writer.is_some()
    }

    /// Write a log event to the JSONL file
    pub fn log_event(&self, event: &LogEvent) {
        if let Some(writer) = &self.writer {
            if let Err(e) = writer.write(event) {
                tracing::warn!("Failed to write JSONL log event: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for SessionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLog")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
