//! JSONL (JSON Lines) logging for structured session events
//!
//! Each log entry is written as a single JSON object on one line.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

/// Log event kinds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogEventKind {
    /// Listener started
    ServerStart,
    /// Listener stopped
    ServerStop,
    /// Session finished (closed or failed)
    SessionClose,
    /// Credentials rejected
    AuthFailure,
    /// Connection rejected because the session limit was reached
    SessionRejected,
    /// Error occurred
    Error,
}

impl std::fmt::Display for LogEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogEventKind::ServerStart => write!(f, "server_start"),
            LogEventKind::ServerStop => write!(f, "server_stop"),
            LogEventKind::SessionClose => write!(f, "session_close"),
            LogEventKind::AuthFailure => write!(f, "auth_failure"),
            LogEventKind::SessionRejected => write!(f, "session_rejected"),
            LogEventKind::Error => write!(f, "error"),
        }
    }
}

/// A structured log event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    /// Timestamp of the event
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,

    /// Kind of event
    pub kind: LogEventKind,

    /// Listener name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listener: Option<String>,

    /// Listener bind address (server start/stop)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<u64>,

    /// Negotiated protocol
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    /// Client peer address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,

    /// Requested destination (host:port)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,

    /// Authenticated (or attempted) username
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Final session state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    /// Bytes from client to destination
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_up: Option<u64>,

    /// Bytes from destination to client
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_down: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Error message (for failed sessions and error events)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Additional context as key-value pairs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl LogEvent {
    /// Create a new log event with the current timestamp
    pub fn new(kind: LogEventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            listener: None,
            address: None,
            session_id: None,
            protocol: None,
            client: None,
            destination: None,
            username: None,
            state: None,
            bytes_up: None,
            bytes_down: None,
            duration_ms: None,
            error: None,
            context: None,
        }
    }

    pub fn with_listener(mut self, name: impl Into<String>) -> Self {
        self.listener = Some(name.into());
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_session_id(mut self, id: u64) -> Self {
        self.session_id = Some(id);
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn with_client(mut self, client: impl Into<String>) -> Self {
        self.client = Some(client.into());
        self
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    /// Set both byte counters
    pub fn with_bytes(mut self, up: u64, down: u64) -> Self {
        self.bytes_up = Some(up);
        self.bytes_down = Some(down);
        self
    }

    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    /// Set the error message
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Set additional context
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    /// Create a listener start event
    pub fn server_start(listener: impl Into<String>, address: impl Into<String>) -> Self {
        Self::new(LogEventKind::ServerStart)
            .with_listener(listener)
            .with_address(address)
    }

    /// Create a listener stop event
    pub fn server_stop(listener: impl Into<String>, address: impl Into<String>) -> Self {
        Self::new(LogEventKind::ServerStop)
            .with_listener(listener)
            .with_address(address)
    }

    /// Create an authentication failure event
    pub fn auth_failure(
        listener: impl Into<String>,
        client: impl Into<String>,
        username: Option<&str>,
    ) -> Self {
        let event = Self::new(LogEventKind::AuthFailure)
            .with_listener(listener)
            .with_client(client);
        match username {
            Some(user) => event.with_username(user),
            None => event,
        }
    }

    /// Create an error event
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogEventKind::Error).with_error(message)
    }

    /// Serialize the event to a JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// JSONL file writer with thread-safe buffered output
pub struct JsonlWriter {
    writer: Mutex<BufWriter<File>>,
}

impl JsonlWriter {
    /// Create a new JSONL writer
    ///
    /// Opens the file for appending. Creates the file (and its parent
    /// directory) if it doesn't exist.
    pub fn new<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Write a log event to the file
    pub fn write(&self, event: &LogEvent) -> std::io::Result<()> {
        let json = event
            .to_json()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| std::io::Error::other("Lock poisoned"))?;

        writeln!(writer, "{}", json)?;
        writer.flush()?;

        Ok(())
    }

    /// Flush any buffered data to the file
    pub fn flush(&self) -> std::io::Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| std::io::Error::other("Lock poisoned"))?;

        writer.flush()
    }
}

impl Drop for JsonlWriter {
    fn drop(&mut self) {
        // Best effort flush on drop
        let _ = self.flush();
    }
}
