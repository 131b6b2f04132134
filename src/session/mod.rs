//! Per-connection proxy session
//!
//! A [`ProxySession`] is created when a connection is accepted and is owned by
//! the task handling that connection for its whole life. Its state only ever
//! moves forward; `Closed` and `Failed` are terminal.

use crate::error::{Error, Result};
use crate::logging::{LogEvent, LogEventKind};
use crate::net::TargetAddr;
use crate::relay::RelayStats;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

/// Protocol a session was negotiated with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Plain HTTP proxying of absolute-URI requests
    Http,
    /// HTTP CONNECT tunnel
    HttpsConnect,
    Socks5,
    SshTunnel,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::HttpsConnect => "https_connect",
            Protocol::Socks5 => "socks5",
            Protocol::SshTunnel => "ssh_tunnel",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session lifecycle stage, ordered
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Negotiating,
    Authenticating,
    Connecting,
    Relaying,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Negotiating => "negotiating",
            SessionState::Authenticating => "authenticating",
            SessionState::Connecting => "connecting",
            SessionState::Relaying => "relaying",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One client-to-destination tunnel
#[derive(Debug)]
pub struct ProxySession {
    id: u64,
    listener: String,
    protocol: Protocol,
    client_addr: SocketAddr,
    destination: Option<TargetAddr>,
    username: Option<String>,
    started_at: DateTime<Utc>,
    started: Instant,
    bytes_up: u64,
    bytes_down: u64,
    state: SessionState,
    error: Option<String>,
}

impl ProxySession {
    /// Create a session in the `Negotiating` state
    pub fn new(
        id: u64,
        listener: impl Into<String>,
        protocol: Protocol,
        client_addr: SocketAddr,
    ) -> Self {
        Self {
            id,
            listener: listener.into(),
            protocol,
            client_addr,
            destination: None,
            username: None,
            started_at: Utc::now(),
            started: Instant::now(),
            bytes_up: 0,
            bytes_down: 0,
            state: SessionState::Negotiating,
            error: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn listener(&self) -> &str {
        &self.listener
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn destination(&self) -> Option<&TargetAddr> {
        self.destination.as_ref()
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn bytes_up(&self) -> u64 {
        self.bytes_up
    }

    pub fn bytes_down(&self) -> u64 {
        self.bytes_down
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Refine the protocol once the handshake reveals it
    ///
    /// Only allowed while still negotiating (e.g. a mixed port detecting
    /// SOCKS5, or an HTTP request turning out to be CONNECT).
    pub fn identify(&mut self, protocol: Protocol) -> Result<()> {
        if self.state != SessionState::Negotiating && self.protocol != protocol {
            return Err(Error::InvalidTransition {
                from: self.protocol.to_string(),
                to: protocol.to_string(),
            });
        }
        self.protocol = protocol;
        Ok(())
    }

    /// Move to a later state
    ///
    /// Stages may be skipped but never revisited. Re-entering the current
    /// non-terminal state is a no-op, which lets keep-alive HTTP stay in
    /// `Relaying` across requests.
    pub fn advance(&mut self, next: SessionState) -> Result<()> {
        if self.state.is_terminal() || next < self.state {
            return Err(Error::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        if next != self.state {
            tracing::trace!(session = self.id, from = %self.state, to = %next, "Session state");
            self.state = next;
        }
        Ok(())
    }

    pub fn set_destination(&mut self, destination: TargetAddr) {
        self.destination = Some(destination);
    }

    pub fn set_username(&mut self, username: impl Into<String>) {
        self.username = Some(username.into());
    }

    /// Add relayed byte counts (client→destination is "up")
    pub fn record(&mut self, stats: RelayStats) {
        self.bytes_up += stats.a_to_b;
        self.bytes_down += stats.b_to_a;
    }

    pub fn add_up(&mut self, n: u64) {
        self.bytes_up += n;
    }

    pub fn add_down(&mut self, n: u64) {
        self.bytes_down += n;
    }

    /// Finish the session according to the handler's result
    ///
    /// Idempotent once terminal.
    pub fn finish<T>(&mut self, result: &Result<T>) {
        if self.state.is_terminal() {
            return;
        }
        match result {
            Ok(_) => self.state = SessionState::Closed,
            Err(e) => {
                self.state = SessionState::Failed;
                self.error = Some(e.to_string());
            }
        }
    }

    /// Time since the session was accepted
    pub fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    /// Build the `session_close` log event for this session
    pub fn to_log_event(&self) -> LogEvent {
        let mut event = LogEvent::new(LogEventKind::SessionClose)
            .with_listener(&self.listener)
            .with_session_id(self.id)
            .with_protocol(self.protocol.as_str())
            .with_client(self.client_addr.to_string())
            .with_state(self.state.as_str())
            .with_bytes(self.bytes_up, self.bytes_down)
            .with_duration_ms(self.elapsed().as_millis() as u64);
        if let Some(dest) = &self.destination {
            event = event.with_destination(dest.to_string());
        }
        if let Some(user) = &self.username {
            event = event.with_username(user);
        }
        if let Some(err) = &self.error {
            event = event.with_error(err);
        }
        event
    }
}
