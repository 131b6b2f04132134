//! Per-connection protocol handlers
//!
//! Every accepted connection is handed to [`handle_connection`], which
//! creates the [`ProxySession`], runs the handler for the listener's
//! protocol and writes the `session_close` log event however the handler
//! ends.

pub mod http;
pub mod mixed;
pub mod socks5;
pub mod ssh;

use crate::auth::CredentialStore;
use crate::error::{Error, Result};
use crate::logging::{LogEvent, SessionLog};
use crate::net::{BoxStream, Dialer};
use crate::relay::{CloseReason, Relay};
use crate::session::{Protocol, ProxySession, SessionState};
use crate::ssh::HostKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

/// Default bound on everything before the relay starts
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Protocol served on a listening port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerProtocol {
    Http,
    Socks5,
    Ssh,
    /// SOCKS5 or HTTP, decided by the first byte
    Mixed,
}

impl ListenerProtocol {
    /// Session protocol before the handshake refines it
    pub fn initial_session_protocol(&self) -> Protocol {
        match self {
            ListenerProtocol::Http | ListenerProtocol::Mixed => Protocol::Http,
            ListenerProtocol::Socks5 => Protocol::Socks5,
            ListenerProtocol::Ssh => Protocol::SshTunnel,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerProtocol::Http => "http",
            ListenerProtocol::Socks5 => "socks5",
            ListenerProtocol::Ssh => "ssh",
            ListenerProtocol::Mixed => "mixed",
        }
    }
}

impl fmt::Display for ListenerProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ListenerProtocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(ListenerProtocol::Http),
            "socks5" | "socks" => Ok(ListenerProtocol::Socks5),
            "ssh" => Ok(ListenerProtocol::Ssh),
            "mixed" => Ok(ListenerProtocol::Mixed),
            other => Err(Error::Config(format!("unknown listener protocol '{}'", other))),
        }
    }
}

/// Everything a connection handler needs, shared by all connections of
/// one listener
#[derive(Debug, Clone)]
pub struct ProxyContext {
    pub listener: String,
    pub credentials: Arc<CredentialStore>,
    pub dialer: Dialer,
    pub relay: Relay,
    pub handshake_timeout: Duration,
    pub host_key: Option<Arc<HostKey>>,
    pub session_log: SessionLog,
    session_ids: Arc<AtomicU64>,
}

impl ProxyContext {
    pub fn new(listener: impl Into<String>, credentials: Arc<CredentialStore>, dialer: Dialer) -> Self {
        Self {
            listener: listener.into(),
            credentials,
            dialer,
            relay: Relay::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            host_key: None,
            session_log: SessionLog::disabled(),
            session_ids: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn with_relay(mut self, relay: Relay) -> Self {
        self.relay = relay;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_host_key(mut self, host_key: Arc<HostKey>) -> Self {
        self.host_key = Some(host_key);
        self
    }

    pub fn with_session_log(mut self, log: SessionLog) -> Self {
        self.session_log = log;
        self
    }

    /// Share a session id counter with other listeners
    pub fn with_session_ids(mut self, ids: Arc<AtomicU64>) -> Self {
        self.session_ids = ids;
        self
    }

    pub fn next_session_id(&self) -> u64 {
        self.session_ids.fetch_add(1, Ordering::Relaxed)
    }

    fn log_auth_failure(&self, session: &ProxySession, username: Option<&str>) {
        debug!(
            session = session.id(),
            listener = %self.listener,
            client = %session.client_addr(),
            user = username.unwrap_or("-"),
            "Authentication failed"
        );
        self.session_log.log_event(&LogEvent::auth_failure(
            &self.listener,
            session.client_addr().to_string(),
            username,
        ));
    }

    /// Run `fut` under the handshake timeout
    async fn handshake<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.handshake_timeout, fut)
            .await
            .map_err(|_| Error::HandshakeTimeout(self.handshake_timeout))?
    }
}

/// Serve one accepted connection to completion
pub async fn handle_connection(
    ctx: Arc<ProxyContext>,
    protocol: ListenerProtocol,
    stream: TcpStream,
    client_addr: SocketAddr,
) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let session = ProxySession::new(
        ctx.next_session_id(),
        &ctx.listener,
        protocol.initial_session_protocol(),
        client_addr,
    );
    trace!(session = session.id(), listener = %ctx.listener, client = %client_addr, "Accepted connection");

    // The close event is written even if the handler panics
    let log = ctx.session_log.clone();
    let mut session = scopeguard::guard(session, move |mut session| {
        if !session.state().is_terminal() {
            session.finish::<()>(&Err(Error::Other("connection handler aborted".to_string())));
        }
        log.log_event(&session.to_log_event());
    });

    let result = match protocol {
        ListenerProtocol::Http => http::serve(&ctx, stream, &mut session).await,
        ListenerProtocol::Socks5 => socks5::serve(&ctx, stream, &mut session).await,
        ListenerProtocol::Ssh => ssh::serve(&ctx, stream, &mut session).await,
        ListenerProtocol::Mixed => mixed::serve(&ctx, stream, &mut session).await,
    };
    session.finish(&result);

    match &result {
        Ok(()) => debug!(
            session = session.id(),
            listener = %ctx.listener,
            protocol = %session.protocol(),
            destination = %DisplayTarget(&session),
            up = session.bytes_up(),
            down = session.bytes_down(),
            "Session closed"
        ),
        Err(e) if e.is_peer_error() => debug!(
            session = session.id(),
            listener = %ctx.listener,
            client = %client_addr,
            error = %e,
            "Session failed"
        ),
        Err(e) => warn!(
            session = session.id(),
            listener = %ctx.listener,
            client = %client_addr,
            destination = %DisplayTarget(&session),
            error = %e,
            "Session failed"
        ),
    }
    result
}

struct DisplayTarget<'a>(&'a ProxySession);

impl fmt::Display for DisplayTarget<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.destination() {
            Some(dest) => write!(f, "{}", dest),
            None => f.write_str("-"),
        }
    }
}

/// Move `session` forward to `state` unless it is already there or beyond
fn reach(session: &mut ProxySession, state: SessionState) -> Result<()> {
    if session.state() < state {
        session.advance(state)?;
    }
    Ok(())
}

/// Relay an established tunnel and record its byte counts
async fn relay_session<S>(
    ctx: &ProxyContext,
    session: &mut ProxySession,
    client: S,
    destination: BoxStream,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    reach(session, SessionState::Relaying)?;
    let report = ctx.relay.run(client, destination).await;
    session.record(report.stats);
    let reason = report.outcome?;
    trace!(
        session = session.id(),
        reason = match reason {
            CloseReason::EofFromA => "client_eof",
            CloseReason::EofFromB => "destination_eof",
            CloseReason::IdleTimeout => "idle_timeout",
        },
        "Relay finished"
    );
    Ok(())
}
