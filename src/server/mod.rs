//! Listener orchestration
//!
//! A [`Server`] owns one bound TCP listener per configured entry. Running it
//! starts one accept loop per listener; every accepted connection gets its
//! own task running [`proxy::handle_connection`]. A global semaphore caps
//! concurrent sessions across all listeners.

use crate::auth::CredentialStore;
use crate::config::ResolvedConfig;
use crate::error::{Error, Result};
use crate::logging::{LogEvent, LogEventKind, SessionLog};
use crate::net::Dialer;
use crate::proxy::{self, ListenerProtocol, ProxyContext};
use crate::relay::Relay;
use crate::ssh::HostKey;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub const DEFAULT_MAX_SESSIONS: usize = 1024;
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Pause after a failed accept so a persistent error (EMFILE) does not spin
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// A listener waiting to be bound
#[derive(Debug, Clone)]
pub struct ListenerSpec {
    pub protocol: ListenerProtocol,
    pub bind: SocketAddr,
    pub context: ProxyContext,
}

struct BoundListener {
    protocol: ListenerProtocol,
    listener: TcpListener,
    local_addr: SocketAddr,
    context: Arc<ProxyContext>,
}

/// Bound listeners plus the shared limits
pub struct Server {
    listeners: Vec<BoundListener>,
    sessions: Arc<Semaphore>,
    max_sessions: usize,
    shutdown_grace: Duration,
    session_log: SessionLog,
}

impl Server {
    /// Bind every listener; the first failure aborts
    pub async fn bind(
        specs: Vec<ListenerSpec>,
        max_sessions: usize,
        shutdown_grace: Duration,
        session_log: SessionLog,
    ) -> Result<Self> {
        if max_sessions == 0 {
            return Err(Error::Config("max_sessions must be greater than zero".to_string()));
        }

        let mut listeners = Vec::with_capacity(specs.len());
        for spec in specs {
            let listener = TcpListener::bind(spec.bind).await.map_err(|e| {
                Error::Socket(format!(
                    "Failed to bind listener '{}' on {}: {}",
                    spec.context.listener, spec.bind, e
                ))
            })?;
            let local_addr = listener.local_addr()?;
            info!(listener = %spec.context.listener, protocol = %spec.protocol, address = %local_addr, "Listening");
            listeners.push(BoundListener {
                protocol: spec.protocol,
                listener,
                local_addr,
                context: Arc::new(spec.context),
            });
        }

        Ok(Self {
            listeners,
            sessions: Arc::new(Semaphore::new(max_sessions)),
            max_sessions,
            shutdown_grace,
            session_log,
        })
    }

    /// Build contexts for every configured listener and bind them
    pub async fn from_config(config: &ResolvedConfig, session_log: SessionLog) -> Result<Self> {
        let credentials = Arc::new(CredentialStore::from_credentials(
            config.credentials.iter().cloned(),
        ));
        if credentials.is_empty() {
            warn!("No users configured; every login will be rejected");
        }

        let host_key = if config
            .listeners
            .iter()
            .any(|l| l.protocol == ListenerProtocol::Ssh)
        {
            Some(Arc::new(load_host_key(config)?))
        } else {
            None
        };

        let session_ids = Arc::new(AtomicU64::new(1));
        let relay = Relay::new(config.timeouts.idle);
        let specs = config
            .listeners
            .iter()
            .map(|l| {
                let dialer = match &l.upstream {
                    Some(upstream) => Dialer::via(upstream.clone(), config.timeouts.dial()),
                    None => Dialer::direct(config.timeouts.dial()),
                };
                let mut context = ProxyContext::new(&l.name, Arc::clone(&credentials), dialer)
                    .with_relay(relay)
                    .with_handshake_timeout(config.timeouts.handshake)
                    .with_session_log(session_log.clone())
                    .with_session_ids(Arc::clone(&session_ids));
                if let Some(key) = &host_key {
                    context = context.with_host_key(Arc::clone(key));
                }
                ListenerSpec {
                    protocol: l.protocol,
                    bind: l.bind,
                    context,
                }
            })
            .collect();

        Self::bind(
            specs,
            config.max_sessions,
            config.timeouts.shutdown_grace,
            session_log,
        )
        .await
    }

    /// Bound address of every listener, by name
    pub fn local_addrs(&self) -> Vec<(String, SocketAddr)> {
        self.listeners
            .iter()
            .map(|l| (l.context.listener.clone(), l.local_addr))
            .collect()
    }

    pub fn local_addr(&self, name: &str) -> Option<SocketAddr> {
        self.listeners
            .iter()
            .find(|l| l.context.listener == name)
            .map(|l| l.local_addr)
    }

    /// Serve until `shutdown` turns true, then drain
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut loops = JoinSet::new();
        for bound in self.listeners {
            let limits = Limits {
                sessions: Arc::clone(&self.sessions),
                max_sessions: self.max_sessions,
                shutdown_grace: self.shutdown_grace,
            };
            loops.spawn(accept_loop(
                bound,
                limits,
                self.session_log.clone(),
                shutdown.clone(),
            ));
        }

        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Accept loop panicked");
            }
        }
        info!("All listeners stopped");
        Ok(())
    }
}

fn load_host_key(config: &ResolvedConfig) -> Result<HostKey> {
    match &config.host_key {
        Some(path) => {
            let key = HostKey::load(path).map_err(|e| {
                Error::Config(format!("Failed to load host key {}: {}", path.display(), e))
            })?;
            info!(path = %path.display(), fingerprint = %key.fingerprint(), "Loaded SSH host key");
            Ok(key)
        }
        None => {
            let key = HostKey::generate()?;
            warn!(fingerprint = %key.fingerprint(), "No SSH host key configured, using an ephemeral key");
            Ok(key)
        }
    }
}

struct Limits {
    sessions: Arc<Semaphore>,
    max_sessions: usize,
    shutdown_grace: Duration,
}

async fn accept_loop(
    bound: BoundListener,
    limits: Limits,
    session_log: SessionLog,
    mut shutdown: watch::Receiver<bool>,
) {
    let BoundListener {
        protocol,
        listener,
        local_addr,
        context,
    } = bound;
    let name = context.listener.clone();
    session_log.log_event(&LogEvent::server_start(&name, local_addr.to_string()));

    let mut connections = JoinSet::new();
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }

            Some(_) = connections.join_next(), if !connections.is_empty() => {}

            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, client_addr)) => {
                        let Ok(permit) = Arc::clone(&limits.sessions).try_acquire_owned() else {
                            let err = Error::ResourceExhausted(limits.max_sessions);
                            debug!(listener = %name, client = %client_addr, error = %err, "Rejecting connection");
                            session_log.log_event(
                                &LogEvent::new(LogEventKind::SessionRejected)
                                    .with_listener(&name)
                                    .with_client(client_addr.to_string())
                                    .with_error(err.to_string()),
                            );
                            drop(stream);
                            continue;
                        };
                        let context = Arc::clone(&context);
                        connections.spawn(async move {
                            // Errors are logged by the handler itself
                            let _ = proxy::handle_connection(context, protocol, stream, client_addr).await;
                            drop(permit);
                        });
                    }
                    Err(e) => {
                        error!(listener = %name, error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                }
            }
        }
    }

    drop(listener);
    info!(listener = %name, in_flight = connections.len(), "Listener stopped");
    drain(&name, &mut connections, limits.shutdown_grace).await;
    session_log.log_event(&LogEvent::server_stop(&name, local_addr.to_string()));
}

/// Give in-flight sessions `grace` to finish, then abort the rest
async fn drain(name: &str, connections: &mut JoinSet<()>, grace: Duration) {
    if connections.is_empty() {
        return;
    }
    let drained = tokio::time::timeout(grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(listener = %name, remaining = connections.len(), "Shutdown grace expired, aborting sessions");
        connections.abort_all();
        while connections.join_next().await.is_some() {}
    }
}

/// Resolve on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credential;
    use crate::logging::JsonlWriter;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn spec(name: &str, protocol: ListenerProtocol) -> ListenerSpec {
        let store = CredentialStore::from_credentials(vec![Credential::new("u", "p")]);
        ListenerSpec {
            protocol,
            bind: "127.0.0.1:0".parse().unwrap(),
            context: ProxyContext::new(name, Arc::new(store), Dialer::direct(Default::default())),
        }
    }

    #[tokio::test]
    async fn test_bind_reports_addresses() {
        let server = Server::bind(
            vec![spec("a", ListenerProtocol::Http), spec("b", ListenerProtocol::Socks5)],
            4,
            DEFAULT_SHUTDOWN_GRACE,
            SessionLog::disabled(),
        )
        .await
        .unwrap();
        let addrs = server.local_addrs();
        assert_eq!(addrs.len(), 2);
        assert_ne!(addrs[0].1.port(), 0);
        assert_eq!(server.local_addr("b"), Some(addrs[1].1));
        assert_eq!(server.local_addr("c"), None);
    }

    #[tokio::test]
    async fn test_bind_conflict_aborts() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut s = spec("a", ListenerProtocol::Http);
        s.bind = taken.local_addr().unwrap();
        let result = Server::bind(vec![s], 4, DEFAULT_SHUTDOWN_GRACE, SessionLog::disabled()).await;
        assert!(matches!(result, Err(Error::Socket(_))));
    }

    #[tokio::test]
    async fn test_zero_sessions_rejected() {
        let result = Server::bind(vec![], 0, DEFAULT_SHUTDOWN_GRACE, SessionLog::disabled()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_session_limit_closes_new_connections() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("sessions.jsonl");
        let log = SessionLog::from_writer(JsonlWriter::new(&log_path).unwrap());

        let server = Server::bind(
            vec![spec("socks", ListenerProtocol::Socks5)],
            1,
            Duration::from_millis(100),
            log,
        )
        .await
        .unwrap();
        let addr = server.local_addr("socks").unwrap();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(server.run(rx));

        // Holds the only slot while waiting in the greeting
        let mut first = TcpStream::connect(addr).await.unwrap();
        first.write_all(&[0x05]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut buf = Vec::new();
        let n = second.read_to_end(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
        drop(first);

        let contents = std::fs::read_to_string(&log_path).unwrap();
        assert!(contents.contains("\"session_rejected\""));
        assert!(contents.contains("\"server_start\""));
        assert!(contents.contains("\"server_stop\""));
    }

    #[tokio::test]
    async fn test_shutdown_aborts_stuck_sessions() {
        let server = Server::bind(
            vec![spec("http", ListenerProtocol::Http)],
            8,
            Duration::from_millis(50),
            SessionLog::disabled(),
        )
        .await
        .unwrap();
        let addr = server.local_addr("http").unwrap();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(server.run(rx));

        // Never sends a request head
        let mut idle = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(idle.read(&mut buf).await.unwrap_or(0), 0);
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
