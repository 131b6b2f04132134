//! Outbound connections: direct TCP or chained through an upstream proxy

use crate::auth::encode_basic;
use crate::error::{Error, Result};
use crate::protocol::http::{HttpConn, Response};
use crate::protocol::socks5::{self, Method, Reply};
use crate::ssh::SshClient;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::{BoxStream, PrefixedStream, TargetAddr};

/// Default timeout for a TCP connect (and upstream negotiation)
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for name resolution
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialTimeouts {
    pub connect: Duration,
    pub resolve: Duration,
}

impl Default for DialTimeouts {
    fn default() -> Self {
        Self {
            connect: DEFAULT_CONNECT_TIMEOUT,
            resolve: DEFAULT_RESOLVE_TIMEOUT,
        }
    }
}

/// How an upstream is spoken to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamKind {
    Direct,
    Http,
    Socks5,
    Ssh,
}

impl fmt::Display for UpstreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UpstreamKind::Direct => "direct",
            UpstreamKind::Http => "http",
            UpstreamKind::Socks5 => "socks5",
            UpstreamKind::Ssh => "ssh",
        };
        f.write_str(s)
    }
}

/// A proxy that outbound connections are chained through
#[derive(Clone)]
pub struct Upstream {
    pub name: String,
    pub kind: UpstreamKind,
    pub address: TargetAddr,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Expected SSH host key (`SHA256:...`), ssh only
    pub host_key_fingerprint: Option<String>,
}

impl Upstream {
    pub fn new(name: impl Into<String>, kind: UpstreamKind, address: TargetAddr) -> Self {
        Self {
            name: name.into(),
            kind,
            address,
            username: None,
            password: None,
            host_key_fingerprint: None,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_host_key_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.host_key_fingerprint = Some(fingerprint.into());
        self
    }

    fn credentials(&self) -> Option<(&str, &str)> {
        self.username.as_deref().zip(self.password.as_deref())
    }
}

impl fmt::Debug for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upstream")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("address", &self.address)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("host_key_fingerprint", &self.host_key_fingerprint)
            .finish()
    }
}

/// An established outbound stream
pub struct Connected {
    pub stream: BoxStream,
    /// Local address of the TCP connection; `None` when chained
    pub local_addr: Option<SocketAddr>,
}

impl fmt::Debug for Connected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connected")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

/// Opens destination connections for the listeners
#[derive(Debug, Clone)]
pub struct Dialer {
    upstream: Option<Arc<Upstream>>,
    timeouts: DialTimeouts,
}

impl Dialer {
    pub fn direct(timeouts: DialTimeouts) -> Self {
        Self {
            upstream: None,
            timeouts,
        }
    }

    /// Chain through `upstream`; a `direct` upstream dials directly
    pub fn via(upstream: Upstream, timeouts: DialTimeouts) -> Self {
        if upstream.kind == UpstreamKind::Direct {
            return Self::direct(timeouts);
        }
        Self {
            upstream: Some(Arc::new(upstream)),
            timeouts,
        }
    }

    pub fn upstream(&self) -> Option<&Upstream> {
        self.upstream.as_deref()
    }

    pub fn timeouts(&self) -> DialTimeouts {
        self.timeouts
    }

    /// Connect to `target`
    pub async fn dial(&self, target: &TargetAddr) -> Result<Connected> {
        match &self.upstream {
            None => {
                let stream = connect_tcp(target, &self.timeouts).await?;
                let local_addr = stream.local_addr().ok();
                trace!(destination = %target, local = ?local_addr, "Connected directly");
                Ok(Connected {
                    stream: Box::new(stream),
                    local_addr,
                })
            }
            Some(upstream) => {
                let stream = self.dial_upstream(upstream, target).await?;
                Ok(Connected {
                    stream,
                    local_addr: None,
                })
            }
        }
    }

    async fn dial_upstream(&self, upstream: &Upstream, target: &TargetAddr) -> Result<BoxStream> {
        let tcp = connect_tcp(&upstream.address, &self.timeouts).await?;

        let negotiate = async {
            match upstream.kind {
                UpstreamKind::Direct => Ok(Box::new(tcp) as BoxStream),
                UpstreamKind::Http => http_connect(tcp, upstream, target).await,
                UpstreamKind::Socks5 => socks5_connect(tcp, upstream, target).await,
                UpstreamKind::Ssh => ssh_connect(tcp, upstream, target).await,
            }
        };

        let stream = tokio::time::timeout(self.timeouts.connect, negotiate)
            .await
            .map_err(|_| Error::DialTimeout(format!("{} via {}", target, upstream.name)))??;

        debug!(
            destination = %target,
            upstream = %upstream.name,
            kind = %upstream.kind,
            "Connected through upstream"
        );
        Ok(stream)
    }
}

/// Resolve `target` under the resolve timeout
pub async fn resolve(target: &TargetAddr, timeout: Duration) -> Result<Vec<SocketAddr>> {
    match target {
        TargetAddr::Ip(addr) => Ok(vec![*addr]),
        TargetAddr::Domain(host, port) => {
            let addrs = tokio::time::timeout(timeout, tokio::net::lookup_host((host.as_str(), *port)))
                .await
                .map_err(|_| Error::Resolve(format!("{} (timed out after {:?})", host, timeout)))?
                .map_err(|e| Error::Resolve(format!("{}: {}", host, e)))?
                .collect::<Vec<_>>();
            if addrs.is_empty() {
                return Err(Error::Resolve(format!("{}: no addresses", host)));
            }
            Ok(addrs)
        }
    }
}

/// Resolve and connect, trying each address in turn
async fn connect_tcp(target: &TargetAddr, timeouts: &DialTimeouts) -> Result<TcpStream> {
    let addrs = resolve(target, timeouts.resolve).await?;
    let stream = connect_any(target, &addrs, timeouts.connect, TcpStream::connect).await?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Try `addrs` in order until one connects
///
/// `deadline` bounds all attempts together, not each one.
async fn connect_any<T, F, Fut>(
    target: &TargetAddr,
    addrs: &[SocketAddr],
    deadline: Duration,
    mut connect: F,
) -> Result<T>
where
    F: FnMut(SocketAddr) -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    let attempts = async {
        let mut last_error = None;
        for addr in addrs {
            match connect(*addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    trace!(address = %addr, error = %e, "Connect attempt failed");
                    last_error = Some(Error::Dial {
                        target: target.to_string(),
                        source: e,
                    });
                }
            }
        }
        Err(last_error.unwrap_or_else(|| Error::Resolve(target.to_string())))
    };
    match tokio::time::timeout(deadline, attempts).await {
        Ok(result) => result,
        Err(_) => {
            trace!(destination = %target, "Connect timed out");
            Err(Error::DialTimeout(target.to_string()))
        }
    }
}

async fn http_connect(
    stream: TcpStream,
    upstream: &Upstream,
    target: &TargetAddr,
) -> Result<BoxStream> {
    let authority = match target {
        TargetAddr::Ip(SocketAddr::V6(addr)) => format!("[{}]:{}", addr.ip(), addr.port()),
        other => other.to_string(),
    };
    let mut request = format!(
        "CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n",
        authority
    );
    if let Some((username, password)) = upstream.credentials() {
        request.push_str(&format!(
            "Proxy-Authorization: {}\r\n",
            encode_basic(username, password)
        ));
    }
    request.push_str("\r\n");

    let mut conn = HttpConn::new(stream);
    conn.write_all(request.as_bytes()).await?;
    let head = conn.read_head().await?.ok_or_else(|| {
        Error::Upstream(format!("{} closed the connection during CONNECT", upstream.name))
    })?;
    let response = Response::parse(&head)?;
    if !(200..300).contains(&response.code) {
        return Err(Error::Upstream(format!(
            "{} refused CONNECT to {} with status {}",
            upstream.name, target, response.code
        )));
    }

    let (io, leftover) = conn.into_parts();
    Ok(Box::new(PrefixedStream::new(leftover.freeze(), io)))
}

async fn socks5_connect(
    mut stream: TcpStream,
    upstream: &Upstream,
    target: &TargetAddr,
) -> Result<BoxStream> {
    let credentials = upstream.credentials();
    let greeting: &[u8] = if credentials.is_some() {
        &[socks5::VERSION, 2, Method::NoAuth as u8, Method::UserPass as u8]
    } else {
        &[socks5::VERSION, 1, Method::NoAuth as u8]
    };
    stream.write_all(greeting).await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != socks5::VERSION {
        return Err(Error::Upstream(format!(
            "{} is not a SOCKS5 server",
            upstream.name
        )));
    }

    match (choice[1], credentials) {
        (m, _) if m == Method::NoAuth as u8 => {}
        (m, Some((username, password))) if m == Method::UserPass as u8 => {
            stream
                .write_all(&socks5::encode_auth(username, password)?)
                .await?;
            let mut status = [0u8; 2];
            stream.read_exact(&mut status).await?;
            if status[1] != 0x00 {
                return Err(Error::Upstream(format!(
                    "{} rejected SOCKS5 credentials",
                    upstream.name
                )));
            }
        }
        _ => {
            return Err(Error::Upstream(format!(
                "{} offered no acceptable SOCKS5 auth method",
                upstream.name
            )));
        }
    }

    stream.write_all(&socks5::encode_connect(target)?).await?;
    // The reply header has the same layout as a request header
    let (rep, atyp) = socks5::read_request_header(&mut stream).await?;
    if rep != Reply::Succeeded as u8 {
        return Err(Error::Upstream(format!(
            "{} failed CONNECT to {}: {:?}",
            upstream.name,
            target,
            Reply::from_u8(rep)
        )));
    }
    let _bound = socks5::read_address(&mut stream, atyp).await?;

    Ok(Box::new(stream))
}

async fn ssh_connect(
    stream: TcpStream,
    upstream: &Upstream,
    target: &TargetAddr,
) -> Result<BoxStream> {
    let (username, password) = upstream.credentials().ok_or_else(|| {
        Error::Config(format!(
            "SSH upstream {} requires a username and password",
            upstream.name
        ))
    })?;
    let local = stream
        .local_addr()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));

    let client = SshClient::connect(
        stream,
        username,
        password,
        upstream.host_key_fingerprint.as_deref(),
    )
    .await?;
    let local_ip = local.ip().to_string();
    let (channel, _task) = client
        .open_direct_tcpip(target, (&local_ip, local.port()))
        .await?;
    Ok(Box::new(channel))
}
