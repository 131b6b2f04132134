//! Destination addresses, boxed streams and outbound dialing

pub mod dial;

pub use dial::{Connected, DialTimeouts, Dialer, Upstream, UpstreamKind};

use crate::error::{Error, Result};
use bytes::{Buf, Bytes};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A connection destination as requested by a client
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
    Ip(SocketAddr),
    /// Unresolved host name and port
    Domain(String, u16),
}

impl TargetAddr {
    /// Build from a host string; IP literals become `Ip`, anything else a `Domain`
    pub fn from_host_port(host: &str, port: u16) -> Self {
        let trimmed = host.trim_start_matches('[').trim_end_matches(']');
        match trimmed.parse::<IpAddr>() {
            Ok(ip) => TargetAddr::Ip(SocketAddr::new(ip, port)),
            Err(_) => TargetAddr::Domain(host.to_string(), port),
        }
    }

    /// Parse an authority (`host:port`, `[v6]:port`, or `host` with
    /// `default_port`)
    pub fn parse_authority(authority: &str, default_port: Option<u16>) -> Result<Self> {
        let invalid = || Error::Protocol(format!("invalid authority '{}'", authority));

        if authority.is_empty() {
            return Err(invalid());
        }

        if let Some(rest) = authority.strip_prefix('[') {
            let (host, after) = rest.split_once(']').ok_or_else(invalid)?;
            let ip: IpAddr = host.parse().map_err(|_| invalid())?;
            let port = match after.strip_prefix(':') {
                Some(p) => p.parse().map_err(|_| invalid())?,
                None if after.is_empty() => default_port.ok_or_else(invalid)?,
                None => return Err(invalid()),
            };
            return Ok(TargetAddr::Ip(SocketAddr::new(ip, port)));
        }

        // A bare IPv6 address has more than one colon
        if authority.matches(':').count() > 1 {
            let ip: IpAddr = authority.parse().map_err(|_| invalid())?;
            let port = default_port.ok_or_else(invalid)?;
            return Ok(TargetAddr::Ip(SocketAddr::new(ip, port)));
        }

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (host, port.parse().map_err(|_| invalid())?),
            None => (authority, default_port.ok_or_else(invalid)?),
        };
        if host.is_empty() {
            return Err(invalid());
        }
        Ok(Self::from_host_port(host, port))
    }

    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    /// Host part without brackets
    pub fn host(&self) -> String {
        match self {
            TargetAddr::Ip(addr) => addr.ip().to_string(),
            TargetAddr::Domain(host, _) => host.clone(),
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        TargetAddr::Ip(addr)
    }
}

/// Any bidirectional byte stream a session can relay over
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProxyStream for T {}

/// Type-erased stream returned by the dialer
pub type BoxStream = Box<dyn ProxyStream>;

/// A stream with bytes already read from it pushed back in front
///
/// Used after sniffing the first byte on a mixed port and for bytes read
/// past a handshake head.
pub struct PrefixedStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: impl Into<Bytes>, inner: S) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Returns the unread prefix and the inner stream
    pub fn into_parts(self) -> (Bytes, S) {
        (self.prefix, self.inner)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.prefix.has_remaining() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_parse_authority() {
        assert_eq!(
            TargetAddr::parse_authority("example.com:443", None).unwrap(),
            TargetAddr::Domain("example.com".into(), 443)
        );
        assert_eq!(
            TargetAddr::parse_authority("example.com", Some(80)).unwrap(),
            TargetAddr::Domain("example.com".into(), 80)
        );
        assert_eq!(
            TargetAddr::parse_authority("10.1.2.3:8080", None).unwrap(),
            TargetAddr::Ip("10.1.2.3:8080".parse().unwrap())
        );
        assert_eq!(
            TargetAddr::parse_authority("[::1]:22", None).unwrap(),
            TargetAddr::Ip("[::1]:22".parse().unwrap())
        );
        assert_eq!(
            TargetAddr::parse_authority("[::1]", Some(80)).unwrap(),
            TargetAddr::Ip("[::1]:80".parse().unwrap())
        );
    }

    #[test]
    fn test_parse_authority_rejects_garbage() {
        assert!(TargetAddr::parse_authority("", Some(80)).is_err());
        assert!(TargetAddr::parse_authority("example.com", None).is_err());
        assert!(TargetAddr::parse_authority("example.com:http", None).is_err());
        assert!(TargetAddr::parse_authority(":80", None).is_err());
        assert!(TargetAddr::parse_authority("[::1", Some(80)).is_err());
        assert!(TargetAddr::parse_authority("host:99999", None).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            TargetAddr::Domain("example.com".into(), 80).to_string(),
            "example.com:80"
        );
        assert_eq!(
            TargetAddr::Ip("[2001:db8::1]:443".parse().unwrap()).to_string(),
            "[2001:db8::1]:443"
        );
    }

    #[tokio::test]
    async fn test_prefixed_stream_reads_prefix_first() {
        let (mut remote, local) = tokio::io::duplex(64);
        let mut stream = PrefixedStream::new(Bytes::from_static(b"\x05"), local);

        remote.write_all(b"rest").await.unwrap();
        drop(remote);

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"\x05rest");
    }
}
