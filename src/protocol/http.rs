//! HTTP/1.x proxy framing
//!
//! Only what a forwarding proxy needs: reading message heads, parsing them
//! with `httparse`, rewriting absolute-form requests to origin-form and
//! copying bodies according to their framing. Heads are kept as raw bytes
//! so responses can be relayed unchanged.

use crate::error::{Error, Result};
use crate::net::TargetAddr;
use bytes::{Buf, BufMut, BytesMut};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for a request or response head
pub const MAX_HEAD_BYTES: usize = 32 * 1024;

/// Upper bound for header lines in one head
pub const MAX_HEADERS: usize = 64;

/// Longest accepted chunk-size or trailer line
const MAX_LINE_BYTES: usize = 8 * 1024;

/// Realm sent in `Proxy-Authenticate`
pub const REALM: &str = "authproxy";

pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Build an error response that closes the connection
pub fn error_response(code: u16) -> Vec<u8> {
    let reason = match code {
        400 => "Bad Request",
        407 => "Proxy Authentication Required",
        502 => "Bad Gateway",
        504 => "Gateway Timeout",
        _ => "Error",
    };
    let mut out = format!("HTTP/1.1 {} {}\r\n", code, reason);
    if code == 407 {
        out.push_str(&format!("Proxy-Authenticate: Basic realm=\"{}\"\r\n", REALM));
    }
    out.push_str("Content-Length: 0\r\nConnection: close\r\n\r\n");
    out.into_bytes()
}

/// How a message body is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    Length(u64),
    Chunked,
    /// Response read until the server closes
    UntilEof,
}

type Headers = Vec<(String, Vec<u8>)>;

fn find_header<'a>(headers: &'a Headers, name: &str) -> Option<&'a [u8]> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_slice())
}

/// Whether any `name` header lists `token` (comma separated, case-insensitive)
fn has_token(headers: &Headers, name: &str, token: &str) -> bool {
    headers
        .iter()
        .filter(|(n, _)| n.eq_ignore_ascii_case(name))
        .flat_map(|(_, v)| v.split(|b| *b == b','))
        .any(|t| t.trim_ascii().eq_ignore_ascii_case(token.as_bytes()))
}

fn content_length(headers: &Headers) -> Result<Option<u64>> {
    match find_header(headers, "content-length") {
        Some(value) => std::str::from_utf8(value)
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .map(Some)
            .ok_or_else(|| Error::Protocol("invalid Content-Length".to_string())),
        None => Ok(None),
    }
}

fn is_chunked(headers: &Headers) -> bool {
    has_token(headers, "transfer-encoding", "chunked")
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> Headers {
    parsed
        .iter()
        .map(|h| (h.name.to_string(), h.value.to_vec()))
        .collect()
}

/// A parsed request head
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    /// Request target exactly as sent (`host:port` for CONNECT)
    pub target: String,
    /// Minor version: 0 for HTTP/1.0, 1 for HTTP/1.1
    pub version: u8,
    pub headers: Headers,
}

impl Request {
    pub fn parse(head: &[u8]) -> Result<Self> {
        let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut storage);
        match req.parse(head) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                return Err(Error::Protocol("incomplete request head".to_string()));
            }
            Err(e) => return Err(Error::Protocol(format!("invalid request: {}", e))),
        }

        let method = req
            .method
            .ok_or_else(|| Error::Protocol("missing method".to_string()))?;
        let target = req
            .path
            .ok_or_else(|| Error::Protocol("missing request target".to_string()))?;

        Ok(Self {
            method: method.to_string(),
            target: target.to_string(),
            version: req.version.unwrap_or(1),
            headers: collect_headers(req.headers),
        })
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    pub fn header(&self, name: &str) -> Option<&[u8]> {
        find_header(&self.headers, name)
    }

    /// Destination of a CONNECT request
    pub fn connect_target(&self) -> Result<TargetAddr> {
        TargetAddr::parse_authority(&self.target, None)
    }

    /// Split an absolute `http://` URI into destination, authority and
    /// origin-form path
    pub fn absolute_target(&self) -> Result<(TargetAddr, String, String)> {
        let scheme = "http://";
        let uri = &self.target;
        let rest = match uri.get(..scheme.len()) {
            Some(prefix) if prefix.eq_ignore_ascii_case(scheme) => &uri[scheme.len()..],
            _ => {
                return Err(Error::Protocol(format!(
                    "request target is not an absolute http URI: {}",
                    uri
                )));
            }
        };
        let (authority, path) = match rest.find(['/', '?']) {
            Some(idx) if rest.as_bytes()[idx] == b'?' => (&rest[..idx], format!("/{}", &rest[idx..])),
            Some(idx) => (&rest[..idx], rest[idx..].to_string()),
            None => (rest, "/".to_string()),
        };
        // Userinfo is not allowed in proxied URIs
        if authority.contains('@') {
            return Err(Error::Protocol("userinfo in request URI".to_string()));
        }
        let target = TargetAddr::parse_authority(authority, Some(80))?;
        Ok((target, authority.to_string(), path))
    }

    pub fn body_framing(&self) -> Result<BodyFraming> {
        if is_chunked(&self.headers) {
            return Ok(BodyFraming::Chunked);
        }
        Ok(match content_length(&self.headers)? {
            Some(0) | None => BodyFraming::None,
            Some(n) => BodyFraming::Length(n),
        })
    }

    /// Whether the client asked to close after this exchange
    pub fn wants_close(&self) -> bool {
        if has_token(&self.headers, "connection", "close")
            || has_token(&self.headers, "proxy-connection", "close")
        {
            return true;
        }
        self.version == 0
            && !has_token(&self.headers, "connection", "keep-alive")
            && !has_token(&self.headers, "proxy-connection", "keep-alive")
    }

    /// Serialize in origin-form for the destination server
    ///
    /// Proxy-only headers are dropped and `Host` is added when missing.
    pub fn to_origin_form(&self, authority: &str, path: &str) -> BytesMut {
        let mut out = BytesMut::with_capacity(256);
        out.put_slice(self.method.as_bytes());
        out.put_u8(b' ');
        out.put_slice(path.as_bytes());
        out.put_slice(format!(" HTTP/1.{}\r\n", self.version).as_bytes());

        if self.header("host").is_none() {
            out.put_slice(b"Host: ");
            out.put_slice(authority.as_bytes());
            out.put_slice(b"\r\n");
        }
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("proxy-authorization")
                || name.eq_ignore_ascii_case("proxy-connection")
            {
                continue;
            }
            out.put_slice(name.as_bytes());
            out.put_slice(b": ");
            out.put_slice(value);
            out.put_slice(b"\r\n");
        }
        out.put_slice(b"\r\n");
        out
    }
}

/// A parsed response head
#[derive(Debug, Clone)]
pub struct Response {
    pub code: u16,
    pub version: u8,
    pub headers: Headers,
}

impl Response {
    pub fn parse(head: &[u8]) -> Result<Self> {
        let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut resp = httparse::Response::new(&mut storage);
        match resp.parse(head) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                return Err(Error::Protocol("incomplete response head".to_string()));
            }
            Err(e) => return Err(Error::Protocol(format!("invalid response: {}", e))),
        }
        Ok(Self {
            code: resp
                .code
                .ok_or_else(|| Error::Protocol("missing status code".to_string()))?,
            version: resp.version.unwrap_or(1),
            headers: collect_headers(resp.headers),
        })
    }

    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.code)
    }

    /// Body framing given the request method
    pub fn body_framing(&self, request_method: &str) -> Result<BodyFraming> {
        if request_method.eq_ignore_ascii_case("HEAD")
            || self.is_informational()
            || self.code == 204
            || self.code == 304
        {
            return Ok(BodyFraming::None);
        }
        if is_chunked(&self.headers) {
            return Ok(BodyFraming::Chunked);
        }
        Ok(match content_length(&self.headers)? {
            Some(0) => BodyFraming::None,
            Some(n) => BodyFraming::Length(n),
            None => BodyFraming::UntilEof,
        })
    }

    /// Whether the server will close after this response
    pub fn wants_close(&self) -> bool {
        has_token(&self.headers, "connection", "close")
            || (self.version == 0 && !has_token(&self.headers, "connection", "keep-alive"))
    }
}

/// A buffered HTTP connection
///
/// Bytes read past the current head stay in the buffer and are consumed by
/// the body copy helpers or handed back with [`HttpConn::into_parts`].
///
/// With an idle timeout set, every single read and write must make progress
/// within it; a slow but steady body never times out.
pub struct HttpConn<S> {
    io: S,
    buf: BytesMut,
    idle: Option<Duration>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> HttpConn<S> {
    pub fn new(io: S) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(8 * 1024),
            idle: None,
        }
    }

    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        self.idle = Some(idle);
        self
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.io
    }

    /// Returns the stream and any bytes already read but not consumed
    pub fn into_parts(self) -> (S, BytesMut) {
        (self.io, self.buf)
    }

    async fn fill(&mut self) -> Result<usize> {
        let read = self.io.read_buf(&mut self.buf);
        progress(self.idle, read).await
    }

    /// Read the next message head including the blank line
    ///
    /// Returns `None` on a clean EOF before any byte of a new head.
    pub async fn read_head(&mut self) -> Result<Option<BytesMut>> {
        let mut scanned = 0;
        loop {
            if let Some(end) = find_head_end(&self.buf, scanned) {
                return Ok(Some(self.buf.split_to(end)));
            }
            if self.buf.len() >= MAX_HEAD_BYTES {
                return Err(Error::Protocol("message head too large".to_string()));
            }
            scanned = self.buf.len().saturating_sub(3);
            if self.fill().await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(Error::Protocol("connection closed inside message head".to_string()));
            }
        }
    }

    /// Read one CRLF-terminated line, terminator included
    async fn read_line(&mut self) -> Result<BytesMut> {
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                return Ok(self.buf.split_to(pos + 1));
            }
            if self.buf.len() >= MAX_LINE_BYTES {
                return Err(Error::Protocol("line too long".to_string()));
            }
            if self.fill().await? == 0 {
                return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
        }
    }

    /// Copy exactly `n` body bytes to `out`
    pub async fn copy_exact<W: AsyncWrite + Unpin>(&mut self, out: &mut W, n: u64) -> Result<u64> {
        let mut remaining = n;
        while remaining > 0 {
            if self.buf.is_empty() && self.fill().await? == 0 {
                return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
            let take = (self.buf.len() as u64).min(remaining) as usize;
            progress(self.idle, out.write_all(&self.buf[..take])).await?;
            self.buf.advance(take);
            remaining -= take as u64;
        }
        Ok(n)
    }

    /// Copy a chunked body verbatim, trailers included
    pub async fn copy_chunked<W: AsyncWrite + Unpin>(&mut self, out: &mut W) -> Result<u64> {
        let mut total = 0u64;
        loop {
            let line = self.read_line().await?;
            progress(self.idle, out.write_all(&line)).await?;
            total += line.len() as u64;

            let size = parse_chunk_size(&line)?;
            if size == 0 {
                // Trailer section ends with an empty line
                loop {
                    let trailer = self.read_line().await?;
                    progress(self.idle, out.write_all(&trailer)).await?;
                    total += trailer.len() as u64;
                    if trailer.trim_ascii().is_empty() {
                        return Ok(total);
                    }
                }
            }

            total += self.copy_exact(out, size).await?;
            let crlf = self.read_line().await?;
            if !crlf.trim_ascii().is_empty() {
                return Err(Error::Protocol("missing CRLF after chunk".to_string()));
            }
            progress(self.idle, out.write_all(&crlf)).await?;
            total += crlf.len() as u64;
        }
    }

    /// Copy everything until the peer closes
    pub async fn copy_until_eof<W: AsyncWrite + Unpin>(&mut self, out: &mut W) -> Result<u64> {
        let mut total = 0u64;
        loop {
            if self.buf.is_empty() && self.fill().await? == 0 {
                return Ok(total);
            }
            progress(self.idle, out.write_all(&self.buf)).await?;
            total += self.buf.len() as u64;
            self.buf.clear();
        }
    }

    /// Copy a body with the given framing
    pub async fn copy_body<W: AsyncWrite + Unpin>(
        &mut self,
        out: &mut W,
        framing: BodyFraming,
    ) -> Result<u64> {
        let n = match framing {
            BodyFraming::None => 0,
            BodyFraming::Length(n) => self.copy_exact(out, n).await?,
            BodyFraming::Chunked => self.copy_chunked(out).await?,
            BodyFraming::UntilEof => self.copy_until_eof(out).await?,
        };
        progress(self.idle, out.flush()).await?;
        Ok(n)
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let io = &mut self.io;
        let write = async move {
            io.write_all(data).await?;
            io.flush().await
        };
        progress(self.idle, write).await
    }
}

/// Run one I/O step, failing with [`Error::IdleTimeout`] if it stalls
async fn progress<T, F>(idle: Option<Duration>, io: F) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    match idle {
        Some(idle) => tokio::time::timeout(idle, io)
            .await
            .map_err(|_| Error::IdleTimeout(idle))?
            .map_err(Error::from),
        None => Ok(io.await?),
    }
}

/// Offset just past `\r\n\r\n`, searching from `from`
fn find_head_end(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| from + pos + 4)
}

fn parse_chunk_size(line: &[u8]) -> Result<u64> {
    let line = line.trim_ascii();
    let size = match line.iter().position(|b| *b == b';') {
        Some(idx) => &line[..idx],
        None => line,
    };
    std::str::from_utf8(size.trim_ascii())
        .ok()
        .and_then(|s| u64::from_str_radix(s, 16).ok())
        .ok_or_else(|| Error::Protocol("invalid chunk size".to_string()))
}
