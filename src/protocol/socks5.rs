//! SOCKS5 wire format (RFC 1928 CONNECT subset, RFC 1929 auth)
//!
//! Shared by the SOCKS5 listener and the upstream SOCKS5 dialer.

use crate::error::{Error, Result};
use crate::net::TargetAddr;
use bytes::{BufMut, BytesMut};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const VERSION: u8 = 0x05;
/// RFC 1929 sub-negotiation version
pub const AUTH_VERSION: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Authentication methods
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    NoAuth = 0x00,
    UserPass = 0x02,
    NoAcceptable = 0xff,
}

/// Request commands
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

impl Command {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Command::Connect),
            0x02 => Some(Command::Bind),
            0x03 => Some(Command::UdpAssociate),
            _ => None,
        }
    }
}

/// Reply codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl Reply {
    /// Map a dial failure onto the closest reply code
    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::Resolve(_) | Error::DialTimeout(_) => Reply::HostUnreachable,
            Error::Dial { source, .. } => match source.kind() {
                ErrorKind::ConnectionRefused => Reply::ConnectionRefused,
                ErrorKind::NetworkUnreachable => Reply::NetworkUnreachable,
                ErrorKind::HostUnreachable => Reply::HostUnreachable,
                ErrorKind::TimedOut => Reply::HostUnreachable,
                _ => Reply::GeneralFailure,
            },
            _ => Reply::GeneralFailure,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => Reply::Succeeded,
            0x02 => Reply::NotAllowed,
            0x03 => Reply::NetworkUnreachable,
            0x04 => Reply::HostUnreachable,
            0x05 => Reply::ConnectionRefused,
            0x06 => Reply::TtlExpired,
            0x07 => Reply::CommandNotSupported,
            0x08 => Reply::AddressTypeNotSupported,
            _ => Reply::GeneralFailure,
        }
    }
}

/// Client greeting: version byte already checked, offered methods returned
pub async fn read_greeting<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let version = reader.read_u8().await?;
    if version != VERSION {
        return Err(Error::Protocol(format!(
            "unsupported SOCKS version 0x{:02x}",
            version
        )));
    }
    let n_methods = reader.read_u8().await?;
    let mut methods = vec![0u8; n_methods as usize];
    reader.read_exact(&mut methods).await?;
    Ok(methods)
}

pub async fn write_method<W: AsyncWrite + Unpin>(writer: &mut W, method: Method) -> Result<()> {
    writer.write_all(&[VERSION, method as u8]).await?;
    writer.flush().await?;
    Ok(())
}

/// RFC 1929 username/password request
///
/// Both fields are returned as raw bytes; clients may send any encoding.
pub async fn read_auth<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(Vec<u8>, Vec<u8>)> {
    let version = reader.read_u8().await?;
    if version != AUTH_VERSION {
        return Err(Error::Protocol(format!(
            "unsupported auth sub-negotiation version 0x{:02x}",
            version
        )));
    }

    let username = read_short_bytes(reader).await?;
    let password = read_short_bytes(reader).await?;
    Ok((username, password))
}

pub async fn write_auth_status<W: AsyncWrite + Unpin>(writer: &mut W, status: u8) -> Result<()> {
    writer.write_all(&[AUTH_VERSION, status]).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_short_bytes<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let len = reader.read_u8().await?;
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn read_short_string<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String> {
    String::from_utf8(read_short_bytes(reader).await?)
        .map_err(|_| Error::Protocol("non UTF-8 string".to_string()))
}

/// Read `VER CMD RSV ATYP`, leaving the address unread
pub async fn read_request_header<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(u8, u8)> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(Error::Protocol(format!(
            "unexpected request version 0x{:02x}",
            header[0]
        )));
    }
    Ok((header[1], header[3]))
}

pub fn is_supported_atyp(atyp: u8) -> bool {
    matches!(atyp, ATYP_IPV4 | ATYP_DOMAIN | ATYP_IPV6)
}

/// Read `ADDR PORT` for the given address type
pub async fn read_address<R: AsyncRead + Unpin>(reader: &mut R, atyp: u8) -> Result<TargetAddr> {
    let target = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            reader.read_exact(&mut octets).await?;
            let port = reader.read_u16().await?;
            TargetAddr::Ip(SocketAddr::new(Ipv4Addr::from(octets).into(), port))
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            reader.read_exact(&mut octets).await?;
            let port = reader.read_u16().await?;
            TargetAddr::Ip(SocketAddr::new(Ipv6Addr::from(octets).into(), port))
        }
        ATYP_DOMAIN => {
            let host = read_short_string(reader).await?;
            if host.is_empty() {
                return Err(Error::Protocol("empty domain name".to_string()));
            }
            let port = reader.read_u16().await?;
            TargetAddr::Domain(host, port)
        }
        other => {
            return Err(Error::Protocol(format!(
                "unsupported address type 0x{:02x}",
                other
            )));
        }
    };
    Ok(target)
}

/// Append `ATYP ADDR PORT`
pub fn put_address(buf: &mut BytesMut, target: &TargetAddr) -> Result<()> {
    match target {
        TargetAddr::Ip(SocketAddr::V4(addr)) => {
            buf.put_u8(ATYP_IPV4);
            buf.put_slice(&addr.ip().octets());
            buf.put_u16(addr.port());
        }
        TargetAddr::Ip(SocketAddr::V6(addr)) => {
            buf.put_u8(ATYP_IPV6);
            buf.put_slice(&addr.ip().octets());
            buf.put_u16(addr.port());
        }
        TargetAddr::Domain(host, port) => {
            let len = u8::try_from(host.len())
                .map_err(|_| Error::Protocol(format!("domain name too long: {}", host)))?;
            buf.put_u8(ATYP_DOMAIN);
            buf.put_u8(len);
            buf.put_slice(host.as_bytes());
            buf.put_u16(*port);
        }
    }
    Ok(())
}

/// Write a reply; the bound address defaults to `0.0.0.0:0`
pub async fn write_reply<W: AsyncWrite + Unpin>(
    writer: &mut W,
    reply: Reply,
    bound: Option<SocketAddr>,
) -> Result<()> {
    let bound = bound.unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
    let mut buf = BytesMut::with_capacity(22);
    buf.put_slice(&[VERSION, reply as u8, 0x00]);
    put_address(&mut buf, &TargetAddr::Ip(bound))?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Encode a CONNECT request (client side)
pub fn encode_connect(target: &TargetAddr) -> Result<BytesMut> {
    let mut buf = BytesMut::with_capacity(7 + target.host().len());
    buf.put_slice(&[VERSION, Command::Connect as u8, 0x00]);
    put_address(&mut buf, target)?;
    Ok(buf)
}

/// Encode an RFC 1929 request (client side)
pub fn encode_auth(username: &str, password: &str) -> Result<BytesMut> {
    let user_len = u8::try_from(username.len())
        .map_err(|_| Error::Config("SOCKS5 username longer than 255 bytes".to_string()))?;
    let pass_len = u8::try_from(password.len())
        .map_err(|_| Error::Config("SOCKS5 password longer than 255 bytes".to_string()))?;
    let mut buf = BytesMut::with_capacity(3 + username.len() + password.len());
    buf.put_u8(AUTH_VERSION);
    buf.put_u8(user_len);
    buf.put_slice(username.as_bytes());
    buf.put_u8(pass_len);
    buf.put_slice(password.as_bytes());
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_read_greeting() {
        let mut mock = Builder::new().read(&[0x05, 0x02, 0x00, 0x02]).build();
        let methods = read_greeting(&mut mock).await.unwrap();
        assert_eq!(methods, vec![0x00, 0x02]);
    }

    #[tokio::test]
    async fn test_read_greeting_rejects_socks4() {
        let mut mock = Builder::new().read(&[0x04]).build();
        assert!(matches!(
            read_greeting(&mut mock).await,
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_read_auth() {
        let mut mock = Builder::new()
            .read(&[0x01, 0x05])
            .read(b"khanh")
            .read(&[0x03])
            .read(b"pwd")
            .build();
        let (user, pass) = read_auth(&mut mock).await.unwrap();
        assert_eq!(user, b"khanh");
        assert_eq!(pass, b"pwd");
    }

    #[tokio::test]
    async fn test_read_auth_keeps_raw_bytes() {
        let mut mock = Builder::new()
            .read(&[0x01, 0x02, 0xff, 0xfe, 0x01, b'x'])
            .build();
        let (user, pass) = read_auth(&mut mock).await.unwrap();
        assert_eq!(user, [0xff, 0xfe]);
        assert_eq!(pass, b"x");
    }

    #[tokio::test]
    async fn test_read_domain_request() {
        let mut mock = Builder::new()
            .read(&[0x05, 0x01, 0x00, 0x03, 0x0b])
            .read(b"example.com")
            .read(&[0x01, 0xbb])
            .build();
        let (cmd, atyp) = read_request_header(&mut mock).await.unwrap();
        assert_eq!(Command::from_u8(cmd), Some(Command::Connect));
        assert!(is_supported_atyp(atyp));
        let target = read_address(&mut mock, atyp).await.unwrap();
        assert_eq!(target, TargetAddr::Domain("example.com".into(), 443));
    }

    #[tokio::test]
    async fn test_read_ipv6_address() {
        let mut bytes = vec![0u8; 15];
        bytes.push(1);
        bytes.extend_from_slice(&[0x00, 0x16]);
        let mut mock = Builder::new().read(&bytes).build();
        let target = read_address(&mut mock, ATYP_IPV6).await.unwrap();
        assert_eq!(target, TargetAddr::Ip("[::1]:22".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_write_reply_with_bound_address() {
        let mut mock = Builder::new()
            .write(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x1f, 0x90])
            .build();
        write_reply(
            &mut mock,
            Reply::Succeeded,
            Some("127.0.0.1:8080".parse().unwrap()),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_write_reply_default_bound_address() {
        let mut mock = Builder::new()
            .write(&[0x05, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .build();
        write_reply(&mut mock, Reply::CommandNotSupported, None)
            .await
            .unwrap();
    }

    #[test]
    fn test_encode_connect_domain() {
        let buf = encode_connect(&TargetAddr::Domain("a.io".into(), 80)).unwrap();
        assert_eq!(
            &buf[..],
            &[0x05, 0x01, 0x00, 0x03, 4, b'a', b'.', b'i', b'o', 0x00, 0x50]
        );
    }

    #[test]
    fn test_encode_auth_rejects_long_username() {
        let long = "x".repeat(256);
        assert!(encode_auth(&long, "p").is_err());
        assert_eq!(&encode_auth("u", "pw").unwrap()[..], &[1, 1, b'u', 2, b'p', b'w']);
    }

    #[test]
    fn test_reply_from_error() {
        let refused = Error::Dial {
            target: "127.0.0.1:1".into(),
            source: std::io::Error::from(ErrorKind::ConnectionRefused),
        };
        assert_eq!(Reply::from_error(&refused), Reply::ConnectionRefused);
        assert_eq!(
            Reply::from_error(&Error::Resolve("nope.invalid".into())),
            Reply::HostUnreachable
        );
        assert_eq!(
            Reply::from_error(&Error::DialTimeout("10.0.0.1:80".into())),
            Reply::HostUnreachable
        );
        assert_eq!(
            Reply::from_error(&Error::Upstream("bad".into())),
            Reply::GeneralFailure
        );
    }
}
