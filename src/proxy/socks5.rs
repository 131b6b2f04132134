//! SOCKS5 listener: greeting, username/password sub-negotiation, CONNECT

use crate::error::{Error, Result};
use crate::net::BoxStream;
use crate::protocol::socks5::{self as wire, Command, Method, Reply};
use crate::session::{Protocol, ProxySession, SessionState};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::{ProxyContext, reach, relay_session};

/// RFC 1929 status sent on a failed login (any non-zero value means failure)
const AUTH_STATUS_FAILURE: u8 = 0x02;
const AUTH_STATUS_SUCCESS: u8 = 0x00;

pub async fn serve<S>(ctx: &ProxyContext, mut client: S, session: &mut ProxySession) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    session.identify(Protocol::Socks5)?;
    let destination = ctx.handshake(handshake(ctx, &mut client, session)).await?;
    relay_session(ctx, session, client, destination).await
}

async fn handshake<S>(
    ctx: &ProxyContext,
    client: &mut S,
    session: &mut ProxySession,
) -> Result<BoxStream>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // AWAIT_GREETING
    let methods = wire::read_greeting(client).await?;
    if !methods.contains(&(Method::UserPass as u8)) {
        wire::write_method(client, Method::NoAcceptable).await?;
        return Err(Error::Auth(
            "client did not offer username/password authentication".to_string(),
        ));
    }
    wire::write_method(client, Method::UserPass).await?;

    // AWAIT_AUTH
    reach(session, SessionState::Authenticating)?;
    let (raw_user, raw_pass) = wire::read_auth(client).await?;
    let verified = match (std::str::from_utf8(&raw_user), std::str::from_utf8(&raw_pass)) {
        (Ok(user), Ok(pass)) if ctx.credentials.verify(user, pass) => Some(user.to_string()),
        _ => None,
    };
    let Some(username) = verified else {
        let claimed = String::from_utf8_lossy(&raw_user);
        wire::write_auth_status(client, AUTH_STATUS_FAILURE).await?;
        ctx.log_auth_failure(session, Some(claimed.as_ref()));
        return Err(Error::Auth(format!("invalid credentials for user '{}'", claimed)));
    };
    wire::write_auth_status(client, AUTH_STATUS_SUCCESS).await?;
    session.set_username(&username);

    // AWAIT_REQUEST
    let (command, atyp) = wire::read_request_header(client).await?;
    if !wire::is_supported_atyp(atyp) {
        wire::write_reply(client, Reply::AddressTypeNotSupported, None).await?;
        return Err(Error::Protocol(format!(
            "unsupported address type 0x{:02x}",
            atyp
        )));
    }
    let target = wire::read_address(client, atyp).await?;
    session.set_destination(target.clone());

    if Command::from_u8(command) != Some(Command::Connect) {
        wire::write_reply(client, Reply::CommandNotSupported, None).await?;
        return Err(Error::Protocol(format!(
            "unsupported SOCKS5 command 0x{:02x}",
            command
        )));
    }

    // CONNECTING
    reach(session, SessionState::Connecting)?;
    match ctx.dialer.dial(&target).await {
        Ok(connected) => {
            wire::write_reply(client, Reply::Succeeded, connected.local_addr).await?;
            debug!(session = session.id(), user = %username, destination = %target, "SOCKS5 tunnel established");
            Ok(connected.stream)
        }
        Err(e) => {
            let reply = Reply::from_error(&e);
            debug!(session = session.id(), destination = %target, reply = ?reply, error = %e, "SOCKS5 connect failed");
            wire::write_reply(client, reply, None).await?;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Credential, CredentialStore};
    use crate::net::Dialer;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn ctx() -> ProxyContext {
        let store = CredentialStore::from_credentials(vec![Credential::new("khanh", "khanh")]);
        ProxyContext::new("socks", Arc::new(store), Dialer::direct(Default::default()))
    }

    fn session() -> ProxySession {
        ProxySession::new(1, "socks", Protocol::Socks5, "127.0.0.1:40000".parse().unwrap())
    }

    fn auth_bytes(user: &str, pass: &str) -> Vec<u8> {
        let mut out = vec![0x01, user.len() as u8];
        out.extend_from_slice(user.as_bytes());
        out.push(pass.len() as u8);
        out.extend_from_slice(pass.as_bytes());
        out
    }

    #[tokio::test]
    async fn test_connect_and_relay() {
        let dest = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dest_addr = dest.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = dest.accept().await.unwrap();
            let mut buf = [0u8; 4];
            s.read_exact(&mut buf).await.unwrap();
            s.write_all(&buf).await.unwrap();
        });

        let (mut client, server) = tokio::io::duplex(4096);
        let handler = tokio::spawn(async move {
            let mut session = session();
            let result = serve(&ctx(), server, &mut session).await;
            (result, session)
        });

        client.write_all(&[0x05, 0x02, 0x00, 0x02]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x02]);

        client.write_all(&auth_bytes("khanh", "khanh")).await.unwrap();
        let mut status = [0u8; 2];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status, [0x01, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
        request.extend_from_slice(&dest_addr.port().to_be_bytes());
        client.write_all(&request).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);
        assert_eq!(&reply[4..8], &[127, 0, 0, 1]);

        client.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");
        drop(client);

        let (result, session) = handler.await.unwrap();
        result.unwrap();
        assert_eq!(session.username(), Some("khanh"));
        assert_eq!(session.bytes_up(), 4);
        assert_eq!(session.bytes_down(), 4);
    }

    #[tokio::test]
    async fn test_wrong_password() {
        let (mut client, server) = tokio::io::duplex(1024);
        let handler = tokio::spawn(async move {
            let mut session = session();
            serve(&ctx(), server, &mut session).await
        });

        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        client.write_all(&auth_bytes("khanh", "wrong")).await.unwrap();

        let mut status = [0u8; 2];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status, [0x01, AUTH_STATUS_FAILURE]);
        assert!(matches!(handler.await.unwrap(), Err(Error::Auth(_))));

        // Connection is closed after the failure
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_non_utf8_credentials_rejected() {
        let (mut client, server) = tokio::io::duplex(1024);
        let handler = tokio::spawn(async move {
            let mut session = session();
            let result = serve(&ctx(), server, &mut session).await;
            (result, session)
        });

        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        client
            .write_all(&[0x01, 0x02, 0xff, 0xfe, 0x01, b'x'])
            .await
            .unwrap();

        let mut status = [0u8; 2];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status, [0x01, AUTH_STATUS_FAILURE]);
        let (result, session) = handler.await.unwrap();
        assert!(matches!(result, Err(Error::Auth(_))));
        assert_eq!(session.username(), None);
    }

    #[tokio::test]
    async fn test_no_acceptable_method() {
        let (mut client, server) = tokio::io::duplex(1024);
        let handler = tokio::spawn(async move {
            let mut session = session();
            serve(&ctx(), server, &mut session).await
        });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0xff]);
        assert!(handler.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_bind_not_supported() {
        let (mut client, server) = tokio::io::duplex(1024);
        let handler = tokio::spawn(async move {
            let mut session = session();
            serve(&ctx(), server, &mut session).await
        });

        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        client.write_all(&auth_bytes("khanh", "khanh")).await.unwrap();
        let mut status = [0u8; 2];
        client.read_exact(&mut status).await.unwrap();

        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], Reply::CommandNotSupported as u8);
        assert!(handler.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_unknown_address_type() {
        let (mut client, server) = tokio::io::duplex(1024);
        let handler = tokio::spawn(async move {
            let mut session = session();
            serve(&ctx(), server, &mut session).await
        });

        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        client.write_all(&auth_bytes("khanh", "khanh")).await.unwrap();
        let mut status = [0u8; 2];
        client.read_exact(&mut status).await.unwrap();

        client.write_all(&[0x05, 0x01, 0x00, 0x09]).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], Reply::AddressTypeNotSupported as u8);
        assert!(handler.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_connection_refused_reply() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);

        let (mut client, server) = tokio::io::duplex(1024);
        let handler = tokio::spawn(async move {
            let mut session = session();
            serve(&ctx(), server, &mut session).await
        });

        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        client.write_all(&auth_bytes("khanh", "khanh")).await.unwrap();
        let mut status = [0u8; 2];
        client.read_exact(&mut status).await.unwrap();

        let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
        request.extend_from_slice(&port.to_be_bytes());
        client.write_all(&request).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], Reply::ConnectionRefused as u8);
        assert!(matches!(handler.await.unwrap(), Err(Error::Dial { .. })));
    }
}
