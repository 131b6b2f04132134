//! SSH tunnel listener: password login, one `direct-tcpip` channel, relay

use crate::error::{Error, Result};
use crate::net::BoxStream;
use crate::session::{Protocol, ProxySession, SessionState};
use crate::ssh::channel::{self, ChannelParams};
use crate::ssh::server::{self, AuthOutcome, ChannelOpen};
use crate::ssh::wire::{disconnect, open_failure};
use crate::ssh::{HostKey, Transport};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::{ProxyContext, reach, relay_session};

pub async fn serve<S>(ctx: &ProxyContext, stream: S, session: &mut ProxySession) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    session.identify(Protocol::SshTunnel)?;
    let host_key = ctx
        .host_key
        .clone()
        .ok_or_else(|| Error::Config("SSH listener has no host key".to_string()))?;

    let (transport, open, destination) =
        ctx.handshake(handshake(ctx, stream, &host_key, session)).await?;

    let (reader, writer) = transport.into_split();
    let (tunnel, channel_task) = channel::spawn(
        reader,
        writer,
        ChannelParams {
            local_id: 0,
            remote_id: open.sender,
            remote_window: open.window,
            remote_max_packet: open.max_packet,
        },
    );

    let relayed = relay_session(ctx, session, tunnel, destination).await;
    // The channel task sends EOF/CLOSE and then ends by itself
    let channel_result = channel_task
        .await
        .unwrap_or_else(|e| Err(Error::Other(format!("SSH channel task failed: {}", e))));
    relayed.and(channel_result)
}

async fn handshake<S>(
    ctx: &ProxyContext,
    stream: S,
    host_key: &HostKey,
    session: &mut ProxySession,
) -> Result<(Transport<S>, ChannelOpen, BoxStream)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut transport = Transport::accept(stream, host_key).await?;
    debug!(session = session.id(), client_version = %transport.peer_version(), "SSH key exchange complete");

    reach(session, SessionState::Authenticating)?;
    server::accept_service(&mut transport).await?;
    match server::authenticate(&mut transport, &ctx.credentials).await? {
        AuthOutcome::Accepted(user) => session.set_username(user),
        AuthOutcome::Rejected { username } => {
            ctx.log_auth_failure(session, username.as_deref());
            return Err(Error::Auth(format!(
                "SSH password rejected for user '{}'",
                username.as_deref().unwrap_or("")
            )));
        }
    }

    let open = server::await_channel_open(&mut transport).await?;
    session.set_destination(open.target.clone());
    debug!(session = session.id(), destination = %open.target, originator = %open.originator, "direct-tcpip requested");

    reach(session, SessionState::Connecting)?;
    match ctx.dialer.dial(&open.target).await {
        Ok(connected) => {
            server::confirm_channel(&mut transport, &open).await?;
            Ok((transport, open, connected.stream))
        }
        Err(e) => {
            server::reject_channel(
                &mut transport,
                open.sender,
                open_failure::CONNECT_FAILED,
                &e.to_string(),
            )
            .await?;
            transport
                .disconnect(disconnect::BY_APPLICATION, "connect failed")
                .await;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Credential, CredentialStore};
    use crate::net::{Dialer, TargetAddr};
    use crate::ssh::SshClient;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn ctx() -> ProxyContext {
        let store = CredentialStore::from_credentials(vec![Credential::new("khanh", "khanh")]);
        ProxyContext::new("ssh", Arc::new(store), Dialer::direct(Default::default()))
            .with_host_key(Arc::new(HostKey::generate().unwrap()))
    }

    #[tokio::test]
    async fn test_tunnel_to_destination() {
        let dest = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dest_addr = dest.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = dest.accept().await.unwrap();
            let mut buf = [0u8; 3];
            s.read_exact(&mut buf).await.unwrap();
            s.write_all(&buf).await.unwrap();
        });

        let (client_io, server_io) = tokio::io::duplex(256 * 1024);
        let handle = tokio::spawn(async move {
            let mut session =
                ProxySession::new(1, "ssh", Protocol::SshTunnel, "127.0.0.1:40000".parse().unwrap());
            let result = serve(&ctx(), server_io, &mut session).await;
            (result, session)
        });

        let client = SshClient::connect(client_io, "khanh", "khanh", None).await.unwrap();
        let (mut stream, _task) = client
            .open_direct_tcpip(&TargetAddr::Ip(dest_addr), ("127.0.0.1", 5000))
            .await
            .unwrap();
        stream.write_all(b"abc").await.unwrap();
        let mut echoed = Vec::new();
        stream.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"abc");

        let (result, session) = handle.await.unwrap();
        result.unwrap();
        assert_eq!(session.username(), Some("khanh"));
        assert_eq!(session.destination(), Some(&TargetAddr::Ip(dest_addr)));
        assert_eq!(session.bytes_up(), 3);
        assert_eq!(session.bytes_down(), 3);
    }

    #[tokio::test]
    async fn test_wrong_password() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let handle = tokio::spawn(async move {
            let mut session =
                ProxySession::new(1, "ssh", Protocol::SshTunnel, "127.0.0.1:40000".parse().unwrap());
            serve(&ctx(), server_io, &mut session).await
        });

        let result = SshClient::connect(client_io, "khanh", "nope", None).await;
        assert!(result.is_err());
        assert!(matches!(handle.await.unwrap(), Err(Error::Auth(_))));
    }

    #[tokio::test]
    async fn test_unreachable_destination_refuses_channel() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = closed.local_addr().unwrap();
        drop(closed);

        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let handle = tokio::spawn(async move {
            let mut session =
                ProxySession::new(1, "ssh", Protocol::SshTunnel, "127.0.0.1:40000".parse().unwrap());
            serve(&ctx(), server_io, &mut session).await
        });

        let client = SshClient::connect(client_io, "khanh", "khanh", None).await.unwrap();
        let result = client
            .open_direct_tcpip(&TargetAddr::Ip(addr), ("127.0.0.1", 5000))
            .await;
        assert!(matches!(result, Err(Error::Upstream(_))));
        assert!(matches!(handle.await.unwrap(), Err(Error::Dial { .. })));
    }
}
