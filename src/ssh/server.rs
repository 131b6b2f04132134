//! Server side of the connection protocol: user authentication and the
//! single `direct-tcpip` channel open

use crate::auth::CredentialStore;
use crate::error::{Error, Result};
use crate::net::TargetAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

use super::channel::{LOCAL_WINDOW, MAX_PACKET};
use super::transport::Transport;
use super::wire::{Reader, Writer, disconnect, msg, open_failure};

/// Non-password attempts tolerated before giving up on the client
const MAX_AUTH_PROBES: usize = 20;

/// Result of the authentication phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Accepted(String),
    /// The client offered a wrong password; it has been disconnected
    Rejected { username: Option<String> },
}

/// A client's `direct-tcpip` request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    pub sender: u32,
    pub window: u32,
    pub max_packet: u32,
    pub target: TargetAddr,
    pub originator: String,
}

/// Handle `SERVICE_REQUEST` for `ssh-userauth`
pub async fn accept_service<S>(transport: &mut Transport<S>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let payload = transport.recv().await?;
    let mut r = Reader::new(&payload);
    if r.u8()? != msg::SERVICE_REQUEST {
        transport
            .disconnect(disconnect::PROTOCOL_ERROR, "expected service request")
            .await;
        return Err(Error::Protocol(format!(
            "expected SERVICE_REQUEST, got message {}",
            payload[0]
        )));
    }
    let service = r.utf8()?;
    if service != "ssh-userauth" {
        transport
            .disconnect(disconnect::SERVICE_NOT_AVAILABLE, "service not available")
            .await;
        return Err(Error::Protocol(format!("unsupported service {}", service)));
    }
    let accept = Writer::new(msg::SERVICE_ACCEPT).string(service).finish();
    transport.send(&accept).await
}

/// Run password authentication
///
/// A single wrong password ends the connection: the client gets
/// `USERAUTH_FAILURE` followed by a disconnect.
pub async fn authenticate<S>(
    transport: &mut Transport<S>,
    credentials: &CredentialStore,
) -> Result<AuthOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let failure = Writer::new(msg::USERAUTH_FAILURE)
        .name_list(&["password"])
        .bool(false)
        .finish();
    let mut probes = 0;

    loop {
        let payload = transport.recv().await?;
        let mut r = Reader::new(&payload);
        match r.u8()? {
            msg::USERAUTH_REQUEST => {}
            msg::SERVICE_REQUEST => {
                let service = r.utf8()?;
                let accept = Writer::new(msg::SERVICE_ACCEPT).string(service).finish();
                transport.send(&accept).await?;
                continue;
            }
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected message {} during authentication",
                    other
                )));
            }
        }

        let username = r.utf8()?.to_string();
        let _service = r.utf8()?;
        let method = r.utf8()?;

        if method != "password" {
            trace!(user = %username, method = %method, "Unsupported auth method");
            probes += 1;
            if probes > MAX_AUTH_PROBES {
                transport
                    .disconnect(
                        disconnect::NO_MORE_AUTH_METHODS_AVAILABLE,
                        "too many authentication attempts",
                    )
                    .await;
                return Ok(AuthOutcome::Rejected {
                    username: Some(username),
                });
            }
            transport.send(&failure).await?;
            continue;
        }

        let change = r.bool()?;
        let password = r.utf8()?;
        if !change && credentials.verify(&username, password) {
            transport.send(&[msg::USERAUTH_SUCCESS]).await?;
            debug!(user = %username, "SSH password accepted");
            return Ok(AuthOutcome::Accepted(username));
        }

        transport.send(&failure).await?;
        transport
            .disconnect(
                disconnect::NO_MORE_AUTH_METHODS_AVAILABLE,
                "authentication failed",
            )
            .await;
        return Ok(AuthOutcome::Rejected {
            username: Some(username),
        });
    }
}

/// Wait for the client's `direct-tcpip` channel open
///
/// Other channel types are refused and the wait continues.
pub async fn await_channel_open<S>(transport: &mut Transport<S>) -> Result<ChannelOpen>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let payload = transport.recv().await?;
        let mut r = Reader::new(&payload);
        match r.u8()? {
            msg::CHANNEL_OPEN => {
                let kind = r.utf8()?.to_string();
                let sender = r.u32()?;
                let window = r.u32()?;
                let max_packet = r.u32()?;

                if kind != "direct-tcpip" {
                    debug!(kind = %kind, "Refusing SSH channel type");
                    let reply = Writer::new(msg::CHANNEL_OPEN_FAILURE)
                        .u32(sender)
                        .u32(open_failure::UNKNOWN_CHANNEL_TYPE)
                        .string("only direct-tcpip channels are supported")
                        .string("")
                        .finish();
                    transport.send(&reply).await?;
                    continue;
                }

                let host = r.utf8()?.to_string();
                let port = r.u32()?;
                let originator_host = r.utf8()?;
                let originator_port = r.u32()?;

                let port = match u16::try_from(port) {
                    Ok(p) if p != 0 => p,
                    _ => {
                        reject_channel(
                            transport,
                            sender,
                            open_failure::CONNECT_FAILED,
                            "invalid port",
                        )
                        .await?;
                        continue;
                    }
                };

                return Ok(ChannelOpen {
                    sender,
                    window,
                    max_packet,
                    target: TargetAddr::from_host_port(&host, port),
                    originator: format!("{}:{}", originator_host, originator_port),
                });
            }
            msg::GLOBAL_REQUEST => {
                let name = r.utf8()?;
                trace!(request = %name, "Refusing global request");
                if r.bool()? {
                    transport.send(&[msg::REQUEST_FAILURE]).await?;
                }
            }
            msg::KEXINIT => {
                transport
                    .disconnect(disconnect::KEY_EXCHANGE_FAILED, "re-keying is not supported")
                    .await;
                return Err(Error::Protocol("peer requested re-key".to_string()));
            }
            other => {
                trace!(msg = other, "Unimplemented SSH message");
                let seq = transport.reader.last_sequence();
                let reply = Writer::new(msg::UNIMPLEMENTED).u32(seq).finish();
                transport.send(&reply).await?;
            }
        }
    }
}

/// Confirm a channel open; our channel id is always 0
pub async fn confirm_channel<S>(transport: &mut Transport<S>, open: &ChannelOpen) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let reply = Writer::new(msg::CHANNEL_OPEN_CONFIRMATION)
        .u32(open.sender)
        .u32(0)
        .u32(LOCAL_WINDOW)
        .u32(MAX_PACKET)
        .finish();
    transport.send(&reply).await
}

/// Refuse a channel open
pub async fn reject_channel<S>(
    transport: &mut Transport<S>,
    sender: u32,
    reason: u32,
    description: &str,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let reply = Writer::new(msg::CHANNEL_OPEN_FAILURE)
        .u32(sender)
        .u32(reason)
        .string(description)
        .string("")
        .finish();
    transport.send(&reply).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credential;
    use crate::ssh::hostkey::HostKey;
    use tokio::io::DuplexStream;

    async fn pair() -> (Transport<DuplexStream>, Transport<DuplexStream>) {
        let host_key = HostKey::generate().unwrap();
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(async move { Transport::accept(server_io, &host_key).await });
        let client = Transport::connect(client_io, None).await.unwrap();
        (client, server.await.unwrap().unwrap())
    }

    fn store() -> CredentialStore {
        CredentialStore::from_credentials(vec![Credential::new("alice", "s3cret")])
    }

    fn password_request(user: &str, password: &str) -> Vec<u8> {
        Writer::new(msg::USERAUTH_REQUEST)
            .string(user)
            .string("ssh-connection")
            .string("password")
            .bool(false)
            .string(password)
            .finish()
    }

    #[tokio::test]
    async fn test_service_accept() {
        let (mut client, mut server) = pair().await;
        let request = Writer::new(msg::SERVICE_REQUEST).string("ssh-userauth").finish();
        client.send(&request).await.unwrap();
        accept_service(&mut server).await.unwrap();
        let reply = client.recv().await.unwrap();
        assert_eq!(reply[0], msg::SERVICE_ACCEPT);
    }

    #[tokio::test]
    async fn test_unknown_service_disconnects() {
        let (mut client, mut server) = pair().await;
        let request = Writer::new(msg::SERVICE_REQUEST).string("ssh-connection").finish();
        client.send(&request).await.unwrap();
        assert!(accept_service(&mut server).await.is_err());
        assert!(client.recv().await.is_err());
    }

    #[tokio::test]
    async fn test_password_accepted_after_none_probe() {
        let (mut client, mut server) = pair().await;
        let none = Writer::new(msg::USERAUTH_REQUEST)
            .string("alice")
            .string("ssh-connection")
            .string("none")
            .finish();
        client.send(&none).await.unwrap();
        client.send(&password_request("alice", "s3cret")).await.unwrap();

        let outcome = authenticate(&mut server, &store()).await.unwrap();
        assert_eq!(outcome, AuthOutcome::Accepted("alice".to_string()));

        let failure = client.recv().await.unwrap();
        let mut r = Reader::new(&failure);
        assert_eq!(r.u8().unwrap(), msg::USERAUTH_FAILURE);
        assert_eq!(r.name_list().unwrap(), vec!["password"]);
        assert_eq!(client.recv().await.unwrap(), vec![msg::USERAUTH_SUCCESS]);
    }

    #[tokio::test]
    async fn test_wrong_password_disconnects() {
        let (mut client, mut server) = pair().await;
        client.send(&password_request("alice", "nope")).await.unwrap();

        let outcome = authenticate(&mut server, &store()).await.unwrap();
        assert_eq!(
            outcome,
            AuthOutcome::Rejected {
                username: Some("alice".to_string())
            }
        );
        assert_eq!(client.recv().await.unwrap()[0], msg::USERAUTH_FAILURE);
        assert!(client.recv().await.is_err());
    }

    #[tokio::test]
    async fn test_channel_open_direct_tcpip() {
        let (mut client, mut server) = pair().await;

        let session = Writer::new(msg::CHANNEL_OPEN)
            .string("session")
            .u32(0)
            .u32(1024)
            .u32(1024)
            .finish();
        client.send(&session).await.unwrap();
        let global = Writer::new(msg::GLOBAL_REQUEST)
            .string("keepalive@openssh.com")
            .bool(true)
            .finish();
        client.send(&global).await.unwrap();
        let direct = Writer::new(msg::CHANNEL_OPEN)
            .string("direct-tcpip")
            .u32(7)
            .u32(65536)
            .u32(16384)
            .string("example.com")
            .u32(443)
            .string("10.0.0.1")
            .u32(40000)
            .finish();
        client.send(&direct).await.unwrap();

        let open = await_channel_open(&mut server).await.unwrap();
        assert_eq!(open.sender, 7);
        assert_eq!(open.window, 65536);
        assert_eq!(open.max_packet, 16384);
        assert_eq!(open.target, TargetAddr::Domain("example.com".to_string(), 443));
        assert_eq!(open.originator, "10.0.0.1:40000");

        let refused = client.recv().await.unwrap();
        let mut r = Reader::new(&refused);
        assert_eq!(r.u8().unwrap(), msg::CHANNEL_OPEN_FAILURE);
        assert_eq!(r.u32().unwrap(), 0);
        assert_eq!(r.u32().unwrap(), open_failure::UNKNOWN_CHANNEL_TYPE);
        assert_eq!(client.recv().await.unwrap(), vec![msg::REQUEST_FAILURE]);

        confirm_channel(&mut server, &open).await.unwrap();
        let confirm = client.recv().await.unwrap();
        let mut r = Reader::new(&confirm);
        assert_eq!(r.u8().unwrap(), msg::CHANNEL_OPEN_CONFIRMATION);
        assert_eq!(r.u32().unwrap(), 7);
        assert_eq!(r.u32().unwrap(), 0);
        assert_eq!(r.u32().unwrap(), LOCAL_WINDOW);
    }
}
