//! Client side: log in to an upstream SSH server and open `direct-tcpip`
//! channels through it

use crate::error::{Error, Result};
use crate::net::TargetAddr;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::channel::{self, ChannelParams, LOCAL_WINDOW, MAX_PACKET};
use super::transport::Transport;
use super::wire::{Reader, Writer, msg};

/// An authenticated SSH client connection
pub struct SshClient<S> {
    transport: Transport<S>,
}

impl<S> SshClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Key exchange plus password authentication
    pub async fn connect(
        io: S,
        username: &str,
        password: &str,
        expected_fingerprint: Option<&str>,
    ) -> Result<Self> {
        let mut transport = Transport::connect(io, expected_fingerprint).await?;

        let request = Writer::new(msg::SERVICE_REQUEST)
            .string("ssh-userauth")
            .finish();
        transport.send(&request).await?;
        loop {
            let payload = transport.recv().await?;
            match payload[0] {
                msg::SERVICE_ACCEPT => break,
                msg::EXT_INFO => continue,
                other => {
                    return Err(Error::Upstream(format!(
                        "SSH upstream refused userauth service (message {})",
                        other
                    )));
                }
            }
        }

        let auth = Writer::new(msg::USERAUTH_REQUEST)
            .string(username)
            .string("ssh-connection")
            .string("password")
            .bool(false)
            .string(password)
            .finish();
        transport.send(&auth).await?;
        loop {
            let payload = transport.recv().await?;
            match payload[0] {
                msg::USERAUTH_SUCCESS => break,
                msg::USERAUTH_BANNER | msg::EXT_INFO => continue,
                msg::USERAUTH_FAILURE => {
                    return Err(Error::Upstream(format!(
                        "SSH upstream rejected password for {}",
                        username
                    )));
                }
                other => {
                    return Err(Error::Upstream(format!(
                        "unexpected SSH message {} during authentication",
                        other
                    )));
                }
            }
        }

        debug!(user = %username, server = %transport.peer_version(), "Logged in to SSH upstream");
        Ok(Self { transport })
    }

    /// Fingerprint of the server's host key
    pub fn host_key_fingerprint(&self) -> Option<&str> {
        self.transport.host_key_fingerprint()
    }

    /// Open a `direct-tcpip` channel and turn the connection into a stream
    ///
    /// The connection carries exactly one channel, so this consumes the
    /// client.
    pub async fn open_direct_tcpip(
        mut self,
        target: &TargetAddr,
        originator: (&str, u16),
    ) -> Result<(DuplexStream, JoinHandle<Result<()>>)> {
        let open = Writer::new(msg::CHANNEL_OPEN)
            .string("direct-tcpip")
            .u32(0)
            .u32(LOCAL_WINDOW)
            .u32(MAX_PACKET)
            .string(target.host())
            .u32(target.port() as u32)
            .string(originator.0)
            .u32(originator.1 as u32)
            .finish();
        self.transport.send(&open).await?;

        let params = loop {
            let payload = self.transport.recv().await?;
            let mut r = Reader::new(&payload);
            match r.u8()? {
                msg::CHANNEL_OPEN_CONFIRMATION => {
                    let local_id = r.u32()?;
                    let remote_id = r.u32()?;
                    let remote_window = r.u32()?;
                    let remote_max_packet = r.u32()?;
                    break ChannelParams {
                        local_id,
                        remote_id,
                        remote_window,
                        remote_max_packet,
                    };
                }
                msg::CHANNEL_OPEN_FAILURE => {
                    let _recipient = r.u32()?;
                    let reason = r.u32()?;
                    let description = r.utf8().unwrap_or("");
                    return Err(Error::Upstream(format!(
                        "SSH upstream refused channel to {} (reason {}): {}",
                        target, reason, description
                    )));
                }
                msg::GLOBAL_REQUEST => {
                    let _name = r.utf8()?;
                    if r.bool()? {
                        self.transport.send(&[msg::REQUEST_FAILURE]).await?;
                    }
                }
                other => {
                    trace!(msg = other, "Ignoring SSH message while opening channel");
                }
            }
        };

        let (reader, writer) = self.transport.into_split();
        Ok(channel::spawn(reader, writer, params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Credential, CredentialStore};
    use crate::ssh::hostkey::HostKey;
    use crate::ssh::server::{self, AuthOutcome};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn store() -> CredentialStore {
        CredentialStore::from_credentials(vec![Credential::new("bob", "hunter2")])
    }

    #[tokio::test]
    async fn test_client_against_server() {
        let host_key = HostKey::generate().unwrap();
        let fingerprint = host_key.fingerprint();
        let (client_io, server_io) = tokio::io::duplex(256 * 1024);

        let server = tokio::spawn(async move {
            let mut transport = Transport::accept(server_io, &host_key).await.unwrap();
            server::accept_service(&mut transport).await.unwrap();
            let outcome = server::authenticate(&mut transport, &store()).await.unwrap();
            assert_eq!(outcome, AuthOutcome::Accepted("bob".to_string()));
            let open = server::await_channel_open(&mut transport).await.unwrap();
            assert_eq!(open.target, TargetAddr::Domain("db.internal".to_string(), 5432));
            server::confirm_channel(&mut transport, &open).await.unwrap();

            let (reader, writer) = transport.into_split();
            let (mut stream, _handle) = channel::spawn(
                reader,
                writer,
                ChannelParams {
                    local_id: 0,
                    remote_id: open.sender,
                    remote_window: open.window,
                    remote_max_packet: open.max_packet,
                },
            );
            // Echo one message
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
            stream.shutdown().await.unwrap();
        });

        let client = SshClient::connect(client_io, "bob", "hunter2", Some(&fingerprint))
            .await
            .unwrap();
        assert_eq!(client.host_key_fingerprint(), Some(fingerprint.as_str()));

        let target = TargetAddr::Domain("db.internal".to_string(), 5432);
        let (mut stream, _handle) = client
            .open_direct_tcpip(&target, ("127.0.0.1", 0))
            .await
            .unwrap();

        stream.write_all(b"hello").await.unwrap();
        let mut echoed = Vec::new();
        stream.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"hello");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_wrong_password() {
        let host_key = HostKey::generate().unwrap();
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);

        let server = tokio::spawn(async move {
            let mut transport = Transport::accept(server_io, &host_key).await.unwrap();
            server::accept_service(&mut transport).await.unwrap();
            server::authenticate(&mut transport, &store()).await.unwrap()
        });

        let result = SshClient::connect(client_io, "bob", "wrong", None).await;
        assert!(matches!(result, Err(Error::Upstream(_))));
        assert!(matches!(
            server.await.unwrap(),
            AuthOutcome::Rejected { .. }
        ));
    }
}
