//! SSH transport layer (RFC 4253) for a single algorithm suite
//!
//! - kex: `curve25519-sha256` (and its `@libssh.org` alias)
//! - host key: `ssh-ed25519`
//! - cipher: `chacha20-poly1305@openssh.com` (AEAD, so no MAC is negotiated)
//! - compression: `none`
//!
//! The same code runs both roles: the tunnel listener is a server, the
//! upstream dialer is a client. Re-keying is not supported.

use crate::error::{Error, Result};
use bytes::BytesMut;
use rand::RngCore;
use rand::rngs::OsRng;
use ring::aead::chacha20_poly1305_openssh::{KEY_LEN, OpeningKey, SealingKey, TAG_LEN};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{debug, trace};
use x25519_dalek::{EphemeralSecret, PublicKey};

use super::hostkey::{self, HostKey};
use super::wire::{self, Reader, Writer, disconnect, msg, put_mpint, put_string};

pub const KEX_ALGORITHMS: &[&str] = &["curve25519-sha256", "curve25519-sha256@libssh.org"];
pub const HOST_KEY_ALGORITHMS: &[&str] = &[hostkey::ALGORITHM];
pub const CIPHERS: &[&str] = &["chacha20-poly1305@openssh.com"];
/// Advertised for completeness; never used with the AEAD cipher
pub const MACS: &[&str] = &["hmac-sha2-256"];
pub const COMPRESSION: &[&str] = &["none"];

/// Largest packet accepted (`packet_length` field)
pub const MAX_PACKET_LEN: usize = 256 * 1024;

/// Preamble bytes tolerated before the peer's `SSH-` line
const MAX_PREAMBLE: usize = 255;

const BLOCK_SIZE: usize = 8;
const MIN_PADDING: usize = 4;

/// Our identification string without CRLF
pub fn local_version() -> String {
    format!("SSH-2.0-authproxy_{}", crate::VERSION)
}

/// Which side of the key exchange we are
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// Read half of a transport
pub struct PacketReader<R> {
    io: R,
    opening: Option<OpeningKey>,
    seq: u32,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    fn new(io: R) -> Self {
        Self {
            io,
            opening: None,
            seq: 0,
        }
    }

    /// Sequence number of the most recently read packet
    pub fn last_sequence(&self) -> u32 {
        self.seq.wrapping_sub(1)
    }

    /// Read one packet and return its payload
    pub async fn read_packet(&mut self) -> Result<Vec<u8>> {
        let mut len_bytes = [0u8; 4];
        self.io.read_exact(&mut len_bytes).await?;

        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);

        let payload = match &self.opening {
            None => {
                let len = check_packet_len(u32::from_be_bytes(len_bytes))?;
                let mut body = vec![0u8; len];
                self.io.read_exact(&mut body).await?;
                strip_padding(&body)?.to_vec()
            }
            Some(key) => {
                let len =
                    check_packet_len(u32::from_be_bytes(key.decrypt_packet_length(seq, len_bytes)))?;
                let mut packet = vec![0u8; 4 + len + TAG_LEN];
                packet[..4].copy_from_slice(&len_bytes);
                self.io.read_exact(&mut packet[4..]).await?;

                let mut tag = [0u8; TAG_LEN];
                tag.copy_from_slice(&packet[4 + len..]);
                packet.truncate(4 + len);
                let plain = key
                    .open_in_place(seq, &mut packet, &tag)
                    .map_err(|_| Error::Protocol("packet authentication failed".to_string()))?;
                strip_padding(plain)?.to_vec()
            }
        };

        if payload.is_empty() {
            return Err(Error::Protocol("empty SSH packet".to_string()));
        }
        Ok(payload)
    }

    /// Read the next payload that is not transport noise
    ///
    /// `IGNORE`, `DEBUG` and `UNIMPLEMENTED` are skipped; `DISCONNECT`
    /// becomes an error.
    pub async fn recv(&mut self) -> Result<Vec<u8>> {
        loop {
            let payload = self.read_packet().await?;
            match payload[0] {
                msg::IGNORE | msg::DEBUG | msg::UNIMPLEMENTED => {
                    trace!(msg = payload[0], "Skipping SSH transport message");
                }
                msg::DISCONNECT => {
                    let mut r = Reader::new(&payload[1..]);
                    let reason = r.u32().unwrap_or(0);
                    let description = r.utf8().unwrap_or("");
                    return Err(Error::Protocol(format!(
                        "peer disconnected (reason {}): {}",
                        reason, description
                    )));
                }
                _ => return Ok(payload),
            }
        }
    }
}

/// Write half of a transport
pub struct PacketWriter<W> {
    io: W,
    sealing: Option<SealingKey>,
    seq: u32,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    fn new(io: W) -> Self {
        Self {
            io,
            sealing: None,
            seq: 0,
        }
    }

    /// Frame, encrypt and send one payload
    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        // With the AEAD cipher the length field is excluded from alignment
        let aligned = if self.sealing.is_some() { 1 } else { 5 } + payload.len();
        let mut padding = BLOCK_SIZE - aligned % BLOCK_SIZE;
        if padding < MIN_PADDING {
            padding += BLOCK_SIZE;
        }
        let packet_len = 1 + payload.len() + padding;

        let mut packet = Vec::with_capacity(4 + packet_len + TAG_LEN);
        packet.extend_from_slice(&(packet_len as u32).to_be_bytes());
        packet.push(padding as u8);
        packet.extend_from_slice(payload);
        let mut pad = [0u8; 2 * BLOCK_SIZE];
        OsRng.fill_bytes(&mut pad[..padding]);
        packet.extend_from_slice(&pad[..padding]);

        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);

        if let Some(key) = &self.sealing {
            let mut tag = [0u8; TAG_LEN];
            key.seal_in_place(seq, &mut packet, &mut tag);
            packet.extend_from_slice(&tag);
        }

        self.io.write_all(&packet).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Send `SSH_MSG_DISCONNECT`, ignoring write failures
    pub async fn disconnect(&mut self, reason: u32, description: &str) {
        let _ = self
            .send(&wire::disconnect_message(reason, description))
            .await;
    }

    pub async fn shutdown(&mut self) {
        let _ = self.io.shutdown().await;
    }
}

fn check_packet_len(len: u32) -> Result<usize> {
    let len = len as usize;
    if len < 1 + MIN_PADDING || len > MAX_PACKET_LEN {
        return Err(Error::Protocol(format!("invalid packet length {}", len)));
    }
    Ok(len)
}

/// `padding_length || payload || padding` → payload
fn strip_padding(body: &[u8]) -> Result<&[u8]> {
    let padding = body[0] as usize;
    if padding < MIN_PADDING || padding + 1 > body.len() {
        return Err(Error::Protocol(format!("invalid padding length {}", padding)));
    }
    Ok(&body[1..body.len() - padding])
}

/// An established transport: version exchanged and keys in use
pub struct Transport<S> {
    pub reader: PacketReader<ReadHalf<S>>,
    pub writer: PacketWriter<WriteHalf<S>>,
    session_id: Vec<u8>,
    peer_version: String,
    host_key_fingerprint: Option<String>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Transport<S> {
    /// Run the server side of version exchange and key exchange
    pub async fn accept(mut io: S, host_key: &HostKey) -> Result<Self> {
        let local = local_version();
        io.write_all(format!("{}\r\n", local).as_bytes()).await?;
        io.flush().await?;
        let peer = read_version(&mut io).await?;
        debug!(client_version = %peer, "SSH version exchanged");

        let (read, write) = tokio::io::split(io);
        let mut transport = Self {
            reader: PacketReader::new(read),
            writer: PacketWriter::new(write),
            session_id: Vec::new(),
            peer_version: peer,
            host_key_fingerprint: None,
        };
        transport.key_exchange(Role::Server, &local, Some(host_key)).await?;
        Ok(transport)
    }

    /// Run the client side of version exchange and key exchange
    ///
    /// When `expected_fingerprint` is given the server's host key must match
    /// it (`SHA256:...`).
    pub async fn connect(mut io: S, expected_fingerprint: Option<&str>) -> Result<Self> {
        let local = local_version();
        io.write_all(format!("{}\r\n", local).as_bytes()).await?;
        io.flush().await?;
        let peer = read_version(&mut io).await?;
        debug!(server_version = %peer, "SSH version exchanged");

        let (read, write) = tokio::io::split(io);
        let mut transport = Self {
            reader: PacketReader::new(read),
            writer: PacketWriter::new(write),
            session_id: Vec::new(),
            peer_version: peer,
            host_key_fingerprint: None,
        };
        transport.key_exchange(Role::Client, &local, None).await?;

        if let (Some(expected), Some(actual)) =
            (expected_fingerprint, transport.host_key_fingerprint.as_deref())
        {
            if expected != actual {
                transport
                    .writer
                    .disconnect(disconnect::KEY_EXCHANGE_FAILED, "host key mismatch")
                    .await;
                return Err(Error::Upstream(format!(
                    "SSH host key mismatch: expected {}, got {}",
                    expected, actual
                )));
            }
        }
        Ok(transport)
    }

    pub fn session_id(&self) -> &[u8] {
        &self.session_id
    }

    pub fn peer_version(&self) -> &str {
        &self.peer_version
    }

    /// Fingerprint of the server host key (client role only)
    pub fn host_key_fingerprint(&self) -> Option<&str> {
        self.host_key_fingerprint.as_deref()
    }

    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.writer.send(payload).await
    }

    pub async fn recv(&mut self) -> Result<Vec<u8>> {
        self.reader.recv().await
    }

    pub async fn disconnect(&mut self, reason: u32, description: &str) {
        self.writer.disconnect(reason, description).await;
    }

    /// Split into independently owned read and write halves
    pub fn into_split(self) -> (PacketReader<ReadHalf<S>>, PacketWriter<WriteHalf<S>>) {
        (self.reader, self.writer)
    }

    async fn key_exchange(
        &mut self,
        role: Role,
        local_version: &str,
        host_key: Option<&HostKey>,
    ) -> Result<()> {
        let local_kexinit = build_kexinit();
        self.send(&local_kexinit).await?;

        let peer_kexinit = self.recv().await?;
        if peer_kexinit[0] != msg::KEXINIT {
            return Err(Error::Protocol(format!(
                "expected KEXINIT, got message {}",
                peer_kexinit[0]
            )));
        }

        let (client_kexinit, server_kexinit) = match role {
            Role::Server => (&peer_kexinit, &local_kexinit),
            Role::Client => (&local_kexinit, &peer_kexinit),
        };
        let negotiated = match negotiate(client_kexinit, server_kexinit) {
            Ok(n) => n,
            Err(e) => {
                self.disconnect(disconnect::KEY_EXCHANGE_FAILED, &e.to_string())
                    .await;
                return Err(e);
            }
        };
        trace!(kex = negotiated.kex, "SSH algorithms negotiated");

        // A wrongly guessed first kex packet from the peer must be dropped
        if role == Role::Server && negotiated.peer_guessed_wrong {
            let _ = self.recv().await?;
        }

        let peer_version = self.peer_version.clone();
        let (local_v, peer_v) = (local_version.as_bytes(), peer_version.as_bytes());
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let local_public = PublicKey::from(&secret);

        let (shared, exchange_hash) = match role {
            Role::Server => {
                let host_key = host_key
                    .ok_or_else(|| Error::Other("server key exchange without host key".into()))?;
                let init = self.recv().await?;
                let mut r = Reader::new(&init);
                if r.u8()? != msg::KEX_ECDH_INIT {
                    return Err(Error::Protocol("expected KEX_ECDH_INIT".to_string()));
                }
                let client_public = read_public_key(&mut r)?;
                let shared = shared_secret(secret, &client_public)?;

                let host_blob = host_key.public_blob();
                let h = exchange_hash(
                    peer_v,
                    local_v,
                    client_kexinit,
                    server_kexinit,
                    &host_blob,
                    client_public.as_bytes(),
                    local_public.as_bytes(),
                    &shared,
                );
                let reply = Writer::new(msg::KEX_ECDH_REPLY)
                    .string(&host_blob)
                    .string(local_public.as_bytes())
                    .string(host_key.sign(&h))
                    .finish();
                self.send(&reply).await?;
                (shared, h)
            }
            Role::Client => {
                let init = Writer::new(msg::KEX_ECDH_INIT)
                    .string(local_public.as_bytes())
                    .finish();
                self.send(&init).await?;

                let reply = self.recv().await?;
                let mut r = Reader::new(&reply);
                if r.u8()? != msg::KEX_ECDH_REPLY {
                    return Err(Error::Protocol("expected KEX_ECDH_REPLY".to_string()));
                }
                let host_blob = r.string()?.to_vec();
                let server_public = read_public_key(&mut r)?;
                let signature = r.string()?;
                let shared = shared_secret(secret, &server_public)?;

                let h = exchange_hash(
                    local_v,
                    peer_v,
                    client_kexinit,
                    server_kexinit,
                    &host_blob,
                    local_public.as_bytes(),
                    server_public.as_bytes(),
                    &shared,
                );
                hostkey::verify(&host_blob, &h, signature)?;
                self.host_key_fingerprint = Some(hostkey::fingerprint(&host_blob));
                (shared, h)
            }
        };

        self.send(&[msg::NEWKEYS]).await?;
        let newkeys = self.recv().await?;
        if newkeys[0] != msg::NEWKEYS {
            return Err(Error::Protocol(format!(
                "expected NEWKEYS, got message {}",
                newkeys[0]
            )));
        }

        if self.session_id.is_empty() {
            self.session_id = exchange_hash.clone();
        }

        let mut k = BytesMut::with_capacity(37);
        put_mpint(&mut k, &shared);
        let c2s = derive_key(&k, &exchange_hash, b'C', &self.session_id)?;
        let s2c = derive_key(&k, &exchange_hash, b'D', &self.session_id)?;
        let (outgoing, incoming) = match role {
            Role::Server => (s2c, c2s),
            Role::Client => (c2s, s2c),
        };
        self.writer.sealing = Some(SealingKey::new(&outgoing));
        self.reader.opening = Some(OpeningKey::new(&incoming));

        debug!(role = ?role, "SSH key exchange complete");
        Ok(())
    }
}

/// Read the peer identification line, skipping a short preamble
async fn read_version<S: AsyncRead + Unpin>(io: &mut S) -> Result<String> {
    let mut consumed = 0usize;
    loop {
        let mut line = Vec::with_capacity(64);
        loop {
            let b = io.read_u8().await?;
            consumed += 1;
            if b == b'\n' {
                break;
            }
            line.push(b);
            if line.len() > MAX_PREAMBLE {
                return Err(Error::Protocol("identification line too long".to_string()));
            }
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }

        if line.starts_with(b"SSH-") {
            let version = String::from_utf8(line)
                .map_err(|_| Error::Protocol("identification is not UTF-8".to_string()))?;
            if !(version.starts_with("SSH-2.0-") || version.starts_with("SSH-1.99-")) {
                return Err(Error::Protocol(format!(
                    "unsupported protocol version {}",
                    version
                )));
            }
            return Ok(version);
        }

        if consumed > MAX_PREAMBLE {
            return Err(Error::Protocol(
                "no SSH identification line received".to_string(),
            ));
        }
    }
}

fn build_kexinit() -> Vec<u8> {
    let mut cookie = [0u8; 16];
    OsRng.fill_bytes(&mut cookie);
    Writer::new(msg::KEXINIT)
        .raw(&cookie)
        .name_list(KEX_ALGORITHMS)
        .name_list(HOST_KEY_ALGORITHMS)
        .name_list(CIPHERS)
        .name_list(CIPHERS)
        .name_list(MACS)
        .name_list(MACS)
        .name_list(COMPRESSION)
        .name_list(COMPRESSION)
        .name_list(&[])
        .name_list(&[])
        .bool(false)
        .u32(0)
        .finish()
}

/// Algorithms chosen for one key exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub kex: &'static str,
    pub host_key: &'static str,
    pub cipher: &'static str,
    /// The client sent a speculative kex packet that must be dropped
    pub peer_guessed_wrong: bool,
}

/// Pick the first client-preferred algorithm the server also supports
fn choose(client: &[&str], supported: &[&'static str], what: &str) -> Result<&'static str> {
    client
        .iter()
        .find_map(|c| supported.iter().copied().find(|s| s == c))
        .ok_or_else(|| Error::Protocol(format!("no common {} algorithm", what)))
}

pub fn negotiate(client_kexinit: &[u8], server_kexinit: &[u8]) -> Result<Negotiated> {
    let mut c = Reader::new(client_kexinit);
    let mut s = Reader::new(server_kexinit);
    c.bytes(17)?;
    s.bytes(17)?;

    let c_kex = c.name_list()?;
    let s_kex = s.name_list()?;
    let c_host = c.name_list()?;
    let s_host = s.name_list()?;
    let c_enc_cs = c.name_list()?;
    let c_enc_sc = c.name_list()?;
    let _ = (s.name_list()?, s.name_list()?);
    // MAC lists are not consulted for the AEAD cipher
    let _ = (c.name_list()?, c.name_list()?, s.name_list()?, s.name_list()?);
    let c_comp_cs = c.name_list()?;
    let c_comp_sc = c.name_list()?;
    let _ = (c.name_list()?, c.name_list()?);
    let first_kex_follows = c.bool()?;

    let kex = choose(&c_kex, KEX_ALGORITHMS, "key exchange")?;
    let host_key = choose(&c_host, HOST_KEY_ALGORITHMS, "host key")?;
    let cipher = choose(&c_enc_cs, CIPHERS, "cipher")?;
    choose(&c_enc_sc, CIPHERS, "cipher")?;
    choose(&c_comp_cs, COMPRESSION, "compression")?;
    choose(&c_comp_sc, COMPRESSION, "compression")?;

    let peer_guessed_wrong = first_kex_follows
        && (c_kex.first() != s_kex.first() || c_host.first() != s_host.first());

    Ok(Negotiated {
        kex,
        host_key,
        cipher,
        peer_guessed_wrong,
    })
}

fn read_public_key(r: &mut Reader<'_>) -> Result<PublicKey> {
    let bytes: [u8; 32] = r
        .string()?
        .try_into()
        .map_err(|_| Error::Protocol("invalid curve25519 public key length".to_string()))?;
    Ok(PublicKey::from(bytes))
}

fn shared_secret(secret: EphemeralSecret, peer: &PublicKey) -> Result<Vec<u8>> {
    let shared = secret.diffie_hellman(peer);
    if !shared.was_contributory() {
        return Err(Error::Protocol("degenerate curve25519 shared secret".to_string()));
    }
    Ok(shared.as_bytes().to_vec())
}

#[allow(clippy::too_many_arguments)]
fn exchange_hash(
    client_version: &[u8],
    server_version: &[u8],
    client_kexinit: &[u8],
    server_kexinit: &[u8],
    host_key_blob: &[u8],
    client_public: &[u8],
    server_public: &[u8],
    shared: &[u8],
) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(1024);
    put_string(&mut buf, client_version);
    put_string(&mut buf, server_version);
    put_string(&mut buf, client_kexinit);
    put_string(&mut buf, server_kexinit);
    put_string(&mut buf, host_key_blob);
    put_string(&mut buf, client_public);
    put_string(&mut buf, server_public);
    put_mpint(&mut buf, shared);
    Sha256::digest(&buf).to_vec()
}

/// RFC 4253 section 7.2 key derivation, extended to the 64 bytes the
/// cipher needs
fn derive_key(
    k_mpint: &[u8],
    h: &[u8],
    letter: u8,
    session_id: &[u8],
) -> Result<[u8; KEY_LEN]> {
    let mut hasher = Sha256::new();
    hasher.update(k_mpint);
    hasher.update(h);
    hasher.update([letter]);
    hasher.update(session_id);
    let mut out = hasher.finalize().to_vec();

    while out.len() < KEY_LEN {
        let mut hasher = Sha256::new();
        hasher.update(k_mpint);
        hasher.update(h);
        hasher.update(&out);
        out.extend_from_slice(&hasher.finalize());
    }

    out[..KEY_LEN]
        .try_into()
        .map_err(|_| Error::Other("key derivation produced a short key".to_string()))
}
