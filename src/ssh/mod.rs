//! Minimal SSH-2 for TCP tunnelling
//!
//! Only what a `ssh -W` / `ssh -L` style port forward needs: curve25519
//! key exchange, an ed25519 host key, chacha20-poly1305 packets, password
//! authentication and one `direct-tcpip` channel per connection. Used by
//! the SSH listener and by the SSH upstream dialer.

pub mod channel;
pub mod client;
pub mod hostkey;
pub mod server;
pub mod transport;
pub mod wire;

pub use client::SshClient;
pub use hostkey::HostKey;
pub use server::{AuthOutcome, ChannelOpen};
pub use transport::Transport;
