//! authproxy - authenticating HTTP, SOCKS5 and SSH tunnel proxy
//!
//! Every listener checks a username/password against a shared credential
//! store before relaying the client to its destination, either directly or
//! through an upstream HTTP, SOCKS5 or SSH proxy. Finished sessions can be
//! recorded in a JSONL log.

pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod net;
pub mod protocol;
pub mod proxy;
pub mod relay;
pub mod server;
pub mod session;
pub mod ssh;

pub use error::{Error, Result};
pub use server::Server;

/// Package version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Package name
pub const NAME: &str = env!("CARGO_PKG_NAME");
