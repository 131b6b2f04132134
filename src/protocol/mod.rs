//! Wire formats spoken by the listeners and upstream dialers
//!
//! - SOCKS5: RFC 1928 (CONNECT) and RFC 1929 username/password
//! - HTTP/1.x proxy framing (CONNECT and absolute-URI forwarding)

pub mod http;
pub mod socks5;
