//! Credential store shared by every listener
//!
//! Credentials are loaded once at start-up and never mutated afterwards, so the
//! store is shared behind an `Arc` without any locking.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::collections::HashMap;
use std::fmt;

/// A username/password pair
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Parse a `name:password` specification (the password may contain ':')
    pub fn parse(spec: &str) -> Option<Self> {
        let (username, password) = spec.split_once(':')?;
        if username.is_empty() {
            return None;
        }
        Some(Self::new(username, password))
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Read-only username → password table
#[derive(Clone, Default)]
pub struct CredentialStore {
    users: HashMap<String, String>,
}

impl CredentialStore {
    /// Create an empty store (every verification fails)
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from credentials; later duplicates replace earlier ones
    pub fn from_credentials<I>(credentials: I) -> Self
    where
        I: IntoIterator<Item = Credential>,
    {
        let users = credentials
            .into_iter()
            .map(|c| (c.username, c.password))
            .collect();
        Self { users }
    }

    /// Number of configured users
    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Check a username/password pair
    ///
    /// Fails closed: unknown users and mismatches both return `false`. The
    /// password comparison does not short-circuit on the first differing byte.
    pub fn verify(&self, username: &str, password: &str) -> bool {
        match self.users.get(username) {
            Some(expected) => constant_time_eq(expected.as_bytes(), password.as_bytes()),
            None => {
                // Burn a comparable amount of work for unknown users
                let _ = constant_time_eq(password.as_bytes(), password.as_bytes());
                false
            }
        }
    }

    /// Verify a `Proxy-Authorization` header value, returning the username on success
    pub fn verify_basic(&self, header: &[u8]) -> Option<String> {
        let (username, password) = parse_basic(header)?;
        self.verify(&username, &password).then_some(username)
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.users.keys().collect();
        names.sort();
        f.debug_struct("CredentialStore")
            .field("users", &names)
            .finish()
    }
}

/// Decode a `Basic <base64(user:pass)>` authorization value
///
/// The scheme is matched case-insensitively. Returns `None` for any other
/// scheme, invalid base64, non-UTF-8 content or a missing ':' separator.
pub fn parse_basic(header: &[u8]) -> Option<(String, String)> {
    let value = header.trim_ascii();
    let scheme = b"basic";
    if value.len() <= scheme.len() || !value[..scheme.len()].eq_ignore_ascii_case(scheme) {
        return None;
    }

    let rest = &value[scheme.len()..];
    if !rest[0].is_ascii_whitespace() {
        return None;
    }

    let decoded = STANDARD.decode(rest.trim_ascii()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// Encode a `Basic` authorization value for `username`/`password`
pub fn encode_basic(username: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", username, password)))
}

/// Constant-time byte comparison to avoid timing side channels
///
/// Lengths are compared up front; equal-length inputs are compared in full.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut acc: u8 = 0;
    for (&x, &y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}
