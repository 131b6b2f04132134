//! Configuration module for authproxy
//!
//! This module handles loading and parsing of configuration files,
//! including environment variable expansion, duration parsing and the
//! command-line overrides of `authproxy run`.

mod file;

use crate::auth::Credential;
use crate::net::{DialTimeouts, TargetAddr, Upstream, UpstreamKind};
use crate::proxy::ListenerProtocol;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

pub use file::{
    ConfigFile, ConfigPath, config_search_paths, find_config_file, load_config,
    load_config_or_default,
};

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Path to the JSONL session log
    /// Supports environment variable and tilde expansion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,

    /// Upper bound on concurrent sessions across all listeners
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    /// username = "password"
    #[serde(default)]
    pub users: BTreeMap<String, String>,

    #[serde(default)]
    pub ssh: SshConfig,

    /// Listener definitions, keyed by name
    #[serde(default = "default_listeners")]
    pub listeners: BTreeMap<String, ListenerConfig>,

    /// Upstream proxies listeners can chain through, keyed by name
    #[serde(default)]
    pub upstreams: BTreeMap<String, UpstreamConfig>,
}

/// Timeouts, as duration strings ("10s", "5m")
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutsConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect: String,
    #[serde(default = "default_resolve_timeout")]
    pub resolve: String,
    /// No bytes in either direction for this long ends a relay
    #[serde(default = "default_idle_timeout")]
    pub idle: String,
    /// Everything before the relay starts
    #[serde(default = "default_handshake_timeout")]
    pub handshake: String,
    /// How long in-flight sessions may drain on shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SshConfig {
    /// OpenSSH ed25519 private key; an ephemeral key is used when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key: Option<String>,
}

/// Configuration for a single listener
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    pub protocol: ListenerProtocol,
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Name of an entry in `[upstreams]`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<String>,
}

/// Configuration for an upstream proxy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    pub kind: UpstreamKind,
    /// `host:port`; required unless `kind = "direct"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Expected SSH host key fingerprint (`SHA256:...`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key_fingerprint: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_path: None,
            max_sessions: default_max_sessions(),
            timeouts: TimeoutsConfig::default(),
            users: BTreeMap::new(),
            ssh: SshConfig::default(),
            listeners: default_listeners(),
            upstreams: BTreeMap::new(),
        }
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            connect: default_connect_timeout(),
            resolve: default_resolve_timeout(),
            idle: default_idle_timeout(),
            handshake: default_handshake_timeout(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

fn default_max_sessions() -> usize {
    crate::server::DEFAULT_MAX_SESSIONS
}

fn default_connect_timeout() -> String {
    "10s".to_string()
}

fn default_resolve_timeout() -> String {
    "5s".to_string()
}

fn default_idle_timeout() -> String {
    "300s".to_string()
}

fn default_handshake_timeout() -> String {
    "30s".to_string()
}

fn default_shutdown_grace() -> String {
    "10s".to_string()
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_listeners() -> BTreeMap<String, ListenerConfig> {
    [
        ("ssh", ListenerProtocol::Ssh, 8000),
        ("http", ListenerProtocol::Http, 8001),
        ("socks5", ListenerProtocol::Socks5, 8002),
    ]
    .into_iter()
    .map(|(name, protocol, port)| {
        (
            name.to_string(),
            ListenerConfig {
                protocol,
                port,
                bind: default_bind(),
                upstream: None,
            },
        )
    })
    .collect()
}

/// Command-line additions to the file configuration
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// `proto:[bind:]port`; when present these replace the file's listeners
    pub listen: Vec<String>,
    /// `name:password`, added to (or replacing entries of) `[users]`
    pub users: Vec<String>,
    pub host_key: Option<String>,
    pub log_path: Option<String>,
}

impl ListenerConfig {
    /// Parse a `--listen` value: `proto:port` or `proto:bind:port`
    ///
    /// IPv6 bind addresses are written in brackets: `http:[::1]:8080`.
    pub fn parse_spec(spec: &str) -> crate::Result<(String, Self)> {
        let invalid = || {
            crate::Error::Config(format!(
                "Invalid listener '{}', expected proto:[bind:]port",
                spec
            ))
        };
        let (proto, rest) = spec.split_once(':').ok_or_else(invalid)?;
        let protocol: ListenerProtocol = proto.parse()?;
        let (bind, port) = match rest.rsplit_once(':') {
            Some((bind, port)) => (
                bind.trim_start_matches('[').trim_end_matches(']').to_string(),
                port,
            ),
            None => (default_bind(), rest),
        };
        let port: u16 = port.parse().map_err(|_| invalid())?;
        bind.parse::<IpAddr>().map_err(|_| invalid())?;

        Ok((
            format!("{}-{}", protocol, port),
            Self {
                protocol,
                port,
                bind,
                upstream: None,
            },
        ))
    }
}

impl Config {
    /// Apply command-line overrides
    pub fn with_overrides(mut self, overrides: &Overrides) -> crate::Result<Self> {
        if !overrides.listen.is_empty() {
            self.listeners.clear();
            for spec in &overrides.listen {
                let (name, listener) = ListenerConfig::parse_spec(spec)?;
                self.listeners.insert(name, listener);
            }
        }
        for spec in &overrides.users {
            let credential = Credential::parse(spec).ok_or_else(|| {
                crate::Error::Config(format!(
                    "Invalid user '{}', expected name:password",
                    spec.split(':').next().unwrap_or_default()
                ))
            })?;
            self.users.insert(credential.username, credential.password);
        }
        if let Some(host_key) = &overrides.host_key {
            self.ssh.host_key = Some(host_key.clone());
        }
        if let Some(log_path) = &overrides.log_path {
            self.log_path = Some(log_path.clone());
        }
        Ok(self)
    }

    /// Expand paths, parse durations and addresses, and check references
    pub fn resolve(&self) -> crate::Result<ResolvedConfig> {
        if self.max_sessions == 0 {
            return Err(crate::Error::Config(
                "max_sessions must be greater than zero".to_string(),
            ));
        }
        if self.listeners.is_empty() {
            return Err(crate::Error::Config("No listeners configured".to_string()));
        }

        let timeouts = Timeouts {
            connect: parse_duration(&self.timeouts.connect)?,
            resolve: parse_duration(&self.timeouts.resolve)?,
            idle: parse_duration(&self.timeouts.idle)?,
            handshake: parse_duration(&self.timeouts.handshake)?,
            shutdown_grace: parse_duration(&self.timeouts.shutdown_grace)?,
        };

        let mut upstreams = BTreeMap::new();
        for (name, upstream) in &self.upstreams {
            upstreams.insert(name.clone(), upstream.resolve(name)?);
        }

        let mut listeners = Vec::with_capacity(self.listeners.len());
        for (name, listener) in &self.listeners {
            let ip: IpAddr = listener.bind.parse().map_err(|_| {
                crate::Error::Config(format!(
                    "Listener '{}': invalid bind address '{}'",
                    name, listener.bind
                ))
            })?;
            let upstream = match &listener.upstream {
                Some(upstream_name) => Some(
                    upstreams
                        .get(upstream_name)
                        .cloned()
                        .ok_or_else(|| {
                            crate::Error::Config(format!(
                                "Listener '{}' refers to unknown upstream '{}'",
                                name, upstream_name
                            ))
                        })?,
                ),
                None => None,
            };
            listeners.push(ResolvedListener {
                name: name.clone(),
                protocol: listener.protocol,
                bind: SocketAddr::new(ip, listener.port),
                upstream,
            });
        }

        let credentials = self
            .users
            .iter()
            .map(|(user, password)| Credential::new(user, password))
            .collect();

        Ok(ResolvedConfig {
            log_path: self
                .log_path
                .as_deref()
                .map(expand_path)
                .transpose()?
                .map(PathBuf::from),
            max_sessions: self.max_sessions,
            timeouts,
            credentials,
            host_key: self
                .ssh
                .host_key
                .as_deref()
                .map(expand_path)
                .transpose()?
                .map(PathBuf::from),
            listeners,
        })
    }
}

impl UpstreamConfig {
    fn resolve(&self, name: &str) -> crate::Result<Upstream> {
        let address = match (&self.address, self.kind) {
            (Some(address), _) => TargetAddr::parse_authority(address, None).map_err(|_| {
                crate::Error::Config(format!(
                    "Upstream '{}': invalid address '{}', expected host:port",
                    name, address
                ))
            })?,
            (None, UpstreamKind::Direct) => TargetAddr::Ip(SocketAddr::from(([0, 0, 0, 0], 0))),
            (None, kind) => {
                return Err(crate::Error::Config(format!(
                    "Upstream '{}' of kind {} needs an address",
                    name, kind
                )));
            }
        };
        if self.kind == UpstreamKind::Ssh && (self.username.is_none() || self.password.is_none()) {
            return Err(crate::Error::Config(format!(
                "Upstream '{}': ssh upstreams need a username and password",
                name
            )));
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(crate::Error::Config(format!(
                "Upstream '{}': username and password must be given together",
                name
            )));
        }

        let mut upstream = Upstream::new(name, self.kind, address);
        if let (Some(user), Some(pass)) = (&self.username, &self.password) {
            upstream = upstream.with_credentials(user, pass);
        }
        if let Some(fingerprint) = &self.host_key_fingerprint {
            upstream = upstream.with_host_key_fingerprint(fingerprint);
        }
        Ok(upstream)
    }
}

/// Parsed timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub resolve: Duration,
    pub idle: Duration,
    pub handshake: Duration,
    pub shutdown_grace: Duration,
}

impl Timeouts {
    pub fn dial(&self) -> DialTimeouts {
        DialTimeouts {
            connect: self.connect,
            resolve: self.resolve,
        }
    }
}

/// A listener ready to bind
#[derive(Debug, Clone)]
pub struct ResolvedListener {
    pub name: String,
    pub protocol: ListenerProtocol,
    pub bind: SocketAddr,
    pub upstream: Option<Upstream>,
}

/// Configuration with paths expanded, durations parsed and references
/// checked
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub log_path: Option<PathBuf>,
    pub max_sessions: usize,
    pub timeouts: Timeouts,
    pub credentials: Vec<Credential>,
    pub host_key: Option<PathBuf>,
    pub listeners: Vec<ResolvedListener>,
}

/// Expand environment variables and tilde in a path string
pub fn expand_path(path: &str) -> crate::Result<String> {
    shellexpand::full(path)
        .map(|s| s.into_owned())
        .map_err(|e| crate::Error::Config(format!("Failed to expand path '{}': {}", path, e)))
}

/// Parse a duration string like "1h", "30m", "10s", "500ms"
pub fn parse_duration(s: &str) -> crate::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::Config("Empty duration string".to_string()));
    }

    let (num_str, unit) = s
        .char_indices()
        .find(|(_, c)| c.is_alphabetic())
        .map(|(i, _)| (&s[..i], &s[i..]))
        .unwrap_or((s, "s"));

    let num: u64 = num_str.trim().parse().map_err(|e| {
        crate::Error::Config(format!("Invalid duration number '{}': {}", num_str, e))
    })?;

    let duration = match unit.to_lowercase().as_str() {
        "ms" | "msec" | "millis" => Duration::from_millis(num),
        "s" | "sec" | "secs" | "second" | "seconds" => Duration::from_secs(num),
        "m" | "min" | "mins" | "minute" | "minutes" => Duration::from_secs(num * 60),
        "h" | "hr" | "hrs" | "hour" | "hours" => Duration::from_secs(num * 60 * 60),
        "d" | "day" | "days" => Duration::from_secs(num * 60 * 60 * 24),
        _ => {
            return Err(crate::Error::Config(format!(
                "Unknown duration unit '{}' in '{}'",
                unit, s
            )));
        }
    };

    Ok(duration)
}
