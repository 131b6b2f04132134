//! Argument structures for CLI commands

use clap::Args;
use clap_complete::Shell;
use std::path::PathBuf;

/// Arguments for the `run` command
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Listener definitions (repeatable); replace the configured listeners
    ///
    /// Format: proto:[bind:]port where proto is http, socks5, ssh or mixed
    ///
    /// Examples:
    ///   --listen socks5:1080
    ///   --listen http:127.0.0.1:3128
    #[arg(short, long, value_name = "SPEC")]
    pub listen: Vec<String>,

    /// Accepted credentials (repeatable), added to the configured users
    ///
    /// Format: name:password
    #[arg(short, long = "user", value_name = "NAME:PASSWORD")]
    pub users: Vec<String>,

    /// SSH host key (OpenSSH ed25519 private key)
    #[arg(long, value_name = "PATH")]
    pub host_key: Option<PathBuf>,

    /// Path to JSONL session log file
    #[arg(long, value_name = "PATH")]
    pub log: Option<PathBuf>,
}

/// Arguments for the `config` command
#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Validate configuration only
    #[arg(long)]
    pub validate: bool,

    /// Print an example configuration
    #[arg(long, conflicts_with = "validate")]
    pub example: bool,

    /// List configuration search paths
    #[arg(long, conflicts_with_all = ["validate", "example"])]
    pub paths: bool,

    /// Output format
    #[arg(short, long, default_value = "toml", value_parser = ["toml", "json"])]
    pub format: String,
}

/// Arguments for the `keygen` command
#[derive(Args, Debug, Clone)]
pub struct KeygenArgs {
    /// Where to write the private key; `<path>.pub` gets the public key
    #[arg(short, long, value_name = "PATH")]
    pub output: PathBuf,

    /// Overwrite an existing key
    #[arg(short, long)]
    pub force: bool,
}

/// Arguments for the `completion` command
#[derive(Args, Debug, Clone)]
pub struct CompletionArgs {
    /// Target shell
    #[arg(value_enum)]
    pub shell: Shell,
}
