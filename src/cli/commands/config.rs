//! Config command - show or validate configuration

use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};

use crate::cli::args::ConfigArgs;
use crate::config::{Config, config_search_paths, find_config_file, load_config};

/// Example configuration content
pub fn example_config() -> &'static str {
    r#"# authproxy configuration file

# JSONL session log (one line per finished session)
# log_path = "~/.local/state/authproxy/sessions.jsonl"

# Concurrent sessions across all listeners
max_sessions = 1024

[timeouts]
connect = "10s"
resolve = "5s"
idle = "300s"
handshake = "30s"
shutdown_grace = "10s"

# Accepted credentials: name = "password"
[users]
khanh = "khanh"

[ssh]
# OpenSSH ed25519 private key, see `authproxy keygen`
# An ephemeral key is generated when unset
# host_key = "~/.config/authproxy/ssh_host_ed25519_key"

# Listeners: protocol is one of ssh, http, socks5, mixed
[listeners.ssh]
protocol = "ssh"
port = 8000
bind = "0.0.0.0"

[listeners.http]
protocol = "http"
port = 8001
bind = "0.0.0.0"

[listeners.socks5]
protocol = "socks5"
port = 8002
bind = "0.0.0.0"

# Example: SOCKS5 and HTTP on one port, chained through an upstream
# [listeners.office]
# protocol = "mixed"
# port = 3128
# bind = "127.0.0.1"
# upstream = "office"

# Upstreams: kind is one of direct, http, socks5, ssh
# [upstreams.office]
# kind = "socks5"
# address = "10.0.0.2:1080"
# username = "u"
# password = "p"

# [upstreams.bastion]
# kind = "ssh"
# address = "bastion.example.com:22"
# username = "tunnel"
# password = "secret"
# host_key_fingerprint = "SHA256:..."
"#
}

/// Execute the config command
pub async fn execute(args: ConfigArgs, config_path: Option<PathBuf>) -> Result<()> {
    if args.paths {
        println!("Config search paths (in priority order):");
        for (i, cp) in config_search_paths().iter().enumerate() {
            let exists = if cp.path.exists() {
                "\x1b[32m[exists]\x1b[0m"
            } else {
                ""
            };
            println!("  {}. {} {}", i + 1, cp.description, exists);
            println!("     {}", cp.path.display());
        }
        return Ok(());
    }

    if args.example {
        match args.format.as_str() {
            "json" => println!("{}", toml_to_json(example_config())?),
            _ => print!("{}", example_config()),
        }
        return Ok(());
    }

    let Some(path) = config_path.or_else(find_config_file) else {
        if args.validate {
            eprintln!("No configuration file found.");
            eprintln!("Searched locations (use --paths for details):");
            for cp in config_search_paths() {
                eprintln!("  - {}", cp.path.display());
            }
            bail!("No configuration file to validate");
        }
        println!("# No configuration file found, showing built-in defaults");
        println!("# Use 'config --paths' to see search locations");
        println!();
        print_config(&Config::default(), &args.format)?;
        return Ok(());
    };

    if args.validate {
        validate(&path)?;
        println!("Configuration file is valid: {}", path.display());
        return Ok(());
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    match args.format.as_str() {
        "json" => println!("{}", toml_to_json(&content)?),
        _ => {
            println!("# Configuration from: {}", path.display());
            println!();
            print!("{}", content);
        }
    }
    Ok(())
}

/// Parse and resolve, so unknown fields, bad durations and dangling
/// upstream references are all reported
fn validate(path: &Path) -> Result<()> {
    let config_file = load_config(path)?;
    config_file
        .config
        .resolve()
        .with_context(|| format!("Configuration file is invalid: {}", path.display()))?;
    Ok(())
}

fn print_config(config: &Config, format: &str) -> Result<()> {
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(config)?),
        _ => print!(
            "{}",
            toml::to_string_pretty(config).context("Failed to serialize configuration")?
        ),
    }
    Ok(())
}

fn toml_to_json(content: &str) -> Result<String> {
    let value: toml::Value = toml::from_str(content).context("Failed to parse config")?;
    Ok(serde_json::to_string_pretty(&value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_example_config_is_valid() {
        let config: Config = toml::from_str(example_config()).unwrap();
        assert_eq!(config.listeners.len(), 3);
        let resolved = config.resolve().unwrap();
        assert_eq!(resolved.credentials.len(), 1);
    }

    #[test]
    fn test_example_config_as_json() {
        let json = toml_to_json(example_config()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["listeners"]["ssh"]["port"], 8000);
    }

    #[test]
    fn test_validate_rejects_dangling_upstream() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[listeners.web]\nprotocol = \"http\"\nport = 8080\nupstream = \"missing\"\n",
        )
        .unwrap();
        assert!(validate(&path).is_err());

        std::fs::write(&path, "[listeners.web]\nprotocol = \"http\"\nport = 8080\n").unwrap();
        assert!(validate(&path).is_ok());
    }

    #[test]
    fn test_default_config_serializes() {
        let text = toml::to_string_pretty(&Config::default()).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back, Config::default());
    }
}
