//! Run command - serve every configured listener in the foreground

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::info;

use crate::cli::args::RunArgs;
use crate::config::{self, Overrides, ResolvedConfig};
use crate::logging::{self, LogConfig};
use crate::server::{self, Server};

impl RunArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            listen: self.listen.clone(),
            users: self.users.clone(),
            host_key: self.host_key.as_ref().map(|p| p.display().to_string()),
            log_path: self.log.as_ref().map(|p| p.display().to_string()),
        }
    }
}

/// Load the file configuration, apply the flags and resolve
pub fn resolve_config(args: &RunArgs, config_path: Option<&Path>) -> Result<ResolvedConfig> {
    let config_file = config::load_config_or_default(config_path)
        .context("Failed to load configuration")?;
    if !config_file.path.as_os_str().is_empty() {
        info!(path = %config_file.path.display(), "Using configuration file");
    }

    config_file
        .config
        .with_overrides(&args.overrides())
        .context("Invalid command-line option")?
        .resolve()
        .context("Invalid configuration")
}

/// Execute the run command
pub async fn execute(args: RunArgs, config_path: Option<PathBuf>) -> Result<()> {
    let config = resolve_config(&args, config_path.as_deref())?;

    let mut log_config = LogConfig::new();
    if let Some(path) = &config.log_path {
        info!(log = %path.display(), "JSONL session log enabled");
        log_config = log_config.with_jsonl_path(path);
    }
    let session_log = logging::open_session_log(&log_config);

    let server = Server::from_config(&config, session_log)
        .await
        .context("Failed to start listeners")?;
    for (name, addr) in server.local_addrs() {
        info!(listener = %name, address = %addr, "Configured listener");
    }
    info!(
        version = crate::VERSION,
        listeners = config.listeners.len(),
        users = config.credentials.len(),
        "authproxy started. Press Ctrl+C to stop."
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        server::shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    server.run(shutdown_rx).await.context("Server failed")?;
    info!("Shutdown complete");
    Ok(())
}
