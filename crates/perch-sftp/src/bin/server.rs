//! SFTP server binary
//!
//! Run with: cargo run --bin perch-sftp-server -- perch.toml

use anyhow::Context;
use clap::Parser;
use perch_sftp::{Config, Server, logging};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(default_value = "perch.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config {}", args.config.display()))?;
    config.validate().context("Invalid configuration")?;

    let _log_guard = logging::init(&config.logging).context("Failed to initialize logging")?;

    info!(
        event = "server_starting",
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        "Starting Perch SFTP server"
    );

    let root = &config.server.root_path;
    if !root.exists() {
        info!(
            event = "creating_root_directory",
            directory = %root.display(),
            "Creating root directory"
        );
        std::fs::create_dir_all(root)
            .with_context(|| format!("Failed to create root directory {}", root.display()))?;
    }

    info!(
        event = "server_configuration",
        host = %config.server.host,
        port = config.server.port,
        root_path = %config.server.root_path.display(),
        permission_mode = ?config.server.permission_mode,
        users = config.users.len(),
        max_auth_attempts = config.server.max_auth_attempts,
        rate_limit_max_attempts = config.rate_limit.max_attempts,
        rate_limit_lockout_secs = config.rate_limit.lockout_secs,
        log_format = ?config.logging.format,
        audit_enabled = config.logging.audit_enabled,
        "SFTP server configuration"
    );

    let server = Server::new(config)
        .await
        .context("Failed to create server")?;

    let token = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(event = "shutdown_requested", "Received Ctrl-C, shutting down");
            token.cancel();
        }
    });

    server.run().await.context("Server encountered an error")?;

    let status = server.status().to_json()?;
    info!(event = "server_shutdown", status = %status, "SFTP server stopped");

    Ok(())
}
