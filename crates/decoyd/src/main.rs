//! decoyd — the decoy daemon.
//!
//! Single binary that assembles the decoy subsystems:
//! - Configuration (TOML root aggregate)
//! - Spreader + per-server units + account pool
//! - Stats logging sink
//!
//! # Usage
//!
//! ```text
//! decoyd --config decoy.toml run
//! decoyd --config decoy.toml check 198.51.100.7:28015
//! decoyd --config decoy.toml import-accounts accounts.txt --server 198.51.100.7:28015
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::info;

use decoy_core::config::parse_accounts;
use decoy_core::ManagerConfig;
use decoy_joiner::probe_server;
use decoy_spreader::Spreader;

/// Display names are capped to keep logs and config readable.
const DISPLAY_NAME_MAX: usize = 30;

#[derive(Parser)]
#[command(name = "decoyd", about = "Decoy fleet daemon")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, default_value = "decoy.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Keep the configured servers populated until interrupted.
    Run,

    /// Probe one server and refresh its display name on success.
    Check {
        /// Server key, `address:port`.
        server: String,

        /// Probe timeout in seconds.
        #[arg(long, default_value = "60")]
        timeout: u64,
    },

    /// Import `username:password` lines from a file.
    ImportAccounts {
        /// Accounts file, one `username:password` per line.
        file: PathBuf,

        /// Server key whose roster the accounts replace; they join the
        /// shared pool when omitted.
        #[arg(long)]
        server: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,decoyd=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let config = ManagerConfig::from_file(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;

    match cli.command {
        Command::Run => run(config).await,
        Command::Check { server, timeout } => {
            check(&cli.config, config, &server, timeout).await
        }
        Command::ImportAccounts { file, server } => {
            import_accounts(&cli.config, config, &file, server.as_deref())
        }
    }
}

/// Run the spreader until Ctrl-C.
async fn run(config: ManagerConfig) -> anyhow::Result<()> {
    if config.servers.is_empty() {
        bail!("no servers configured, nothing to populate");
    }

    let spreader = Spreader::new(config.joiner_bin.clone());
    spreader.on_config_changed(&config);
    spreader.start();

    // Stats sink: log every active-count change per server.
    for unit in spreader.units() {
        let label = unit.spec().label();
        let mut stats_rx = unit.subscribe_stats();
        tokio::spawn(async move {
            while stats_rx.changed().await.is_ok() {
                let stats = *stats_rx.borrow_and_update();
                info!(server = %label, active = stats.active, "server stats");
            }
        });
    }

    info!(
        servers = config.servers.len(),
        pool = config.accounts.len(),
        "decoyd running, press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c().await?;

    info!("shutting down, reclaiming bots");
    spreader.stop();
    // Let the kill signals reach the joiner processes before exiting.
    tokio::time::sleep(Duration::from_millis(500)).await;
    Ok(())
}

/// Probe one configured server; on success store the observed name.
async fn check(
    config_path: &Path,
    mut config: ManagerConfig,
    key: &str,
    timeout: u64,
) -> anyhow::Result<()> {
    let server = config
        .server(key)
        .with_context(|| format!("server not found in config: {key}"))?
        .clone();

    let account = server
        .accounts
        .first()
        .or_else(|| config.accounts.first())
        .context("no account available for probing")?
        .clone();

    info!(server = %server.label(), account = %account.username, "probing");
    let name = probe_server(
        &config.joiner_bin,
        &account,
        &server,
        Duration::from_secs(timeout),
    )
    .await?;

    let display_name: String = name.chars().take(DISPLAY_NAME_MAX).collect();
    info!(server = %key, name = %display_name, "probe succeeded");

    if let Some(spec) = config.server_mut(key) {
        spec.display_name = display_name;
    }
    config.save_to(config_path)?;
    Ok(())
}

/// Import accounts into a server roster or the shared pool.
fn import_accounts(
    config_path: &Path,
    mut config: ManagerConfig,
    file: &Path,
    server: Option<&str>,
) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read accounts file {}", file.display()))?;
    let accounts = parse_accounts(&content)?;
    let imported = accounts.len();

    match server {
        Some(key) => {
            let spec = config
                .server_mut(key)
                .with_context(|| format!("server not found in config: {key}"))?;
            spec.accounts = accounts;
            info!(server = %key, imported, "roster replaced");
        }
        None => {
            let mut added = 0usize;
            for account in accounts {
                if !config.accounts.iter().any(|a| a.username == account.username) {
                    config.accounts.push(account);
                    added += 1;
                }
            }
            info!(imported, added, "accounts joined the shared pool");
        }
    }

    config.save_to(config_path)?;
    Ok(())
}
