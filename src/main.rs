//! GateShell SSH reverse proxy
//!
//! Terminates inbound SSH connections, routes each one by user name to a
//! configured upstream SSH server, and bridges session channels between
//! the two encrypted sessions.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use gateshell::ProxyConfig;

/// GateShell - a reverse proxy for SSH
#[derive(Parser, Debug)]
#[command(name = "gateshell", version, about)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        default_value = "/etc/gateshell/gateshell.toml",
        env = "GATESHELL_CONFIG"
    )]
    config: PathBuf,

    /// Generate default configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Override listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new(Level::DEBUG.to_string())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Handle --generate-config
    if cli.generate_config {
        let config = ProxyConfig::default();
        let content = toml::to_string_pretty(&config)?;
        println!("{}", content);
        return Ok(());
    }

    // Load configuration
    let mut config = ProxyConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    // Apply CLI overrides
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }

    config.validate().context("Invalid configuration")?;
    config.ensure_dirs()?;

    info!("Starting gateshell");
    info!("  Listen address: {}", config.listen_addr);
    info!("  Host key: {}", config.host_key_path.display());
    info!("  Endpoints: {}", config.endpoints.len());

    gateshell::entrypoint(config).await
}
