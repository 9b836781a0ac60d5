//! commsyncd: keeps this device in sync with the user's other devices
//!
//! Usage:
//!   commsyncd [--config /etc/commsync/config.toml] [--log debug] [--log-format json]

mod daemon;
mod metrics;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};
use tracing::info;

use commsync_core::config::CommsyncConfig;

#[derive(Parser, Debug)]
#[command(name = "commsyncd", version, about = "commsync device sync daemon")]
struct Cli {
    /// Path to commsync.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "COMMSYNC_CONFIG",
        default_value = "/etc/commsync/config.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, env = "COMMSYNC_LOG")]
    log: Option<String>,

    /// Log format; overrides the config file
    #[arg(long, env = "COMMSYNC_LOG_FORMAT")]
    log_format: Option<LogFormat>,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, found) = load_config(&cli.config).await?;

    let level = cli.log.unwrap_or_else(|| config.daemon.log_level.clone());
    let format = cli.log_format.unwrap_or_else(|| {
        LogFormat::from_str(&config.daemon.log_format, true).unwrap_or(LogFormat::Text)
    });
    init_logging(&level, &format);

    if !found {
        tracing::warn!(
            "config file not found: {}  (using defaults)",
            cli.config.display()
        );
    }
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "commsyncd starting"
    );

    daemon::run(config).await
}

/// Read the config file; a missing file yields defaults.
async fn load_config(path: &Path) -> Result<(CommsyncConfig, bool)> {
    if !path.exists() {
        return Ok((CommsyncConfig::default(), false));
    }
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
    let config = CommsyncConfig::from_toml(&content)
        .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.display()))?;
    Ok((config, true))
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}
