//! tesserad: tessera storage node daemon
//!
//! Usage:
//!   tesserad [--config /etc/tessera/config.toml] [--log info] [--log-format json]
//!
//! Holds this node's shares and lease table, runs the lease collector on
//! `[lease] sweep_interval_secs`, and serves /metrics, /healthz, /readyz.

mod daemon;
mod metrics;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "tesserad", version, about = "tessera storage node daemon")]
struct Cli {
    /// Path to tessera.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "TESSERA_CONFIG",
        default_value = "/etc/tessera/config.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides [daemon] log_level
    #[arg(long, env = "TESSERA_LOG")]
    log: Option<String>,

    /// Log format; overrides [daemon] log_format
    #[arg(long, env = "TESSERA_LOG_FORMAT")]
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

    // Config first: it carries the default log settings
    let config = tessera_core::config::TesseraConfig::load(&cli.config)?;

    let level = cli.log.as_deref().unwrap_or(&config.daemon.log_level);
    let format = cli.log_format.clone().unwrap_or_else(|| {
        if config.daemon.log_format.eq_ignore_ascii_case("text") {
            LogFormat::Text
        } else {
            LogFormat::Json
        }
    });
    init_logging(level, &format);

    if !cli.config.exists() {
        warn!(config = %cli.config.display(), "config file not found, running with defaults");
    }
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        node = %config.node.name,
        backend = %config.node.backend,
        "tesserad starting"
    );

    daemon::run(config).await
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
