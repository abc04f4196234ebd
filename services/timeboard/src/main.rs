//! Timeboard CLI
//!
//! Command-line interface for the server time and request counter display.

use std::path::PathBuf;

use clap::Parser;
use timeboard::{load_config, Config};
use tracing::Level;

#[derive(Parser)]
#[command(name = "timeboard")]
#[command(about = "Displays server time and request counters polled from backend APIs")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Origin the endpoint paths are resolved against (overrides config file)
    #[arg(long)]
    base_url: Option<String>,

    /// Dashboard port (overrides config file)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Start with the developer panel open
    #[arg(long)]
    devtools: bool,

    /// Log level
    #[arg(short, long, default_value = "info", value_parser = parse_log_level)]
    log_level: Level,
}

fn parse_log_level(s: &str) -> Result<Level, String> {
    s.parse().map_err(|_| {
        format!(
            "Invalid log level: {}. Use: trace, debug, info, warn, error",
            s
        )
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Frames go to stdout, so logs go to stderr
    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(
        "Parsed command line arguments: config={:?}, base_url={:?}, dashboard_port={:?}, devtools={}, log_level={:?}",
        args.config,
        args.base_url,
        args.dashboard_port,
        args.devtools,
        args.log_level
    );

    let mut config = if let Some(config_path) = &args.config {
        tracing::debug!("Loading configuration from {:?}", config_path);
        load_config(config_path)?
    } else {
        tracing::debug!("Using default configuration");
        Config::default()
    };

    if let Some(base_url) = args.base_url {
        config.base_url = base_url;
    }
    if let Some(dashboard_port) = args.dashboard_port {
        config.dashboard.port = dashboard_port;
    }
    if args.devtools {
        config.devtools.initially_open = true;
    }

    tracing::info!("Starting timeboard");
    tracing::debug!(
        "Endpoints: {:?}, refetch every {}s",
        config.endpoints,
        config.query.refetch_interval_seconds
    );

    timeboard::run(config).await?;

    Ok(())
}
