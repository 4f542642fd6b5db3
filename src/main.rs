mod api;
mod bus;
mod engine;
mod gateway;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use wagate_client::BridgeClient;
use wagate_core::clock::SystemClock;
use wagate_core::config::{self, shellexpand};
use wagate_store::Store;

#[derive(Parser)]
#[command(
    name = "wagate",
    version,
    about = "WhatsApp automation gateway for valuation routing and rate broadcasts"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file.
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway.
    Start,
    /// Check configuration and store reachability.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => cmd_start(&cli.config).await,
        Commands::Status => cmd_status(&cli.config).await,
    }
}

/// Start the gateway daemon.
async fn cmd_start(config_path: &str) -> anyhow::Result<()> {
    let cfg = config::load(config_path)?;

    // Logging: stdout + file appender at {data_dir}/logs/wagate.log.
    let data_dir = shellexpand(&cfg.gateway.data_dir);
    let log_dir = PathBuf::from(&data_dir).join("logs");
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::never(&log_dir, "wagate.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cfg.gateway.log_level.clone()));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .init();

    // A store we cannot open is fatal: exit non-zero so the orchestrator
    // restarts us rather than running without persistence.
    let store = Store::new(&cfg.store.db_path)
        .await
        .map_err(|e| anyhow::anyhow!("store initialization failed: {e}"))?;

    let client = Arc::new(BridgeClient::new(&cfg.bridge, &cfg.gateway.session_id));
    let clock = Arc::new(SystemClock);

    let gw = gateway::Gateway::build(cfg, store, client, clock);
    gw.run().await
}

/// Print a configuration summary and probe the store.
async fn cmd_status(config_path: &str) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("error")),
        )
        .init();

    let cfg = config::load(config_path)?;
    println!("config:   {config_path}");
    println!("session:  {}", cfg.gateway.session_id);
    println!("port:     {}", cfg.server.port);
    println!("bridge:   {}", cfg.bridge.base_url);
    println!(
        "imagekit: {}",
        if cfg.imagekit.is_some() {
            "configured"
        } else {
            "not configured (upload disabled)"
        }
    );

    match Store::new(&cfg.store.db_path).await {
        Ok(store) => {
            let reachable = store.is_reachable().await;
            println!(
                "store:    {} ({})",
                cfg.store.db_path,
                if reachable { "CONNECTED" } else { "ERROR" }
            );
        }
        Err(e) => {
            println!("store:    {} (ERROR: {e})", cfg.store.db_path);
            std::process::exit(1);
        }
    }

    Ok(())
}
