//! Controller service entry point

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use controller::{api::HttpApi, Config, Controller};

/// Controller - control plane for a sharded key-value cluster
#[derive(Parser, Debug)]
#[command(name = "controller")]
#[command(about = "Topology, failover and slot migration for a sharded key-value cluster")]
struct Args {
    /// Configuration file (YAML)
    #[arg(short, long)]
    config: Option<String>,

    /// HTTP API listen address
    #[arg(long)]
    addr: Option<String>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(addr) = args.addr {
        config.addr = addr;
    }
    if let Some(level) = args.log_level {
        config.log.level = level;
    }

    // Initialize logging
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    config.validate()?;

    info!("Starting controller...");
    info!("  Storage: {:?} under {}", config.storage.storage_type, config.storage.prefix);
    info!("  HTTP API: {}", config.addr);
    info!(
        "  Failover: ping every {}s, {} misses, multi-detect {}",
        config.failover.ping_interval_seconds,
        config.failover.max_ping_count,
        if config.multi_detect.enabled { "on" } else { "off" }
    );

    let controller = Controller::new(config.clone()).await?;
    controller.start();

    let app = HttpApi::new(controller.clone()).router();
    let listener = tokio::net::TcpListener::bind(&config.addr).await?;
    info!("HTTP API listening on {}", config.addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    controller.shutdown().await;
    Ok(())
}
