//! Threadlink gateway - JSON-RPC front door to in-process Services.
//!
//! Starts a hub with the demo scripts registered, a Manager for the demo
//! Services, and an HTTP server that forwards JSON-RPC calls to them.

mod demo;
mod handler;
mod server;

use anyhow::Result;
use clap::Parser;
use std::time::Duration;
use threadlink::{Hub, HubConfig, Manager};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "threadlink-gateway")]
#[command(about = "JSON-RPC gateway for threadlink Services")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// How long a Service may take to start before discovery fails
    #[arg(long)]
    discovery_timeout_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting threadlink gateway");

    let mut config = HubConfig::default();
    if let Some(ms) = args.discovery_timeout_ms {
        config.discovery_timeout = Duration::from_millis(ms);
    }
    let hub = Hub::with_config(config);
    demo::register(&hub);

    let root = hub.root();
    let manager = Manager::new(&root, demo::templates());

    let addr = server::start_server(root.clone(), manager.clone(), &args.host, args.port).await?;

    // Read by whoever launched the gateway.
    println!("RPC_PORT={}", addr.port());

    info!("Gateway running on {}", addr);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    manager.destroy();
    root.terminate();

    Ok(())
}
