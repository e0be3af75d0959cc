//! dweb host - boots a registry, the gateway module and its listener.
//!
//! Trailing arguments are treated as a deep link:
//!
//! ```text
//! dweb-host --port 8080 dweb install -url=https://x.test/app.json
//! ```

use anyhow::Result;
use clap::Parser;
use dweb_core::{normalize_args, Registry};
use dweb_gateway::{GatewayServer, HttpModule};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "dweb-host")]
#[command(about = "Host process for dweb modules")]
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

    /// Deep link: <scheme> <path...> [-key=value | -key value]...
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    deeplink: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over --debug
    let default_level = if args.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("Starting dweb host");

    let registry = Registry::new()?;
    let http = Arc::new(HttpModule::new());
    registry.install(http.clone());
    registry.open(dweb_core::GatewayConfig::HTTP_MMID).await?;

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let server = GatewayServer::start(addr, http.table()).await?;

    // Machine-readable port line for launchers
    println!("GATEWAY_PORT={}", server.addr().port());

    if !args.deeplink.is_empty() {
        let url = normalize_args(args.deeplink.as_slice())?;
        match registry.dispatch_deeplink(url.as_str()).await {
            Ok(0) => warn!("No module accepted {}", url),
            Ok(n) => info!("{} delivered to {} module(s)", url, n),
            Err(e) => warn!("Deep link {} failed: {}", url, e),
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");

    server.join().await;
    registry.close_all().await;
    Ok(())
}
