//! Fleet control plane binary entry point.

use anyhow::{Context, Result};
use clap::Parser;
use plc_common::ServerProcessConfig;
use plc_profiles::ProfileStore;
use plc_server::{ControlPlaneServer, ServerConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;

/// Fleet server command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "plc-server",
    about = "ICS honeypot fleet control plane - agent registry and profile distribution",
    version,
    long_about = None
)]
struct Args {
    /// Address to bind the HTTP API to.
    #[arg(long, short = 'b', value_name = "ADDR")]
    bind: Option<SocketAddr>,

    /// Directory containing profile JSON files.
    #[arg(long, short = 'p', value_name = "DIR")]
    profiles_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info")]
    log_level: String,
}

fn init_logging(level: &str) {
    let filter = format!("plc_server={level},plc_profiles={level},plc_common={level}");
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);
    info!(version = env!("CARGO_PKG_VERSION"), "starting ICS honeypot fleet server");

    let process_config = ServerProcessConfig::default();
    let profiles_dir = args.profiles_dir.unwrap_or(process_config.profiles_dir);
    let bind_addr = args.bind.unwrap_or_else(|| {
        process_config.bind_addr.parse().unwrap_or_else(|_| "0.0.0.0:8000".parse().unwrap())
    });

    let profiles = ProfileStore::load(profiles_dir.clone())
        .with_context(|| format!("failed to load profiles from {profiles_dir:?}"))?;

    let server = ControlPlaneServer::new(ServerConfig { bind_addr, enable_cors: true }, profiles);
    server.start().await
}
