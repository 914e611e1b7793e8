//! Agent binary entry point.
//!
//! Loads the local wire-format configuration, starts the periodic sync
//! tick (heartbeat, config fetch, log upload), and hosts whichever PLC
//! devices the current configuration enables until a shutdown signal
//! arrives.

use anyhow::{Context, Result};
use clap::Parser;
use plc_agent::config::{self, AgentWireConfig};
use plc_agent::devices::DeviceFleet;
use plc_agent::heartbeat::{self, HeartbeatOutcome, HeartbeatRequest};
use plc_agent::signals;
use plc_common::AgentProcessConfig;
use plc_logger::InteractionLog;
use plc_profiles::ProfileStore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Agent command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "plc-agent",
    about = "ICS honeypot agent - emulates PLC devices and reports to a fleet server",
    version,
    long_about = None
)]
struct Args {
    /// Path to the agent's wire-format config (JSON).
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory containing profile JSON files.
    #[arg(long, short = 'p', value_name = "DIR", default_value = "profiles")]
    profiles_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info")]
    log_level: String,
}

fn init_logging(level: &str) {
    let filter = format!(
        "plc_agent={level},plc_modbus={level},plc_s7={level},plc_simulation={level},plc_common={level}"
    );
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

fn load_wire_config(path: &std::path::Path) -> AgentWireConfig {
    match AgentWireConfig::from_file(path) {
        Ok(config) => config,
        Err(err) => {
            info!(%err, ?path, "no usable local config found, starting unconfigured");
            AgentWireConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);
    info!(version = env!("CARGO_PKG_VERSION"), "starting ICS honeypot agent");

    let process_config = AgentProcessConfig::default();
    let config_path = args.config.unwrap_or(process_config.config_path);
    let profiles_dir = args.profiles_dir.clone();
    let profile_store = ProfileStore::load(profiles_dir)
        .with_context(|| format!("failed to load profiles from {:?}", args.profiles_dir))?;

    run_agent(config_path, profile_store).await
}

/// The agent's full lifetime: sync tick, device fleet, shutdown signal.
async fn run_agent(config_path: PathBuf, profile_store: ProfileStore) -> Result<()> {
    let mut wire_config = load_wire_config(&config_path);
    if wire_config.node_id.is_empty() {
        wire_config.node_id = generate_node_id();
        info!(node_id = %wire_config.node_id, "generated a fresh node id");
    }

    let client = heartbeat::build_client().context("failed to build HTTP client")?;
    let logger = Arc::new(InteractionLog::new());
    let mut fleet = DeviceFleet::new();
    let shutdown = CancellationToken::new();

    let signal_task = tokio::spawn(signals::wait_for_shutdown(shutdown.clone()));

    let mut tick_interval = tokio::time::interval(std::time::Duration::from_secs(5));
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = tick_interval.tick() => {
                sync_tick(&client, &mut wire_config, &config_path, &profile_store, &mut fleet, &logger).await;
            }
        }
    }

    info!("shutting down, stopping all devices");
    fleet.stop_all();
    let _ = signal_task.await;
    Ok(())
}

fn generate_node_id() -> String {
    let hostname = hostname_or_default();
    let suffix = std::process::id();
    format!("{hostname}-{suffix}")
}

fn hostname_or_default() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "honeypot-agent".to_string())
}

/// One sync tick: heartbeat, then (on success) config fetch, then log
/// upload, in that order (§4.8).
async fn sync_tick(
    client: &reqwest::Client,
    wire_config: &mut AgentWireConfig,
    config_path: &std::path::Path,
    profile_store: &ProfileStore,
    fleet: &mut DeviceFleet,
    logger: &Arc<InteractionLog>,
) {
    let request = HeartbeatRequest {
        node_id: wire_config.node_id.clone(),
        ip: local_ip_guess(),
        name: wire_config.name.clone(),
        config: Some(wire_config.clone()),
    };

    let outcome = match heartbeat::send_heartbeat(client, &wire_config.server_url, &request).await {
        Ok(response) => heartbeat::dispatch(&response, &wire_config.node_id),
        Err(err) => {
            tracing::debug!(%err, "heartbeat failed");
            HeartbeatOutcome::UnreachableServer
        }
    };

    match outcome {
        HeartbeatOutcome::Adopted { new_node_id } => {
            info!(old = %wire_config.node_id, new = %new_node_id, "adopted by server");
            fleet.stop_all();
            wire_config.original_id = Some(wire_config.node_id.clone());
            wire_config.node_id = new_node_id;
            fleet.reset_backoff();
            if let Err(err) = wire_config.save(config_path) {
                warn!(%err, "failed to persist adopted config");
            }
            return;
        }
        HeartbeatOutcome::UnreachableServer => {
            if fleet.is_running() {
                warn!("server unreachable, safety-stopping all devices");
                fleet.stop_all();
            }
            return;
        }
        HeartbeatOutcome::Stop => {
            if fleet.is_running() {
                info!("server requested stop");
                fleet.stop_all();
            }
        }
        HeartbeatOutcome::Start => {
            if !fleet.is_running() && !wire_config.plcs.is_empty() && fleet.can_attempt_start() {
                info!("starting configured devices");
                if fleet.start_all(&wire_config.plcs, profile_store, Arc::clone(logger)).await {
                    info!("devices started");
                } else if fleet.backoff_exhausted() {
                    error!("giving up starting devices after repeated failures");
                }
            }
        }
    }

    fetch_and_apply_config(client, wire_config, config_path, fleet).await;
    upload_pending_logs(client, wire_config, logger).await;
}

async fn fetch_and_apply_config(
    client: &reqwest::Client,
    wire_config: &mut AgentWireConfig,
    config_path: &std::path::Path,
    fleet: &mut DeviceFleet,
) {
    let raw = match heartbeat::fetch_config(client, &wire_config.server_url, &wire_config.node_id).await {
        Ok(raw) => raw,
        Err(err) => {
            tracing::debug!(%err, "config fetch failed");
            return;
        }
    };

    let normalized = match config::normalize(raw) {
        Ok(normalized) => normalized,
        Err(err) => {
            warn!(%err, "server returned an invalid config, keeping current configuration");
            return;
        }
    };

    if config::plcs_differ(&wire_config.plcs, &normalized.plcs) {
        info!("configuration changed, restarting devices");
        fleet.stop_all();
        fleet.reset_backoff();
        wire_config.plcs = normalized.plcs;
        wire_config.name = normalized.name;
        if let Err(err) = wire_config.save(config_path) {
            warn!(%err, "failed to persist fetched config");
        }
    }
}

async fn upload_pending_logs(client: &reqwest::Client, wire_config: &AgentWireConfig, logger: &Arc<InteractionLog>) {
    let pending = logger.pending(plc_logger::UPLOAD_BATCH_SIZE);
    if pending.is_empty() {
        return;
    }
    let ids: Vec<u64> = pending.iter().map(|r| r.id).collect();
    match heartbeat::upload_logs(client, &wire_config.server_url, &wire_config.node_id, &pending).await {
        Ok(()) => logger.mark_uploaded(&ids),
        Err(err) => tracing::debug!(%err, count = pending.len(), "log upload failed, will retry next tick"),
    }
}

fn local_ip_guess() -> String {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "0.0.0.0".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_node_id_is_non_empty() {
        assert!(!generate_node_id().is_empty());
    }
}
