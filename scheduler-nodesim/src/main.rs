//! scheduler-nodesim: a small fleet of simulated exec nodes that drive
//! scheduler-core's node heartbeat RPC (spec §6), for exercising the
//! fair-share engine without real hardware or job controllers.

mod node;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use scheduler_core::proto::scheduling_v1::node_heartbeat_service_client::NodeHeartbeatServiceClient;
use node::{NodeSpec, SimulatedNode};

#[derive(Debug, serde::Deserialize)]
struct FleetConfig {
    #[serde(default = "default_heartbeat_interval_ms")]
    heartbeat_interval_ms: u64,
    #[serde(default = "default_job_duration_ms")]
    job_duration_ms: u64,
    nodes: Vec<NodeSpec>,
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_job_duration_ms() -> u64 {
    5000
}

/// Simulated exec-node fleet for scheduler-core.
#[derive(Debug, Parser)]
#[command(name = "scheduler-nodesim", version, about)]
struct Args {
    /// Path to the simulated fleet configuration YAML.
    #[arg(long, default_value = "config/nodesim_fleet.yaml")]
    fleet: PathBuf,

    /// `scheduler-core` heartbeat RPC endpoint.
    #[arg(long, default_value = "http://127.0.0.1:7433")]
    scheduler: String,

    #[arg(long, default_value = "info")]
    log_level: String,
}

fn default_fleet() -> FleetConfig {
    FleetConfig {
        heartbeat_interval_ms: default_heartbeat_interval_ms(),
        job_duration_ms: default_job_duration_ms(),
        nodes: vec![NodeSpec {
            id: "nodesim-1".into(),
            address: None,
            tags: vec!["default".into()],
            scheduling_segment: None,
            cpu: 32_000,
            memory: 137_438_953_472,
            user_slots: 8,
            gpu: 0,
            network: 0,
        }],
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt().with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level))).init();

    let fleet = if args.fleet.exists() {
        let content = std::fs::read_to_string(&args.fleet).with_context(|| format!("reading fleet config {}", args.fleet.display()))?;
        serde_yaml::from_str(&content).with_context(|| format!("parsing fleet config {}", args.fleet.display()))?
    } else {
        warn!(path = %args.fleet.display(), "fleet config not found, simulating a single default node");
        default_fleet()
    };

    let interval = Duration::from_millis(fleet.heartbeat_interval_ms);
    let job_duration = Duration::from_millis(fleet.job_duration_ms);

    let mut handles = Vec::with_capacity(fleet.nodes.len());
    for spec in fleet.nodes {
        let scheduler_addr = args.scheduler.clone();
        handles.push(tokio::spawn(async move {
            if let Err(err) = run_node(spec, scheduler_addr, interval, job_duration).await {
                warn!(%err, "simulated node exited with an error");
            }
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

async fn run_node(spec: NodeSpec, scheduler_addr: String, interval: Duration, job_duration: Duration) -> Result<()> {
    let node_id = spec.id.clone();
    let mut client = NodeHeartbeatServiceClient::connect(scheduler_addr).await.context("connecting to scheduler-core")?;
    let mut node = SimulatedNode::new(spec, job_duration);
    let mut ticker = tokio::time::interval(interval);

    loop {
        ticker.tick().await;
        let now = Instant::now();
        let request = node.build_request(now);
        match client.heartbeat(request).await {
            Ok(response) => {
                let response = response.into_inner();
                if response.scheduling_skipped {
                    tracing::debug!(node = %node_id, "scheduling skipped this heartbeat");
                }
                node.apply_response(&response, now);
                info!(
                    node = %node_id,
                    started = response.jobs_to_start.len(),
                    aborted = response.jobs_to_abort.len(),
                    removed = response.jobs_to_remove.len(),
                    running = node.jobs.len(),
                    "heartbeat processed"
                );
            }
            Err(status) => {
                warn!(node = %node_id, %status, "heartbeat RPC failed");
            }
        }
    }
}
