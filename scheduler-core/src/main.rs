//! scheduler-core binary: loads a pool-tree configuration, brings up the
//! node-shard pool and tree host, and serves the node heartbeat RPC (spec
//! §6, §4.8, §4.9).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tonic::transport::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

use scheduler_core::config::StrategyConfig;
use scheduler_core::grpc::{HeartbeatLimits, SchedulerService};
use scheduler_core::node_shard::pool::NodeShardPool;
use scheduler_core::node_shard::ShardConfig;
use scheduler_core::proto::scheduling_v1::node_heartbeat_service_server::NodeHeartbeatServiceServer;
use scheduler_core::tree_host::TreeHost;

/// Hierarchical fair-share scheduling engine.
#[derive(Debug, Parser)]
#[command(name = "scheduler-core", version, about)]
struct Args {
    /// Path to the pool-tree configuration YAML (spec §6 "Pool
    /// configuration").
    #[arg(long, default_value = "config/pool_trees.yaml")]
    config: PathBuf,

    /// Address the node heartbeat RPC listens on.
    #[arg(long, default_value = "127.0.0.1:7433")]
    listen: String,

    /// Number of node shards (spec §4.8 "Nodes are partitioned across
    /// shard_count shards").
    #[arg(long, default_value_t = 8)]
    shards: usize,

    /// Fair-share update period in milliseconds (spec §4.1 "Triggered on a
    /// fixed period (default O(seconds))").
    #[arg(long, default_value_t = 5000)]
    update_period_ms: u64,

    /// Per-shard hard concurrent-heartbeat limit (spec §4.8 step 5, §8
    /// scenario 5).
    #[arg(long, default_value_t = 64)]
    hard_concurrent_heartbeat_limit: usize,

    /// Per-shard soft concurrent-heartbeat limit.
    #[arg(long, default_value_t = 32)]
    soft_concurrent_heartbeat_limit: usize,

    /// Log level / `tracing_subscriber::EnvFilter` directive, overridden by
    /// `RUST_LOG` if set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt().with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level))).init();

    let mut strategy_config = StrategyConfig::new();
    if args.config.exists() {
        strategy_config.load_from_file(&args.config).with_context(|| format!("loading pool tree configuration from {}", args.config.display()))?;
    } else {
        tracing::warn!(path = %args.config.display(), "pool tree configuration file not found, starting with a single empty 'default' tree");
    }

    let tree_host = Arc::new(TreeHost::new());
    let trees: HashMap<String, _> = strategy_config.tree_ids().map(|id| (id.to_string(), strategy_config.tree(id).unwrap().clone())).collect();
    tree_host.load_config(&trees).await.context("loading pool trees into the tree host")?;

    let shard_config = ShardConfig::default();
    let shards = Arc::new(NodeShardPool::new(args.shards, shard_config, Duration::from_millis(200)));

    let update_period = Duration::from_millis(args.update_period_ms);
    let _updater_handle = tree_host.clone().spawn_periodic_updater(shards.clone(), update_period);

    let lease_sweeper = {
        let shards = shards.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(10));
            loop {
                ticker.tick().await;
                let offline = shards.expire_leases(std::time::Instant::now());
                if !offline.is_empty() {
                    info!(count = offline.len(), "nodes transitioned to offline on lease expiry");
                }
            }
        })
    };

    let service = SchedulerService::new(
        shards,
        tree_host,
        HeartbeatLimits {
            hard_concurrent_heartbeat_limit: args.hard_concurrent_heartbeat_limit,
            soft_concurrent_heartbeat_limit: args.soft_concurrent_heartbeat_limit,
        },
    );

    let addr = args.listen.parse().with_context(|| format!("invalid --listen address: {}", args.listen))?;
    info!(%addr, shards = args.shards, "scheduler-core listening");

    Server::builder()
        .add_service(NodeHeartbeatServiceServer::new(service))
        .serve_with_shutdown(addr, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("gRPC server error")?;

    lease_sweeper.abort();
    Ok(())
}
