//! Bounded node-shard pool (spec §4.8, §5 "a bounded node-shard pool
//! (~`shard_count` shards) handles heartbeats in parallel across shards;
//! each shard is single-threaded internally").
//!
//! Each shard's [`NodeShard`] is mutated only while its `std::sync::Mutex`
//! is held and `process_heartbeat` never awaits while holding it, so the
//! lock stands in for the "single-threaded invoker" the spec describes
//! without needing a dedicated OS thread per shard: shards still make
//! progress concurrently because they are independent mutexes, while a
//! single shard's nodes stay totally ordered (spec §5 "Within a node
//! shard, events for one node are totally ordered").

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::SchedulingTagFilter;
use crate::controller::OperationController;
use crate::job::{NodeId, OperationId};
use crate::resources::JobResources;
use crate::tree_host::{ClusterResourceHost, Tree};

use super::{HeartbeatInput, HeartbeatOutput, NodeShard, ShardConfig};

/// One shard's mutable state plus the bookkeeping the pool needs to decide
/// throttling without reaching inside the shard (spec §4.8 step 5).
struct ShardSlot {
    shard: Mutex<NodeShard>,
    in_flight: AtomicUsize,
    last_seen: Mutex<HashMap<NodeId, Instant>>,
}

/// Partitions exec nodes across `shard_count` [`NodeShard`]s by a hash of
/// node id (spec §4.8 "Nodes are partitioned across shard_count shards by
/// a hash of node id").
pub struct NodeShardPool {
    shards: Vec<Arc<ShardSlot>>,
    soft_backoff: Duration,
}

impl NodeShardPool {
    pub fn new(shard_count: usize, config: ShardConfig, soft_backoff: Duration) -> Self {
        assert!(shard_count > 0, "a node-shard pool needs at least one shard");
        let shards = (0..shard_count)
            .map(|i| {
                Arc::new(ShardSlot {
                    shard: Mutex::new(NodeShard::new(i, config.clone())),
                    in_flight: AtomicUsize::new(0),
                    last_seen: Mutex::new(HashMap::new()),
                })
            })
            .collect();
        Self { shards, soft_backoff }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard_index(&self, node_id: &NodeId) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        node_id.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }

    /// Register an operation's controller on every shard: a shard only
    /// learns about an operation once one of its nodes is handed a job for
    /// it, but the controller handle must be available up front (spec §4.8
    /// "`operation_id -> OperationState`").
    pub fn register_operation(&self, operation_id: OperationId, controller: Arc<dyn OperationController>) {
        for slot in &self.shards {
            slot.shard.lock().unwrap().register_operation(operation_id.clone(), controller.clone());
        }
    }

    pub fn unregister_operation(&self, operation_id: &str) {
        for slot in &self.shards {
            slot.shard.lock().unwrap().unregister_operation(operation_id);
        }
    }

    /// Sweep every shard for leases that expired without a renewing
    /// heartbeat (spec §5 "Node registration lease ... expiry transitions
    /// the node to Offline").
    pub fn expire_leases(&self, now: Instant) -> Vec<NodeId> {
        let mut offline = Vec::new();
        for slot in &self.shards {
            offline.extend(slot.shard.lock().unwrap().expire_leases(now));
        }
        offline
    }

    /// Spec §4.8 steps 2-7: resolve `input.node_id` to its shard, decide
    /// throttling from that shard's in-flight counter and this node's
    /// last-seen time (step 5), then run the full heartbeat pipeline.
    pub fn process_heartbeat(&self, input: HeartbeatInput, trees: &[Arc<Tree>], total_limits_by_tree: &HashMap<String, JobResources>, hard_limit: usize, soft_limit: usize, now: Instant) -> HeartbeatOutput {
        let idx = self.shard_index(&input.node_id);
        let slot = &self.shards[idx];

        let in_flight = slot.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let throttled = if in_flight > hard_limit {
            true
        } else if in_flight > soft_limit {
            let mut last_seen = slot.last_seen.lock().unwrap();
            let recently_seen = last_seen.get(&input.node_id).is_some_and(|t| now.duration_since(*t) < self.soft_backoff);
            last_seen.insert(input.node_id.clone(), now);
            recently_seen
        } else {
            slot.last_seen.lock().unwrap().insert(input.node_id.clone(), now);
            false
        };

        if throttled {
            debug!(node = %input.node_id, shard = idx, in_flight, "heartbeat scheduling throttled");
        }

        let output = slot.shard.lock().unwrap().process_heartbeat(input, trees, total_limits_by_tree, throttled, now);
        slot.in_flight.fetch_sub(1, Ordering::SeqCst);
        output
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.shards.iter().flat_map(|slot| slot.shard.lock().unwrap().node_ids().cloned().collect::<Vec<_>>()).collect()
    }

    /// All jobs currently known across every shard, keyed by id; used by
    /// graceful-shutdown and introspection paths outside this crate's
    /// scope, but handy for tests.
    #[cfg(test)]
    fn shard_for_test(&self, node_id: &NodeId) -> usize {
        self.shard_index(node_id)
    }
}

impl ClusterResourceHost for NodeShardPool {
    /// Spec §4.1 "dominant_limit ... the combined capacity of every node
    /// matching a tree's filter": summed across every shard's nodes.
    fn total_resource_limits(&self, filter: &SchedulingTagFilter) -> JobResources {
        self.shards.iter().fold(JobResources::zero(), |acc, slot| acc.add(&slot.shard.lock().unwrap().total_resource_limits(filter)))
    }
}
