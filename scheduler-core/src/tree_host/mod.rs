//! Tree host / multi-tree dispatcher (spec §4.9, §9 "Shared mutable
//! state").
//!
//! Holds the canonical map `tree_id -> Tree`. Each [`Tree`] pairs a
//! single-writer [`LiveTree`] (mutated only through the host, per spec §5
//! "a control thread ... owns master-side state for a tree or shard") with
//! a `tokio::sync::watch` channel publishing the latest immutable
//! [`TreeSnapshot`] (spec §4.1 step 6 "atomically swap the new snapshot
//! in"). Readers (node shards) clone the `Arc<TreeSnapshot>` out of the
//! watch channel and never block an in-progress update, matching the
//! "fork-join step, published atomically" model of spec §5.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex, RwLock};
use tracing::{info, warn};

use crate::config::{SchedulingTagFilter, TreeDefinition};
use crate::controller::OperationController;
use crate::element::{Element, OperationElement, PoolElement};
use crate::error::ConfigError;
use crate::fair_share::{self, UpdateReport};
use crate::resources::JobResources;
use crate::tree::{LiveTree, TreeSnapshot};

/// Supplies the denominator every element's ratios are computed against:
/// the combined capacity of every node matching a tree's filter (spec
/// §4.1 "dominant_limit", grounded in the original's
/// `Host->GetTotalResourceLimits()`). Implemented by whatever owns the
/// node registry — the node-shard pool in this engine — so `tree_host`
/// doesn't need to know about node shards at all.
pub trait ClusterResourceHost: Send + Sync {
    fn total_resource_limits(&self, filter: &SchedulingTagFilter) -> JobResources;
}

/// One pool tree: its live mutable structure plus the published snapshot
/// every node shard schedules against (spec §4.9, §9).
pub struct Tree {
    pub tree_id: String,
    pub nodes_filter: SchedulingTagFilter,
    live: Mutex<LiveTree>,
    snapshot_tx: watch::Sender<Arc<TreeSnapshot>>,
    snapshot_rx: watch::Receiver<Arc<TreeSnapshot>>,
}

impl Tree {
    fn new(tree_id: impl Into<String>, nodes_filter: SchedulingTagFilter) -> Self {
        let tree_id = tree_id.into();
        let live = LiveTree::new(tree_id.clone());
        let snapshot = live.snapshot().expect("freshly-created single-root tree has no cycles");
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(snapshot));
        Self {
            tree_id,
            nodes_filter,
            live: Mutex::new(live),
            snapshot_tx,
            snapshot_rx,
        }
    }

    /// Latest published snapshot; cheap, never blocks on an in-progress
    /// update (spec §3 Invariants "Tree snapshot used by a heartbeat is
    /// immutable for the duration of that heartbeat").
    pub fn snapshot(&self) -> Arc<TreeSnapshot> {
        self.snapshot_rx.borrow().clone()
    }

    /// A receiver that resolves the next time a new snapshot is published;
    /// lets a long-lived task wait for the update instead of polling.
    pub fn subscribe(&self) -> watch::Receiver<Arc<TreeSnapshot>> {
        self.snapshot_rx.clone()
    }

    /// Spec §4.1 full update (steps 1-5) plus step 6 (publish + copy
    /// persistent attributes back). Runs on whatever task the caller
    /// schedules it on (spec §5 "bounded fair-share update pool").
    pub async fn run_update(&self, total_resource_limits: &JobResources, now: Instant) -> UpdateReport {
        let mut live = self.live.lock().await;
        let mut snapshot = match live.snapshot() {
            Ok(s) => s,
            Err(err) => {
                // Spec §4.1 "Failure": a hard failure during clone aborts
                // the update and keeps the previous snapshot live.
                warn!(tree = %self.tree_id, %err, "fair-share update aborted: tree clone failed, previous snapshot stays live");
                return UpdateReport::default();
            }
        };
        let report = fair_share::update(&mut snapshot, total_resource_limits, now);
        for alert in &report.alerts {
            warn!(tree = %self.tree_id, %alert, "fair-share alert");
        }
        self.copy_persistent_back(&mut live, &snapshot);
        let _ = self.snapshot_tx.send(Arc::new(snapshot));
        info!(tree = %self.tree_id, size = live.len(), "fair-share update published");
        report
    }

    fn copy_persistent_back(&self, live: &mut LiveTree, snapshot: &TreeSnapshot) {
        for element in &snapshot.elements {
            if let Some(live_element) = live.get_mut(element.id()) {
                *live_element.persistent_mut() = element.persistent().clone();
            }
        }
    }

    pub async fn insert_pool(&self, pool: PoolElement) -> Result<(), ConfigError> {
        self.live.lock().await.insert_pool(pool)
    }

    pub async fn insert_operation(&self, operation: OperationElement) -> Result<(), ConfigError> {
        self.live.lock().await.insert_operation(operation)
    }

    /// `true` if an element with this id was present and removed (spec §3
    /// "Lifecycle ... removed on unregister").
    pub async fn remove(&self, id: &str) -> bool {
        self.live.lock().await.remove(id).is_some()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.live.lock().await.get(id).is_some()
    }
}

/// Routes node heartbeats and operation lifecycle events to the correct
/// tree(s) (spec §4.9). Tree add/remove always goes through here so a
/// heartbeat never observes a half-built tree.
#[derive(Default)]
pub struct TreeHost {
    trees: RwLock<HashMap<String, Arc<Tree>>>,
}

impl TreeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_tree(&self, tree_id: impl Into<String>, nodes_filter: SchedulingTagFilter) -> Arc<Tree> {
        let tree_id = tree_id.into();
        let tree = Arc::new(Tree::new(tree_id.clone(), nodes_filter));
        self.trees.write().await.insert(tree_id.clone(), tree.clone());
        info!(tree = %tree_id, "tree added to host");
        tree
    }

    pub async fn remove_tree(&self, tree_id: &str) {
        self.trees.write().await.remove(tree_id);
        info!(tree = %tree_id, "tree removed from host");
    }

    pub async fn tree(&self, tree_id: &str) -> Option<Arc<Tree>> {
        self.trees.read().await.get(tree_id).cloned()
    }

    pub async fn tree_ids(&self) -> Vec<String> {
        self.trees.read().await.keys().cloned().collect()
    }

    /// Trees whose `nodes_filter` matches a node's tags (spec §4.9 "On node
    /// updates it recomputes tree membership per node from tag filters").
    pub async fn trees_for_node(&self, tags: &[String]) -> Vec<Arc<Tree>> {
        self.trees.read().await.values().filter(|t| t.nodes_filter.matches(tags)).cloned().collect()
    }

    /// Load (or reload) trees from parsed configuration (spec §4.9 tree
    /// add/remove). Existing pools are left as-is — reconfiguring an
    /// already-loaded pool's attributes is persistent master state (spec
    /// §1, out of scope); only previously-unseen trees/pools are created.
    pub async fn load_config(&self, trees: &HashMap<String, TreeDefinition>) -> Result<(), ConfigError> {
        for (tree_id, def) in trees {
            let tree = match self.tree(tree_id).await {
                Some(t) => t,
                None => self.add_tree(tree_id.clone(), def.nodes_filter.clone()).await,
            };
            for pool_def in def.pools_in_dependency_order() {
                if tree.contains(&pool_def.id).await {
                    continue;
                }
                let parent = pool_def.common.parent.clone().unwrap_or_else(|| tree_id.clone());
                let mut pool = PoolElement::new(pool_def.id.clone(), parent);
                pool.common = pool_def.common.clone();
                pool.mode = pool_def.mode;
                pool.fifo_sort_parameters = pool_def.fifo_sort_parameters.clone();
                pool.max_operation_count = pool_def.max_operation_count;
                pool.max_running_operation_count = pool_def.max_running_operation_count;
                tree.insert_pool(pool).await?;
            }
        }
        Ok(())
    }

    /// Spec §6 "register_operation": attach a freshly-registered operation
    /// to every `(tree_id, pool_id)` pair from its `pool_trees` spec.
    pub async fn register_operation(
        &self,
        operation_id: impl Into<String> + Clone,
        pool_trees: &[(String, String)],
        controller: Arc<dyn OperationController>,
    ) -> Result<(), ConfigError> {
        let operation_id: String = operation_id.into();
        for (tree_id, pool_id) in pool_trees {
            match self.tree(tree_id).await {
                Some(tree) => {
                    let op = OperationElement::new(operation_id.clone(), pool_id.clone()).with_controller(controller.clone());
                    tree.insert_operation(op).await?;
                }
                None => warn!(tree = %tree_id, operation = %operation_id, "register_operation: unknown tree"),
            }
        }
        Ok(())
    }

    /// Spec §6 "unregister_operation": remove the operation from every
    /// tree it might be attached to.
    pub async fn unregister_operation(&self, operation_id: &str) {
        let trees: Vec<Arc<Tree>> = self.trees.read().await.values().cloned().collect();
        for tree in trees {
            tree.remove(operation_id).await;
        }
    }

    /// Runs one fair-share update pass across every tree (spec §5 "bounded
    /// fair-share update pool"). `host` supplies each tree's total
    /// resource-limits denominator.
    pub async fn run_update_pass(&self, host: &dyn ClusterResourceHost, now: Instant) {
        let trees: Vec<Arc<Tree>> = self.trees.read().await.values().cloned().collect();
        for tree in trees {
            let limits = host.total_resource_limits(&tree.nodes_filter);
            tree.run_update(&limits, now).await;
        }
    }

    /// Spawns the periodic update loop as its own tokio task (spec §4.1
    /// "Triggered on a fixed period", §5 "bounded fair-share update pool").
    /// The returned handle's task runs until the `TreeHost` (captured by
    /// `Arc`) and `host` are both dropped, or the process aborts.
    pub fn spawn_periodic_updater(
        self: Arc<Self>,
        host: Arc<dyn ClusterResourceHost>,
        period: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                self.run_update_pass(host.as_ref(), Instant::now()).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedHost(JobResources);
    impl ClusterResourceHost for FixedHost {
        fn total_resource_limits(&self, _filter: &SchedulingTagFilter) -> JobResources {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn add_tree_is_immediately_visible() {
        let host = TreeHost::new();
        host.add_tree("default", SchedulingTagFilter::default()).await;
        assert!(host.tree("default").await.is_some());
        assert!(host.tree("missing").await.is_none());
    }

    #[tokio::test]
    async fn trees_for_node_filters_by_tag() {
        let host = TreeHost::new();
        host.add_tree("default", SchedulingTagFilter::parse("")).await;
        host.add_tree("gpu", SchedulingTagFilter::parse("gpu")).await;

        let matched = host.trees_for_node(&["gpu".to_string()]).await;
        let ids: Vec<&str> = matched.iter().map(|t| t.tree_id.as_str()).collect();
        assert!(ids.contains(&"default"));
        assert!(ids.contains(&"gpu"));

        let matched = host.trees_for_node(&[]).await;
        let ids: Vec<&str> = matched.iter().map(|t| t.tree_id.as_str()).collect();
        assert!(ids.contains(&"default"));
        assert!(!ids.contains(&"gpu"));
    }

    #[tokio::test]
    async fn run_update_pass_publishes_a_new_snapshot() {
        let host = TreeHost::new();
        let tree = host.add_tree("default", SchedulingTagFilter::default()).await;
        let before = tree.snapshot();
        host.run_update_pass(&FixedHost(JobResources { cpu: 100, ..Default::default() }), Instant::now()).await;
        let after = tree.snapshot();
        // Different Arc allocation: the watch channel published a new value
        // even though this tree is empty (root-only).
        assert!(!Arc::ptr_eq(&before, &after));
    }

    #[tokio::test]
    async fn unregister_operation_removes_from_every_tree() {
        let host = TreeHost::new();
        let tree = host.add_tree("default", SchedulingTagFilter::default()).await;
        tree.insert_pool(PoolElement::new("p", "default")).await.unwrap();
        tree.insert_operation(OperationElement::new("op1", "p")).await.unwrap();
        assert!(tree.contains("op1").await);
        host.unregister_operation("op1").await;
        assert!(!tree.contains("op1").await);
    }
}
