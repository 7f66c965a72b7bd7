//! Node shard (spec §4.8): partitions exec nodes by id, serializes
//! heartbeat processing for its nodes, and drives the scheduling state
//! machine (§4.2) against the tree host's published snapshots.
//!
//! A shard's job registry only ever holds jobs running on its own nodes,
//! so the per-operation [`PreemptibleJobTracker`] it maintains (spec §4.6)
//! reflects that shard's view of the operation, not the operation's full
//! cluster-wide job set — an operation whose jobs land across several
//! shards gets several independent, consistent-within-themselves trackers
//! rather than one globally synchronized one. This mirrors spec §9
//! "Shared mutable state: conflict is acceptable because counters are
//! monotone within a commit" and §5's tolerance for eventually-consistent
//! cross-shard resource-usage counters; see `DESIGN.md`.

pub mod exec_node;
pub mod pool;
pub mod reconcile;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::SchedulingTagFilter;
use crate::controller::{AbortReason, OperationController};
use crate::element::Element;
use crate::job::{Job, JobId, JobState, NodeId, OperationId, PreemptionReason};
use crate::preemption::planner::{self, PreemptionCandidate};
use crate::preemption::PreemptibleJobTracker;
use crate::resources::JobResources;
use crate::scheduling::packing::PackingTracker;
use crate::scheduling::{self};
use crate::scheduling_context::{NodeDescriptor, SchedulingContext};
use crate::tree::TreeSnapshot;
use crate::tree_host::Tree;
use exec_node::ExecNode;
use reconcile::{JobTimers, ReconcileOutcome, ReportedJobStatus};

/// Tunables for one shard's heartbeat pipeline (spec §4.8, §5 "Timeouts &
/// cancellation").
#[derive(Debug, Clone)]
pub struct ShardConfig {
    pub registration_lease: Duration,
    pub heartbeat_lease: Duration,
    pub unconfirmed_job_timeout: Duration,
    pub finished_job_ttl: Duration,
    pub job_revival_abort_timeout: Duration,
    pub preemptive_scheduling_backoff: Duration,
    pub non_preemptive_deadline: Duration,
    pub preemptive_deadline: Duration,
    pub packing_threshold: f64,
    /// Spec §4.6 thresholds, `aggressive < preemption`.
    pub aggressive_preemption_threshold: f64,
    pub preemption_threshold: f64,
    pub hard_concurrent_heartbeat_limit: usize,
    pub soft_concurrent_heartbeat_limit: usize,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            registration_lease: Duration::from_secs(300),
            heartbeat_lease: Duration::from_secs(30),
            unconfirmed_job_timeout: Duration::from_secs(60),
            finished_job_ttl: Duration::from_secs(60),
            job_revival_abort_timeout: Duration::from_secs(600),
            preemptive_scheduling_backoff: Duration::from_secs(5),
            non_preemptive_deadline: Duration::from_millis(500),
            preemptive_deadline: Duration::from_millis(300),
            packing_threshold: 0.5,
            aggressive_preemption_threshold: 1.0,
            preemption_threshold: 1.2,
            hard_concurrent_heartbeat_limit: 64,
            soft_concurrent_heartbeat_limit: 32,
        }
    }
}

/// Per-operation state a shard keeps for the operations it has jobs for
/// (spec §4.8 "`operation_id -> OperationState{controller, jobs_map,
/// forbid_new_jobs, jobs_ready, controller_epoch, shard_epoch}`").
pub struct OperationState {
    pub controller: Arc<dyn OperationController>,
    pub tracker: PreemptibleJobTracker,
    pub forbid_new_jobs: bool,
    pub controller_epoch: u64,
    pub shard_epoch: u64,
}

impl OperationState {
    fn new(controller: Arc<dyn OperationController>) -> Self {
        Self {
            controller,
            tracker: PreemptibleJobTracker::new(),
            forbid_new_jobs: false,
            controller_epoch: 0,
            shard_epoch: 0,
        }
    }
}

/// One node's heartbeat request, decoupled from the wire `HeartbeatRequest`
/// proto (spec §6) so the shard pipeline is unit-testable without tonic.
#[derive(Debug, Clone)]
pub struct HeartbeatInput {
    pub node_id: NodeId,
    pub address: String,
    pub tags: Vec<String>,
    pub scheduling_segment: Option<String>,
    pub resource_limits: JobResources,
    pub resource_usage: JobResources,
    pub disk_resources: JobResources,
    pub jobs: Vec<ReportedJobStatus>,
    pub unconfirmed_jobs: Vec<JobId>,
}

#[derive(Debug, Clone)]
pub struct JobStartDescriptor {
    pub job_id: JobId,
    pub operation_id: OperationId,
    pub resource_limits: JobResources,
}

#[derive(Debug, Clone)]
pub struct JobAbortDescriptor {
    pub job_id: JobId,
    pub abort_reason: Option<String>,
    pub preemption_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct JobInterruptDescriptor {
    pub job_id: JobId,
    pub timeout_ms: u64,
    pub preemption_reason: Option<String>,
}

/// One node's heartbeat response, decoupled from the wire
/// `HeartbeatResponse` proto (spec §6).
#[derive(Debug, Clone, Default)]
pub struct HeartbeatOutput {
    pub jobs_to_start: Vec<JobStartDescriptor>,
    pub jobs_to_abort: Vec<JobAbortDescriptor>,
    pub jobs_to_remove: Vec<JobId>,
    pub jobs_to_interrupt: Vec<JobInterruptDescriptor>,
    pub jobs_to_confirm: Vec<JobId>,
    pub jobs_to_store: Vec<JobId>,
    pub jobs_to_fail: Vec<JobId>,
    pub scheduling_skipped: bool,
}

/// A partition of exec nodes with a single logical invoker (spec §4.8,
/// §5). All state updates for this shard's nodes and jobs flow through
/// `process_heartbeat`.
pub struct NodeShard {
    pub shard_index: usize,
    config: ShardConfig,
    nodes: HashMap<NodeId, ExecNode>,
    operations: HashMap<OperationId, OperationState>,
    jobs: HashMap<JobId, Job>,
    timers: HashMap<JobId, JobTimers>,
    last_preemptive_time: HashMap<NodeId, Instant>,
    packing: PackingTracker,
}

impl NodeShard {
    pub fn new(shard_index: usize, config: ShardConfig) -> Self {
        Self {
            shard_index,
            config,
            nodes: HashMap::new(),
            operations: HashMap::new(),
            jobs: HashMap::new(),
            timers: HashMap::new(),
            last_preemptive_time: HashMap::new(),
            packing: PackingTracker::new(),
        }
    }

    pub fn register_operation(&mut self, operation_id: OperationId, controller: Arc<dyn OperationController>) {
        self.operations.entry(operation_id).or_insert_with(|| OperationState::new(controller));
    }

    pub fn unregister_operation(&mut self, operation_id: &str) {
        self.operations.remove(operation_id);
        self.jobs.retain(|_, job| job.operation_id != operation_id);
    }

    /// Spec §4.1 "the combined capacity of every node matching this tree's
    /// filter", restricted to this shard's nodes; the pool combines every
    /// shard's contribution (see [`crate::node_shard::pool::NodeShardPool`]
    /// `ClusterResourceHost` impl).
    pub fn total_resource_limits(&self, filter: &SchedulingTagFilter) -> JobResources {
        self.nodes
            .values()
            .filter(|n| !n.offline && filter.matches(&n.tags))
            .fold(JobResources::zero(), |acc, n| acc.add(&n.resource_limits))
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }

    /// Sweep for leases that expired without a heartbeat renewing them
    /// (spec §5 "expiry transitions the node to Offline ... and aborts its
    /// jobs"). Returns the newly-offline node ids so the caller can notify
    /// controllers.
    pub fn expire_leases(&mut self, now: Instant) -> Vec<NodeId> {
        let mut newly_offline = Vec::new();
        for (id, node) in self.nodes.iter_mut() {
            if !node.offline && !node.ongoing_heartbeat && node.leases_expired(now) {
                node.offline = true;
                newly_offline.push(id.clone());
            }
        }
        for id in &newly_offline {
            self.abort_all_jobs_at_node(id, AbortReason::NodeOffline);
        }
        newly_offline
    }

    fn abort_all_jobs_at_node(&mut self, node_id: &NodeId, reason: AbortReason) -> Vec<JobId> {
        let victims: Vec<JobId> = self
            .jobs
            .values()
            .filter(|j| &j.node == node_id && matches!(j.state, JobState::Scheduled | JobState::Waiting | JobState::Running))
            .map(|j| j.id.clone())
            .collect();
        for job_id in &victims {
            if let Some(job) = self.jobs.remove(job_id) {
                if let Some(op) = self.operations.get_mut(&job.operation_id) {
                    op.tracker.on_job_finished(&job);
                    op.controller.abort_job(&job.id, reason.clone());
                }
            }
        }
        victims
    }

    /// Spec §4.8 full per-heartbeat pipeline (steps 1-7). `trees` are the
    /// tree snapshots whose `nodes_filter` already matched this node (spec
    /// §4.8 step 6); `total_limits_by_tree` gives each tree's cluster-wide
    /// capacity denominator for the preemptible-list rebalance (spec
    /// §4.6). `throttled` is decided by the caller from shard-wide
    /// concurrency counters (spec §4.8 step 5, §8 scenario 5) since that
    /// bookkeeping spans every node in the shard, not just this one.
    #[allow(clippy::too_many_arguments)]
    pub fn process_heartbeat(
        &mut self,
        input: HeartbeatInput,
        trees: &[Arc<Tree>],
        total_limits_by_tree: &HashMap<String, JobResources>,
        throttled: bool,
        now: Instant,
    ) -> HeartbeatOutput {
        let mut output = HeartbeatOutput::default();
        let node_id = input.node_id.clone();

        let node = self.nodes.entry(node_id.clone()).or_insert_with(|| {
            info!(node = %node_id, "registering previously unseen node");
            ExecNode::register(
                node_id.clone(),
                input.address.clone(),
                input.tags.clone(),
                input.scheduling_segment.clone(),
                now,
                self.config.registration_lease,
                self.config.heartbeat_lease,
            )
        });

        if node.ongoing_heartbeat {
            warn!(node = %node_id, "heartbeat already in flight for this node, refusing");
            return HeartbeatOutput { scheduling_skipped: true, ..Default::default() };
        }
        node.ongoing_heartbeat = true;
        node.renew_leases(now, self.config.registration_lease, self.config.heartbeat_lease);
        node.tags = input.tags.clone();
        node.scheduling_segment = input.scheduling_segment.clone();
        node.resource_limits = input.resource_limits.clone();
        node.resource_usage = input.resource_usage.clone();
        node.disk_resources = input.disk_resources.clone();
        let no_user_slots = node.has_no_user_slots();

        if no_user_slots {
            debug!(node = %node_id, "user slots dropped to zero, aborting all jobs at node");
            for job_id in self.abort_all_jobs_at_node(&node_id, AbortReason::Other("user slots exhausted".into())) {
                output.jobs_to_abort.push(JobAbortDescriptor {
                    job_id,
                    abort_reason: Some("node has zero user slots".into()),
                    preemption_reason: None,
                });
            }
        }

        let outcome = reconcile::reconcile(
            &node_id,
            &input.jobs,
            &input.unconfirmed_jobs,
            &mut self.jobs,
            &mut self.timers,
            now,
            self.config.unconfirmed_job_timeout,
            self.config.finished_job_ttl,
            self.config.job_revival_abort_timeout,
        );
        self.apply_reconcile_outcome(outcome, &mut output);

        if throttled {
            output.scheduling_skipped = true;
            if let Some(node) = self.nodes.get_mut(&node_id) {
                node.ongoing_heartbeat = false;
            }
            return output;
        }

        self.run_scheduling(&node_id, &input, trees, total_limits_by_tree, now, &mut output);

        if let Some(node) = self.nodes.get_mut(&node_id) {
            node.ongoing_heartbeat = false;
        }
        output
    }

    fn apply_reconcile_outcome(&mut self, outcome: ReconcileOutcome, output: &mut HeartbeatOutput) {
        output.jobs_to_confirm.extend(outcome.confirmed.iter().cloned());

        for job_id in &outcome.newly_finished {
            if let Some(job) = self.jobs.get(job_id) {
                if let Some(op) = self.operations.get_mut(&job.operation_id) {
                    op.tracker.on_job_finished(job);
                    op.controller.on_job_completed(&crate::controller::JobSummary {
                        job_id: job.id.clone(),
                        resource_usage: job.resource_usage.clone(),
                        controller_epoch: job.controller_epoch,
                    });
                }
            }
        }

        for job_id in outcome.vanished.into_iter().chain(outcome.abort_unconfirmed) {
            if let Some(job) = self.jobs.remove(&job_id) {
                if let Some(op) = self.operations.get_mut(&job.operation_id) {
                    op.tracker.on_job_finished(&job);
                    op.controller.on_non_scheduled_job_aborted(&job.id, AbortReason::JobVanished, &job.tree_id, job.controller_epoch);
                }
                output.jobs_to_abort.push(JobAbortDescriptor {
                    job_id,
                    abort_reason: Some("job unconfirmed past timeout".into()),
                    preemption_reason: None,
                });
            }
        }

        for job_id in outcome.release {
            self.jobs.remove(&job_id);
            self.timers.remove(&job_id);
            output.jobs_to_remove.push(job_id);
        }
    }

    fn running_jobs_at_node(&self, node_id: &NodeId) -> Vec<Job> {
        self.jobs
            .values()
            .filter(|j| &j.node == node_id && matches!(j.state, JobState::Scheduled | JobState::Waiting | JobState::Running))
            .cloned()
            .collect()
    }

    fn run_scheduling(
        &mut self,
        node_id: &NodeId,
        input: &HeartbeatInput,
        trees: &[Arc<Tree>],
        total_limits_by_tree: &HashMap<String, JobResources>,
        now: Instant,
        output: &mut HeartbeatOutput,
    ) {
        let running = self.running_jobs_at_node(node_id);
        let mut context = SchedulingContext::new(
            NodeDescriptor {
                node_id: node_id.clone(),
                address: input.address.clone(),
                tags: input.tags.clone(),
                scheduling_segment: input.scheduling_segment.clone(),
            },
            input.resource_limits.clone(),
            input.resource_usage.clone(),
            running,
        );

        for tree in trees {
            let snapshot = tree.snapshot();

            // Stage N (spec §4.2).
            let deadline_n = now + self.config.non_preemptive_deadline;
            let (_, bad_packing) = scheduling::run_non_preemptive_stage(&snapshot, &mut context, &mut self.packing, self.config.packing_threshold, deadline_n);

            // Stage P, throttled per node (spec §4.2, §4.8).
            let can_run_preemptive = self
                .last_preemptive_time
                .get(node_id)
                .map_or(true, |last| now.duration_since(*last) >= self.config.preemptive_scheduling_backoff);
            if can_run_preemptive {
                self.last_preemptive_time.insert(node_id.clone(), now);
                let candidates = self.collect_preemption_candidates(&snapshot);
                scheduling::run_preemptive_stage(&snapshot, &mut context, &candidates, &mut self.packing, self.config.packing_threshold);
            }

            // Stage F: packing fallback, only if Stage N started nothing
            // and rejected at least one operation on packing grounds.
            if context.started_jobs().is_empty() && !bad_packing.is_empty() {
                scheduling::run_packing_fallback_stage(&snapshot, &mut context, &mut self.packing);
            }

            // Preemption sweep (spec §4.2 "runs regardless of whether a
            // job started").
            let sweep_candidates = self.build_sweep_candidates(&snapshot, &context);
            planner::run_sweep(&mut context, &context.resource_limits.clone(), sweep_candidates);

            if let Some(total_limits) = total_limits_by_tree.get(&tree.tree_id) {
                self.rebalance_touched_operations(&snapshot, total_limits);
            }
        }

        for job in context.started_jobs() {
            self.jobs.insert(job.id.clone(), job.clone());
            if let Some(op) = self.operations.get_mut(&job.operation_id) {
                let mut started = job.clone();
                op.tracker.on_job_started(&mut started);
                self.jobs.insert(started.id.clone(), started);
                op.controller.on_job_started(job);
            }
            output.jobs_to_start.push(JobStartDescriptor {
                job_id: job.id.clone(),
                operation_id: job.operation_id.clone(),
                resource_limits: job.resource_limits.clone(),
            });
        }

        for job in context.preempted_jobs() {
            if let Some(entry) = self.jobs.get_mut(&job.id) {
                entry.preempted = true;
                entry.preemption_reason = job.preemption_reason.clone();
            }
            let reason = job.preemption_reason.as_ref().map(PreemptionReason::to_string);
            if job.interruptible && job.interrupt_timeout_ms > 0 {
                output.jobs_to_interrupt.push(JobInterruptDescriptor {
                    job_id: job.id.clone(),
                    timeout_ms: job.interrupt_timeout_ms,
                    preemption_reason: reason,
                });
            } else {
                output.jobs_to_abort.push(JobAbortDescriptor { job_id: job.id.clone(), abort_reason: None, preemption_reason: reason });
            }
        }
    }

    /// Spec §4.2 Stage P candidates: running jobs at this node whose
    /// operation's preemptible tracker and starvation guards (spec §4.6,
    /// §4.7) allow preemption.
    fn collect_preemption_candidates(&self, snapshot: &TreeSnapshot) -> Vec<Job> {
        self.jobs
            .values()
            .filter(|job| job.state == JobState::Running)
            .filter(|job| self.job_is_preemption_eligible(job, snapshot))
            .cloned()
            .collect()
    }

    fn job_is_preemption_eligible(&self, job: &Job, snapshot: &TreeSnapshot) -> bool {
        let Some(op_state) = self.operations.get(&job.operation_id) else { return false };
        if !op_state.tracker.aggressively_preemptible().any(|id| id == &job.id) && !op_state.tracker.preemptible().any(|id| id == &job.id) {
            return false;
        }
        let Some(op_idx) = snapshot.index_of(&job.operation_id) else { return false };
        let below_floor = match &snapshot.elements[op_idx] {
            Element::Operation(op) => op.below_unpreemptible_floor(),
            _ => false,
        };
        scheduling::guard_allows_preemption(snapshot, op_idx, below_floor).is_some()
    }

    /// Build the richer [`PreemptionCandidate`] list the sweep (spec §4.2
    /// "Preemption phase") needs: every running job at this node that
    /// [`Self::job_is_preemption_eligible`] (spec §4.6/§4.7 tracker
    /// membership, unpreemptible floor, ancestor-starvation guard) admits,
    /// with its operation's and ancestor pools' current usage/limits so the
    /// sweep can tell node-overflow from operation/pool-overflow.
    fn build_sweep_candidates<'a>(&'a self, snapshot: &TreeSnapshot, context: &SchedulingContext) -> Vec<PreemptionCandidate<'a>> {
        context
            .running_jobs()
            .iter()
            .filter(|job| self.job_is_preemption_eligible(job, snapshot))
            .filter_map(|job| {
                let op_idx = snapshot.index_of(&job.operation_id)?;
                let op_attrs = &snapshot.attributes[op_idx];
                let mut pool_ancestors = Vec::new();
                for ancestor in snapshot.ancestors(op_idx) {
                    let attrs = &snapshot.attributes[ancestor];
                    if !attrs.resource_limits.is_zero() {
                        pool_ancestors.push((snapshot.elements[ancestor].id().to_string(), attrs.resource_usage.clone(), attrs.resource_limits.clone()));
                    }
                }
                let original = self.jobs.get(&job.id)?;
                Some(PreemptionCandidate {
                    job: original,
                    operation_usage: op_attrs.resource_usage.clone(),
                    operation_limits: op_attrs.resource_limits.clone(),
                    pool_ancestors,
                })
            })
            .collect()
    }

    /// Spec §4.6 "After every usage change ... run
    /// update_preemptible_lists": rebalance every operation this heartbeat
    /// touched (started or finished a job for).
    fn rebalance_touched_operations(&mut self, snapshot: &TreeSnapshot, total_limits: &JobResources) {
        let op_ids: Vec<OperationId> = self.operations.keys().cloned().collect();
        for op_id in op_ids {
            let Some(op_idx) = snapshot.index_of(&op_id) else { continue };
            let fair_share_ratio = snapshot.attributes[op_idx].fair_share_ratio;
            let jobs_for_op: HashMap<JobId, Job> = self.jobs.iter().filter(|(_, j)| j.operation_id == op_id).map(|(k, v)| (k.clone(), v.clone())).collect();
            if jobs_for_op.is_empty() {
                continue;
            }
            let Some(op_state) = self.operations.get_mut(&op_id) else { continue };
            op_state.tracker.update(&jobs_for_op, fair_share_ratio, total_limits, self.config.aggressive_preemption_threshold, self.config.preemption_threshold);
            let mut classified = jobs_for_op;
            op_state.tracker.apply_classification(&mut classified);
            for (id, job) in classified {
                if let Some(entry) = self.jobs.get_mut(&id) {
                    entry.list_kind = job.list_kind;
                }
            }
        }
    }
}
