//! The scheduling state machine (spec §4.2, §4.3, §4.4, §4.5): the
//! per-heartbeat descent of a [`TreeSnapshot`] that picks which jobs to
//! start and which to preempt.
//!
//! Dynamic attributes that only make sense *within* one heartbeat —
//! `active`, `satisfaction_ratio`, `best_leaf_descendant`, and the usage
//! ratio as it evolves while jobs are started mid-heartbeat — live in
//! [`SchedulingState`], computed fresh by [`SchedulingState::preschedule`]
//! rather than stored on the (shared, immutable-for-the-heartbeat)
//! snapshot. Everything [`SchedulingState`] reads from the snapshot
//! (`fair_share_ratio`, `adjusted_min_share_ratio`, `fifo_index`,
//! `dominant_resource`/`dominant_limit`) was fixed by the last fair-share
//! update and never changes during the heartbeat.

pub mod packing;

use std::time::Instant;

use tracing::debug;

use crate::controller::ScheduleJobOutcome;
use crate::element::attributes::DynamicAttributes;
use crate::element::pool::SchedulingMode;
use crate::element::Element;
use crate::job::{Job, OperationId, PreemptionReason};
use crate::resources::JobResources;
use crate::scheduling_context::{JobStartRequest, SchedulingContext};
use crate::tree::TreeSnapshot;
use packing::PackingTracker;

/// Computation precision for ratio comparisons (spec §4.1, reused here for
/// the `fair_share_ratio < eps` satisfaction short-circuit of §4.3).
const COMPUTATION_EPS: f64 = 1e-12;

/// Per-heartbeat mutable view over a [`TreeSnapshot`] (spec §4.3). Built
/// once per scheduling stage by [`SchedulingState::preschedule`] and
/// mutated incrementally as jobs start during that stage.
#[derive(Debug)]
pub struct SchedulingState {
    active: Vec<bool>,
    usage_ratio: Vec<f64>,
    satisfaction_ratio: Vec<f64>,
    best_leaf: Vec<Option<usize>>,
}

impl SchedulingState {
    /// Spec §4.2 "Preschedule the tree with starving_only = ...". Computes
    /// `active` bottom-up: a leaf (operation) is active if it is
    /// schedulable, has pending jobs, its tag filter (if any) matches the
    /// node, and — when `starving_only` — it is currently starving. A
    /// composite is active iff at least one child is.
    pub fn preschedule(snapshot: &TreeSnapshot, context: &SchedulingContext, starving_only: bool) -> Self {
        let n = snapshot.tree_size();
        let mut state = Self {
            active: vec![false; n],
            usage_ratio: vec![0.0; n],
            satisfaction_ratio: vec![f64::INFINITY; n],
            best_leaf: vec![None; n],
        };

        for idx in snapshot.post_order() {
            let attrs = &snapshot.attributes[idx];
            state.usage_ratio[idx] = attrs.usage_ratio;

            match &snapshot.elements[idx] {
                Element::Operation(op) => {
                    let tag_ok = match &op.common.scheduling_tag_filter {
                        Some(filter) => filter.matches(&context.node.tags),
                        None => true,
                    };
                    let starve_ok = !starving_only || op.persistent.starving;
                    let is_active = tag_ok && starve_ok && attrs.schedulable && attrs.pending_job_count > 0;
                    state.active[idx] = is_active;
                    state.satisfaction_ratio[idx] = satisfaction_ratio(attrs, state.usage_ratio[idx]);
                    state.best_leaf[idx] = if is_active { Some(idx) } else { None };
                }
                Element::Pool(pool) => {
                    let choice = best_active_child(snapshot, &state, &snapshot.children[idx], pool.mode);
                    state.apply_choice(idx, attrs, choice);
                }
                Element::Root(_) => {
                    let choice = best_active_child(snapshot, &state, &snapshot.children[idx], SchedulingMode::FairShare);
                    state.apply_choice(idx, attrs, choice);
                }
            }
        }

        state
    }

    fn apply_choice(&mut self, idx: usize, attrs: &DynamicAttributes, choice: Option<(usize, f64)>) {
        self.active[idx] = choice.is_some();
        self.best_leaf[idx] = choice.map(|(leaf, _)| leaf);
        self.satisfaction_ratio[idx] = choice.map(|(_, s)| s).unwrap_or_else(|| satisfaction_ratio(attrs, self.usage_ratio[idx]));
    }

    pub fn best_leaf_at_root(&self, snapshot: &TreeSnapshot) -> Option<usize> {
        self.best_leaf[snapshot.root_index]
    }

    /// Temporarily (for the remainder of this call to
    /// [`SchedulingState`]) mark `leaf` inactive and recompute its
    /// ancestors' choice of best child, without touching the snapshot.
    /// Used when a controller reports `NoPendingJobs`/failure for this
    /// round, or when packing rejects the candidate (spec §4.2 "no more
    /// operations with pending jobs").
    pub fn deactivate(&mut self, snapshot: &TreeSnapshot, leaf: usize) {
        self.active[leaf] = false;
        self.best_leaf[leaf] = None;
        self.satisfaction_ratio[leaf] = f64::INFINITY;
        self.recompute_ancestors(snapshot, leaf);
    }

    /// Spec §4.3 "after a successful job start the leaf's ancestors'
    /// satisfaction_ratio, usage_ratio, and best_leaf_descendant are
    /// updated incrementally by walking to the root".
    pub fn commit_job_start(&mut self, snapshot: &TreeSnapshot, leaf: usize, job: &Job) {
        self.bump_usage_ratio(snapshot, leaf, job);
        let attrs = &snapshot.attributes[leaf];
        self.satisfaction_ratio[leaf] = satisfaction_ratio(attrs, self.usage_ratio[leaf]);
        for ancestor in snapshot.ancestors(leaf) {
            self.bump_usage_ratio(snapshot, ancestor, job);
        }
        self.recompute_ancestors(snapshot, leaf);
    }

    fn bump_usage_ratio(&mut self, snapshot: &TreeSnapshot, idx: usize, job: &Job) {
        let attrs = &snapshot.attributes[idx];
        if attrs.dominant_limit > 0 {
            if let Some(kind) = &attrs.dominant_resource {
                self.usage_ratio[idx] += job.resource_usage.get(kind) as f64 / attrs.dominant_limit as f64;
            }
        }
    }

    fn recompute_ancestors(&mut self, snapshot: &TreeSnapshot, leaf: usize) {
        for ancestor in snapshot.ancestors(leaf) {
            let mode = match &snapshot.elements[ancestor] {
                Element::Pool(p) => p.mode,
                _ => SchedulingMode::FairShare,
            };
            let choice = best_active_child(snapshot, self, &snapshot.children[ancestor], mode);
            let attrs = &snapshot.attributes[ancestor];
            self.apply_choice(ancestor, attrs, choice);
        }
    }
}

/// Spec §4.3 satisfaction ratio formula.
fn satisfaction_ratio(attrs: &DynamicAttributes, usage_ratio: f64) -> f64 {
    if attrs.fifo_index >= 0 || attrs.fair_share_ratio < COMPUTATION_EPS {
        return f64::INFINITY;
    }
    if attrs.adjusted_min_share_ratio > COMPUTATION_EPS && usage_ratio < attrs.adjusted_min_share_ratio {
        usage_ratio / attrs.adjusted_min_share_ratio - 1.0
    } else {
        usage_ratio / attrs.fair_share_ratio
    }
}

/// Spec §4.3 (FairShare: lowest `satisfaction_ratio`) / §4.4 (FIFO:
/// lowest `fifo_index`). Returns the chosen child's own best leaf and
/// satisfaction ratio, or `None` if no child is active.
fn best_active_child(
    snapshot: &TreeSnapshot,
    state: &SchedulingState,
    children: &[usize],
    mode: SchedulingMode,
) -> Option<(usize, f64)> {
    match mode {
        SchedulingMode::FairShare => {
            let mut best: Option<(usize, f64)> = None;
            for &child in children {
                if !state.active[child] {
                    continue;
                }
                let Some(leaf) = state.best_leaf[child] else { continue };
                let key = state.satisfaction_ratio[child];
                if best.map_or(true, |(_, best_key)| key < best_key) {
                    best = Some((leaf, key));
                }
            }
            best
        }
        SchedulingMode::Fifo => {
            let mut chosen: Option<(usize, i32, f64)> = None;
            for &child in children {
                if !state.active[child] {
                    continue;
                }
                let Some(leaf) = state.best_leaf[child] else { continue };
                let fifo_index = snapshot.attributes[child].fifo_index;
                if chosen.map_or(true, |(_, best_idx, _)| fifo_index < best_idx) {
                    chosen = Some((leaf, fifo_index, state.satisfaction_ratio[child]));
                }
            }
            chosen.map(|(leaf, _, key)| (leaf, key))
        }
    }
}

/// Resources this leaf could still be handed, intersected between what the
/// node has free and what the operation's own fair-share-derived
/// resource_limits still allow (spec §4.2; ancestor pool caps are enforced
/// by the preemption sweep's overflow check rather than a hard admission
/// clamp here, since a pool's `resource_limits` is advisory quota, not a
/// hard per-node reservation — see DESIGN.md).
fn available_resources(snapshot: &TreeSnapshot, context: &SchedulingContext, leaf: usize) -> JobResources {
    let attrs = &snapshot.attributes[leaf];
    let op_headroom = attrs.resource_limits.saturating_sub(&attrs.resource_usage);
    context.free_resources().pointwise_min(&op_headroom)
}

/// Outcome of one `try_schedule_one` call.
pub enum ScheduleAttempt {
    Started(Job),
    Exhausted,
}

/// Attempt to fill exactly one scheduling slot, descending from the root
/// via cached `best_leaf_descendant`s and retrying when a controller
/// declines (spec §4.2 "invokes the operation controller"). Terminates
/// because every branch either returns a job or permanently deactivates a
/// leaf (monotonically shrinking the active set).
pub fn try_schedule_one(
    snapshot: &TreeSnapshot,
    state: &mut SchedulingState,
    context: &mut SchedulingContext,
    packing: &mut PackingTracker,
    ignore_packing: bool,
    packing_threshold: f64,
    bad_packing_ops: &mut std::collections::HashSet<OperationId>,
) -> ScheduleAttempt {
    loop {
        let Some(leaf) = state.best_leaf_at_root(snapshot) else {
            return ScheduleAttempt::Exhausted;
        };
        let Element::Operation(op) = &snapshot.elements[leaf] else {
            unreachable!("best_leaf_descendant always addresses an operation")
        };

        let available = available_resources(snapshot, context, leaf);
        if available.is_zero() {
            state.deactivate(snapshot, leaf);
            continue;
        }

        if !ignore_packing {
            let free_after = context.free_resources().saturating_sub(&available);
            if !packing.is_good_fit(&op.operation_id, &free_after, packing_threshold) {
                bad_packing_ops.insert(op.operation_id.clone());
                state.deactivate(snapshot, leaf);
                continue;
            }
        }

        match op.controller.schedule_job(context, &available) {
            ScheduleJobOutcome::Start {
                resource_limits,
                job_type,
                interruptible,
                interrupt_timeout_ms,
            } => {
                let job_id = context.generate_job_id(&op.operation_id);
                let request = JobStartRequest {
                    job_id,
                    resource_limits,
                    job_type,
                    interruptible,
                    interrupt_timeout_ms,
                };
                let job = context.start_job(op.operation_id.clone(), request, &snapshot.tree_id);
                state.commit_job_start(snapshot, leaf, &job);
                packing.record(&op.operation_id, context.free_resources());
                debug!(job = %job.id, operation = %op.operation_id, node = %context.node.node_id, "started job");
                return ScheduleAttempt::Started(job);
            }
            ScheduleJobOutcome::NoPendingJobs => {
                state.deactivate(snapshot, leaf);
            }
            ScheduleJobOutcome::Failed(reason) => {
                debug!(operation = %op.operation_id, %reason, "schedule_job failed, deactivating for this heartbeat");
                state.deactivate(snapshot, leaf);
            }
        }
    }
}

/// Stage N (spec §4.2 "non-preemptive"): loop starting jobs until the node
/// is full or the deadline passes.
pub fn run_non_preemptive_stage(
    snapshot: &TreeSnapshot,
    context: &mut SchedulingContext,
    packing: &mut PackingTracker,
    packing_threshold: f64,
    deadline: Instant,
) -> (Vec<Job>, std::collections::HashSet<OperationId>) {
    let mut state = SchedulingState::preschedule(snapshot, context, false);
    let mut started = Vec::new();
    let mut bad_packing = std::collections::HashSet::new();
    while context.can_start_more_jobs() && Instant::now() < deadline {
        match try_schedule_one(snapshot, &mut state, context, packing, false, packing_threshold, &mut bad_packing) {
            ScheduleAttempt::Started(job) => started.push(job),
            ScheduleAttempt::Exhausted => break,
        }
    }
    (started, bad_packing)
}

/// Stage P (spec §4.2 "preemptive"). `candidates` are the jobs the caller
/// has already determined are preemptible for this node (node/operation/
/// ancestor guards applied by [`crate::preemption`]); their usage is
/// discounted from the node's accounting before prescheduling so the
/// "what if we evicted these" view can admit a starving operation, then the
/// discount is reset regardless of outcome.
pub fn run_preemptive_stage(
    snapshot: &TreeSnapshot,
    context: &mut SchedulingContext,
    candidates: &[Job],
    packing: &mut PackingTracker,
    packing_threshold: f64,
) -> Option<Job> {
    let discount = candidates.iter().fold(JobResources::zero(), |acc, j| acc.add(&j.resource_usage));
    *context.resource_usage_discount_mut() = discount;

    let mut state = SchedulingState::preschedule(snapshot, context, true);
    let mut bad_packing = std::collections::HashSet::new();
    let result = match try_schedule_one(snapshot, &mut state, context, packing, false, packing_threshold, &mut bad_packing) {
        ScheduleAttempt::Started(job) => Some(job),
        ScheduleAttempt::Exhausted => None,
    };

    context.reset_discount();
    result
}

/// Stage F (spec §4.2 "packing fallback"): one attempt, ignoring packing
/// entirely, for operations Stage N rejected on packing grounds.
pub fn run_packing_fallback_stage(
    snapshot: &TreeSnapshot,
    context: &mut SchedulingContext,
    packing: &mut PackingTracker,
) -> Option<Job> {
    let mut state = SchedulingState::preschedule(snapshot, context, false);
    let mut bad_packing = std::collections::HashSet::new();
    match try_schedule_one(snapshot, &mut state, context, packing, true, 0.0, &mut bad_packing) {
        ScheduleAttempt::Started(job) => Some(job),
        ScheduleAttempt::Exhausted => None,
    }
}

/// Why a job's preemption was not attempted even though it otherwise
/// looked like a candidate (spec §4.7 "Starvation & preemption interlock").
pub fn guard_allows_preemption(
    snapshot: &TreeSnapshot,
    op_idx: usize,
    below_unpreemptible_floor: bool,
) -> Option<PreemptionReason> {
    if below_unpreemptible_floor {
        return None;
    }
    for ancestor in std::iter::once(op_idx).chain(snapshot.ancestors(op_idx)) {
        if snapshot.elements[ancestor].persistent().starving {
            return None;
        }
    }
    Some(PreemptionReason::OperationResourceOverflow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{AbortReason, JobSummary, OperationController};
    use crate::element::{OperationElement, PoolElement};
    use crate::scheduling_context::NodeDescriptor;
    use crate::tree::LiveTree;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Debug)]
    struct QueueController {
        pending: Mutex<Vec<JobResources>>,
    }

    impl QueueController {
        fn new(pending: Vec<JobResources>) -> Arc<Self> {
            Arc::new(Self {
                pending: Mutex::new(pending),
            })
        }
    }

    impl OperationController for QueueController {
        fn schedule_job(&self, _context: &SchedulingContext, available: &JobResources) -> ScheduleJobOutcome {
            let mut pending = self.pending.lock().unwrap();
            if let Some(pos) = pending.iter().position(|r| r.dominated_by(available)) {
                let r = pending.remove(pos);
                ScheduleJobOutcome::Start {
                    resource_limits: r,
                    job_type: "test".into(),
                    interruptible: false,
                    interrupt_timeout_ms: 0,
                }
            } else if pending.is_empty() {
                ScheduleJobOutcome::NoPendingJobs
            } else {
                ScheduleJobOutcome::Failed(crate::error::ScheduleJobFailureReason::ResourceOvercommit)
            }
        }
        fn abort_job(&self, _job_id: &crate::job::JobId, _reason: AbortReason) {}
        fn on_job_started(&self, _job: &Job) {}
        fn on_job_completed(&self, _summary: &JobSummary) {}
        fn on_job_failed(&self, _summary: &JobSummary) {}
        fn on_non_scheduled_job_aborted(&self, _job_id: &crate::job::JobId, _reason: AbortReason, _tree_id: &str, _epoch: u64) {}
        fn get_needed_resources(&self) -> JobResources {
            self.pending.lock().unwrap().iter().fold(JobResources::zero(), |acc, r| acc.add(r))
        }
        fn get_pending_job_count(&self) -> i64 {
            self.pending.lock().unwrap().len() as i64
        }
        fn get_min_needed_job_resources(&self) -> Vec<JobResources> {
            self.pending.lock().unwrap().clone()
        }
    }

    fn cpu(n: i64) -> JobResources {
        JobResources {
            cpu: n,
            ..Default::default()
        }
    }

    fn context(limit_cpu: i64) -> SchedulingContext {
        SchedulingContext::new(
            NodeDescriptor {
                node_id: "n1".into(),
                address: "n1.local".into(),
                tags: vec![],
                scheduling_segment: None,
            },
            cpu(limit_cpu),
            JobResources::zero(),
            Vec::new(),
        )
    }

    /// Spec §8 scenario 1, driven through the actual scheduling loop: two
    /// operations with weights 1:3, each demanding more than fits, on a
    /// 100-cpu node -> roughly a 25:75 job-count split once fair share
    /// settles (checked loosely here since packing/order introduce ties).
    #[test]
    fn non_preemptive_stage_starts_jobs_respecting_best_leaf_selection() {
        let mut tree = LiveTree::new("tree1");
        let mut pool = PoolElement::new("p", "tree1");
        pool.common.weight = 1.0;
        tree.insert_pool(pool).unwrap();

        let mut a = OperationElement::new("a", "p").with_controller(QueueController::new(vec![cpu(10); 2]));
        a.common.weight = 1.0;
        let mut b = OperationElement::new("b", "p").with_controller(QueueController::new(vec![cpu(10); 2]));
        b.common.weight = 3.0;
        tree.insert_operation(a).unwrap();
        tree.insert_operation(b).unwrap();

        let mut snapshot = tree.snapshot().unwrap();
        crate::fair_share::update(&mut snapshot, &cpu(100), Instant::now());

        let mut ctx = context(100);
        let mut packing = PackingTracker::new();
        let (started, bad_packing) =
            run_non_preemptive_stage(&snapshot, &mut ctx, &mut packing, 0.5, Instant::now() + Duration::from_secs(5));
        assert_eq!(started.len(), 4, "both operations' queues should drain");
        assert!(bad_packing.is_empty());
    }

    #[test]
    fn exhausted_operation_yields_to_sibling() {
        let mut tree = LiveTree::new("tree1");
        let pool = PoolElement::new("p", "tree1");
        tree.insert_pool(pool).unwrap();
        tree.insert_operation(OperationElement::new("a", "p").with_controller(QueueController::new(vec![])))
            .unwrap();
        tree.insert_operation(OperationElement::new("b", "p").with_controller(QueueController::new(vec![cpu(5)])))
            .unwrap();

        let mut snapshot = tree.snapshot().unwrap();
        crate::fair_share::update(&mut snapshot, &cpu(100), Instant::now());

        let mut ctx = context(100);
        let mut packing = PackingTracker::new();
        let (started, _) = run_non_preemptive_stage(&snapshot, &mut ctx, &mut packing, 0.5, Instant::now() + Duration::from_secs(5));
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].operation_id, "b");
    }

    #[test]
    fn preemptive_stage_discounts_candidates_then_resets() {
        let mut tree = LiveTree::new("tree1");
        let pool = PoolElement::new("p", "tree1");
        tree.insert_pool(pool).unwrap();
        tree.insert_operation(OperationElement::new("a", "p").with_controller(QueueController::new(vec![cpu(5)])))
            .unwrap();

        let mut snapshot = tree.snapshot().unwrap();
        crate::fair_share::update(&mut snapshot, &cpu(10), Instant::now());
        // make the operation starving so starving_only preschedule admits it
        let a_idx = snapshot.index_of("a").unwrap();
        if let Element::Operation(op) = &mut snapshot.elements[a_idx] {
            op.persistent.starving = true;
        }

        let victim = Job::new("victim".into(), "other".into(), "tree1", "n1".into(), cpu(8), cpu(8));
        let mut ctx = SchedulingContext::new(
            NodeDescriptor {
                node_id: "n1".into(),
                address: "n1.local".into(),
                tags: vec![],
                scheduling_segment: None,
            },
            cpu(10),
            cpu(8),
            vec![victim.clone()],
        );

        let mut packing = PackingTracker::new();
        let result = run_preemptive_stage(&snapshot, &mut ctx, std::slice::from_ref(&victim), &mut packing, 0.5);
        assert!(result.is_some());
        assert!(ctx.resource_usage_discount().is_zero(), "discount must be reset after the attempt");
    }
}
