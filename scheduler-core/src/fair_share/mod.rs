//! Two-pass fair-share update over a cloned tree snapshot (spec §4.1).
//!
//! [`update`] runs the four steps the spec numbers 2-5 (step 1, the clone
//! itself, is [`crate::tree::LiveTree::snapshot`]): pre-update, bottom-up,
//! top-down, starvation check. The caller (the tree host, spec §4.9) is
//! responsible for step 6: publishing the resulting snapshot and copying
//! persistent attributes back onto the live tree.
//!
//! `active` / `satisfaction_ratio` / `best_leaf_descendant` are
//! deliberately **not** set here. In the original engine they are recomputed
//! on every `PrescheduleJob` call — once per heartbeat, not once per
//! fair-share-update period — because they depend on the current best
//! *active* child, which can change between updates as operations run out
//! of demand. This engine keeps that split: [`crate::scheduling::preschedule`]
//! computes them fresh at the start of every heartbeat's non-preemptive and
//! preemptive stages.

pub mod fit_factor;
pub mod invariants;
pub mod starvation;

use std::time::Instant;

use tracing::{debug, warn};

use crate::element::pool::{FifoSortParameter, SchedulingMode};
use crate::element::Element;
use crate::error::FairShareAlert;
use crate::resources::JobResources;
use crate::tree::TreeSnapshot;
use fit_factor::{compute_by_fitting, FitBounds};

/// Computation precision the spec calls out for the binary search and for
/// deciding whether min-share sums overflow their parent (spec §4.1).
const COMPUTATION_EPS: f64 = 1e-12;
/// Comparison precision for ratio comparisons (spec §4.1 "sqrt(ε) ≈ 1e-6").
const COMPARISON_EPS: f64 = 1e-6;

#[derive(Debug, Default)]
pub struct UpdateReport {
    pub alerts: Vec<FairShareAlert>,
}

/// Run the full update (spec §4.1 steps 2-5) over `snapshot` in place.
/// `total_resource_limits` is the combined capacity of every node matching
/// this tree's filter — the fixed denominator every element's ratios are
/// computed against (spec §4.1 "dominant_limit", grounded in the original's
/// `Host->GetTotalResourceLimits()`, shared by every element in the tree).
pub fn update(snapshot: &mut TreeSnapshot, total_resource_limits: &JobResources, now: Instant) -> UpdateReport {
    let mut report = UpdateReport::default();
    pre_update(snapshot);
    bottom_up(snapshot, total_resource_limits);
    top_down(snapshot, total_resource_limits, &mut report);
    starvation_pass(snapshot, now);
    invariants::check(snapshot);
    report
}

/// Spec §4.1 step 2: per-operation `schedulable`, `resource_demand`,
/// `resource_limits`, `pending_job_count`. Every element (not only
/// operations) gets its `resource_limits` here since pools and root need it
/// too for the `max_possible_resource_usage` clamp in `bottom_up`.
fn pre_update(snapshot: &mut TreeSnapshot) {
    for idx in 0..snapshot.tree_size() {
        let element = &snapshot.elements[idx];
        if let Element::Operation(op) = element {
            let pending_job_count = op.controller.get_pending_job_count();
            let schedulable = pending_job_count > 0;
            let usage = op.resource_usage.clone();
            let demand = if schedulable {
                usage.add(&op.controller.get_needed_resources())
            } else {
                usage.clone()
            };
            let attrs = &mut snapshot.attributes[idx];
            attrs.schedulable = schedulable;
            attrs.pending_job_count = if schedulable { pending_job_count } else { 0 };
            attrs.resource_usage = usage;
            attrs.resource_demand = demand;
        }
    }
}

/// Spec §4.1 step 3: sum children into parents, derive dominant resource,
/// demand/usage/max-possible ratios, and best-allocation ratio. Also the
/// "adjusted starvation tolerance/timeout limits" propagation (spec: "child
/// = clamp(child_spec, parent_adjusted)"), run top-down alongside since it
/// only needs the parent's own adjusted values (SPEC_FULL groups it with
/// `bottom_up` in the module but it is a pre-order computation in the
/// original; here it runs as the first thing `top_down` does per element so
/// it's visible before the fitting computation reads it — see `top_down`).
fn bottom_up(snapshot: &mut TreeSnapshot, total_resource_limits: &JobResources) {
    let post_order = snapshot.post_order();
    for idx in post_order {
        let is_leaf = matches!(snapshot.elements[idx], Element::Operation(_));

        let max_share_ratio = snapshot.elements[idx].common().max_share_ratio;
        let configured_limits = snapshot.elements[idx].common().resource_limits.clone();
        let scaled = total_resource_limits.scale(max_share_ratio);
        let resource_limits = match configured_limits {
            Some(c) => scaled.pointwise_min(&c),
            None => scaled,
        };

        if is_leaf {
            let attrs = &mut snapshot.attributes[idx];
            attrs.resource_limits = resource_limits.clone();
            attrs.max_possible_resource_usage = resource_limits.pointwise_min(&attrs.resource_demand);
        } else {
            let mut demand = JobResources::zero();
            let mut usage = JobResources::zero();
            let mut max_possible = JobResources::zero();
            let mut pending_job_count = 0i64;
            let mut best_allocation_ratio = 0.0_f64;
            for &child in &snapshot.children[idx] {
                let c = &snapshot.attributes[child];
                demand = demand.add(&c.resource_demand);
                usage = usage.add(&c.resource_usage);
                max_possible = max_possible.add(&c.max_possible_resource_usage);
                pending_job_count += c.pending_job_count;
                best_allocation_ratio = best_allocation_ratio.max(c.best_allocation_ratio);
            }
            let attrs = &mut snapshot.attributes[idx];
            attrs.resource_demand = demand;
            attrs.resource_usage = usage;
            attrs.pending_job_count = pending_job_count;
            attrs.resource_limits = resource_limits.clone();
            attrs.max_possible_resource_usage = resource_limits.pointwise_min(&max_possible);
            attrs.best_allocation_ratio = best_allocation_ratio;
        }

        // Dominant resource is chosen from usage (falling back to demand
        // when usage is zero, so an idle-but-demanding element still has a
        // meaningful dominant dimension) against the tree-wide total, not
        // the element's own limits (spec §3 "dominant_resource"; grounded
        // in the original's `GetDominantResource(usage, TotalResourceLimits_)`).
        let attrs = &snapshot.attributes[idx];
        let probe = if attrs.resource_usage.is_zero() { &attrs.resource_demand } else { &attrs.resource_usage };
        let (dominant_resource, _) = JobResources::dominant_resource(probe, total_resource_limits)
            .unwrap_or((crate::resources::ResourceKind::Cpu, 0.0));
        let dominant_limit = total_resource_limits.get(&dominant_resource);
        let demand_ratio = ratio_or_one(attrs.resource_demand.get(&dominant_resource), dominant_limit);
        let usage_ratio = ratio_or_one(attrs.resource_usage.get(&dominant_resource), dominant_limit);

        let possible_usage_ratio =
            ratio_or_one(attrs.max_possible_resource_usage.get(&dominant_resource), dominant_limit);
        let max_possible_usage_ratio = possible_usage_ratio.min(max_share_ratio);

        // Leaf best-allocation ratio: can this operation's smallest pending
        // job ever be allocated at all, anywhere in the cluster? The
        // original derives this from the exec-node memory distribution
        // (`GetAdjustedResourceLimits`), which models per-node placement —
        // out of scope here (spec §1 "does not place data"; decision
        // recorded in DESIGN.md). We approximate with the simplest
        // dimension this engine *can* see: whether the smallest min-needed
        // job resource request is dominated by the tree's total capacity at
        // all; 0.0 if it can never fit, 1.0 (scaled by max_share_ratio)
        // otherwise.
        let best_allocation_ratio = if is_leaf {
            leaf_best_allocation_ratio(snapshot, idx, total_resource_limits, max_share_ratio)
        } else {
            snapshot.attributes[idx].best_allocation_ratio.min(1.0)
        };

        let attrs = &mut snapshot.attributes[idx];
        attrs.dominant_resource = Some(dominant_resource);
        attrs.dominant_limit = dominant_limit;
        attrs.demand_ratio = demand_ratio;
        attrs.usage_ratio = usage_ratio;
        attrs.max_possible_usage_ratio = max_possible_usage_ratio;
        attrs.best_allocation_ratio = best_allocation_ratio;
    }
}

fn leaf_best_allocation_ratio(
    snapshot: &TreeSnapshot,
    idx: usize,
    total_resource_limits: &JobResources,
    max_share_ratio: f64,
) -> f64 {
    let Element::Operation(op) = &snapshot.elements[idx] else {
        return 1.0;
    };
    let min_needed = op.controller.get_min_needed_job_resources();
    if min_needed.is_empty() {
        return max_share_ratio;
    }
    let fits_somewhere = min_needed.iter().any(|r| r.dominated_by(total_resource_limits));
    if fits_somewhere {
        max_share_ratio
    } else {
        0.0
    }
}

fn ratio_or_one(value: i64, limit: i64) -> f64 {
    if limit == 0 {
        1.0
    } else {
        value as f64 / limit as f64
    }
}

/// Spec §4.1 step 4. Pre-order so a parent's own top-down results
/// (`fair_share_ratio`, `recursive_min_share_ratio`, `guaranteed_resources_ratio`,
/// adjusted starvation settings) are available before its children are
/// computed.
fn top_down(snapshot: &mut TreeSnapshot, total_resource_limits: &JobResources, report: &mut UpdateReport) {
    let root = snapshot.root_index;
    {
        let root_attrs = &mut snapshot.attributes[root];
        root_attrs.fair_share_ratio = 1.0;
        root_attrs.recursive_min_share_ratio = 1.0;
        root_attrs.guaranteed_resources_ratio = 1.0;
        root_attrs.adjusted_min_share_ratio = 1.0;
        let root_config = &snapshot.elements[root].common().starvation;
        root_attrs.adjusted_fair_share_starvation_tolerance =
            root_config.fair_share_starvation_tolerance.unwrap_or(1.0);
        root_attrs.adjusted_min_share_preemption_timeout =
            root_config.min_share_preemption_timeout.unwrap_or_default();
        root_attrs.adjusted_fair_share_preemption_timeout =
            root_config.fair_share_preemption_timeout.unwrap_or_default();
    }

    for idx in snapshot.pre_order() {
        let children: Vec<usize> = snapshot.children[idx].clone();
        if children.is_empty() {
            continue;
        }

        propagate_starvation_settings(snapshot, idx, &children);

        let mode = match &snapshot.elements[idx] {
            Element::Pool(p) => p.mode,
            Element::Root(_) => SchedulingMode::FairShare,
            Element::Operation(_) => unreachable!("operations have no children"),
        };

        match mode {
            SchedulingMode::Fifo => top_down_fifo(snapshot, idx, &children),
            SchedulingMode::FairShare => top_down_fair_share(snapshot, idx, &children, total_resource_limits, report),
        }
    }
}

fn propagate_starvation_settings(snapshot: &mut TreeSnapshot, parent: usize, children: &[usize]) {
    let parent_tolerance = snapshot.attributes[parent].adjusted_fair_share_starvation_tolerance;
    let parent_min_timeout = snapshot.attributes[parent].adjusted_min_share_preemption_timeout;
    let parent_fair_timeout = snapshot.attributes[parent].adjusted_fair_share_preemption_timeout;
    for &child in children {
        let starvation = snapshot.elements[child].common().starvation;
        let attrs = &mut snapshot.attributes[child];
        attrs.adjusted_fair_share_starvation_tolerance =
            starvation.fair_share_starvation_tolerance.unwrap_or(parent_tolerance).min(parent_tolerance);
        attrs.adjusted_min_share_preemption_timeout =
            starvation.min_share_preemption_timeout.unwrap_or(parent_min_timeout).max(parent_min_timeout);
        attrs.adjusted_fair_share_preemption_timeout =
            starvation.fair_share_preemption_timeout.unwrap_or(parent_fair_timeout).max(parent_fair_timeout);
    }
}

/// Spec §4.1 step 4 FIFO branch / §4.4. Children are sorted by the
/// composite's `fifo_sort_parameters`; each in turn gets as much of the
/// parent's remaining fair-share ratio as its own caps allow, so a leader
/// that has exhausted its demand still lets the next child in line receive
/// the remainder (spec §8 scenario 2).
fn top_down_fifo(snapshot: &mut TreeSnapshot, parent: usize, children: &[usize]) {
    let sort_params = match &snapshot.elements[parent] {
        Element::Pool(p) => p.fifo_sort_parameters.clone(),
        _ => vec![FifoSortParameter::Weight, FifoSortParameter::StartTime],
    };

    let mut ordered = children.to_vec();
    ordered.sort_by(|&a, &b| fifo_compare(snapshot, a, b, &sort_params));

    let mut remaining = snapshot.attributes[parent].fair_share_ratio;
    for (index, &child) in ordered.iter().enumerate() {
        let cap = snapshot.attributes[child].max_possible_usage_ratio.min(snapshot.attributes[child].best_allocation_ratio);
        let share = remaining.min(cap).max(0.0);
        let attrs = &mut snapshot.attributes[child];
        attrs.fifo_index = index as i32;
        attrs.recursive_min_share_ratio = 0.0;
        attrs.adjusted_min_share_ratio = 0.0;
        attrs.fair_share_ratio = share;
        attrs.guaranteed_resources_ratio = share;
        remaining -= share;
    }
}

/// Strict weak ordering matching `HasHigherPriorityInFifoMode`: earlier in
/// the sorted order means higher priority.
fn fifo_compare(snapshot: &TreeSnapshot, a: usize, b: usize, params: &[FifoSortParameter]) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    for param in params {
        let ordering = match param {
            FifoSortParameter::Weight => {
                let wa = snapshot.elements[a].common().weight;
                let wb = snapshot.elements[b].common().weight;
                wb.partial_cmp(&wa).unwrap_or(Ordering::Equal)
            }
            FifoSortParameter::StartTime => {
                let ta = start_time(snapshot, a);
                let tb = start_time(snapshot, b);
                ta.cmp(&tb)
            }
            FifoSortParameter::PendingJobCount => {
                snapshot.attributes[a].pending_job_count.cmp(&snapshot.attributes[b].pending_job_count)
            }
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn start_time(snapshot: &TreeSnapshot, idx: usize) -> Instant {
    match &snapshot.elements[idx] {
        Element::Operation(op) => op.start_time,
        _ => Instant::now(),
    }
}

/// Spec §4.1 step 4 FairShare branch.
fn top_down_fair_share(
    snapshot: &mut TreeSnapshot,
    parent: usize,
    children: &[usize],
    total_resource_limits: &JobResources,
    report: &mut UpdateReport,
) {
    let parent_recursive_min_share = snapshot.attributes[parent].recursive_min_share_ratio;
    let parent_id = snapshot.elements[parent].id().to_string();

    let mut min_share_sum_pools = 0.0_f64;
    let mut min_share_sum_operations = 0.0_f64;
    let mut min_weight = f64::INFINITY;

    for &child in children {
        let is_operation = matches!(snapshot.elements[child], Element::Operation(_));
        let own_min_share_ratio = snapshot.elements[child].common().min_share_ratio;
        let min_share_resources = snapshot.elements[child].common().min_share_resources.clone();
        let min_share_by_resources = min_share_resources.max_ratio_to(total_resource_limits);
        let recursive = (parent_recursive_min_share * own_min_share_ratio).max(min_share_by_resources);

        if !is_operation && own_min_share_ratio > 0.0 && parent_recursive_min_share == 0.0 {
            report.alerts.push(FairShareAlert::MinShareHasNoEffect {
                child: snapshot.elements[child].id().to_string(),
                parent: parent_id.clone(),
            });
        }

        snapshot.attributes[child].recursive_min_share_ratio = recursive;
        if is_operation {
            min_share_sum_operations += recursive;
        } else {
            min_share_sum_pools += recursive;
        }

        let weight = snapshot.elements[child].common().weight;
        if weight > COMPUTATION_EPS {
            min_weight = min_weight.min(weight);
        }
    }
    if !min_weight.is_finite() {
        min_weight = 1.0;
    }

    if min_share_sum_pools > parent_recursive_min_share + COMPARISON_EPS {
        warn!(
            pool = %parent_id,
            sum = min_share_sum_pools,
            available = parent_recursive_min_share,
            "impossible to satisfy min-share guarantees: total min share ratio of children pools is too large"
        );
        report.alerts.push(FairShareAlert::MinShareSumExceedsParent {
            pool: parent_id.clone(),
            sum: min_share_sum_pools,
            parent_recursive_min_share,
        });
        let fit_factor = if min_share_sum_pools > COMPUTATION_EPS { parent_recursive_min_share / min_share_sum_pools } else { 0.0 };
        for &child in children {
            let is_operation = matches!(snapshot.elements[child], Element::Operation(_));
            let attrs = &mut snapshot.attributes[child];
            if is_operation {
                attrs.recursive_min_share_ratio = 0.0;
            } else {
                attrs.recursive_min_share_ratio *= fit_factor;
            }
        }
    } else if min_share_sum_pools + min_share_sum_operations > parent_recursive_min_share + COMPARISON_EPS {
        let fit_factor = if min_share_sum_operations > COMPUTATION_EPS {
            (parent_recursive_min_share - min_share_sum_pools + COMPARISON_EPS) / min_share_sum_operations
        } else {
            0.0
        };
        for &child in children {
            if matches!(snapshot.elements[child], Element::Operation(_)) {
                snapshot.attributes[child].recursive_min_share_ratio *= fit_factor;
            }
        }
    }

    // Fair-share pass: clamped by max_possible_usage_ratio and best_allocation_ratio.
    let fair_bounds: Vec<FitBounds> = children
        .iter()
        .map(|&child| {
            let a = &snapshot.attributes[child];
            FitBounds {
                weight: snapshot.elements[child].common().weight,
                lower: a.recursive_min_share_ratio,
                upper: a.max_possible_usage_ratio.min(a.best_allocation_ratio),
            }
        })
        .collect();
    let parent_fair_share = snapshot.attributes[parent].fair_share_ratio;
    let (_, fair_shares) = compute_by_fitting(&fair_bounds, min_weight, parent_fair_share);
    for (i, &child) in children.iter().enumerate() {
        snapshot.attributes[child].fair_share_ratio = fair_shares[i];
    }

    // Guaranteed-resources pass: same lower bound, no upper clamp (spec §4.1).
    let guaranteed_bounds: Vec<FitBounds> = children
        .iter()
        .map(|&child| FitBounds {
            weight: snapshot.elements[child].common().weight,
            lower: snapshot.attributes[child].recursive_min_share_ratio,
            upper: 1.0,
        })
        .collect();
    let parent_guaranteed = snapshot.attributes[parent].guaranteed_resources_ratio;
    let (_, guaranteed_shares) = compute_by_fitting(&guaranteed_bounds, min_weight, parent_guaranteed);
    for (i, &child) in children.iter().enumerate() {
        snapshot.attributes[child].guaranteed_resources_ratio = guaranteed_shares[i];
    }

    for &child in children {
        let a = &mut snapshot.attributes[child];
        a.adjusted_min_share_ratio = a.recursive_min_share_ratio.min(a.max_possible_usage_ratio).min(a.best_allocation_ratio);
    }

    debug!(pool = %parent_id, children = children.len(), fair_share = parent_fair_share, "top-down fair-share pass complete");
}

/// Spec §4.1 step 5, §4.7, §8 scenario 6.
fn starvation_pass(snapshot: &mut TreeSnapshot, now: Instant) {
    for idx in 0..snapshot.tree_size() {
        if idx == snapshot.root_index {
            continue;
        }
        let attrs = &snapshot.attributes[idx];
        let tolerance = attrs.adjusted_fair_share_starvation_tolerance;
        let fifo_index = if attrs.fifo_index >= 0 { Some(attrs.fifo_index) } else { None };
        let status = starvation::compute_status(
            attrs.usage_ratio,
            attrs.fair_share_ratio,
            attrs.adjusted_min_share_ratio,
            tolerance,
            fifo_index,
        );
        let min_timeout = attrs.adjusted_min_share_preemption_timeout;
        let fair_timeout = attrs.adjusted_fair_share_preemption_timeout;

        let persistent = snapshot.elements[idx].persistent_mut();
        let was_starving = persistent.starving;
        starvation::update_starving(persistent, status, now, min_timeout, fair_timeout);
        if persistent.starving != was_starving {
            debug!(element = %snapshot.elements[idx].id(), starving = persistent.starving, "starvation state changed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{OperationElement, PoolElement};
    use crate::tree::LiveTree;
    use std::sync::Arc;

    /// A controller that always reports exactly one pending job demanding a
    /// fixed amount of CPU, never starts anything. Enough for the updater
    /// tests, which only read demand/pending-count, not actual scheduling.
    #[derive(Debug)]
    struct FixedDemandController {
        demand: JobResources,
    }

    impl crate::controller::OperationController for FixedDemandController {
        fn schedule_job(
            &self,
            _context: &crate::scheduling_context::SchedulingContext,
            _available_resources: &JobResources,
        ) -> crate::controller::ScheduleJobOutcome {
            crate::controller::ScheduleJobOutcome::NoPendingJobs
        }
        fn abort_job(&self, _job_id: &crate::job::JobId, _reason: crate::controller::AbortReason) {}
        fn on_job_started(&self, _job: &crate::job::Job) {}
        fn on_job_completed(&self, _summary: &crate::controller::JobSummary) {}
        fn on_job_failed(&self, _summary: &crate::controller::JobSummary) {}
        fn on_non_scheduled_job_aborted(
            &self,
            _job_id: &crate::job::JobId,
            _reason: crate::controller::AbortReason,
            _tree_id: &str,
            _epoch: u64,
        ) {
        }
        fn get_needed_resources(&self) -> JobResources {
            self.demand.clone()
        }
        fn get_pending_job_count(&self) -> i64 {
            1
        }
        fn get_min_needed_job_resources(&self) -> Vec<JobResources> {
            vec![self.demand.clone()]
        }
    }

    fn controller_with_demand(cpu: i64) -> Arc<dyn crate::controller::OperationController> {
        Arc::new(FixedDemandController {
            demand: JobResources {
                cpu,
                ..Default::default()
            },
        })
    }

    fn total(cpu: i64) -> JobResources {
        JobResources {
            cpu,
            ..Default::default()
        }
    }

    /// Spec §8 scenario 1: A(weight=1), B(weight=3), both demanding 100 CPU
    /// on a 100 CPU cluster under one FairShare pool -> 25:75 split.
    #[test]
    fn two_operations_split_fair_share_by_weight() {
        let mut tree = LiveTree::new("tree1");
        let mut pool = PoolElement::new("p", "tree1");
        pool.common.weight = 1.0;
        tree.insert_pool(pool).unwrap();

        let mut a = OperationElement::new("a", "p").with_controller(controller_with_demand(100));
        a.common.weight = 1.0;
        let mut b = OperationElement::new("b", "p").with_controller(controller_with_demand(100));
        b.common.weight = 3.0;
        tree.insert_operation(a).unwrap();
        tree.insert_operation(b).unwrap();

        let mut snapshot = tree.snapshot().unwrap();
        let report = update(&mut snapshot, &total(100), Instant::now());
        assert!(report.alerts.is_empty());

        let a_idx = snapshot.index_of("a").unwrap();
        let b_idx = snapshot.index_of("b").unwrap();
        assert!((snapshot.attributes[a_idx].fair_share_ratio - 0.25).abs() < 1e-6, "{}", snapshot.attributes[a_idx].fair_share_ratio);
        assert!((snapshot.attributes[b_idx].fair_share_ratio - 0.75).abs() < 1e-6, "{}", snapshot.attributes[b_idx].fair_share_ratio);
    }

    /// Spec §8 scenario 3: P1(min_share=0.6), P2(min_share=0.7) under root,
    /// demand exceeds cluster -> rescaled to ~0.4615 / ~0.5385, sum <= 1.
    #[test]
    fn oversubscribed_min_shares_are_rescaled() {
        let mut tree = LiveTree::new("tree1");
        let mut p1 = PoolElement::new("p1", "tree1");
        p1.common.min_share_ratio = 0.6;
        let mut p2 = PoolElement::new("p2", "tree1");
        p2.common.min_share_ratio = 0.7;
        tree.insert_pool(p1).unwrap();
        tree.insert_pool(p2).unwrap();
        tree.insert_operation(OperationElement::new("a", "p1").with_controller(controller_with_demand(1000))).unwrap();
        tree.insert_operation(OperationElement::new("b", "p2").with_controller(controller_with_demand(1000))).unwrap();

        let mut snapshot = tree.snapshot().unwrap();
        update(&mut snapshot, &total(100), Instant::now());

        let p1_idx = snapshot.index_of("p1").unwrap();
        let p2_idx = snapshot.index_of("p2").unwrap();
        let r1 = snapshot.attributes[p1_idx].recursive_min_share_ratio;
        let r2 = snapshot.attributes[p2_idx].recursive_min_share_ratio;
        assert!((r1 - 0.6 / 1.3).abs() < 1e-3, "p1 recursive min share {r1}");
        assert!((r2 - 0.7 / 1.3).abs() < 1e-3, "p2 recursive min share {r2}");
        assert!(r1 + r2 <= 1.0 + 1e-6);
    }

    /// Spec §8 scenario 2: FIFO pool with X, Y, Z. X gets min(demand, fair
    /// share); until X is saturated, Y and Z get the remainder/zero.
    #[test]
    fn fifo_pool_orders_by_weight_then_start_time() {
        let mut tree = LiveTree::new("tree1");
        let mut pool = PoolElement::new("p", "tree1");
        pool.mode = SchedulingMode::Fifo;
        pool.fifo_sort_parameters = vec![FifoSortParameter::Weight, FifoSortParameter::StartTime];
        tree.insert_pool(pool).unwrap();

        let mut x = OperationElement::new("x", "p").with_controller(controller_with_demand(10));
        x.common.weight = 2.0;
        let mut y = OperationElement::new("y", "p").with_controller(controller_with_demand(10));
        y.common.weight = 2.0;
        y.start_time = x.start_time + std::time::Duration::from_secs(1);
        let mut z = OperationElement::new("z", "p").with_controller(controller_with_demand(10));
        z.common.weight = 1.0;

        tree.insert_operation(x).unwrap();
        tree.insert_operation(y).unwrap();
        tree.insert_operation(z).unwrap();

        let mut snapshot = tree.snapshot().unwrap();
        update(&mut snapshot, &total(100), Instant::now());

        let x_idx = snapshot.index_of("x").unwrap();
        let y_idx = snapshot.index_of("y").unwrap();
        let z_idx = snapshot.index_of("z").unwrap();
        assert_eq!(snapshot.attributes[x_idx].fifo_index, 0);
        assert_eq!(snapshot.attributes[y_idx].fifo_index, 1);
        assert_eq!(snapshot.attributes[z_idx].fifo_index, 2);
        // x demands 10/100 = 0.1 of the cluster, capped by its own demand ratio via max_possible_usage_ratio.
        assert!((snapshot.attributes[x_idx].fair_share_ratio - 0.1).abs() < 1e-6, "{}", snapshot.attributes[x_idx].fair_share_ratio);
        // remaining 0.9 flows to y next in priority order.
        assert!((snapshot.attributes[y_idx].fair_share_ratio - 0.1).abs() < 1e-6, "{}", snapshot.attributes[y_idx].fair_share_ratio);
    }

    #[test]
    fn sum_of_children_fair_share_never_exceeds_parent() {
        let mut tree = LiveTree::new("tree1");
        let mut pool = PoolElement::new("p", "tree1");
        pool.common.weight = 1.0;
        tree.insert_pool(pool).unwrap();
        for (i, w) in [1.0, 2.0, 5.0, 0.5].into_iter().enumerate() {
            let mut op = OperationElement::new(format!("op{i}"), "p").with_controller(controller_with_demand(80));
            op.common.weight = w;
            tree.insert_operation(op).unwrap();
        }
        let mut snapshot = tree.snapshot().unwrap();
        update(&mut snapshot, &total(100), Instant::now());
        let p_idx = snapshot.index_of("p").unwrap();
        let sum: f64 = snapshot.children[p_idx].iter().map(|&c| snapshot.attributes[c].fair_share_ratio).sum();
        assert!(sum <= snapshot.attributes[p_idx].fair_share_ratio + 1e-6, "sum {sum}");
    }
}
