//! Post-update invariant checks (spec §8, SPEC_FULL §B.5).
//!
//! Run once after every [`super::update`] pass. Mirrors the teacher's
//! `scheduler::feasibility` module's shape: a pure, independently-testable
//! analysis consulted after the main algorithm, warning-only — a violation
//! is logged but the update's report is still returned and used. These are
//! defense-in-depth checks on an algorithm already proven correct by the
//! fair-share updater's own tests, not a gate.

use tracing::warn;

use crate::resources::JobResources;
use crate::tree::TreeSnapshot;

use super::COMPARISON_EPS;

/// Check the tree-sum invariants of spec §8 over every composite element in
/// `snapshot`, logging `warn!` for each violation found. Never mutates the
/// snapshot or fails the update.
pub fn check(snapshot: &TreeSnapshot) {
    for idx in 0..snapshot.tree_size() {
        let children = &snapshot.children[idx];
        if children.is_empty() {
            continue;
        }
        check_fair_share_sum(snapshot, idx, children);
        check_demand_sum(snapshot, idx, children);
    }
}

/// `Σ_children fair_share_ratio ≤ P.fair_share_ratio` unless a child's own
/// `max_possible_usage_ratio` saturates it (spec §8 first bullet).
fn check_fair_share_sum(snapshot: &TreeSnapshot, parent: usize, children: &[usize]) {
    let sum: f64 = children.iter().map(|&c| snapshot.attributes[c].fair_share_ratio).sum();
    let parent_share = snapshot.attributes[parent].fair_share_ratio;
    if sum <= parent_share + COMPARISON_EPS {
        return;
    }
    let any_saturated = children.iter().any(|&c| {
        let a = &snapshot.attributes[c];
        a.fair_share_ratio >= a.max_possible_usage_ratio - COMPARISON_EPS
    });
    if any_saturated {
        return;
    }
    warn!(
        element = %snapshot.elements[parent].id(),
        sum,
        parent_fair_share = parent_share,
        "invariant violated: children's fair share ratios exceed parent's"
    );
}

/// `P.resource_demand == Σ children demand` (spec §8 second bullet).
fn check_demand_sum(snapshot: &TreeSnapshot, parent: usize, children: &[usize]) {
    let sum = children
        .iter()
        .fold(JobResources::zero(), |acc, &c| acc.add(&snapshot.attributes[c].resource_demand));
    let parent_demand = &snapshot.attributes[parent].resource_demand;
    if &sum != parent_demand {
        warn!(
            element = %snapshot.elements[parent].id(),
            "invariant violated: resource_demand does not equal the sum of children's demand"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{AbortReason, JobSummary, OperationController, ScheduleJobOutcome};
    use crate::element::{OperationElement, PoolElement};
    use crate::job::{Job, JobId};
    use crate::scheduling_context::SchedulingContext;
    use crate::tree::LiveTree;
    use std::sync::Arc;
    use std::time::Instant;

    #[derive(Debug)]
    struct FixedDemandController {
        demand: JobResources,
    }

    impl OperationController for FixedDemandController {
        fn schedule_job(&self, _context: &SchedulingContext, _available_resources: &JobResources) -> ScheduleJobOutcome {
            ScheduleJobOutcome::NoPendingJobs
        }
        fn abort_job(&self, _job_id: &JobId, _reason: AbortReason) {}
        fn on_job_started(&self, _job: &Job) {}
        fn on_job_completed(&self, _summary: &JobSummary) {}
        fn on_job_failed(&self, _summary: &JobSummary) {}
        fn on_non_scheduled_job_aborted(&self, _job_id: &JobId, _reason: AbortReason, _tree_id: &str, _epoch: u64) {}
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

    fn demand(cpu: i64) -> Arc<dyn OperationController> {
        Arc::new(FixedDemandController {
            demand: JobResources {
                cpu,
                ..Default::default()
            },
        })
    }

    /// A healthy tree from the fair-share updater's own scenario tests must
    /// pass both checks without panicking (there's nothing to assert on a
    /// warn-only check besides "it doesn't explode").
    #[test]
    fn healthy_tree_has_no_violations() {
        let mut tree = LiveTree::new("tree1");
        let mut pool = PoolElement::new("p", "tree1");
        pool.common.weight = 1.0;
        tree.insert_pool(pool).unwrap();
        let mut a = OperationElement::new("a", "p").with_controller(demand(100));
        a.common.weight = 1.0;
        let mut b = OperationElement::new("b", "p").with_controller(demand(100));
        b.common.weight = 3.0;
        tree.insert_operation(a).unwrap();
        tree.insert_operation(b).unwrap();

        let mut snapshot = tree.snapshot().unwrap();
        super::super::update(
            &mut snapshot,
            &JobResources {
                cpu: 100,
                ..Default::default()
            },
            Instant::now(),
        );
        check(&snapshot);
    }

    #[test]
    fn demand_sum_matches_after_update() {
        let mut tree = LiveTree::new("tree1");
        let pool = PoolElement::new("p", "tree1");
        tree.insert_pool(pool).unwrap();
        tree.insert_operation(OperationElement::new("a", "p").with_controller(demand(10))).unwrap();
        tree.insert_operation(OperationElement::new("b", "p").with_controller(demand(20))).unwrap();

        let mut snapshot = tree.snapshot().unwrap();
        super::super::update(
            &mut snapshot,
            &JobResources {
                cpu: 100,
                ..Default::default()
            },
            Instant::now(),
        );
        let p_idx = snapshot.index_of("p").unwrap();
        assert_eq!(snapshot.attributes[p_idx].resource_demand.cpu, 30);
        check(&snapshot);
    }
}
