//! Operation pool-tree element (spec §3 "Operation element").

use std::sync::Arc;
use std::time::Instant;

use crate::controller::OperationController;
use crate::element::attributes::PersistentAttributes;
use crate::element::CommonElementConfig;
use crate::job::OperationId;
use crate::preemption::PreemptibleJobTracker;
use crate::resources::JobResources;

#[derive(Debug, Clone)]
pub struct OperationElement {
    pub common: CommonElementConfig,
    pub operation_id: OperationId,
    pub start_time: Instant,
    /// An operation attached to a tree it does not primarily belong to
    /// (multi-tree `pool_trees` spec); a controller may decline scheduling
    /// on it (spec §6 `tentative_tree_declined`).
    pub tentative: bool,
    pub custom_profiling_tag: Option<String>,
    /// Position allocated by the owning pool on attach; stable for the
    /// operation's lifetime in that pool (spec §3 "Lifecycle").
    pub slot_index: Option<usize>,
    /// Below this many running jobs, none may be preempted (spec §4.6).
    pub max_unpreemptible_job_count: Option<i64>,
    pub controller: Arc<dyn OperationController>,
    pub preemptible_jobs: PreemptibleJobTracker,
    pub persistent: PersistentAttributes,
    /// `Σ running jobs' resource_usage` (spec §3 Invariants). The ground
    /// truth lives here on the live tree element; the fair-share updater
    /// only reads it (spec §4.1 step 2) and pools/root derive theirs by
    /// summing children bottom-up.
    pub resource_usage: JobResources,
}

impl OperationElement {
    pub fn new(id: impl Into<String>, parent: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            common: CommonElementConfig {
                id: id.clone(),
                parent: Some(parent.into()),
                weight: 1.0,
                min_share_ratio: 0.0,
                max_share_ratio: 1.0,
                min_share_resources: Default::default(),
                resource_limits: None,
                scheduling_tag_filter: None,
                starvation: Default::default(),
            },
            operation_id: id,
            start_time: Instant::now(),
            tentative: false,
            custom_profiling_tag: None,
            slot_index: None,
            max_unpreemptible_job_count: None,
            controller: Arc::new(NullController),
            preemptible_jobs: PreemptibleJobTracker::new(),
            persistent: PersistentAttributes::default(),
            resource_usage: JobResources::zero(),
        }
    }

    pub fn with_controller(mut self, controller: Arc<dyn OperationController>) -> Self {
        self.controller = controller;
        self
    }

    /// Spec §4.6 "reject preemption when the operation has too few running
    /// jobs".
    pub fn below_unpreemptible_floor(&self) -> bool {
        match self.max_unpreemptible_job_count {
            Some(floor) => (self.preemptible_jobs.running_job_count() as i64) <= floor,
            None => false,
        }
    }

    /// Called by the node shard when a job starts or finishes on this
    /// operation (spec §5 "IncreaseHierarchicalResourceUsage"); the
    /// fair-share updater reads `resource_usage` back out on the next pass.
    pub fn increase_resource_usage(&mut self, delta: &JobResources) {
        self.resource_usage = self.resource_usage.add(delta);
    }

    pub fn decrease_resource_usage(&mut self, delta: &JobResources) {
        self.resource_usage = self.resource_usage.saturating_sub(delta);
    }
}

/// Placeholder controller for an operation element under construction;
/// never scheduled against since `get_pending_job_count` is always zero.
#[derive(Debug)]
struct NullController;

impl OperationController for NullController {
    fn schedule_job(
        &self,
        _context: &crate::scheduling_context::SchedulingContext,
        _available_resources: &crate::resources::JobResources,
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

    fn get_needed_resources(&self) -> crate::resources::JobResources {
        crate::resources::JobResources::zero()
    }

    fn get_pending_job_count(&self) -> i64 {
        0
    }

    fn get_min_needed_job_resources(&self) -> Vec<crate::resources::JobResources> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_operation_has_no_controller_and_zero_demand() {
        let op = OperationElement::new("op1", "research");
        assert_eq!(op.controller.get_pending_job_count(), 0);
        assert!(op.common.parent.as_deref() == Some("research"));
        assert!(!op.tentative);
    }

    #[test]
    fn below_unpreemptible_floor_without_floor_is_false() {
        let op = OperationElement::new("op1", "research");
        assert!(!op.below_unpreemptible_floor());
    }

    #[test]
    fn below_unpreemptible_floor_respects_configured_floor() {
        let mut op = OperationElement::new("op1", "research");
        op.max_unpreemptible_job_count = Some(2);
        assert!(op.below_unpreemptible_floor());
    }
}
