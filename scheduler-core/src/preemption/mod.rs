//! Per-operation preemptible-job tracker (spec §4.6).
//!
//! Three ordered lists partition an operation's running jobs:
//! `non_preemptible`, `aggressively_preemptible`, `preemptible`. Job order
//! within each list is insertion order (oldest first), which is also
//! start-time order since jobs are appended as they start. The tracker
//! keeps running aggregate usage for the first two lists so the rebalance
//! sweep in [`PreemptibleJobTracker::update`] never has to re-sum the whole
//! operation.
//!
//! A job's slot is addressed by id rather than a raw list node — the
//! "iterator into an intrusive list" of the original design becomes a plain
//! lookup into the per-operation job arena (spec §9 "Iterators into
//! intrusive lists").

pub mod planner;

use std::collections::VecDeque;

use crate::job::{Job, JobId, PreemptionListKind};
use crate::resources::JobResources;

#[derive(Debug, Clone, Default)]
pub struct PreemptibleJobTracker {
    non_preemptible: VecDeque<JobId>,
    aggressively_preemptible: VecDeque<JobId>,
    preemptible: VecDeque<JobId>,
    non_preemptible_usage: JobResources,
    aggressive_usage: JobResources,
}

impl PreemptibleJobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn non_preemptible(&self) -> impl Iterator<Item = &JobId> {
        self.non_preemptible.iter()
    }

    pub fn aggressively_preemptible(&self) -> impl Iterator<Item = &JobId> {
        self.aggressively_preemptible.iter()
    }

    pub fn preemptible(&self) -> impl Iterator<Item = &JobId> {
        self.preemptible.iter()
    }

    pub fn running_job_count(&self) -> usize {
        self.non_preemptible.len() + self.aggressively_preemptible.len() + self.preemptible.len()
    }

    /// A freshly started job always enters as non-preemptible; the next
    /// [`update`](Self::update) call demotes it if usage already exceeds
    /// the thresholds.
    pub fn on_job_started(&mut self, job: &mut Job) {
        self.non_preemptible.push_back(job.id.clone());
        self.non_preemptible_usage = self.non_preemptible_usage.add(&job.resource_usage);
        job.list_kind = Some(PreemptionListKind::NonPreemptible);
    }

    pub fn on_job_finished(&mut self, job: &Job) {
        match job.list_kind {
            Some(PreemptionListKind::NonPreemptible) => {
                self.non_preemptible.retain(|id| id != &job.id);
                self.non_preemptible_usage = self.non_preemptible_usage.saturating_sub(&job.resource_usage);
            }
            Some(PreemptionListKind::AggressivelyPreemptible) => {
                self.aggressively_preemptible.retain(|id| id != &job.id);
                self.aggressive_usage = self.aggressive_usage.saturating_sub(&job.resource_usage);
            }
            Some(PreemptionListKind::Preemptible) => {
                self.preemptible.retain(|id| id != &job.id);
            }
            None => {}
        }
    }

    /// Rebalance the three lists against the current fair-share ratio (spec
    /// §4.6). Runs two sweeps, each moving the youngest non-preemptible job
    /// down to aggressive, and the youngest aggressive job down to
    /// preemptible, until:
    ///
    /// ```text
    /// usage_ratio(non_preemptible)            <= fair_share_ratio * aggressive_threshold
    /// usage_ratio(non_preemptible ∪ aggr.)    <= fair_share_ratio * preemption_threshold
    /// ```
    ///
    /// `jobs` must contain every job currently tracked, keyed by id, so
    /// aggregate usage can be recomputed as jobs move between lists.
    pub fn update(
        &mut self,
        jobs: &std::collections::HashMap<JobId, Job>,
        fair_share_ratio: f64,
        total_resource_limits: &JobResources,
        aggressive_threshold: f64,
        preemption_threshold: f64,
    ) {
        for _ in 0..2 {
            let aggressive_bound = fair_share_ratio * aggressive_threshold;
            while JobResources::dominant_resource_ratio(&self.non_preemptible_usage, total_resource_limits)
                > aggressive_bound
            {
                let Some(id) = self.non_preemptible.pop_back() else { break };
                if let Some(job) = jobs.get(&id) {
                    self.non_preemptible_usage = self.non_preemptible_usage.saturating_sub(&job.resource_usage);
                    self.aggressive_usage = self.aggressive_usage.add(&job.resource_usage);
                }
                self.aggressively_preemptible.push_front(id);
            }

            let preemption_bound = fair_share_ratio * preemption_threshold;
            let combined = self.non_preemptible_usage.add(&self.aggressive_usage);
            if JobResources::dominant_resource_ratio(&combined, total_resource_limits) > preemption_bound {
                while JobResources::dominant_resource_ratio(
                    &self.non_preemptible_usage.add(&self.aggressive_usage),
                    total_resource_limits,
                ) > preemption_bound
                {
                    let Some(id) = self.aggressively_preemptible.pop_back() else { break };
                    if let Some(job) = jobs.get(&id) {
                        self.aggressive_usage = self.aggressive_usage.saturating_sub(&job.resource_usage);
                    }
                    self.preemptible.push_front(id);
                }
            }
        }
    }

    /// Classifications are applied back onto the job objects so callers can
    /// read `job.is_preemptible()` / `job.is_aggressively_preemptible()`
    /// directly.
    pub fn apply_classification(&self, jobs: &mut std::collections::HashMap<JobId, Job>) {
        for id in &self.non_preemptible {
            if let Some(job) = jobs.get_mut(id) {
                job.list_kind = Some(PreemptionListKind::NonPreemptible);
            }
        }
        for id in &self.aggressively_preemptible {
            if let Some(job) = jobs.get_mut(id) {
                job.list_kind = Some(PreemptionListKind::AggressivelyPreemptible);
            }
        }
        for id in &self.preemptible {
            if let Some(job) = jobs.get_mut(id) {
                job.list_kind = Some(PreemptionListKind::Preemptible);
            }
        }
    }
}
