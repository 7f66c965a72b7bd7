//! Operation controller interface (spec §6 "Controller interface
//! (consumed)").
//!
//! The engine never knows what kind of job an operation runs; it only
//! drives an [`OperationController`] trait object through the scheduling
//! stages and reacts to job lifecycle callbacks. Modeled on the teacher's
//! pattern of a thin trait at the engine/workload boundary, implemented
//! once per job-type family outside this crate.

use std::fmt;

use crate::error::ScheduleJobFailureReason;
use crate::job::{Job, JobId};
use crate::resources::JobResources;
use crate::scheduling_context::SchedulingContext;

/// Why a running job was aborted outside of the normal preemption path
/// (spec §6 "abort_job").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    NodeOffline,
    JobVanished,
    SchedulerCancelled,
    Other(String),
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::NodeOffline => write!(f, "node offline"),
            AbortReason::JobVanished => write!(f, "job vanished"),
            AbortReason::SchedulerCancelled => write!(f, "cancelled by scheduler"),
            AbortReason::Other(s) => write!(f, "{s}"),
        }
    }
}

/// Terminal-state summary handed to a controller's completion callbacks
/// (spec §6 "on_job_completed / on_job_failed").
#[derive(Debug, Clone)]
pub struct JobSummary {
    pub job_id: JobId,
    pub resource_usage: JobResources,
    pub controller_epoch: u64,
}

/// Outcome of a controller's attempt to fill one scheduling slot (spec §4.2
/// `BeginScheduleJob`/`ScheduleJob`).
#[derive(Debug, Clone)]
pub enum ScheduleJobOutcome {
    /// The controller picked a job and wants it started with these
    /// resources; the caller mints the job id via
    /// [`SchedulingContext::generate_job_id`].
    Start {
        resource_limits: JobResources,
        job_type: String,
        interruptible: bool,
        interrupt_timeout_ms: u64,
    },
    /// The controller has no job that fits and won't have one this round
    /// (spec §4.2 Stage N "no more operations with pending jobs").
    NoPendingJobs,
    Failed(ScheduleJobFailureReason),
}

/// The engine/workload seam (spec §6). One implementation per job-type
/// family; the engine drives every operation through the same trait object
/// regardless of what it runs.
pub trait OperationController: Send + Sync {
    /// Attempt to fill one scheduling slot on the node behind `context`
    /// (spec §4.2). Must not mutate `context` directly; the caller commits
    /// the returned outcome.
    fn schedule_job(&self, context: &SchedulingContext, available_resources: &JobResources) -> ScheduleJobOutcome;

    /// A running job is being preempted or force-aborted outside of a
    /// normal completion (spec §6 "abort_job").
    fn abort_job(&self, job_id: &JobId, reason: AbortReason);

    fn on_job_started(&self, job: &Job);
    fn on_job_completed(&self, summary: &JobSummary);
    fn on_job_failed(&self, summary: &JobSummary);

    /// A job this controller never confirmed as started was aborted by the
    /// node shard during reconciliation (spec §5 "unconfirmed jobs").
    fn on_non_scheduled_job_aborted(&self, job_id: &JobId, reason: AbortReason, tree_id: &str, epoch: u64);

    /// Aggregate resource demand across all of this operation's pending and
    /// running jobs (spec §3 "resource_demand").
    fn get_needed_resources(&self) -> JobResources;

    /// Number of jobs this operation still wants started (spec §3
    /// "pending_job_count").
    fn get_pending_job_count(&self) -> i64;

    /// Smallest per-job resource request across all pending jobs, used by
    /// the scheduling state machine to decide whether an element can ever
    /// fit in the resources currently free (spec §4.2 "min needed
    /// resources" check, §9 "best allocation ratio").
    fn get_min_needed_job_resources(&self) -> Vec<JobResources>;
}
