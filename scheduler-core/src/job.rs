//! Job lifecycle data (spec §3 "Job").

use std::time::Instant;

use crate::resources::JobResources;

pub type JobId = String;
pub type OperationId = String;
pub type NodeId = String;

/// Lifecycle state of a job, as tracked by the node shard and reflected to
/// the scheduling context (spec §3 "Lifecycle").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Chosen by a controller during `BeginScheduleJob`, not yet confirmed
    /// by any heartbeat from its node.
    Scheduled,
    /// Confirmed present at the node but not yet reported running.
    Waiting,
    /// Running and counted against resource usage.
    Running,
    /// A terminal status arrived; awaiting controller acknowledgment.
    Finishing,
    /// Acknowledged by the controller; ready for release.
    Finished,
}

/// Which of an operation's three preemptible-job lists (spec §4.6) a running
/// job currently sits in. `None` until the operation's preemptible tracker
/// has classified it at least once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreemptionListKind {
    NonPreemptible,
    AggressivelyPreemptible,
    Preemptible,
}

/// Why a job was marked for preemption (spec §4.2 "To preempt").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreemptionReason {
    NodeResourceOverflow,
    OperationResourceOverflow,
    PoolResourceOverflow(String),
    /// "started job J of operation O" — an inciting job from the preemptive
    /// scheduling stage bumped this one.
    MakesRoomFor { job_id: JobId, operation_id: OperationId },
}

impl std::fmt::Display for PreemptionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PreemptionReason::NodeResourceOverflow => write!(f, "node resource overflow"),
            PreemptionReason::OperationResourceOverflow => write!(f, "operation resource overflow"),
            PreemptionReason::PoolResourceOverflow(pool) => write!(f, "pool '{pool}' resource overflow"),
            PreemptionReason::MakesRoomFor { job_id, operation_id } => {
                write!(f, "started job '{job_id}' of operation '{operation_id}'")
            }
        }
    }
}

/// A single running (or about-to-run) job.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub operation_id: OperationId,
    pub tree_id: String,
    pub resource_usage: JobResources,
    pub resource_limits: JobResources,
    pub job_type: String,
    pub start_time: Instant,
    pub node: NodeId,
    pub state: JobState,
    /// Job-type-level interruptibility — whether a graceful interrupt (vs.
    /// a hard abort) is possible at all.
    pub interruptible: bool,
    pub interrupt_timeout_ms: u64,
    pub interrupt_reason: Option<String>,
    pub interrupt_deadline: Option<Instant>,
    pub preempted: bool,
    pub preemption_reason: Option<PreemptionReason>,
    pub controller_epoch: u64,
    pub incarnation_id: String,
    /// Which preemptible list this job currently sits in, maintained by the
    /// owning operation's `PreemptibleJobTracker` (spec §4.6). `None` for a
    /// job not yet classified (e.g. just started, before the next tracker
    /// pass runs).
    pub list_kind: Option<PreemptionListKind>,
}

impl Job {
    pub fn new(
        id: JobId,
        operation_id: OperationId,
        tree_id: impl Into<String>,
        node: NodeId,
        resource_usage: JobResources,
        resource_limits: JobResources,
    ) -> Self {
        Self {
            id,
            operation_id,
            tree_id: tree_id.into(),
            resource_usage,
            resource_limits,
            job_type: String::new(),
            start_time: Instant::now(),
            node,
            state: JobState::Scheduled,
            interruptible: false,
            interrupt_timeout_ms: 0,
            interrupt_reason: None,
            interrupt_deadline: None,
            preempted: false,
            preemption_reason: None,
            controller_epoch: 0,
            incarnation_id: String::new(),
            list_kind: None,
        }
    }

    pub fn is_preemptible(&self) -> bool {
        matches!(self.list_kind, Some(PreemptionListKind::Preemptible))
    }

    pub fn is_aggressively_preemptible(&self) -> bool {
        matches!(
            self.list_kind,
            Some(PreemptionListKind::Preemptible) | Some(PreemptionListKind::AggressivelyPreemptible)
        )
    }

    /// Mark this job for preemption (spec §4.2 "To preempt"): if
    /// interruptible with a positive timeout, schedule a graceful interrupt;
    /// otherwise it will be hard-aborted on the next heartbeat response.
    pub fn mark_preempted(&mut self, reason: PreemptionReason) {
        self.preempted = true;
        if self.interruptible && self.interrupt_timeout_ms > 0 {
            self.interrupt_deadline =
                Some(Instant::now() + std::time::Duration::from_millis(self.interrupt_timeout_ms));
            self.interrupt_reason = Some(reason.to_string());
        }
        self.preemption_reason = Some(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(
            "j1".into(),
            "op1".into(),
            "tree1",
            "node1".into(),
            JobResources::zero(),
            JobResources::zero(),
        )
    }

    #[test]
    fn new_job_starts_unclassified_and_not_preempted() {
        let j = job();
        assert!(!j.is_preemptible());
        assert!(!j.is_aggressively_preemptible());
        assert!(!j.preempted);
    }

    #[test]
    fn preemptible_list_membership_is_aggressive_too() {
        let mut j = job();
        j.list_kind = Some(PreemptionListKind::Preemptible);
        assert!(j.is_preemptible());
        assert!(j.is_aggressively_preemptible());

        j.list_kind = Some(PreemptionListKind::AggressivelyPreemptible);
        assert!(!j.is_preemptible());
        assert!(j.is_aggressively_preemptible());

        j.list_kind = Some(PreemptionListKind::NonPreemptible);
        assert!(!j.is_preemptible());
        assert!(!j.is_aggressively_preemptible());
    }

    #[test]
    fn mark_preempted_schedules_interrupt_when_interruptible() {
        let mut j = job();
        j.interruptible = true;
        j.interrupt_timeout_ms = 5_000;
        j.mark_preempted(PreemptionReason::NodeResourceOverflow);
        assert!(j.preempted);
        assert!(j.interrupt_deadline.is_some());
        assert!(j.interrupt_reason.is_some());
    }

    #[test]
    fn mark_preempted_without_interrupt_timeout_skips_deadline() {
        let mut j = job();
        j.interruptible = false;
        j.mark_preempted(PreemptionReason::OperationResourceOverflow);
        assert!(j.preempted);
        assert!(j.interrupt_deadline.is_none());
    }
}
