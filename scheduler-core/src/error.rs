//! Structured error types for the fair-share scheduling engine (spec §7).
//!
//! Three layers, mirroring the teacher's `scheduler::error` split between a
//! low-level admission reason and a top-level error enum:
//!
//! * [`ConfigError`] — pool-tree configuration is rejected outright; the
//!   previous configuration stays live (spec §4.1 "Failure", §9 "Cyclic pool
//!   graphs").
//! * [`ScheduleJobFailureReason`] — why a single controller `schedule_job`
//!   call failed (spec §6, §7).
//! * [`EngineError`] — everything else: operation admission, resource
//!   overcommit, node lifecycle, and cooperative cancellation.
//!
//! **Do not** collapse these into `anyhow::Error` at the point of origin —
//! the structured variants let `node_shard` and `tree_host` decide recovery
//! (per-operation backoff, per-node throttle, alert surfacing) without
//! string matching.

use thiserror::Error;

/// Pool-tree configuration errors (spec §4.1, §9). A config update that
/// raises one of these is rejected atomically; the tree keeps running the
/// last-good configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("pool '{0}' participates in a cycle in the declared parent graph")]
    Cycle(String),

    #[error("declared parent '{0}' does not exist")]
    UnknownParent(String),

    #[error("duplicate pool id '{0}' in configuration")]
    DuplicatePool(String),

    #[error("pool '{pool}' has invalid field '{field}': {reason}")]
    InvalidField {
        pool: String,
        field: String,
        reason: String,
    },
}

/// Non-fatal anomaly surfaced during a fair-share update (spec §4.1
/// "Failure"): the update still completes and publishes a snapshot, but the
/// anomaly is recorded so it can be raised as an alert.
#[derive(Debug, Clone, PartialEq)]
pub enum FairShareAlert {
    /// Sum of children's min-share ratios exceeds the parent's — see
    /// `fair_share::update_top_down_fair_share`.
    MinShareSumExceedsParent {
        pool: String,
        sum: f64,
        parent_recursive_min_share: f64,
    },
    /// A child's min-share ratio setting has no effect because the parent's
    /// recursive min-share is zero.
    MinShareHasNoEffect { child: String, parent: String },
}

impl std::fmt::Display for FairShareAlert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FairShareAlert::MinShareSumExceedsParent {
                pool,
                sum,
                parent_recursive_min_share,
            } => write!(
                f,
                "impossible to satisfy resource guarantees of pool '{pool}': total min share ratio of children ({sum:.6}) exceeds parent's recursive min share ({parent_recursive_min_share:.6})"
            ),
            FairShareAlert::MinShareHasNoEffect { child, parent } => write!(
                f,
                "min share ratio setting for '{child}' has no effect because min share ratio of parent pool '{parent}' is zero"
            ),
        }
    }
}

/// Why a controller's `schedule_job` call failed (spec §6, §7). Counted per
/// stage by the scheduling state machine; `Timeout` and `ResourceOvercommit`
/// trigger backoff on subsequent calls for that operation, `NoPendingJobs`
/// deactivates the operation for the remainder of the heartbeat.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScheduleJobFailureReason {
    #[error("controller schedule_job call timed out")]
    Timeout,

    #[error("controller reported a resource overcommit")]
    ResourceOvercommit,

    #[error("operation has no pending jobs")]
    NoPendingJobs,

    #[error("tentative tree declined the job")]
    TentativeTreeDeclined,

    #[error("controller failure: {0}")]
    Other(String),
}

/// Top-level engine error (spec §7). Recovery is local where possible: most
/// variants describe a single rejected operation/job, not a fatal condition.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration rejected: {0}")]
    Config(#[from] ConfigError),

    /// Raised by the accounting subsystem on operation start or job spec
    /// change. Accounting itself is out of scope (spec §1); this variant
    /// exists so the engine's admission path has somewhere to route the
    /// external collaborator's verdict.
    #[error("operation '{operation_id}' exceeds account '{account}' resource limit for {resource}")]
    AccountLimitExceeded {
        operation_id: String,
        account: String,
        resource: String,
    },

    #[error("operation '{operation_id}' rejected: pool '{pool}' is at its {kind} operation count limit ({limit})")]
    OperationLimitExceeded {
        operation_id: String,
        pool: String,
        kind: OperationLimitKind,
        limit: i64,
    },

    #[error("controller schedule_job failed for operation '{operation_id}': {reason}")]
    ScheduleJobFailure {
        operation_id: String,
        reason: ScheduleJobFailureReason,
    },

    /// Detected locally, post-commit: a just-started job pushed a node (or
    /// an ancestor pool) over its resource limits despite admission control.
    #[error("resource overcommit on node '{node}' after starting job '{job_id}'")]
    ResourceOvercommit { node: String, job_id: String },

    #[error("node '{0}' is offline")]
    NodeOffline(String),

    #[error("job '{0}' went unconfirmed past the revival abort timeout")]
    JobUnconfirmed(String),

    #[error("job '{0}' vanished from its node without a terminal status")]
    JobVanished(String),

    #[error("operation cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationLimitKind {
    MaxOperationCount,
    MaxRunningOperationCount,
}

impl std::fmt::Display for OperationLimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationLimitKind::MaxOperationCount => write!(f, "max_operation_count"),
            OperationLimitKind::MaxRunningOperationCount => write!(f, "max_running_operation_count"),
        }
    }
}
