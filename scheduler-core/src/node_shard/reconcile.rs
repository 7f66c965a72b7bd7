//! Per-heartbeat job reconciliation (spec §4.8 step 4 "Reconcile reported
//! jobs: for each JobStatus in the request, match against the shard's job
//! registry; transition states; detect missing jobs; abort unconfirmed
//! jobs after the configured timeout; remove recently-finished jobs after
//! their TTL").

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::job::{Job, JobId, JobState, NodeId, OperationId};
use crate::resources::JobResources;

/// One job status line from a node's heartbeat request (spec §6
/// `HeartbeatRequest.jobs`), decoupled from the wire `JobStatus` proto
/// message so the reconciler can be unit-tested without a tonic
/// dependency.
#[derive(Debug, Clone)]
pub struct ReportedJobStatus {
    pub job_id: JobId,
    pub operation_id: OperationId,
    pub state: JobState,
    pub resource_usage: JobResources,
}

/// Outcome of reconciling one heartbeat's reported jobs against the
/// shard's registry (spec §4.8 step 4).
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Jobs confirmed present this heartbeat; the registry already
    /// reflects their new state and usage.
    pub confirmed: Vec<JobId>,
    /// Jobs the node reported finished for the first time; caller should
    /// notify the owning controller.
    pub newly_finished: Vec<JobId>,
    /// Known running/waiting jobs absent from this heartbeat long enough
    /// to be considered vanished (spec §7 "NodeOffline / Unconfirmed /
    /// Vanished").
    pub vanished: Vec<JobId>,
    /// Unconfirmed (revived or newly-scheduled-but-not-yet-seen) jobs past
    /// their abort timeout (spec §5 "job_revival_abort_timeout").
    pub abort_unconfirmed: Vec<JobId>,
    /// Recently-finished jobs past their TTL, ready for release (spec §3
    /// "Finished ... then released").
    pub release: Vec<JobId>,
}

/// Per-job bookkeeping the reconciler needs across heartbeats: when a job
/// first went unaccounted-for, and when it first reported a terminal
/// status. Lives in the node shard alongside the job registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobTimers {
    pub first_unconfirmed_at: Option<Instant>,
    pub finished_at: Option<Instant>,
}

/// Reconcile one heartbeat's reported jobs against the shard's known job
/// registry for this node (spec §4.8 step 4). Mutates `jobs` and `timers`
/// in place; returns the actions the caller (the node shard) still needs
/// to take against the tree/controllers.
#[allow(clippy::too_many_arguments)]
pub fn reconcile(
    node_id: &NodeId,
    reported: &[ReportedJobStatus],
    unconfirmed_ids: &[JobId],
    jobs: &mut HashMap<JobId, Job>,
    timers: &mut HashMap<JobId, JobTimers>,
    now: Instant,
    unconfirmed_timeout: Duration,
    finished_job_ttl: Duration,
    job_revival_abort_timeout: Duration,
) -> ReconcileOutcome {
    let mut outcome = ReconcileOutcome::default();
    let reported_ids: HashSet<&JobId> = reported.iter().map(|r| &r.job_id).collect();

    for status in reported {
        let Some(job) = jobs.get_mut(&status.job_id) else { continue };
        job.resource_usage = status.resource_usage.clone();
        timers.entry(status.job_id.clone()).or_default().first_unconfirmed_at = None;

        let already_terminal = matches!(job.state, JobState::Finishing | JobState::Finished);
        let reported_terminal = matches!(status.state, JobState::Finishing | JobState::Finished);
        job.state = status.state;
        if reported_terminal && !already_terminal {
            timers.entry(status.job_id.clone()).or_default().finished_at = Some(now);
            outcome.newly_finished.push(status.job_id.clone());
        }
        outcome.confirmed.push(status.job_id.clone());
    }

    // Known jobs at this node that this heartbeat neither reported nor
    // listed as unconfirmed (spec §7 "Vanished") or that have sat
    // unconfirmed past the timeout (spec §5 "job_revival_abort_timeout").
    let unconfirmed_set: HashSet<&JobId> = unconfirmed_ids.iter().collect();
    for (job_id, job) in jobs.iter() {
        if &job.node != node_id || reported_ids.contains(job_id) {
            continue;
        }
        let timer = timers.entry(job_id.clone()).or_default();
        if timer.first_unconfirmed_at.is_none() {
            timer.first_unconfirmed_at = Some(now);
        }
        let waited = timer.first_unconfirmed_at.map(|since| now.duration_since(since)).unwrap_or_default();

        if unconfirmed_set.contains(job_id) {
            if waited >= job_revival_abort_timeout || waited >= unconfirmed_timeout {
                outcome.abort_unconfirmed.push(job_id.clone());
            }
        } else if matches!(job.state, JobState::Running | JobState::Waiting) && waited >= unconfirmed_timeout {
            outcome.vanished.push(job_id.clone());
        }
    }

    for (job_id, timer) in timers.iter() {
        let Some(finished_at) = timer.finished_at else { continue };
        if now.duration_since(finished_at) < finished_job_ttl {
            continue;
        }
        if let Some(job) = jobs.get(job_id) {
            if matches!(job.state, JobState::Finishing | JobState::Finished) {
                outcome.release.push(job_id.clone());
            }
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &str, node: &str, state: JobState) -> Job {
        let mut j = Job::new(id.into(), "op1".into(), "tree1", node.into(), JobResources::zero(), JobResources::zero());
        j.state = state;
        j
    }

    #[test]
    fn reported_job_transitions_to_running() {
        let mut jobs = HashMap::new();
        jobs.insert("j1".to_string(), job("j1", "n1", JobState::Waiting));
        let mut timers = HashMap::new();

        let reported = vec![ReportedJobStatus {
            job_id: "j1".into(),
            operation_id: "op1".into(),
            state: JobState::Running,
            resource_usage: JobResources { cpu: 4, ..Default::default() },
        }];
        let outcome = reconcile(
            &"n1".to_string(),
            &reported,
            &[],
            &mut jobs,
            &mut timers,
            Instant::now(),
            Duration::from_secs(60),
            Duration::from_secs(60),
            Duration::from_secs(120),
        );
        assert_eq!(outcome.confirmed, vec!["j1".to_string()]);
        assert_eq!(jobs["j1"].state, JobState::Running);
        assert_eq!(jobs["j1"].resource_usage.cpu, 4);
    }

    #[test]
    fn finishing_status_reported_once() {
        let mut jobs = HashMap::new();
        jobs.insert("j1".to_string(), job("j1", "n1", JobState::Running));
        let mut timers = HashMap::new();
        let now = Instant::now();

        let reported = vec![ReportedJobStatus {
            job_id: "j1".into(),
            operation_id: "op1".into(),
            state: JobState::Finishing,
            resource_usage: JobResources::zero(),
        }];
        let outcome = reconcile(&"n1".to_string(), &reported, &[], &mut jobs, &mut timers, now, Duration::from_secs(60), Duration::from_secs(60), Duration::from_secs(120));
        assert_eq!(outcome.newly_finished, vec!["j1".to_string()]);

        // second heartbeat still reporting Finishing must not re-fire.
        let outcome2 = reconcile(&"n1".to_string(), &reported, &[], &mut jobs, &mut timers, now, Duration::from_secs(60), Duration::from_secs(60), Duration::from_secs(120));
        assert!(outcome2.newly_finished.is_empty());
    }

    #[test]
    fn missing_running_job_becomes_vanished_after_timeout() {
        let mut jobs = HashMap::new();
        jobs.insert("j1".to_string(), job("j1", "n1", JobState::Running));
        let mut timers = HashMap::new();
        let t0 = Instant::now();

        let outcome = reconcile(&"n1".to_string(), &[], &[], &mut jobs, &mut timers, t0, Duration::from_secs(30), Duration::from_secs(60), Duration::from_secs(120));
        assert!(outcome.vanished.is_empty(), "timer just started");

        let t1 = t0 + Duration::from_secs(31);
        let outcome = reconcile(&"n1".to_string(), &[], &[], &mut jobs, &mut timers, t1, Duration::from_secs(30), Duration::from_secs(60), Duration::from_secs(120));
        assert_eq!(outcome.vanished, vec!["j1".to_string()]);
    }

    #[test]
    fn unconfirmed_job_aborted_after_revival_timeout() {
        let mut jobs = HashMap::new();
        jobs.insert("j1".to_string(), job("j1", "n1", JobState::Scheduled));
        let mut timers = HashMap::new();
        let t0 = Instant::now();

        let outcome = reconcile(&"n1".to_string(), &[], &["j1".to_string()], &mut jobs, &mut timers, t0, Duration::from_secs(600), Duration::from_secs(60), Duration::from_secs(10));
        assert!(outcome.abort_unconfirmed.is_empty());

        let t1 = t0 + Duration::from_secs(11);
        let outcome = reconcile(&"n1".to_string(), &[], &["j1".to_string()], &mut jobs, &mut timers, t1, Duration::from_secs(600), Duration::from_secs(60), Duration::from_secs(10));
        assert_eq!(outcome.abort_unconfirmed, vec!["j1".to_string()]);
    }

    #[test]
    fn finished_job_released_after_ttl() {
        let mut jobs = HashMap::new();
        jobs.insert("j1".to_string(), job("j1", "n1", JobState::Running));
        let mut timers = HashMap::new();
        let t0 = Instant::now();

        let reported = vec![ReportedJobStatus {
            job_id: "j1".into(),
            operation_id: "op1".into(),
            state: JobState::Finished,
            resource_usage: JobResources::zero(),
        }];
        reconcile(&"n1".to_string(), &reported, &[], &mut jobs, &mut timers, t0, Duration::from_secs(60), Duration::from_secs(5), Duration::from_secs(120));
        jobs.get_mut("j1").unwrap().state = JobState::Finished;

        let t1 = t0 + Duration::from_secs(6);
        let outcome = reconcile(&"n1".to_string(), &reported, &[], &mut jobs, &mut timers, t1, Duration::from_secs(60), Duration::from_secs(5), Duration::from_secs(120));
        assert_eq!(outcome.release, vec!["j1".to_string()]);
    }
}
