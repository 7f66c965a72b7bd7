//! The preemption sweep run after Stage P of the scheduling state machine
//! (spec §4.2 "Preemption phase").
//!
//! Two passes over the preemptible candidates, sorted youngest-first: first
//! bring the node back within its resource limits, then evict anything
//! whose owning operation or an ancestor pool is still over its own limit.
//! Neither pass cares *why* a job became a preemption candidate — that
//! policy (tracker membership, ancestor-starvation guard,
//! `max_unpreemptible_job_count`) is the caller's job: `candidates` must
//! already be filtered to eligible jobs before they reach [`run_sweep`] (see
//! `node_shard::NodeShard::job_is_preemption_eligible`).

use crate::job::{Job, PreemptionReason};
use crate::resources::JobResources;
use crate::scheduling_context::SchedulingContext;

/// One job considered for eviction this heartbeat, with the ancestor usage
/// figures the sweep needs without re-walking the tree per candidate.
pub struct PreemptionCandidate<'a> {
    pub job: &'a Job,
    pub operation_usage: JobResources,
    pub operation_limits: JobResources,
    /// `(pool_id, usage, limits)` for every ancestor pool that declares a
    /// resource limit, nearest ancestor first.
    pub pool_ancestors: Vec<(String, JobResources, JobResources)>,
}

/// Sort candidates by `start_time` descending — youngest first, so the
/// jobs that have accrued the least "seniority" are preempted before older
/// ones (spec §4.2).
pub fn sort_youngest_first<'a>(mut candidates: Vec<PreemptionCandidate<'a>>) -> Vec<PreemptionCandidate<'a>> {
    candidates.sort_by(|a, b| b.job.start_time.cmp(&a.job.start_time));
    candidates
}

/// Run both sweeps and preempt the chosen jobs directly on `context`.
/// Returns the reasons applied, in eviction order.
pub fn run_sweep(
    context: &mut SchedulingContext,
    node_limits: &JobResources,
    candidates: Vec<PreemptionCandidate<'_>>,
) -> Vec<PreemptionReason> {
    let candidates = sort_youngest_first(candidates);
    let mut reasons = Vec::new();
    let mut remaining = Vec::with_capacity(candidates.len());

    // Sweep 1: node overflow.
    let mut iter = candidates.into_iter();
    for candidate in iter.by_ref() {
        if context.resource_usage().dominated_by(node_limits) {
            remaining.push(candidate);
            break;
        }
        preempt_candidate(context, &candidate, PreemptionReason::NodeResourceOverflow);
        reasons.push(PreemptionReason::NodeResourceOverflow);
    }
    remaining.extend(iter);

    // Sweep 2: operation / ancestor-pool overflow.
    for candidate in remaining {
        if !candidate.operation_usage.dominated_by(&candidate.operation_limits) {
            preempt_candidate(context, &candidate, PreemptionReason::OperationResourceOverflow);
            reasons.push(PreemptionReason::OperationResourceOverflow);
            continue;
        }
        if let Some((pool_id, _, _)) = candidate
            .pool_ancestors
            .iter()
            .find(|(_, usage, limits)| !usage.dominated_by(limits))
        {
            let reason = PreemptionReason::PoolResourceOverflow(pool_id.clone());
            preempt_candidate(context, &candidate, reason.clone());
            reasons.push(reason);
        }
    }

    reasons
}

fn preempt_candidate(context: &mut SchedulingContext, candidate: &PreemptionCandidate<'_>, reason: PreemptionReason) {
    if let Some(job) = context.running_jobs().iter().find(|j| j.id == candidate.job.id).cloned() {
        context.preempt_job(job, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduling_context::NodeDescriptor;
    use std::time::{Duration, Instant};

    fn job_at(id: &str, cpu: i64, age_secs: u64) -> Job {
        let mut j = Job::new(
            id.into(),
            "op1".into(),
            "tree1",
            "node1".into(),
            JobResources {
                cpu,
                ..Default::default()
            },
            JobResources {
                cpu,
                ..Default::default()
            },
        );
        j.start_time = Instant::now() - Duration::from_secs(age_secs);
        j
    }

    fn ctx_with_jobs(jobs: Vec<Job>, usage_cpu: i64, limit_cpu: i64) -> SchedulingContext {
        let mut ctx = SchedulingContext::new(
            NodeDescriptor {
                node_id: "n1".into(),
                address: "n1.local".into(),
                tags: vec![],
                scheduling_segment: None,
            },
            JobResources {
                cpu: limit_cpu,
                ..Default::default()
            },
            JobResources {
                cpu: usage_cpu,
                ..Default::default()
            },
            jobs,
        );
        ctx.reset_discount();
        ctx
    }

    #[test]
    fn sort_youngest_first_orders_by_start_time_descending() {
        let young = job_at("young", 1, 1);
        let old = job_at("old", 1, 100);
        let candidates = vec![
            PreemptionCandidate {
                job: &old,
                operation_usage: JobResources::zero(),
                operation_limits: JobResources::zero(),
                pool_ancestors: vec![],
            },
            PreemptionCandidate {
                job: &young,
                operation_usage: JobResources::zero(),
                operation_limits: JobResources::zero(),
                pool_ancestors: vec![],
            },
        ];
        let sorted = sort_youngest_first(candidates);
        assert_eq!(sorted[0].job.id, "young");
    }

    #[test]
    fn node_overflow_sweep_preempts_until_within_limits() {
        let j1 = job_at("j1", 6, 10);
        let j2 = job_at("j2", 6, 5);
        let mut ctx = ctx_with_jobs(vec![j1.clone(), j2.clone()], 12, 10);
        let candidates = vec![
            PreemptionCandidate {
                job: &j1,
                operation_usage: JobResources {
                    cpu: 6,
                    ..Default::default()
                },
                operation_limits: JobResources {
                    cpu: 100,
                    ..Default::default()
                },
                pool_ancestors: vec![],
            },
            PreemptionCandidate {
                job: &j2,
                operation_usage: JobResources {
                    cpu: 6,
                    ..Default::default()
                },
                operation_limits: JobResources {
                    cpu: 100,
                    ..Default::default()
                },
                pool_ancestors: vec![],
            },
        ];
        let node_limits = JobResources {
            cpu: 10,
            ..Default::default()
        };
        let reasons = run_sweep(&mut ctx, &node_limits, candidates);
        assert_eq!(reasons, vec![PreemptionReason::NodeResourceOverflow]);
        assert!(ctx.resource_usage().dominated_by(&node_limits));
        assert_eq!(ctx.preempted_jobs().len(), 1);
        // youngest (j2, age 5s) preempted first.
        assert_eq!(ctx.preempted_jobs()[0].id, "j2");
    }

    #[test]
    fn operation_overflow_sweep_preempts_when_node_already_within_limits() {
        let j1 = job_at("j1", 4, 10);
        let mut ctx = ctx_with_jobs(vec![j1.clone()], 4, 10);
        let candidates = vec![PreemptionCandidate {
            job: &j1,
            operation_usage: JobResources {
                cpu: 4,
                ..Default::default()
            },
            operation_limits: JobResources {
                cpu: 2,
                ..Default::default()
            },
            pool_ancestors: vec![],
        }];
        let node_limits = JobResources {
            cpu: 10,
            ..Default::default()
        };
        let reasons = run_sweep(&mut ctx, &node_limits, candidates);
        assert_eq!(reasons, vec![PreemptionReason::OperationResourceOverflow]);
    }

    #[test]
    fn no_overflow_preempts_nothing() {
        let j1 = job_at("j1", 4, 10);
        let mut ctx = ctx_with_jobs(vec![j1.clone()], 4, 10);
        let candidates = vec![PreemptionCandidate {
            job: &j1,
            operation_usage: JobResources {
                cpu: 4,
                ..Default::default()
            },
            operation_limits: JobResources {
                cpu: 10,
                ..Default::default()
            },
            pool_ancestors: vec![],
        }];
        let node_limits = JobResources {
            cpu: 10,
            ..Default::default()
        };
        let reasons = run_sweep(&mut ctx, &node_limits, candidates);
        assert!(reasons.is_empty());
    }
}
