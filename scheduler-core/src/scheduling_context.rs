//! Per-heartbeat scheduling context (spec §4 "Scheduling context", §6
//! `ISchedulingContext`-equivalent consumed by controllers).
//!
//! One [`SchedulingContext`] is built per node per heartbeat and handed down
//! through the tree during all three scheduling stages (spec §4.2). It is
//! the single mutable surface the state machine and operation controllers
//! touch while making decisions about that node; everything else about the
//! tree is read from the immutable snapshot.

use std::time::Instant;

use crate::job::{Job, JobId, NodeId, OperationId};
use crate::resources::JobResources;

/// Node-side input to a heartbeat: static node identity plus the limits and
/// usage as reported by the exec node (spec §6 `HeartbeatRequest`).
#[derive(Debug, Clone)]
pub struct NodeDescriptor {
    pub node_id: NodeId,
    pub address: String,
    pub tags: Vec<String>,
    pub scheduling_segment: Option<String>,
}

/// A request to start a job, returned by an operation controller (spec §6
/// `schedule_job` success case).
#[derive(Debug, Clone)]
pub struct JobStartRequest {
    pub job_id: JobId,
    pub resource_limits: JobResources,
    pub job_type: String,
    pub interruptible: bool,
    pub interrupt_timeout_ms: u64,
}

/// Per-node mutable scheduling state for the duration of one heartbeat.
/// Constructed fresh per heartbeat by the node shard (spec §4.8 step 6);
/// never shared across heartbeats or nodes.
#[derive(Debug, Clone)]
pub struct SchedulingContext {
    pub node: NodeDescriptor,
    pub resource_limits: JobResources,
    resource_usage: JobResources,
    resource_usage_discount: JobResources,
    running_jobs: Vec<Job>,
    started_jobs: Vec<Job>,
    preempted_jobs: Vec<Job>,
    now: Instant,
    next_job_seq: u64,
}

impl SchedulingContext {
    pub fn new(
        node: NodeDescriptor,
        resource_limits: JobResources,
        resource_usage: JobResources,
        running_jobs: Vec<Job>,
    ) -> Self {
        Self {
            node,
            resource_limits,
            resource_usage,
            resource_usage_discount: JobResources::zero(),
            running_jobs,
            started_jobs: Vec::new(),
            preempted_jobs: Vec::new(),
            now: Instant::now(),
            next_job_seq: 0,
        }
    }

    pub fn resource_usage(&self) -> &JobResources {
        &self.resource_usage
    }

    pub fn resource_usage_discount(&self) -> &JobResources {
        &self.resource_usage_discount
    }

    pub fn resource_usage_discount_mut(&mut self) -> &mut JobResources {
        &mut self.resource_usage_discount
    }

    pub fn reset_discount(&mut self) {
        self.resource_usage_discount = JobResources::zero();
    }

    /// Resources still free to hand to a new job: limits minus usage plus
    /// whatever has been discounted by the preemptive stage's "what if we
    /// evicted this" analysis (spec §4.2 Stage P).
    pub fn free_resources(&self) -> JobResources {
        self.resource_limits
            .saturating_sub(&self.resource_usage)
            .add(&self.resource_usage_discount)
    }

    pub fn can_start_more_jobs(&self) -> bool {
        !self.free_resources().is_zero()
    }

    pub fn can_schedule(&self, filter: &crate::config::SchedulingTagFilter) -> bool {
        filter.matches(&self.node.tags)
    }

    pub fn running_jobs(&self) -> &[Job] {
        &self.running_jobs
    }

    pub fn running_jobs_mut(&mut self) -> &mut Vec<Job> {
        &mut self.running_jobs
    }

    pub fn started_jobs(&self) -> &[Job] {
        &self.started_jobs
    }

    pub fn preempted_jobs(&self) -> &[Job] {
        &self.preempted_jobs
    }

    pub fn get_started_job(&self, job_id: &str) -> Option<&Job> {
        self.started_jobs.iter().find(|j| j.id == job_id)
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    /// Mints a locally-unique job id for this context. The node shard
    /// combines it with the node id when persisting (spec §6 "Called by a
    /// controller to generate id for new job").
    pub fn generate_job_id(&mut self, operation_id: &OperationId) -> JobId {
        self.next_job_seq += 1;
        format!("{}-{}-{}", operation_id, self.node.node_id, self.next_job_seq)
    }

    /// Commit a controller's start request: add its resources to node usage
    /// and append it to the started-jobs buffer (spec §4.2 "commit the
    /// job's resources up the chain ... append to context.started_jobs").
    /// Ancestor-chain commit happens in the tree element update, not here.
    pub fn start_job(&mut self, operation_id: OperationId, request: JobStartRequest, tree_id: &str) -> Job {
        self.resource_usage = self.resource_usage.add(&request.resource_limits);
        let mut job = Job::new(
            request.job_id,
            operation_id,
            tree_id,
            self.node.node_id.clone(),
            request.resource_limits.clone(),
            request.resource_limits,
        );
        job.job_type = request.job_type;
        job.interruptible = request.interruptible;
        job.interrupt_timeout_ms = request.interrupt_timeout_ms;
        job.state = crate::job::JobState::Scheduled;
        self.started_jobs.push(job.clone());
        job
    }

    /// Mark a running job for preemption and move it into the
    /// preempted-jobs buffer (spec §4.2 "To preempt").
    pub fn preempt_job(&mut self, mut job: Job, reason: crate::job::PreemptionReason) {
        job.mark_preempted(reason);
        self.resource_usage = self.resource_usage.saturating_sub(&job.resource_usage);
        self.running_jobs.retain(|j| j.id != job.id);
        self.preempted_jobs.push(job);
    }
}
