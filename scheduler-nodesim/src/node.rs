//! Per-node simulated state: the exec-node side of the heartbeat contract
//! (spec §6), reduced to just enough bookkeeping to drive the scheduler
//! through a realistic job lifecycle (§3 "Lifecycle").

use std::collections::HashMap;
use std::time::{Duration, Instant};

use scheduler_core::proto::scheduling_v1 as pb;
use scheduler_core::resources::JobResources;

/// Local view of one job the scheduler has started on this simulated node.
#[derive(Debug, Clone)]
pub struct SimulatedJob {
    pub operation_id: String,
    pub resource_usage: JobResources,
    pub started_at: Instant,
    /// Set once the node has decided this job's simulated runtime elapsed;
    /// the node reports `JOB_STATE_FINISHING` for one heartbeat before
    /// dropping it (mirroring spec §3 "a terminal status arrives ... then
    /// Finished ... then released").
    pub finishing: bool,
}

/// Config for one simulated node (deserialized from the fleet YAML).
#[derive(Debug, Clone, serde::Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub scheduling_segment: Option<String>,
    #[serde(default)]
    pub cpu: i64,
    #[serde(default)]
    pub memory: i64,
    #[serde(default)]
    pub user_slots: i64,
    #[serde(default)]
    pub gpu: i64,
    #[serde(default)]
    pub network: i64,
}

impl NodeSpec {
    pub fn resource_limits(&self) -> JobResources {
        JobResources {
            cpu: self.cpu,
            memory: self.memory,
            user_slots: self.user_slots,
            gpu: self.gpu,
            network: self.network,
            disk: Default::default(),
        }
    }
}

/// Mutable per-node simulation state carried across heartbeats.
pub struct SimulatedNode {
    pub spec: NodeSpec,
    pub jobs: HashMap<String, SimulatedJob>,
    pub job_duration: Duration,
}

impl SimulatedNode {
    pub fn new(spec: NodeSpec, job_duration: Duration) -> Self {
        Self { spec, jobs: HashMap::new(), job_duration }
    }

    pub fn resource_usage(&self) -> JobResources {
        self.jobs.values().fold(JobResources::zero(), |acc, j| acc.add(&j.resource_usage))
    }

    /// Advance simulated job runtimes and build this heartbeat's job
    /// status list (spec §6 `HeartbeatRequest.jobs`).
    pub fn tick_and_report(&mut self, now: Instant) -> Vec<pb::JobStatus> {
        let mut statuses = Vec::with_capacity(self.jobs.len());
        for (job_id, job) in self.jobs.iter_mut() {
            if !job.finishing && now.duration_since(job.started_at) >= self.job_duration {
                job.finishing = true;
            }
            let state = if job.finishing { 4 /* JOB_STATE_FINISHING */ } else { 3 /* JOB_STATE_RUNNING */ };
            statuses.push(pb::JobStatus {
                job_id: job_id.clone(),
                operation_id: job.operation_id.clone(),
                state,
                resource_usage: Some(resources_to_proto(&job.resource_usage)),
                statistics: Vec::new(),
            });
        }
        statuses
    }

    pub fn build_request(&mut self, now: Instant) -> pb::HeartbeatRequest {
        let jobs = self.tick_and_report(now);
        pb::HeartbeatRequest {
            node_id: self.spec.id.clone(),
            node_address: self.spec.address.clone().unwrap_or_else(|| format!("{}.local", self.spec.id)),
            resource_limits: Some(resources_to_proto(&self.spec.resource_limits())),
            resource_usage: Some(resources_to_proto(&self.resource_usage())),
            disk_resources: Some(pb::DiskResources::default()),
            jobs,
            unconfirmed_jobs: Vec::new(),
            confirmed_job_count: self.jobs.len() as i32,
            job_reporter_write_failures_count: None,
            job_reporter_queue_is_too_large: None,
            tags: self.spec.tags.clone(),
            scheduling_segment: self.spec.scheduling_segment.clone(),
        }
    }

    /// Apply a heartbeat response: start newly-assigned jobs, drop
    /// aborted/removed ones (spec §6 `HeartbeatResponse`).
    pub fn apply_response(&mut self, response: &pb::HeartbeatResponse, now: Instant) {
        for start in &response.jobs_to_start {
            let usage = start.resource_limits.as_ref().map(resources_from_proto).unwrap_or_default();
            self.jobs.insert(
                start.job_id.clone(),
                SimulatedJob { operation_id: start.operation_id.clone(), resource_usage: usage, started_at: now, finishing: false },
            );
        }
        for abort in &response.jobs_to_abort {
            self.jobs.remove(&abort.job_id);
        }
        for remove in &response.jobs_to_remove {
            self.jobs.remove(&remove.job_id);
        }
        for interrupt in &response.jobs_to_interrupt {
            if let Some(job) = self.jobs.get_mut(&interrupt.job_id) {
                job.finishing = true;
            }
        }
    }
}

fn resources_to_proto(res: &JobResources) -> pb::JobResourcesProto {
    pb::JobResourcesProto {
        cpu_milli: res.cpu,
        memory_bytes: res.memory,
        user_slots: res.user_slots,
        gpu: res.gpu,
        network: res.network,
        disk: Some(pb::DiskResources { medium_to_bytes: res.disk.iter().map(|(k, v)| (k.clone(), *v as u64)).collect() }),
    }
}

fn resources_from_proto(proto: &pb::JobResourcesProto) -> JobResources {
    JobResources {
        cpu: proto.cpu_milli,
        memory: proto.memory_bytes,
        user_slots: proto.user_slots,
        gpu: proto.gpu,
        network: proto.network,
        disk: proto.disk.as_ref().map(|d| d.medium_to_bytes.iter().map(|(k, v)| (k.clone(), *v as i64)).collect()).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> NodeSpec {
        NodeSpec { id: "n1".into(), address: None, tags: vec!["default".into()], scheduling_segment: None, cpu: 1000, memory: 1 << 30, user_slots: 4, gpu: 0, network: 0 }
    }

    #[test]
    fn tick_and_report_transitions_to_finishing_after_duration() {
        let mut node = SimulatedNode::new(spec(), Duration::from_millis(10));
        let started = Instant::now() - Duration::from_millis(50);
        node.jobs.insert("j1".into(), SimulatedJob { operation_id: "op1".into(), resource_usage: JobResources { cpu: 100, ..Default::default() }, started_at: started, finishing: false });
        let statuses = node.tick_and_report(Instant::now());
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].state, 4);
    }

    #[test]
    fn apply_response_starts_and_removes_jobs() {
        let mut node = SimulatedNode::new(spec(), Duration::from_secs(60));
        let response = pb::HeartbeatResponse {
            jobs_to_start: vec![pb::JobStartDescriptor {
                job_id: "j1".into(),
                operation_id: "op1".into(),
                resource_limits: Some(pb::JobResourcesProto { cpu_milli: 100, ..Default::default() }),
                controller_agent_descriptor: String::new(),
            }],
            ..Default::default()
        };
        node.apply_response(&response, Instant::now());
        assert_eq!(node.jobs.len(), 1);
        assert_eq!(node.resource_usage().cpu, 100);

        let remove = pb::HeartbeatResponse { jobs_to_remove: vec![pb::JobRemoveDescriptor { job_id: "j1".into(), release_flags: None }], ..Default::default() };
        node.apply_response(&remove, Instant::now());
        assert!(node.jobs.is_empty());
    }
}
