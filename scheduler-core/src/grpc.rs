//! Node heartbeat gRPC service (spec §6 "Node heartbeat RPC").
//!
//! Wraps the generated `tonic` server trait around the wire-decoupled
//! [`crate::node_shard`] types: every message in `proto/scheduling.proto`
//! has a hand-written conversion to/from the domain type it mirrors, so
//! the scheduling pipeline itself never depends on `prost`/`tonic`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use tonic::{Request, Response, Status};
use tracing::warn;

use crate::job::JobState;
use crate::node_shard::pool::NodeShardPool;
use crate::node_shard::reconcile::ReportedJobStatus;
use crate::node_shard::{HeartbeatInput, HeartbeatOutput};
use crate::proto::scheduling_v1 as pb;
use crate::resources::JobResources;
use crate::tree_host::{ClusterResourceHost, TreeHost};

/// Tunables the gRPC layer needs that aren't per-shard (spec §4.8 step 5
/// thresholds, shared across every shard in the pool).
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatLimits {
    pub hard_concurrent_heartbeat_limit: usize,
    pub soft_concurrent_heartbeat_limit: usize,
}

/// Implements the generated `NodeHeartbeatService` trait by delegating to
/// a [`NodeShardPool`] for shard routing and a [`TreeHost`] for the set of
/// trees whose `nodes_filter` matches the reporting node (spec §4.9 "On
/// node updates it recomputes tree membership per node from tag filters").
pub struct SchedulerService {
    pub shards: Arc<NodeShardPool>,
    pub tree_host: Arc<TreeHost>,
    pub limits: HeartbeatLimits,
}

impl SchedulerService {
    pub fn new(shards: Arc<NodeShardPool>, tree_host: Arc<TreeHost>, limits: HeartbeatLimits) -> Self {
        Self { shards, tree_host, limits }
    }
}

fn resources_from_proto(proto: Option<pb::JobResourcesProto>) -> JobResources {
    let Some(proto) = proto else { return JobResources::zero() };
    let disk: BTreeMap<String, i64> = proto.disk.map(|d| d.medium_to_bytes.into_iter().map(|(k, v)| (k, v as i64)).collect()).unwrap_or_default();
    JobResources {
        cpu: proto.cpu_milli,
        memory: proto.memory_bytes,
        user_slots: proto.user_slots,
        gpu: proto.gpu,
        network: proto.network,
        disk,
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

/// Maps the wire `JobStateProto` enum's numeric discriminant (see
/// `proto/scheduling.proto`) to the domain `JobState`, sidestepping
/// prost's generated Rust variant names entirely since only the proto
/// file's own numbering is a stable contract.
fn job_state_from_proto(state: i32) -> JobState {
    match state {
        1 => JobState::Scheduled,
        2 => JobState::Waiting,
        3 => JobState::Running,
        4 => JobState::Finishing,
        5 => JobState::Finished,
        other => {
            warn!(state = other, "unrecognized JobStateProto value, treating as Waiting");
            JobState::Waiting
        }
    }
}

fn heartbeat_input_from_proto(req: pb::HeartbeatRequest) -> HeartbeatInput {
    HeartbeatInput {
        node_id: req.node_id,
        address: req.node_address,
        tags: req.tags,
        scheduling_segment: req.scheduling_segment,
        resource_limits: resources_from_proto(req.resource_limits),
        resource_usage: resources_from_proto(req.resource_usage),
        disk_resources: JobResources {
            disk: req.disk_resources.map(|d| d.medium_to_bytes.into_iter().map(|(k, v)| (k, v as i64)).collect()).unwrap_or_default(),
            ..JobResources::zero()
        },
        jobs: req
            .jobs
            .into_iter()
            .map(|j| ReportedJobStatus {
                job_id: j.job_id,
                operation_id: j.operation_id,
                state: job_state_from_proto(j.state),
                resource_usage: resources_from_proto(j.resource_usage),
            })
            .collect(),
        unconfirmed_jobs: req.unconfirmed_jobs,
    }
}

fn heartbeat_output_to_proto(output: HeartbeatOutput) -> pb::HeartbeatResponse {
    pb::HeartbeatResponse {
        jobs_to_start: output
            .jobs_to_start
            .into_iter()
            .map(|j| pb::JobStartDescriptor {
                job_id: j.job_id,
                operation_id: j.operation_id,
                resource_limits: Some(resources_to_proto(&j.resource_limits)),
                // Controller-agent assignment is an external collaborator's
                // concern (spec §1); left empty here.
                controller_agent_descriptor: String::new(),
            })
            .collect(),
        jobs_to_abort: output
            .jobs_to_abort
            .into_iter()
            .map(|j| pb::JobAbortDescriptor { job_id: j.job_id, abort_reason: j.abort_reason, preemption_reason: j.preemption_reason })
            .collect(),
        jobs_to_remove: output.jobs_to_remove.into_iter().map(|job_id| pb::JobRemoveDescriptor { job_id, release_flags: None }).collect(),
        jobs_to_interrupt: output
            .jobs_to_interrupt
            .into_iter()
            .map(|j| pb::JobInterruptDescriptor { job_id: j.job_id, timeout_ms: j.timeout_ms as i64, preemption_reason: j.preemption_reason })
            .collect(),
        jobs_to_confirm: output.jobs_to_confirm.into_iter().map(|job_id| pb::JobConfirmDescriptor { job_id, controller_agent_descriptor: String::new() }).collect(),
        jobs_to_store: output.jobs_to_store,
        jobs_to_fail: output.jobs_to_fail,
        scheduling_skipped: output.scheduling_skipped,
    }
}

#[tonic::async_trait]
impl pb::node_heartbeat_service_server::NodeHeartbeatService for SchedulerService {
    async fn heartbeat(&self, request: Request<pb::HeartbeatRequest>) -> Result<Response<pb::HeartbeatResponse>, Status> {
        let req = request.into_inner();
        let input = heartbeat_input_from_proto(req);
        let now = Instant::now();

        let trees = self.tree_host.trees_for_node(&input.tags).await;
        if trees.is_empty() {
            warn!(node = %input.node_id, "heartbeat from a node matching no pool tree");
        }
        let mut total_limits_by_tree = HashMap::with_capacity(trees.len());
        for tree in &trees {
            total_limits_by_tree.insert(tree.tree_id.clone(), self.shards.total_resource_limits(&tree.nodes_filter));
        }

        let output = self.shards.process_heartbeat(input, &trees, &total_limits_by_tree, self.limits.hard_concurrent_heartbeat_limit, self.limits.soft_concurrent_heartbeat_limit, now);

        Ok(Response::new(heartbeat_output_to_proto(output)))
    }
}
