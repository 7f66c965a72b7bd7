//! Per-node state owned by a [`super::NodeShard`] (spec §4.8 "The shard
//! holds: `id -> ExecNode` with lease, heartbeat-lease, resource
//! limits/usage, disk resources, tag set, scheduling segment, ongoing-
//! heartbeat flag, pending-unregistration flag").

use std::time::{Duration, Instant};

use crate::job::NodeId;
use crate::resources::JobResources;

/// Registration vs. heartbeat leases expire independently (spec §5
/// "Timeouts & cancellation"); registration is the longer-lived lease, the
/// heartbeat lease is renewed on every successful RPC.
#[derive(Debug, Clone)]
pub struct ExecNode {
    pub node_id: NodeId,
    pub address: String,
    pub tags: Vec<String>,
    pub scheduling_segment: Option<String>,
    pub resource_limits: JobResources,
    pub resource_usage: JobResources,
    pub disk_resources: JobResources,
    pub registration_lease_until: Instant,
    pub heartbeat_lease_until: Instant,
    /// Set for the duration of an in-flight heartbeat; a second
    /// concurrent heartbeat for the same node is refused (spec §4.8 step
    /// 2 "refuse if a heartbeat is already in flight for this node").
    pub ongoing_heartbeat: bool,
    pub pending_unregistration: bool,
    pub offline: bool,
}

impl ExecNode {
    pub fn register(
        node_id: NodeId,
        address: String,
        tags: Vec<String>,
        scheduling_segment: Option<String>,
        now: Instant,
        registration_lease: Duration,
        heartbeat_lease: Duration,
    ) -> Self {
        Self {
            node_id,
            address,
            tags,
            scheduling_segment,
            resource_limits: JobResources::zero(),
            resource_usage: JobResources::zero(),
            disk_resources: JobResources::zero(),
            registration_lease_until: now + registration_lease,
            heartbeat_lease_until: now + heartbeat_lease,
            ongoing_heartbeat: false,
            pending_unregistration: false,
            offline: false,
        }
    }

    /// Spec §5 "Node registration lease (longer) and heartbeat lease
    /// (shorter) expire independently". Called at the start of a
    /// successful heartbeat.
    pub fn renew_leases(&mut self, now: Instant, registration_lease: Duration, heartbeat_lease: Duration) {
        self.registration_lease_until = now + registration_lease;
        self.heartbeat_lease_until = now + heartbeat_lease;
        self.offline = false;
    }

    /// Spec §5 "expiry transitions the node to Offline scheduler-state and
    /// aborts its jobs". The node shard's periodic sweep calls this for
    /// every node not currently mid-heartbeat.
    pub fn leases_expired(&self, now: Instant) -> bool {
        now > self.registration_lease_until || now > self.heartbeat_lease_until
    }

    /// Spec §4.8 step 3 "if user-slots dropped to zero, abort all jobs at
    /// that node".
    pub fn has_no_user_slots(&self) -> bool {
        self.resource_limits.user_slots == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(now: Instant) -> ExecNode {
        ExecNode::register(
            "n1".into(),
            "n1.local".into(),
            vec!["default".into()],
            None,
            now,
            Duration::from_secs(300),
            Duration::from_secs(30),
        )
    }

    #[test]
    fn fresh_node_is_not_expired() {
        let now = Instant::now();
        let n = node(now);
        assert!(!n.leases_expired(now));
    }

    #[test]
    fn heartbeat_lease_expires_before_registration_lease() {
        let now = Instant::now();
        let n = node(now);
        assert!(n.leases_expired(now + Duration::from_secs(31)));
    }

    #[test]
    fn renew_leases_clears_offline_and_extends_both_leases() {
        let now = Instant::now();
        let mut n = node(now);
        n.offline = true;
        let later = now + Duration::from_secs(20);
        n.renew_leases(later, Duration::from_secs(300), Duration::from_secs(30));
        assert!(!n.offline);
        assert!(!n.leases_expired(later + Duration::from_secs(29)));
    }
}
