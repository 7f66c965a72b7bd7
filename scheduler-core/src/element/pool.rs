//! Pool pool-tree element (spec §3 "Pool element").

use crate::element::attributes::PersistentAttributes;
use crate::element::CommonElementConfig;

/// Scheduling discipline for a composite element's children (spec §3, §4.1
/// step 4, §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulingMode {
    #[default]
    FairShare,
    Fifo,
}

/// One key in a FIFO pool's lexicographic sort order (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FifoSortParameter {
    Weight,
    StartTime,
    PendingJobCount,
}

#[derive(Debug, Clone)]
pub struct PoolElement {
    pub common: CommonElementConfig,
    pub mode: SchedulingMode,
    pub fifo_sort_parameters: Vec<FifoSortParameter>,
    pub forbid_immediate_operations: bool,
    pub max_operation_count: Option<i64>,
    pub max_running_operation_count: Option<i64>,
    /// Created on demand (a per-user default pool) rather than from
    /// configuration; removed when empty (spec §3 "Lifecycle").
    pub ephemeral: bool,
    pub owning_user: Option<String>,
    pub children: Vec<String>,
    pub persistent: PersistentAttributes,
}

impl PoolElement {
    pub fn new(id: impl Into<String>, parent: impl Into<String>) -> Self {
        Self {
            common: CommonElementConfig {
                id: id.into(),
                parent: Some(parent.into()),
                weight: 1.0,
                min_share_ratio: 0.0,
                max_share_ratio: 1.0,
                min_share_resources: Default::default(),
                resource_limits: None,
                scheduling_tag_filter: None,
                starvation: Default::default(),
            },
            mode: SchedulingMode::FairShare,
            fifo_sort_parameters: vec![FifoSortParameter::Weight, FifoSortParameter::StartTime],
            forbid_immediate_operations: false,
            max_operation_count: None,
            max_running_operation_count: None,
            ephemeral: false,
            owning_user: None,
            children: Vec::new(),
            persistent: PersistentAttributes::default(),
        }
    }

    /// Spec §9 "`TCompositeSchedulerElement::IsEmpty`": a pool with no
    /// children at all is eligible for ephemeral-pool cleanup.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_pool_defaults_to_fair_share_with_zero_min_share() {
        let p = PoolElement::new("research", "root");
        assert_eq!(p.mode, SchedulingMode::FairShare);
        assert_eq!(p.common.min_share_ratio, 0.0);
        assert_eq!(p.common.parent.as_deref(), Some("root"));
    }

    #[test]
    fn is_empty_tracks_children() {
        let mut p = PoolElement::new("research", "root");
        assert!(p.is_empty());
        p.children.push("op1".into());
        assert!(!p.is_empty());
    }
}
