//! Per-element dynamic and persistent attributes (spec §3).
//!
//! Dynamic attributes are recomputed wholesale by every fair-share update and
//! live only on the cloned working tree (§4.1). Persistent attributes
//! (starvation state, historic usage) survive across updates and are copied
//! back onto the live tree after a snapshot is published.

use std::time::{Duration, Instant};

use crate::resources::{JobResources, ResourceKind};

/// Recomputed wholesale on every fair-share update (spec §3 "Dynamic
/// attributes"). Indexed by `tree_index` in a flat `Vec` for O(1) lookup
/// during the update passes and the scheduling hot path.
#[derive(Debug, Clone)]
pub struct DynamicAttributes {
    pub resource_demand: JobResources,
    pub resource_usage: JobResources,
    pub resource_limits: JobResources,
    pub max_possible_resource_usage: JobResources,
    pub pending_job_count: i64,
    /// `false` for an operation the controller has reported as not
    /// schedulable this round (spec §4.1 step 2); demand is forced to zero.
    pub schedulable: bool,

    pub dominant_resource: Option<ResourceKind>,
    pub dominant_limit: i64,
    pub demand_ratio: f64,
    pub usage_ratio: f64,
    pub fair_share_ratio: f64,
    pub adjusted_min_share_ratio: f64,
    pub recursive_min_share_ratio: f64,
    pub max_possible_usage_ratio: f64,
    pub guaranteed_resources_ratio: f64,
    pub best_allocation_ratio: f64,

    /// `-1` when not in a FIFO pool (or not yet assigned this update).
    pub fifo_index: i32,

    pub adjusted_fair_share_starvation_tolerance: f64,
    pub adjusted_min_share_preemption_timeout: Duration,
    pub adjusted_fair_share_preemption_timeout: Duration,

    pub satisfaction_ratio: f64,
    pub active: bool,
    /// `tree_index` of the operation element this subtree would currently
    /// hand a job to, cached by the best-child selector and updated
    /// incrementally after each job start (spec §4.3).
    pub best_leaf_descendant: Option<usize>,

    /// Sum of preempted-but-not-yet-removed usage applied to this element
    /// for the duration of the preemptive scheduling stage (spec §4.2 Stage
    /// P); reset to zero after each preemptive attempt.
    pub resource_usage_discount: JobResources,
}

impl Default for DynamicAttributes {
    fn default() -> Self {
        Self {
            resource_demand: JobResources::zero(),
            resource_usage: JobResources::zero(),
            resource_limits: JobResources::zero(),
            max_possible_resource_usage: JobResources::zero(),
            pending_job_count: 0,
            schedulable: true,
            dominant_resource: None,
            dominant_limit: 0,
            demand_ratio: 0.0,
            usage_ratio: 0.0,
            fair_share_ratio: 0.0,
            adjusted_min_share_ratio: 0.0,
            recursive_min_share_ratio: 0.0,
            max_possible_usage_ratio: 0.0,
            guaranteed_resources_ratio: 0.0,
            best_allocation_ratio: 1.0,
            fifo_index: -1,
            adjusted_fair_share_starvation_tolerance: 1.0,
            adjusted_min_share_preemption_timeout: Duration::ZERO,
            adjusted_fair_share_preemption_timeout: Duration::ZERO,
            satisfaction_ratio: f64::INFINITY,
            active: false,
            best_leaf_descendant: None,
            resource_usage_discount: JobResources::zero(),
        }
    }
}

/// The starvation status an element was last found in (spec §4.1 step 5,
/// §4.7). Ordered worst-to-best only in the informal sense that
/// `BelowMinShare` is a stricter violation than `BelowFairShare`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StarvationStatus {
    Normal,
    BelowFairShare,
    BelowMinShare,
}

/// Survives across fair-share updates (spec §3 "Persistent attributes").
/// Copied from the live tree onto clones at the start of an update and
/// copied back after the snapshot is published.
#[derive(Debug, Clone)]
pub struct PersistentAttributes {
    pub starving: bool,
    /// When the element first entered its current non-`Normal` status; used
    /// by the hysteresis in `fair_share::starvation` to decide when the
    /// adjusted timeout has elapsed.
    pub below_fair_share_since: Option<Instant>,
    pub below_min_share_since: Option<Instant>,
    pub last_status: StarvationStatus,
    /// Exponentially-weighted historic usage ratio, used only for
    /// diagnostics/profiling in this engine (no feedback into the
    /// algorithm) — mirrors the teacher's pattern of carrying a slow
    /// moving-average aggregator alongside the authoritative instantaneous
    /// value.
    pub historic_usage_ratio: f64,
}

impl Default for PersistentAttributes {
    fn default() -> Self {
        Self {
            starving: false,
            below_fair_share_since: None,
            below_min_share_since: None,
            last_status: StarvationStatus::Normal,
            historic_usage_ratio: 0.0,
        }
    }
}

impl PersistentAttributes {
    /// Exponential moving average update, smoothing factor `alpha` in
    /// `(0, 1]`; larger `alpha` weighs the new sample more heavily.
    pub fn record_usage_ratio(&mut self, ratio: f64, alpha: f64) {
        self.historic_usage_ratio = alpha * ratio + (1.0 - alpha) * self.historic_usage_ratio;
    }
}
