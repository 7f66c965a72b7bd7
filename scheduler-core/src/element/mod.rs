//! Pool-tree elements (spec §3 "Pool tree", §9 Design Notes "dynamic
//! dispatch across element kinds").
//!
//! The original engine dispatches virtually across a small class hierarchy
//! (root / composite-pool / operation). Three concrete shapes with no
//! meaningful fourth variant is exactly the case a tagged enum fits better
//! than a trait object: no allocation for the attribute vector, and every
//! match is exhaustive-checked at compile time when a new passes needs to
//! handle all three.

use std::time::Duration;

use crate::config::SchedulingTagFilter;
use crate::element::attributes::PersistentAttributes;
use crate::resources::JobResources;

pub mod attributes;
pub mod operation;
pub mod pool;
pub mod root;

pub use operation::OperationElement;
pub use pool::PoolElement;
pub use root::RootElement;

/// Fair-share starvation timeouts and tolerance, configurable per element
/// and inherited from the parent when unset (spec §4.7).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StarvationConfig {
    pub fair_share_starvation_tolerance: Option<f64>,
    pub min_share_preemption_timeout: Option<Duration>,
    pub fair_share_preemption_timeout: Option<Duration>,
}

impl Default for StarvationConfig {
    fn default() -> Self {
        Self {
            fair_share_starvation_tolerance: None,
            min_share_preemption_timeout: None,
            fair_share_preemption_timeout: None,
        }
    }
}

/// Fields common to every element kind (spec §3). Root pins `weight`,
/// `min_share_ratio` and `max_share_ratio`; pools and operations take theirs
/// from configuration.
#[derive(Debug, Clone)]
pub struct CommonElementConfig {
    pub id: String,
    pub parent: Option<String>,
    pub weight: f64,
    pub min_share_ratio: f64,
    pub max_share_ratio: f64,
    pub min_share_resources: JobResources,
    pub resource_limits: Option<JobResources>,
    pub scheduling_tag_filter: Option<SchedulingTagFilter>,
    pub starvation: StarvationConfig,
}

/// One node of a pool tree, tagged by kind (spec §9).
#[derive(Debug, Clone)]
pub enum Element {
    Root(RootElement),
    Pool(PoolElement),
    Operation(Box<OperationElement>),
}

impl Element {
    pub fn common(&self) -> &CommonElementConfig {
        match self {
            Element::Root(r) => &r.common,
            Element::Pool(p) => &p.common,
            Element::Operation(o) => &o.common,
        }
    }

    pub fn common_mut(&mut self) -> &mut CommonElementConfig {
        match self {
            Element::Root(r) => &mut r.common,
            Element::Pool(p) => &mut p.common,
            Element::Operation(o) => &mut o.common,
        }
    }

    pub fn id(&self) -> &str {
        &self.common().id
    }

    pub fn parent(&self) -> Option<&str> {
        self.common().parent.as_deref()
    }

    pub fn persistent(&self) -> &PersistentAttributes {
        match self {
            Element::Root(r) => &r.persistent,
            Element::Pool(p) => &p.persistent,
            Element::Operation(o) => &o.persistent,
        }
    }

    pub fn persistent_mut(&mut self) -> &mut PersistentAttributes {
        match self {
            Element::Root(r) => &mut r.persistent,
            Element::Pool(p) => &mut p.persistent,
            Element::Operation(o) => &mut o.persistent,
        }
    }

    /// Child `tree_index`es or, for an operation, none (spec §3 `tree_index`,
    /// §9 "composite vs. leaf").
    pub fn children(&self) -> &[String] {
        match self {
            Element::Root(r) => &r.children,
            Element::Pool(p) => &p.children,
            Element::Operation(_) => &[],
        }
    }

    pub fn is_composite(&self) -> bool {
        !matches!(self, Element::Operation(_))
    }

    /// Spec §9 `TCompositeSchedulerElement::IsEmpty` / leaf equivalent: a
    /// childless composite, or an operation with zero pending jobs.
    pub fn is_empty(&self, pending_job_count: i64) -> bool {
        match self {
            Element::Root(r) => r.children.is_empty(),
            Element::Pool(p) => p.is_empty(),
            Element::Operation(_) => pending_job_count == 0,
        }
    }
}
