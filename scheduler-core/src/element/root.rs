//! Root pool-tree element (spec §3 "Root element").

use crate::element::attributes::PersistentAttributes;
use crate::element::CommonElementConfig;

/// The root of one pool tree. Its fair-share ratio is pinned to `1.0`, its
/// min-share ratio to `1.0`, and its scheduling mode is always `FairShare`
/// (spec §3) — these are structural invariants of the tree, not
/// configuration, so they are not stored as overridable fields.
#[derive(Debug, Clone)]
pub struct RootElement {
    pub common: CommonElementConfig,
    pub children: Vec<String>,
    pub persistent: PersistentAttributes,
}

impl RootElement {
    pub fn new(tree_id: impl Into<String>) -> Self {
        let tree_id = tree_id.into();
        Self {
            common: CommonElementConfig {
                id: tree_id,
                parent: None,
                weight: 1.0,
                min_share_ratio: 1.0,
                max_share_ratio: 1.0,
                min_share_resources: Default::default(),
                resource_limits: None,
                scheduling_tag_filter: None,
                starvation: Default::default(),
            },
            children: Vec::new(),
            persistent: PersistentAttributes::default(),
        }
    }
}
