//! Pool-tree configuration loading and management (spec §3 "Pool tree
//! configuration", §6 "Config (consumed)").
//!
//! Mirrors the shape of a node-hardware config loader: a private YAML
//! deserialization layer, a public data model the rest of the engine
//! actually uses, and a manager that owns the currently-loaded set and can
//! be reloaded wholesale.
//!
//! Expected YAML structure:
//! ```yaml
//! trees:
//!   default:
//!     nodes_filter: "default"
//!     pools:
//!       research:
//!         weight: 3.0
//!         min_share_ratio: 0.2
//!         mode: fair_share
//!       research/gpu_team:
//!         parent: research
//!         weight: 1.0
//!         mode: fifo
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::element::{CommonElementConfig, StarvationConfig};
use crate::element::pool::{FifoSortParameter, SchedulingMode};
use crate::resources::JobResources;

// ── Scheduling tag filter ───────────────────────────────────────────────────

/// A simplified form of the original boolean tag expression (spec §3
/// "Scheduling tag filter"): a conjunction of required tags, optionally
/// negated. `"gpu !preemptible"` requires the `gpu` tag and forbids the
/// `preemptible` tag.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulingTagFilter {
    required: Vec<String>,
    excluded: Vec<String>,
}

impl SchedulingTagFilter {
    pub fn parse(expr: &str) -> Self {
        let mut required = Vec::new();
        let mut excluded = Vec::new();
        for token in expr.split_whitespace() {
            if let Some(tag) = token.strip_prefix('!') {
                excluded.push(tag.to_string());
            } else {
                required.push(token.to_string());
            }
        }
        Self { required, excluded }
    }

    pub fn matches(&self, tags: &[String]) -> bool {
        self.required.iter().all(|t| tags.iter().any(|tag| tag == t))
            && self.excluded.iter().all(|t| !tags.iter().any(|tag| tag == t))
    }

    pub fn is_empty(&self) -> bool {
        self.required.is_empty() && self.excluded.is_empty()
    }
}

// ── Private YAML deserialization types ──────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PoolTreeConfigFile {
    trees: HashMap<String, TreeConfigEntry>,
}

#[derive(Debug, Deserialize, Default)]
struct TreeConfigEntry {
    #[serde(default)]
    nodes_filter: String,
    #[serde(default)]
    pools: HashMap<String, PoolConfigEntry>,
}

#[derive(Debug, Deserialize)]
struct PoolConfigEntry {
    parent: Option<String>,
    #[serde(default = "default_weight")]
    weight: f64,
    #[serde(default)]
    min_share_ratio: f64,
    #[serde(default = "default_max_share_ratio")]
    max_share_ratio: f64,
    #[serde(default)]
    mode: PoolModeEntry,
    #[serde(default)]
    fifo_sort_parameters: Vec<String>,
    max_operation_count: Option<i64>,
    max_running_operation_count: Option<i64>,
    #[serde(default)]
    min_share_resources: ResourceEntry,
    resource_limits: Option<ResourceEntry>,
    scheduling_tag_filter: Option<String>,
    fair_share_starvation_tolerance: Option<f64>,
    min_share_preemption_timeout_ms: Option<u64>,
    fair_share_preemption_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum PoolModeEntry {
    #[default]
    FairShare,
    Fifo,
}

#[derive(Debug, Deserialize, Default, Clone)]
struct ResourceEntry {
    #[serde(default)]
    user_slots: i64,
    #[serde(default)]
    cpu: i64,
    #[serde(default)]
    memory: i64,
    #[serde(default)]
    network: i64,
    #[serde(default)]
    gpu: i64,
}

impl From<ResourceEntry> for JobResources {
    fn from(e: ResourceEntry) -> Self {
        JobResources {
            user_slots: e.user_slots,
            cpu: e.cpu,
            memory: e.memory,
            network: e.network,
            gpu: e.gpu,
            disk: Default::default(),
        }
    }
}

fn default_weight() -> f64 {
    1.0
}

fn default_max_share_ratio() -> f64 {
    1.0
}

// ── Public data model ───────────────────────────────────────────────────────

/// One pool's fully-resolved configuration, ready to seed a [`PoolElement`]
/// (spec §3).
///
/// [`PoolElement`]: crate::element::PoolElement
#[derive(Debug, Clone)]
pub struct PoolDefinition {
    pub id: String,
    pub common: CommonElementConfig,
    pub mode: SchedulingMode,
    pub fifo_sort_parameters: Vec<FifoSortParameter>,
    pub max_operation_count: Option<i64>,
    pub max_running_operation_count: Option<i64>,
}

/// One pool tree's fully-resolved configuration (spec §3 "Pool tree
/// configuration").
#[derive(Debug, Clone, Default)]
pub struct TreeDefinition {
    pub nodes_filter: SchedulingTagFilter,
    pub pools: HashMap<String, PoolDefinition>,
}

impl TreeDefinition {
    /// Pools in an order where every pool's parent has already been
    /// yielded, so a tree builder can insert them top-down without a
    /// second pass. Cycles (spec §3 "Invariants: no cycles") surface as a
    /// non-empty remainder, which callers should treat as a config error.
    pub fn pools_in_dependency_order(&self) -> Vec<&PoolDefinition> {
        let mut ordered = Vec::with_capacity(self.pools.len());
        let mut placed: std::collections::HashSet<&str> = std::collections::HashSet::new();
        let mut remaining: Vec<&PoolDefinition> = self.pools.values().collect();
        while !remaining.is_empty() {
            let before = remaining.len();
            remaining.retain(|pool| {
                let parent_ready = match pool.common.parent.as_deref() {
                    // A parent that isn't itself a pool in this tree is the
                    // tree root (spec §3: every pool's parent defaults to
                    // the tree id), which is always already "placed".
                    Some(p) if self.pools.contains_key(p) => placed.contains(p),
                    _ => true,
                };
                if parent_ready {
                    placed.insert(&pool.id);
                    ordered.push(*pool);
                    false
                } else {
                    true
                }
            });
            if remaining.len() == before {
                warn!(tree_pools_stuck = remaining.len(), "pool config has a cycle or a missing parent");
                break;
            }
        }
        ordered
    }
}

fn duration_ms(ms: Option<u64>) -> Option<Duration> {
    ms.map(Duration::from_millis)
}

fn parse_fifo_sort_parameters(entries: &[String]) -> Vec<FifoSortParameter> {
    entries
        .iter()
        .filter_map(|s| match s.as_str() {
            "weight" => Some(FifoSortParameter::Weight),
            "start_time" => Some(FifoSortParameter::StartTime),
            "pending_job_count" => Some(FifoSortParameter::PendingJobCount),
            other => {
                warn!(parameter = other, "unknown fifo_sort_parameters entry, ignoring");
                None
            }
        })
        .collect()
}

// ── StrategyConfig manager ──────────────────────────────────────────────────

/// Loads and manages pool-tree configurations from a YAML file.
#[derive(Debug, Default)]
pub struct StrategyConfig {
    trees: HashMap<String, TreeDefinition>,
    loaded: bool,
}

impl StrategyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `path` and replaces the full set of loaded trees.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened, if the YAML is
    /// structurally invalid, or if a pool names a parent pool that does not
    /// exist within the same tree.
    pub fn load_from_file(&mut self, path: &Path) -> Result<()> {
        info!(path = %path.display(), "loading pool tree configuration");
        self.trees.clear();
        self.loaded = false;

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot open pool tree configuration file: {}", path.display()))?;
        let file: PoolTreeConfigFile = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse pool tree YAML: {}", path.display()))?;

        for (tree_id, entry) in file.trees {
            let mut pools = HashMap::with_capacity(entry.pools.len());
            for (pool_id, pool_entry) in entry.pools {
                let parent = pool_entry.parent.clone().unwrap_or_else(|| tree_id.clone());
                let common = CommonElementConfig {
                    id: pool_id.clone(),
                    parent: Some(parent),
                    weight: pool_entry.weight,
                    min_share_ratio: pool_entry.min_share_ratio,
                    max_share_ratio: pool_entry.max_share_ratio,
                    min_share_resources: pool_entry.min_share_resources.into(),
                    resource_limits: pool_entry.resource_limits.map(Into::into),
                    scheduling_tag_filter: pool_entry.scheduling_tag_filter.as_deref().map(SchedulingTagFilter::parse),
                    starvation: StarvationConfig {
                        fair_share_starvation_tolerance: pool_entry.fair_share_starvation_tolerance,
                        min_share_preemption_timeout: duration_ms(pool_entry.min_share_preemption_timeout_ms),
                        fair_share_preemption_timeout: duration_ms(pool_entry.fair_share_preemption_timeout_ms),
                    },
                };
                let definition = PoolDefinition {
                    id: pool_id.clone(),
                    mode: match pool_entry.mode {
                        PoolModeEntry::FairShare => SchedulingMode::FairShare,
                        PoolModeEntry::Fifo => SchedulingMode::Fifo,
                    },
                    fifo_sort_parameters: if pool_entry.fifo_sort_parameters.is_empty() {
                        vec![FifoSortParameter::Weight, FifoSortParameter::StartTime]
                    } else {
                        parse_fifo_sort_parameters(&pool_entry.fifo_sort_parameters)
                    },
                    max_operation_count: pool_entry.max_operation_count,
                    max_running_operation_count: pool_entry.max_running_operation_count,
                    common,
                };
                debug!(tree = %tree_id, pool = %pool_id, weight = definition.common.weight, "loaded pool");
                pools.insert(pool_id, definition);
            }

            let tree = TreeDefinition {
                nodes_filter: SchedulingTagFilter::parse(&entry.nodes_filter),
                pools,
            };
            if tree.pools_in_dependency_order().len() != tree.pools.len() {
                anyhow::bail!("tree '{tree_id}' has a pool cycle or a pool with an unknown parent");
            }
            self.trees.insert(tree_id, tree);
        }

        if self.trees.is_empty() {
            warn!("no pool trees found in configuration, using a single empty 'default' tree");
            self.trees.insert("default".to_string(), TreeDefinition::default());
        }

        self.loaded = true;
        info!(tree_count = self.trees.len(), "pool tree configuration loaded");
        Ok(())
    }

    pub fn tree_ids(&self) -> impl Iterator<Item = &str> {
        self.trees.keys().map(String::as_str)
    }

    pub fn tree(&self, tree_id: &str) -> Option<&TreeDefinition> {
        self.trees.get(tree_id)
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn yaml_tempfile(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn tag_filter_matches_required_and_excluded() {
        let filter = SchedulingTagFilter::parse("gpu !preemptible");
        assert!(filter.matches(&["gpu".to_string(), "fast".to_string()]));
        assert!(!filter.matches(&["gpu".to_string(), "preemptible".to_string()]));
        assert!(!filter.matches(&["fast".to_string()]));
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = SchedulingTagFilter::parse("");
        assert!(filter.is_empty());
        assert!(filter.matches(&[]));
    }

    #[test]
    fn load_example_yaml_resolves_parents_and_defaults() {
        let yaml = r#"
trees:
  default:
    nodes_filter: "default"
    pools:
      research:
        weight: 3.0
        min_share_ratio: 0.2
        mode: fair_share
      gpu_team:
        parent: research
        weight: 1.0
        mode: fifo
        fifo_sort_parameters: ["start_time"]
"#;
        let f = yaml_tempfile(yaml);
        let mut cfg = StrategyConfig::new();
        cfg.load_from_file(f.path()).unwrap();

        assert!(cfg.is_loaded());
        let tree = cfg.tree("default").unwrap();
        assert_eq!(tree.pools.len(), 2);

        let research = &tree.pools["research"];
        assert_eq!(research.common.parent.as_deref(), Some("default"));
        assert_eq!(research.common.weight, 3.0);
        assert_eq!(research.mode, SchedulingMode::FairShare);

        let gpu_team = &tree.pools["gpu_team"];
        assert_eq!(gpu_team.common.parent.as_deref(), Some("research"));
        assert_eq!(gpu_team.mode, SchedulingMode::Fifo);
        assert_eq!(gpu_team.fifo_sort_parameters, vec![FifoSortParameter::StartTime]);
    }

    #[test]
    fn pools_in_dependency_order_places_parents_first() {
        let yaml = r#"
trees:
  default:
    pools:
      grandchild:
        parent: child
      child:
        parent: research
      research: {}
"#;
        let f = yaml_tempfile(yaml);
        let mut cfg = StrategyConfig::new();
        cfg.load_from_file(f.path()).unwrap();
        let tree = cfg.tree("default").unwrap();
        let order: Vec<&str> = tree.pools_in_dependency_order().iter().map(|p| p.id.as_str()).collect();
        assert_eq!(order.iter().position(|&id| id == "research"), Some(0));
        assert!(order.iter().position(|&id| id == "child") < order.iter().position(|&id| id == "grandchild"));
    }

    #[test]
    fn cyclic_pool_config_is_rejected() {
        let yaml = r#"
trees:
  default:
    pools:
      a:
        parent: b
      b:
        parent: a
"#;
        let f = yaml_tempfile(yaml);
        let mut cfg = StrategyConfig::new();
        assert!(cfg.load_from_file(f.path()).is_err());
        assert!(!cfg.is_loaded());
    }

    #[test]
    fn empty_trees_section_inserts_default_tree() {
        let f = yaml_tempfile("trees: {}\n");
        let mut cfg = StrategyConfig::new();
        cfg.load_from_file(f.path()).unwrap();
        assert!(cfg.tree("default").is_some());
    }

    #[test]
    fn missing_file_returns_error() {
        let mut cfg = StrategyConfig::new();
        assert!(cfg.load_from_file(Path::new("/nonexistent/path/config.yaml")).is_err());
        assert!(!cfg.is_loaded());
    }
}
