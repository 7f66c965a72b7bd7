//! Multi-dimensional resource vectors and the lattice operations the rest of
//! the engine is built on.
//!
//! [`JobResources`] is a fixed-arity tuple of non-negative integers (cpu,
//! memory, user slots, gpu, network) plus a map from storage medium to disk
//! bytes. All comparisons and arithmetic are pointwise; see spec §3.

use std::collections::BTreeMap;
use std::fmt;

/// One resource dimension, used to name the dominant resource of a usage/limit
/// pair and to key per-resource computations generically instead of matching
/// on every field by hand.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    UserSlots,
    Cpu,
    Memory,
    Network,
    Gpu,
    /// Disk space on a named medium (e.g. "ssd_blobs", "default").
    Disk(String),
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::UserSlots => write!(f, "user_slots"),
            ResourceKind::Cpu => write!(f, "cpu"),
            ResourceKind::Memory => write!(f, "memory"),
            ResourceKind::Network => write!(f, "network"),
            ResourceKind::Gpu => write!(f, "gpu"),
            ResourceKind::Disk(medium) => write!(f, "disk:{medium}"),
        }
    }
}

/// A point in the multi-resource lattice: cpu in millicores, memory and disk
/// in bytes, everything else as plain counts.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct JobResources {
    pub user_slots: i64,
    pub cpu: i64,
    pub memory: i64,
    pub network: i64,
    pub gpu: i64,
    pub disk: BTreeMap<String, i64>,
}

impl JobResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn zero() -> Self {
        Self::default()
    }

    /// Value of a single dimension; an absent disk medium reads as zero.
    pub fn get(&self, kind: &ResourceKind) -> i64 {
        match kind {
            ResourceKind::UserSlots => self.user_slots,
            ResourceKind::Cpu => self.cpu,
            ResourceKind::Memory => self.memory,
            ResourceKind::Network => self.network,
            ResourceKind::Gpu => self.gpu,
            ResourceKind::Disk(medium) => self.disk.get(medium).copied().unwrap_or(0),
        }
    }

    fn set(&mut self, kind: &ResourceKind, value: i64) {
        match kind {
            ResourceKind::UserSlots => self.user_slots = value,
            ResourceKind::Cpu => self.cpu = value,
            ResourceKind::Memory => self.memory = value,
            ResourceKind::Network => self.network = value,
            ResourceKind::Gpu => self.gpu = value,
            ResourceKind::Disk(medium) => {
                if value == 0 {
                    self.disk.remove(medium);
                } else {
                    self.disk.insert(medium.clone(), value);
                }
            }
        }
    }

    /// All dimensions that have a nonzero value on either side of a pair,
    /// used so pairwise operations over a sparse disk map stay well-defined.
    fn union_kinds(a: &JobResources, b: &JobResources) -> Vec<ResourceKind> {
        let mut kinds = vec![
            ResourceKind::UserSlots,
            ResourceKind::Cpu,
            ResourceKind::Memory,
            ResourceKind::Network,
            ResourceKind::Gpu,
        ];
        let mut mediums: Vec<&String> = a.disk.keys().chain(b.disk.keys()).collect();
        mediums.sort();
        mediums.dedup();
        kinds.extend(mediums.into_iter().map(|m| ResourceKind::Disk(m.clone())));
        kinds
    }

    /// `self <= other` pointwise across every dimension (the "dominates"
    /// relation of spec §3, read as "other dominates self").
    pub fn dominated_by(&self, other: &JobResources) -> bool {
        for kind in Self::union_kinds(self, other) {
            if self.get(&kind) > other.get(&kind) {
                return false;
            }
        }
        true
    }

    pub fn pointwise_min(&self, other: &JobResources) -> JobResources {
        let mut out = JobResources::zero();
        for kind in Self::union_kinds(self, other) {
            out.set(&kind, self.get(&kind).min(other.get(&kind)));
        }
        out
    }

    pub fn pointwise_max(&self, other: &JobResources) -> JobResources {
        let mut out = JobResources::zero();
        for kind in Self::union_kinds(self, other) {
            out.set(&kind, self.get(&kind).max(other.get(&kind)));
        }
        out
    }

    pub fn add(&self, other: &JobResources) -> JobResources {
        let mut out = JobResources::zero();
        for kind in Self::union_kinds(self, other) {
            out.set(&kind, self.get(&kind).saturating_add(other.get(&kind)));
        }
        out
    }

    /// Pointwise subtraction, clamped at zero. Used to remove a finished
    /// job's usage from an operation/pool without going negative when
    /// accounting races against a concurrent commit (spec §5 "counters are
    /// monotone within a commit").
    pub fn saturating_sub(&self, other: &JobResources) -> JobResources {
        let mut out = JobResources::zero();
        for kind in Self::union_kinds(self, other) {
            out.set(&kind, (self.get(&kind) - other.get(&kind)).max(0));
        }
        out
    }

    pub fn scale(&self, factor: f64) -> JobResources {
        let mut out = JobResources::zero();
        out.user_slots = scale_dim(self.user_slots, factor);
        out.cpu = scale_dim(self.cpu, factor);
        out.memory = scale_dim(self.memory, factor);
        out.network = scale_dim(self.network, factor);
        out.gpu = scale_dim(self.gpu, factor);
        for (medium, v) in &self.disk {
            let scaled = scale_dim(*v, factor);
            if scaled != 0 {
                out.disk.insert(medium.clone(), scaled);
            }
        }
        out
    }

    pub fn is_zero(&self) -> bool {
        self.user_slots == 0
            && self.cpu == 0
            && self.memory == 0
            && self.network == 0
            && self.gpu == 0
            && self.disk.values().all(|&v| v == 0)
    }

    /// Ratio `usage_i / limits_i` for one dimension. A zero limit excludes the
    /// dimension from dominant-resource consideration unless usage is also
    /// zero, in which case the ratio is defined as zero (spec §3).
    fn ratio(usage: i64, limit: i64) -> Option<f64> {
        if limit == 0 {
            if usage == 0 {
                Some(0.0)
            } else {
                None
            }
        } else {
            Some(usage as f64 / limit as f64)
        }
    }

    /// `dominant_resource(usage, limits)`: the resource dimension maximizing
    /// `usage_i / limits_i`, skipping dimensions with zero limit and nonzero
    /// usage (undefined ratio). Returns `None` when every dimension has a
    /// zero limit (and thus necessarily zero usage, or the vector is
    /// entirely unconstrained/empty).
    pub fn dominant_resource(usage: &JobResources, limits: &JobResources) -> Option<(ResourceKind, f64)> {
        let mut best: Option<(ResourceKind, f64)> = None;
        for kind in Self::union_kinds(usage, limits) {
            if let Some(r) = Self::ratio(usage.get(&kind), limits.get(&kind)) {
                match &best {
                    Some((_, best_ratio)) if *best_ratio >= r => {}
                    _ => best = Some((kind, r)),
                }
            }
        }
        best
    }

    /// The ratio value alone, `0.0` if no dimension has a defined ratio.
    pub fn dominant_resource_ratio(usage: &JobResources, limits: &JobResources) -> f64 {
        Self::dominant_resource(usage, limits).map(|(_, r)| r).unwrap_or(0.0)
    }

    /// `max_i(usage_i / limits_i)` without caring which dimension achieved
    /// it — convenient shorthand used throughout the fair-share updater.
    pub fn max_ratio_to(&self, limits: &JobResources) -> f64 {
        Self::dominant_resource_ratio(self, limits)
    }
}

fn scale_dim(value: i64, factor: f64) -> i64 {
    if factor <= 0.0 {
        return 0;
    }
    ((value as f64) * factor).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(cpu: i64, memory: i64) -> JobResources {
        JobResources {
            cpu,
            memory,
            ..Default::default()
        }
    }

    #[test]
    fn dominated_by_pointwise() {
        let a = res(1, 2);
        let b = res(2, 3);
        assert!(a.dominated_by(&b));
        assert!(!b.dominated_by(&a));
    }

    #[test]
    fn dominated_by_considers_disk_mediums() {
        let mut a = res(1, 1);
        a.disk.insert("ssd".into(), 100);
        let b = res(1, 1);
        assert!(!a.dominated_by(&b), "a has disk usage b does not account for");
        let mut b2 = res(1, 1);
        b2.disk.insert("ssd".into(), 200);
        assert!(a.dominated_by(&b2));
    }

    #[test]
    fn pointwise_min_max() {
        let a = res(5, 1);
        let b = res(2, 9);
        assert_eq!(a.pointwise_min(&b), res(2, 1));
        assert_eq!(a.pointwise_max(&b), res(5, 9));
    }

    #[test]
    fn add_and_sub_roundtrip() {
        let a = res(5, 10);
        let b = res(2, 3);
        let sum = a.add(&b);
        assert_eq!(sum, res(7, 13));
        assert_eq!(sum.saturating_sub(&b), a);
    }

    #[test]
    fn saturating_sub_never_negative() {
        let a = res(1, 1);
        let b = res(5, 5);
        assert_eq!(a.saturating_sub(&b), res(0, 0));
    }

    #[test]
    fn scale_rounds_each_dimension() {
        let a = res(10, 3);
        let scaled = a.scale(0.5);
        assert_eq!(scaled.cpu, 5);
        assert_eq!(scaled.memory, 2); // 1.5 rounds to 2
    }

    #[test]
    fn dominant_resource_picks_max_ratio() {
        // 100 cpu / 100 limit = 1.0; 50 memory / 200 limit = 0.25 -> cpu dominates
        let usage = res(100, 50);
        let limits = res(100, 200);
        let (kind, ratio) = JobResources::dominant_resource(&usage, &limits).unwrap();
        assert_eq!(kind, ResourceKind::Cpu);
        assert!((ratio - 1.0).abs() < 1e-9);
    }

    #[test]
    fn dominant_resource_excludes_zero_limit_with_nonzero_usage() {
        // gpu has usage but no limit -- must be excluded, not treated as infinite.
        let usage = JobResources {
            cpu: 10,
            gpu: 5,
            ..Default::default()
        };
        let limits = JobResources {
            cpu: 100,
            gpu: 0,
            ..Default::default()
        };
        let (kind, ratio) = JobResources::dominant_resource(&usage, &limits).unwrap();
        assert_eq!(kind, ResourceKind::Cpu);
        assert!((ratio - 0.1).abs() < 1e-9);
    }

    #[test]
    fn dominant_resource_zero_limit_zero_usage_is_defined_as_zero() {
        let usage = JobResources::zero();
        let limits = JobResources {
            cpu: 100,
            ..Default::default()
        };
        let (kind, ratio) = JobResources::dominant_resource(&usage, &limits).unwrap();
        assert_eq!(kind, ResourceKind::Cpu);
        assert_eq!(ratio, 0.0);
    }

    #[test]
    fn dominant_resource_none_when_all_limits_zero() {
        let usage = JobResources::zero();
        let limits = JobResources::zero();
        assert!(JobResources::dominant_resource(&usage, &limits).is_none());
    }

    #[test]
    fn is_zero_true_for_default() {
        assert!(JobResources::zero().is_zero());
        assert!(!res(1, 0).is_zero());
    }
}
