//! Fit-factor binary search (spec §4.1 step 4 FairShare branch) plus the
//! uncertainty-ratio correction from `fair_share_tree_element.cpp`
//! `ComputeByFitting` (SPEC_FULL §B.1), which the distilled spec's binary
//! search alone doesn't cover.

/// One child's fitting bounds for a single `ComputeByFitting` pass.
#[derive(Debug, Clone, Copy)]
pub struct FitBounds {
    pub weight: f64,
    pub lower: f64,
    pub upper: f64,
}

/// Computation precision the spec calls out for the binary search (§4.1).
const EPS: f64 = 1e-12;
const MAX_ITERATIONS: u32 = 100;

fn candidate_share(x: f64, child: &FitBounds, min_weight: f64) -> f64 {
    let unclamped = if min_weight > EPS { x * child.weight / min_weight } else { 0.0 };
    unclamped.clamp(child.lower, child.upper)
}

/// Find `x* in [0, 1]` such that `sum_c candidate_share(x*, c) == target`,
/// to within `EPS`, then apply the uncertainty-ratio correction so the
/// returned shares never exceed `target` by more than floating-point noise
/// (spec §4.1 step 4; SPEC_FULL §B.1).
///
/// Returns `(x*, per_child_shares)`. `min_weight` is the smallest
/// `weight > EPS` among `children` (spec: `min_weight = min_{w>ε} weight`);
/// callers compute it once across all children before calling this twice
/// (fair-share pass, then the uncapped guaranteed-resources pass).
pub fn compute_by_fitting(children: &[FitBounds], min_weight: f64, target: f64) -> (f64, Vec<f64>) {
    if children.is_empty() {
        return (0.0, Vec::new());
    }

    let sum_at = |x: f64| -> f64 { children.iter().map(|c| candidate_share(x, c, min_weight)).sum() };

    let x_star = if sum_at(1.0) < target {
        1.0
    } else {
        let mut lo = 0.0_f64;
        let mut hi = 1.0_f64;
        for _ in 0..MAX_ITERATIONS {
            if hi - lo < EPS {
                break;
            }
            let mid = (lo + hi) / 2.0;
            if sum_at(mid) < target {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        hi
    };

    let mut shares: Vec<f64> = children.iter().map(|c| candidate_share(x_star, c, min_weight)).collect();
    let achieved: f64 = shares.iter().sum();
    if achieved > target + EPS {
        let uncertainty_ratio = (target / achieved).min(1.0);
        for share in &mut shares {
            *share *= uncertainty_ratio;
        }
    }

    (x_star, shares)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_child_with_no_bounds_gets_full_target() {
        let children = vec![FitBounds {
            weight: 1.0,
            lower: 0.0,
            upper: 1.0,
        }];
        let (_, shares) = compute_by_fitting(&children, 1.0, 0.5);
        assert!((shares[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn equal_weight_children_split_target_evenly() {
        let children = vec![
            FitBounds {
                weight: 1.0,
                lower: 0.0,
                upper: 1.0,
            },
            FitBounds {
                weight: 1.0,
                lower: 0.0,
                upper: 1.0,
            },
        ];
        let (_, shares) = compute_by_fitting(&children, 1.0, 1.0);
        assert!((shares[0] - 0.5).abs() < 1e-6);
        assert!((shares[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn weighted_children_split_proportionally() {
        // spec §8 scenario 1: A(weight=1), B(weight=3), target=1.0.
        let children = vec![
            FitBounds {
                weight: 1.0,
                lower: 0.0,
                upper: 1.0,
            },
            FitBounds {
                weight: 3.0,
                lower: 0.0,
                upper: 1.0,
            },
        ];
        let (_, shares) = compute_by_fitting(&children, 1.0, 1.0);
        assert!((shares[0] - 0.25).abs() < 1e-6, "A got {}", shares[0]);
        assert!((shares[1] - 0.75).abs() < 1e-6, "B got {}", shares[1]);
    }

    #[test]
    fn upper_bound_caps_a_child_and_excess_goes_unallocated_when_others_saturate() {
        let children = vec![
            FitBounds {
                weight: 1.0,
                lower: 0.0,
                upper: 0.2,
            },
            FitBounds {
                weight: 1.0,
                lower: 0.0,
                upper: 1.0,
            },
        ];
        let (x_star, shares) = compute_by_fitting(&children, 1.0, 1.0);
        assert!((shares[0] - 0.2).abs() < 1e-6);
        assert_eq!(x_star, 1.0, "target unreachable with these bounds, x* saturates at 1.0");
        assert!(shares[1] <= 1.0 + 1e-9);
    }

    #[test]
    fn lower_bound_guarantees_recursive_min_share() {
        let children = vec![
            FitBounds {
                weight: 1.0,
                lower: 0.3,
                upper: 1.0,
            },
            FitBounds {
                weight: 1.0,
                lower: 0.0,
                upper: 1.0,
            },
        ];
        let (_, shares) = compute_by_fitting(&children, 1.0, 0.4);
        assert!(shares[0] >= 0.3 - 1e-9);
    }

    #[test]
    fn sum_never_exceeds_target_after_uncertainty_correction() {
        let children: Vec<FitBounds> = (0..7)
            .map(|i| FitBounds {
                weight: 1.0 + i as f64,
                lower: 0.0,
                upper: 1.0,
            })
            .collect();
        let min_weight = children.iter().map(|c| c.weight).fold(f64::INFINITY, f64::min);
        let (_, shares) = compute_by_fitting(&children, min_weight, 0.37);
        let achieved: f64 = shares.iter().sum();
        assert!(achieved <= 0.37 + 1e-6, "achieved {achieved} exceeds target");
    }

    #[test]
    fn empty_children_returns_empty() {
        let (x_star, shares) = compute_by_fitting(&[], 1.0, 0.5);
        assert_eq!(x_star, 0.0);
        assert!(shares.is_empty());
    }
}
