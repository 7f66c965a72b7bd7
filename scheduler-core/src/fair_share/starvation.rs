//! Starvation status and the hysteresis that turns it into `starving`
//! (spec §4.1 step 5, §4.7, §8 scenario 6).

use std::time::{Duration, Instant};

use crate::element::attributes::{PersistentAttributes, StarvationStatus};

/// Comparison precision the spec calls out for ratio comparisons (§4.1
/// "Comparison precision is sqrt(ε) ≈ 1e-6").
const COMPARISON_EPS: f64 = 1e-6;

/// Classify an element's current standing (spec §4.1 step 5). `fifo_index`
/// is `Some` when the element is a FIFO pool's child; such elements never
/// starve (§4.3 "`fifo_index >= 0` => satisfaction = +∞").
pub fn compute_status(
    usage_ratio: f64,
    fair_share_ratio: f64,
    min_share_ratio: f64,
    tolerance: f64,
    fifo_index: Option<i32>,
) -> StarvationStatus {
    if fifo_index.is_some() {
        return StarvationStatus::Normal;
    }
    if usage_ratio + COMPARISON_EPS < min_share_ratio {
        StarvationStatus::BelowMinShare
    } else if usage_ratio + COMPARISON_EPS < fair_share_ratio * tolerance {
        StarvationStatus::BelowFairShare
    } else {
        StarvationStatus::Normal
    }
}

/// Apply the hysteresis transition for one element (spec §4.1 step 5):
/// entering a non-`Normal` status starts (or keeps) a timer; once the
/// timer exceeds the corresponding adjusted timeout, `starving` latches to
/// `true`. Returning to `Normal` clears both timers immediately.
pub fn update_starving(
    persistent: &mut PersistentAttributes,
    status: StarvationStatus,
    now: Instant,
    adjusted_min_share_preemption_timeout: Duration,
    adjusted_fair_share_preemption_timeout: Duration,
) {
    match status {
        StarvationStatus::Normal => {
            persistent.below_fair_share_since = None;
            persistent.below_min_share_since = None;
            persistent.starving = false;
        }
        StarvationStatus::BelowFairShare => {
            if persistent.last_status != StarvationStatus::BelowFairShare {
                persistent.below_fair_share_since = Some(now);
            }
            if let Some(since) = persistent.below_fair_share_since {
                if now.duration_since(since) >= adjusted_fair_share_preemption_timeout {
                    persistent.starving = true;
                }
            }
        }
        StarvationStatus::BelowMinShare => {
            if persistent.last_status != StarvationStatus::BelowMinShare {
                persistent.below_min_share_since = Some(now);
            }
            if let Some(since) = persistent.below_min_share_since {
                if now.duration_since(since) >= adjusted_min_share_preemption_timeout {
                    persistent.starving = true;
                }
            }
        }
    }
    persistent.last_status = status;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_children_never_starve() {
        let status = compute_status(0.0, 1.0, 1.0, 1.0, Some(0));
        assert_eq!(status, StarvationStatus::Normal);
    }

    #[test]
    fn below_min_share_outranks_below_fair_share() {
        let status = compute_status(0.1, 0.5, 0.3, 1.0, None);
        assert_eq!(status, StarvationStatus::BelowMinShare);
    }

    #[test]
    fn above_tolerance_adjusted_fair_share_is_normal() {
        let status = compute_status(0.5, 0.5, 0.0, 1.0, None);
        assert_eq!(status, StarvationStatus::Normal);
    }

    #[test]
    fn starving_latches_only_after_timeout_elapses() {
        let mut persistent = PersistentAttributes::default();
        let t0 = Instant::now();
        update_starving(
            &mut persistent,
            StarvationStatus::BelowFairShare,
            t0,
            Duration::from_secs(60),
            Duration::from_secs(60),
        );
        assert!(!persistent.starving, "timer just started, must not starve yet");

        let t1 = t0 + Duration::from_secs(61);
        update_starving(
            &mut persistent,
            StarvationStatus::BelowFairShare,
            t1,
            Duration::from_secs(60),
            Duration::from_secs(60),
        );
        assert!(persistent.starving, "timeout elapsed, must starve");
    }

    #[test]
    fn returning_to_normal_clears_timers_and_starving() {
        let mut persistent = PersistentAttributes::default();
        persistent.starving = true;
        persistent.below_fair_share_since = Some(Instant::now());
        update_starving(
            &mut persistent,
            StarvationStatus::Normal,
            Instant::now(),
            Duration::from_secs(60),
            Duration::from_secs(60),
        );
        assert!(!persistent.starving);
        assert!(persistent.below_fair_share_since.is_none());
    }
}
