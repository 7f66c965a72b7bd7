//! Packing advisory (spec §4.5 "Packing (brief)").
//!
//! Each operation keeps a short moving window of the node free-resource
//! vectors its jobs actually landed on. A candidate node is "good packing"
//! if, after hypothetically placing the job, the remaining free resources
//! stay close to what the window has already seen — i.e. the job doesn't
//! fragment a node the operation was otherwise packing tightly. Packing
//! never changes resource accounting; it only gates whether Stage N tries a
//! controller call this round, and Stage F re-tries with it disabled.

use std::collections::{HashMap, VecDeque};

use crate::job::OperationId;
use crate::resources::JobResources;

const WINDOW_SIZE: usize = 8;

#[derive(Debug, Default)]
pub struct PackingTracker {
    windows: HashMap<OperationId, VecDeque<JobResources>>,
}

impl PackingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the node's free resources (after the job landed) as a new
    /// sample for `operation_id`'s window.
    pub fn record(&mut self, operation_id: &OperationId, free_after: JobResources) {
        let window = self.windows.entry(operation_id.clone()).or_default();
        window.push_back(free_after);
        if window.len() > WINDOW_SIZE {
            window.pop_front();
        }
    }

    /// `true` if the operation has no history yet (nothing to compare
    /// against) or the hypothetical post-job free resources are within
    /// `threshold` relative distance of the window's mean on the dominant
    /// dimension of `free_after` vs the window average.
    pub fn is_good_fit(&self, operation_id: &OperationId, free_after: &JobResources, threshold: f64) -> bool {
        let Some(window) = self.windows.get(operation_id) else {
            return true;
        };
        if window.is_empty() {
            return true;
        }
        let mean_cpu: f64 = window.iter().map(|r| r.cpu as f64).sum::<f64>() / window.len() as f64;
        if mean_cpu <= 0.0 {
            return true;
        }
        let deviation = (free_after.cpu as f64 - mean_cpu).abs() / mean_cpu;
        deviation <= threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_history_is_always_a_good_fit() {
        let tracker = PackingTracker::new();
        let op = "op1".to_string();
        assert!(tracker.is_good_fit(&op, &JobResources::zero(), 0.1));
    }

    #[test]
    fn consistent_window_accepts_similar_free_resources() {
        let mut tracker = PackingTracker::new();
        let op = "op1".to_string();
        for _ in 0..4 {
            tracker.record(
                &op,
                JobResources {
                    cpu: 100,
                    ..Default::default()
                },
            );
        }
        assert!(tracker.is_good_fit(
            &op,
            &JobResources {
                cpu: 105,
                ..Default::default()
            },
            0.1
        ));
    }

    #[test]
    fn window_rejects_resources_far_from_its_mean() {
        let mut tracker = PackingTracker::new();
        let op = "op1".to_string();
        for _ in 0..4 {
            tracker.record(
                &op,
                JobResources {
                    cpu: 100,
                    ..Default::default()
                },
            );
        }
        assert!(!tracker.is_good_fit(
            &op,
            &JobResources {
                cpu: 10,
                ..Default::default()
            },
            0.1
        ));
    }

    #[test]
    fn window_caps_at_fixed_size() {
        let mut tracker = PackingTracker::new();
        let op = "op1".to_string();
        for i in 0..20 {
            tracker.record(
                &op,
                JobResources {
                    cpu: i,
                    ..Default::default()
                },
            );
        }
        assert_eq!(tracker.windows[&op].len(), WINDOW_SIZE);
    }
}
