//! Soft placement metrics.
//!
//! Every metric is a value in [0, 1]. Backends weight them per metric name
//! and the weighted average decides between workers that passed the
//! predicates:
//! - **resource-fit**: how tightly the task fills what the worker has left
//! - **startup-cost**: whether capacity must be provisioned first (a cost,
//!   so lower is better)

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use taskgrid_state::{Task, Worker};

pub const RESOURCE_FIT: &str = "resource-fit";
pub const STARTUP_COST: &str = "startup-cost";

/// Metrics where a lower value is better.
const COST_METRICS: &[&str] = &[STARTUP_COST];

/// Metric name → weight in [0, 1]. Unlisted metrics weigh 0.
pub type Weights = BTreeMap<String, f64>;

/// Metric name → value in [0, 1].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scores(pub BTreeMap<String, f64>);

impl Scores {
    pub fn set(&mut self, metric: &str, value: f64) {
        self.0.insert(metric.to_string(), value.clamp(0.0, 1.0));
    }

    pub fn get(&self, metric: &str) -> Option<f64> {
        self.0.get(metric).copied()
    }

    /// Weighted average over the metrics that have a non-zero weight.
    /// Cost metrics contribute `1 - value`. Zero when nothing is weighted.
    pub fn weighted(&self, weights: &Weights) -> f64 {
        let mut total = 0.0;
        let mut weight_sum = 0.0;
        for (metric, weight) in weights {
            if *weight == 0.0 {
                continue;
            }
            let Some(value) = self.get(metric) else {
                continue;
            };
            let value = if COST_METRICS.contains(&metric.as_str()) {
                1.0 - value
            } else {
                value
            };
            total += weight * value;
            weight_sum += weight;
        }
        if weight_sum == 0.0 {
            0.0
        } else {
            total / weight_sum
        }
    }
}

/// The metrics every backend computes.
pub fn default_scores(worker: &Worker, task: &Task) -> Scores {
    let mut scores = Scores::default();
    scores.set(RESOURCE_FIT, resource_fit(worker, task));
    scores.set(STARTUP_COST, if worker.is_template() { 1.0 } else { 0.0 });
    scores
}

/// Mean of requested / available over the dimensions the task requests.
fn resource_fit(worker: &Worker, task: &Task) -> f64 {
    let req = &task.resources;
    let avail = &worker.available;
    let ratios = [
        (f64::from(req.cpu_cores), f64::from(avail.cpu_cores)),
        (req.ram_gb, avail.ram_gb),
        (req.disk_gb, avail.disk_gb),
    ];

    let mut sum = 0.0;
    let mut dims = 0u32;
    for (requested, available) in ratios {
        if requested <= 0.0 {
            continue;
        }
        dims += 1;
        sum += if available <= 0.0 {
            1.0
        } else {
            (requested / available).min(1.0)
        };
    }
    if dims == 0 { 0.0 } else { sum / f64::from(dims) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskgrid_state::Resources;

    fn weights(pairs: &[(&str, f64)]) -> Weights {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn tighter_fit_scores_higher() {
        let task = Task::new("t").with_resources(2, 4.0, 0.0);
        let tight = Worker::new("tight", Resources::new(2, 4.0, 10.0));
        let loose = Worker::new("loose", Resources::new(8, 32.0, 10.0));

        let tight_fit = default_scores(&tight, &task).get(RESOURCE_FIT).unwrap();
        let loose_fit = default_scores(&loose, &task).get(RESOURCE_FIT).unwrap();
        assert_eq!(tight_fit, 1.0);
        assert!(loose_fit < tight_fit);
        // (2/8 + 4/32) / 2
        assert!((loose_fit - 0.1875).abs() < 1e-9);
    }

    #[test]
    fn empty_request_has_zero_fit() {
        let task = Task::new("t");
        let worker = Worker::new("w", Resources::new(2, 4.0, 10.0));
        assert_eq!(default_scores(&worker, &task).get(RESOURCE_FIT), Some(0.0));
    }

    #[test]
    fn templates_carry_startup_cost() {
        let task = Task::new("t");
        let live = Worker::new("live", Resources::new(2, 4.0, 10.0));
        let template = Worker::template("tmpl", "n1", Resources::new(2, 4.0, 10.0));
        assert_eq!(default_scores(&live, &task).get(STARTUP_COST), Some(0.0));
        assert_eq!(default_scores(&template, &task).get(STARTUP_COST), Some(1.0));
    }

    #[test]
    fn weighted_ignores_zero_weights() {
        let mut scores = Scores::default();
        scores.set(RESOURCE_FIT, 0.4);
        scores.set(STARTUP_COST, 1.0);

        let value = scores.weighted(&weights(&[(RESOURCE_FIT, 1.0), (STARTUP_COST, 0.0)]));
        assert!((value - 0.4).abs() < 1e-9);
    }

    #[test]
    fn cost_metrics_are_inverted() {
        let mut scores = Scores::default();
        scores.set(RESOURCE_FIT, 0.5);
        scores.set(STARTUP_COST, 1.0);

        // (0.5 * 0.5 + 1.0 * 0.0) / 1.5
        let value = scores.weighted(&weights(&[(RESOURCE_FIT, 0.5), (STARTUP_COST, 1.0)]));
        assert!((value - 0.5 * 0.5 / 1.5).abs() < 1e-9);
    }

    #[test]
    fn no_weights_means_zero() {
        let mut scores = Scores::default();
        scores.set(RESOURCE_FIT, 0.9);
        assert_eq!(scores.weighted(&Weights::new()), 0.0);
    }

    #[test]
    fn values_are_clamped() {
        let mut scores = Scores::default();
        scores.set("custom", 3.0);
        assert_eq!(scores.get("custom"), Some(1.0));
    }
}
