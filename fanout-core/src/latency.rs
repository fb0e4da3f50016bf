//! Latency aggregation shared by run finalisation and analytics.

use serde::{Deserialize, Serialize};

/// Aggregate over the `latency_ms` values of a run's legs.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct LatencySummary {
    pub count: usize,
    pub average_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
}

impl LatencySummary {
    /// Build a summary from raw per-leg latencies. Returns `None` when the
    /// slice is empty so callers can keep the field optional.
    #[must_use]
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let count = sorted.len();
        let average_ms = sorted.iter().sum::<f64>() / count as f64;
        Some(Self {
            count,
            average_ms,
            max_ms: sorted[count - 1],
            p50_ms: percentile_sorted(&sorted, 50.0),
            p95_ms: percentile_sorted(&sorted, 95.0),
        })
    }
}

/// Linear-interpolation percentile over an unsorted sample set.
#[must_use]
pub fn percentile(values: &[f64], pct: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    Some(percentile_sorted(&sorted, pct))
}

fn percentile_sorted(sorted: &[f64], pct: f64) -> f64 {
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = (pct / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        return sorted[lower];
    }
    let fraction = rank - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}
