/// Descriptive statistics for trace series, one summary per (function, node).

use serde::Serialize;

use crate::trace::RateTrace;

/// Percentiles reported for every series
pub const PERCENTILES: [f64; 6] = [0.25, 0.5, 0.75, 0.8, 0.9, 0.95];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesStats {
    pub count: usize,
    pub mean: f64,
    /// Sample standard deviation (n - 1); 0 for fewer than two samples
    pub std_dev: f64,
    pub min: f64,
    /// Values at `PERCENTILES`, same order
    pub percentiles: Vec<f64>,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStats {
    pub function: String,
    pub node: String,
    pub stats: Option<SeriesStats>,
}

/// Summarize one series. `None` when the series is empty.
pub fn describe(values: &[f64]) -> Option<SeriesStats> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let n = sorted.len();
    let mean = sorted.iter().sum::<f64>() / n as f64;
    let std_dev = if n > 1 {
        let var = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
        var.sqrt()
    } else {
        0.0
    };

    Some(SeriesStats {
        count: n,
        mean,
        std_dev,
        min: sorted[0],
        percentiles: PERCENTILES.iter().map(|&q| quantile(&sorted, q)).collect(),
        max: sorted[n - 1],
    })
}

/// Linear-interpolated quantile of an ascending, non-empty slice.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

/// Stats for every node of every function, in key order.
pub fn describe_trace(trace: &RateTrace) -> Vec<NodeStats> {
    trace
        .iter()
        .map(|(function, node, series)| NodeStats {
            function: function.to_string(),
            node: node.to_string(),
            stats: describe(series),
        })
        .collect()
}
