/// Rate trace storage.
///
/// A trace is a JSON object of objects of number arrays:
/// `{ "<function>": { "<node>": [rate0, rate1, ...] } }`, one sample per
/// fixed time bucket (one minute in the recorded traces). It is loaded
/// once at startup and only read afterwards.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;

use crate::error::TraceError;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct RateTrace {
    functions: BTreeMap<String, BTreeMap<String, Vec<f64>>>,
}

/// Round a sampled rate to whole requests per second, half-up.
///
/// Negative and non-finite input maps to 0.
pub fn round_rate(value: f64) -> u32 {
    if !value.is_finite() || value <= 0.0 {
        return 0;
    }
    // `as` saturates at u32::MAX
    (value + 0.5).floor() as u32
}

impl RateTrace {
    /// Read and validate a trace file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TraceError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| TraceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    /// Parse and validate a trace from JSON text.
    pub fn from_json(raw: &str) -> Result<Self, TraceError> {
        let functions: BTreeMap<String, BTreeMap<String, Vec<f64>>> =
            serde_json::from_str(raw).map_err(|e| TraceError::Format(e.to_string()))?;

        for (function, nodes) in &functions {
            for (node, series) in nodes {
                if let Some((index, value)) = series
                    .iter()
                    .enumerate()
                    .find(|(_, v)| !v.is_finite() || **v < 0.0)
                {
                    return Err(TraceError::Format(format!(
                        "function '{function}' node '{node}' sample {index} is {value}, rates must be non-negative"
                    )));
                }
            }
        }

        Ok(Self { functions })
    }

    pub fn from_map(functions: BTreeMap<String, BTreeMap<String, Vec<f64>>>) -> Self {
        Self { functions }
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn functions(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    pub fn nodes(&self, function: &str) -> Result<impl Iterator<Item = &str>, TraceError> {
        let nodes = self.function(function)?;
        Ok(nodes.keys().map(String::as_str))
    }

    /// Raw (unrounded) samples of one node.
    pub fn series(&self, function: &str, node: &str) -> Result<&[f64], TraceError> {
        self.function(function)?
            .get(node)
            .map(Vec::as_slice)
            .ok_or_else(|| TraceError::NodeNotFound {
                function: function.to_string(),
                node: node.to_string(),
            })
    }

    /// Select the rate series for `(function, node)`, truncated to the first
    /// `limit` samples when `limit > 0`, rounded to whole requests/second.
    pub fn select(&self, function: &str, node: &str, limit: i64) -> Result<Vec<u32>, TraceError> {
        if limit < 0 {
            return Err(TraceError::InvalidLimit(limit));
        }
        let series = self.series(function, node)?;
        let take = if limit == 0 {
            series.len()
        } else {
            series.len().min(limit as usize)
        };
        Ok(series[..take].iter().copied().map(round_rate).collect())
    }

    /// Iterate every `(function, node, series)` in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &[f64])> {
        self.functions.iter().flat_map(|(function, nodes)| {
            nodes
                .iter()
                .map(move |(node, series)| (function.as_str(), node.as_str(), series.as_slice()))
        })
    }

    /// Apply `f` to every sample, keeping the shape.
    pub fn map_samples(&self, mut f: impl FnMut(f64) -> f64) -> Self {
        let mut functions = BTreeMap::new();
        for (function, nodes) in &self.functions {
            let mut mapped = BTreeMap::new();
            for (node, series) in nodes {
                let samples: Vec<f64> = series.iter().map(|&v| f(v)).collect();
                mapped.insert(node.clone(), samples);
            }
            functions.insert(function.clone(), mapped);
        }
        Self { functions }
    }

    pub fn to_json_pretty(&self) -> String {
        // A map of finite f64 always serializes
        serde_json::to_string_pretty(&self.functions).unwrap_or_default()
    }

    fn function(&self, function: &str) -> Result<&BTreeMap<String, Vec<f64>>, TraceError> {
        self.functions
            .get(function)
            .ok_or_else(|| TraceError::FunctionNotFound {
                function: function.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_rate_half_up() {
        assert_eq!(round_rate(2.5), 3);
        assert_eq!(round_rate(2.4), 2);
        assert_eq!(round_rate(0.5), 1);
        assert_eq!(round_rate(0.49), 0);
        assert_eq!(round_rate(-3.0), 0);
        assert_eq!(round_rate(f64::NAN), 0);
    }

    #[test]
    fn test_round_rate_idempotent() {
        for v in [0.0, 0.5, 1.49, 2.5, 10.0, 99.99, 1234.5] {
            let once = round_rate(v);
            assert_eq!(round_rate(once as f64), once);
        }
    }

    #[test]
    fn test_select_full_series() {
        let trace = RateTrace::from_json(r#"{"0":{"0":[10.2,19.5,30]}}"#).unwrap();
        assert_eq!(trace.select("0", "0", 0).unwrap(), vec![10, 20, 30]);
    }

    #[test]
    fn test_select_truncates() {
        let trace = RateTrace::from_json(r#"{"0":{"0":[10,20,30]}}"#).unwrap();
        assert_eq!(trace.select("0", "0", 2).unwrap(), vec![10, 20]);
        // Limit past the end keeps everything
        assert_eq!(trace.select("0", "0", 10).unwrap(), vec![10, 20, 30]);
    }

    #[test]
    fn test_select_negative_limit() {
        let trace = RateTrace::from_json(r#"{"0":{"0":[10]}}"#).unwrap();
        assert!(matches!(trace.select("0", "0", -1), Err(TraceError::InvalidLimit(-1))));
    }

    #[test]
    fn test_missing_keys() {
        let trace = RateTrace::from_json(r#"{"0":{"0":[10]}}"#).unwrap();
        assert!(matches!(
            trace.select("1", "0", 0),
            Err(TraceError::FunctionNotFound { ref function }) if function == "1"
        ));
        assert!(matches!(
            trace.select("0", "3", 0),
            Err(TraceError::NodeNotFound { ref node, .. }) if node == "3"
        ));
    }

    #[test]
    fn test_rejects_bad_shape() {
        assert!(matches!(RateTrace::from_json("not json"), Err(TraceError::Format(_))));
        assert!(matches!(RateTrace::from_json(r#"{"0":[1,2]}"#), Err(TraceError::Format(_))));
        assert!(matches!(
            RateTrace::from_json(r#"{"0":{"0":["a"]}}"#),
            Err(TraceError::Format(_))
        ));
        assert!(matches!(
            RateTrace::from_json(r#"{"0":{"0":[1,-2]}}"#),
            Err(TraceError::Format(_))
        ));
    }

    #[test]
    fn test_iter_and_nodes() {
        let trace = RateTrace::from_json(r#"{"0":{"0":[1],"1":[2,3]},"1":{"0":[]}}"#).unwrap();
        assert_eq!(trace.functions().collect::<Vec<_>>(), vec!["0", "1"]);
        assert_eq!(trace.nodes("0").unwrap().collect::<Vec<_>>(), vec!["0", "1"]);
        assert_eq!(trace.iter().count(), 3);
        assert!(trace.series("1", "0").unwrap().is_empty());
    }

    #[test]
    fn test_load_missing_file() {
        let err = RateTrace::load("/nonexistent/trace.json").unwrap_err();
        assert!(matches!(err, TraceError::Io { .. }));
    }
}
