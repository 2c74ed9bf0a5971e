/// Response attribution.
///
/// Every completed request (success or failure) is folded into a counter
/// keyed by `(status, target, responder address, responder node id)`.
/// Comparing `target` with the responder labels shows which node actually
/// served the request, e.g. node A forwarding work to node B.
///
/// Counters are safe to bump from many tasks at once: the map is only
/// write-locked to insert a new label tuple, increments are atomic.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Serialize, Serializer};

use crate::UNKNOWN_LABEL;

/// HTTP status of a response, or a synthetic failure when no response
/// arrived (connection refused, DNS failure, timeout).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResponseStatus {
    Http(u16),
    Failure,
}

impl ResponseStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, ResponseStatus::Failure)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ResponseStatus::Http(code) if (200..300).contains(code))
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseStatus::Http(code) => write!(f, "{code}"),
            ResponseStatus::Failure => f.write_str("failure"),
        }
    }
}

/// Identity reported by the responding node, if it reported one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Responder {
    Known(String),
    Unknown,
}

impl Responder {
    /// Normalize an optional header value; absent or blank is `Unknown`.
    pub fn from_header(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if !v.is_empty() => Responder::Known(v.to_string()),
            _ => Responder::Unknown,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Responder::Known(v) => v,
            Responder::Unknown => UNKNOWN_LABEL,
        }
    }
}

impl fmt::Display for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Outcome of one request, produced by the request issuer.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseRecord {
    pub status: ResponseStatus,
    /// Label of the configured target the request was sent to
    pub target: String,
    pub responder_address: Responder,
    pub responder_node_id: Responder,
    /// Schedule position the request was issued at
    pub stage_index: usize,
    pub latency: Duration,
}

impl ResponseRecord {
    /// Record for a request that never got a response.
    pub fn failure(target: impl Into<String>, stage_index: usize, latency: Duration) -> Self {
        Self {
            status: ResponseStatus::Failure,
            target: target.into(),
            responder_address: Responder::Unknown,
            responder_node_id: Responder::Unknown,
            stage_index,
            latency,
        }
    }

    pub fn trace_index(&self) -> usize {
        crate::schedule::trace_index(self.stage_index)
    }

    pub fn labels(&self) -> AttributionLabels {
        AttributionLabels {
            status: self.status,
            target: self.target.clone(),
            responder_address: self.responder_address.clone(),
            responder_node_id: self.responder_node_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttributionLabels {
    pub status: ResponseStatus,
    pub target: String,
    pub responder_address: Responder,
    pub responder_node_id: Responder,
}

impl Serialize for AttributionLabels {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("AttributionLabels", 4)?;
        s.serialize_field("status", &self.status.to_string())?;
        s.serialize_field("target", &self.target)?;
        s.serialize_field("x_server", self.responder_address.label())?;
        s.serialize_field("dfaas_node_id", self.responder_node_id.label())?;
        s.end()
    }
}

/// One row of a counter snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CounterEntry {
    #[serde(flatten)]
    pub labels: AttributionLabels,
    pub count: u64,
}

#[derive(Debug, Default)]
pub struct AttributionCounters {
    counters: RwLock<HashMap<AttributionLabels, Arc<AtomicU64>>>,
}

impl AttributionCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one completed request.
    pub fn record(&self, record: &ResponseRecord) {
        let labels = record.labels();

        if let Ok(map) = self.counters.read() {
            if let Some(counter) = map.get(&labels) {
                counter.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        // Inserts are single calls, so a poisoned map is still consistent
        let mut map = self.counters.write().unwrap_or_else(|e| e.into_inner());
        map.entry(labels)
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, labels: &AttributionLabels) -> u64 {
        self.read_map()
            .get(labels)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Sum of every counter.
    pub fn total(&self) -> u64 {
        self.read_map()
            .values()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    /// Requests that got no response at all.
    pub fn failures(&self) -> u64 {
        self.read_map()
            .iter()
            .filter(|(labels, _)| labels.status.is_failure())
            .map(|(_, c)| c.load(Ordering::Relaxed))
            .sum()
    }

    /// Counts grouped by responder node id, regardless of status/target.
    pub fn by_responder_node(&self) -> Vec<(Responder, u64)> {
        let mut grouped: HashMap<Responder, u64> = HashMap::new();
        for (labels, counter) in self.read_map().iter() {
            *grouped.entry(labels.responder_node_id.clone()).or_default() +=
                counter.load(Ordering::Relaxed);
        }
        let mut out: Vec<_> = grouped.into_iter().collect();
        out.sort();
        out
    }

    /// Point-in-time copy of every counter, sorted by label.
    pub fn snapshot(&self) -> Vec<CounterEntry> {
        let mut entries: Vec<CounterEntry> = self
            .read_map()
            .iter()
            .map(|(labels, counter)| CounterEntry {
                labels: labels.clone(),
                count: counter.load(Ordering::Relaxed),
            })
            .collect();
        entries.sort_by(|a, b| a.labels.cmp(&b.labels));
        entries
    }

    fn read_map(&self) -> std::sync::RwLockReadGuard<'_, HashMap<AttributionLabels, Arc<AtomicU64>>> {
        self.counters.read().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(code: u16, server: Option<&str>, node: Option<&str>) -> ResponseRecord {
        ResponseRecord {
            status: ResponseStatus::Http(code),
            target: "10.0.2.38:30080".to_string(),
            responder_address: Responder::from_header(server),
            responder_node_id: Responder::from_header(node),
            stage_index: 0,
            latency: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_missing_headers_are_unknown() {
        let record = ok(200, None, Some("   "));
        assert_eq!(record.responder_address, Responder::Unknown);
        assert_eq!(record.responder_node_id, Responder::Unknown);
        assert_eq!(record.responder_address.label(), UNKNOWN_LABEL);
        assert!(!record.responder_address.label().is_empty());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ResponseStatus::Http(429).to_string(), "429");
        assert_eq!(ResponseStatus::Failure.to_string(), "failure");
        assert!(ResponseStatus::Http(204).is_success());
        assert!(!ResponseStatus::Http(503).is_success());
    }

    #[test]
    fn test_record_groups_by_labels() {
        let counters = AttributionCounters::new();
        counters.record(&ok(200, Some("10.0.2.39"), Some("node-b")));
        counters.record(&ok(200, Some("10.0.2.39"), Some("node-b")));
        counters.record(&ok(200, Some("10.0.2.38"), Some("node-a")));
        counters.record(&ResponseRecord::failure("10.0.2.38:30080", 3, Duration::from_secs(8)));

        assert_eq!(counters.total(), 4);
        assert_eq!(counters.failures(), 1);
        assert_eq!(counters.get(&ok(200, Some("10.0.2.39"), Some("node-b")).labels()), 2);
        assert_eq!(counters.snapshot().len(), 3);

        let by_node = counters.by_responder_node();
        assert!(by_node.contains(&(Responder::Known("node-b".into()), 2)));
        assert!(by_node.contains(&(Responder::Unknown, 1)));
    }

    #[test]
    fn test_concurrent_record_loses_nothing() {
        let counters = Arc::new(AttributionCounters::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let counters = Arc::clone(&counters);
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        let node = format!("node-{}", (t + i) % 3);
                        counters.record(&ok(200, None, Some(&node)));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counters.total(), 8000);
    }

    #[test]
    fn test_labels_serialize_with_metric_names() {
        let labels = ok(200, None, Some("b")).labels();
        let json = serde_json::to_value(&labels).unwrap();
        assert_eq!(json["status"], "200");
        assert_eq!(json["x_server"], "undefined");
        assert_eq!(json["dfaas_node_id"], "b");
    }
}
