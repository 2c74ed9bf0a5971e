/// Run configuration.
///
/// Loaded once from a TOML file (every section optional, with defaults),
/// then overridden by CLI flags / environment, then frozen. Components
/// receive the pieces they need by reference.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use tracegen_core::{
    DEFAULT_RESPONDER_ADDRESS_HEADER, DEFAULT_RESPONDER_NODE_HEADER, DEFAULT_STAGE_HEADER,
};

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RunConfig {
    #[serde(default)]
    pub trace: TraceSection,
    #[serde(default)]
    pub request: RequestSection,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub attribution: AttributionSection,
    #[serde(default)]
    pub output: OutputSection,
    #[serde(default, rename = "scenario")]
    pub scenarios: Vec<ScenarioSection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TraceSection {
    /// Trace file; required for trace-driven runs
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Keep only the first N samples (0 = all)
    #[serde(default)]
    pub limit: i64,
    /// Length of one stage time unit; stages last 5 and 55 units
    #[serde(default = "default_time_unit_ms")]
    pub time_unit_ms: u64,
}

impl Default for TraceSection {
    fn default() -> Self {
        Self {
            path: None,
            limit: 0,
            time_unit_ms: default_time_unit_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequestSection {
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_body")]
    pub body: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Extra headers sent with every request
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Header carrying the stage index (empty = don't send it)
    #[serde(default = "default_stage_header")]
    pub stage_header: String,
}

impl Default for RequestSection {
    fn default() -> Self {
        Self {
            method: default_method(),
            body: default_body(),
            content_type: default_content_type(),
            timeout_ms: default_timeout_ms(),
            headers: BTreeMap::new(),
            stage_header: default_stage_header(),
        }
    }
}

impl RequestSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    /// Dispatch queue capacity and warm HTTP connections per host
    #[serde(default = "default_pre_allocated")]
    pub pre_allocated: usize,
    /// Hard ceiling on in-flight requests
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    /// Stop the whole run after this many seconds (0 = no deadline)
    #[serde(default)]
    pub run_deadline_secs: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            pre_allocated: default_pre_allocated(),
            max_concurrency: default_max_concurrency(),
            tick_ms: default_tick_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            run_deadline_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttributionSection {
    #[serde(default = "default_address_header")]
    pub responder_address_header: String,
    #[serde(default = "default_node_header")]
    pub responder_node_header: String,
}

impl Default for AttributionSection {
    fn default() -> Self {
        Self {
            responder_address_header: default_address_header(),
            responder_node_header: default_node_header(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputSection {
    /// Write the final summary as JSON here
    #[serde(default)]
    pub summary_path: Option<PathBuf>,
    /// Write one JSON line per completed request here
    #[serde(default)]
    pub request_log_path: Option<PathBuf>,
    /// Seconds between progress lines (0 = off)
    #[serde(default = "default_progress_interval")]
    pub progress_interval_secs: u64,
}

impl Default for OutputSection {
    fn default() -> Self {
        Self {
            summary_path: None,
            request_log_path: None,
            progress_interval_secs: default_progress_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioSection {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_key")]
    pub function: String,
    #[serde(default = "default_key")]
    pub node: String,
    pub url: String,
    #[serde(default)]
    pub start_delay_secs: u64,
}

// Default value functions
fn default_time_unit_ms() -> u64 { 1000 }
fn default_method() -> String { "POST".to_string() }
fn default_body() -> String { "Ciao".to_string() }
fn default_content_type() -> String { "text/plain".to_string() }
fn default_timeout_ms() -> u64 { 8000 }
fn default_stage_header() -> String { DEFAULT_STAGE_HEADER.to_string() }
fn default_pre_allocated() -> usize { 3000 }
fn default_max_concurrency() -> usize { 50_000 }
fn default_tick_ms() -> u64 { 50 }
fn default_drain_timeout_ms() -> u64 { 10_000 }
fn default_address_header() -> String { DEFAULT_RESPONDER_ADDRESS_HEADER.to_string() }
fn default_node_header() -> String { DEFAULT_RESPONDER_NODE_HEADER.to_string() }
fn default_progress_interval() -> u64 { 10 }
fn default_key() -> String { "0".to_string() }

/// Overrides from the command line / environment. `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub trace_path: Option<PathBuf>,
    pub function: Option<String>,
    pub node: Option<String>,
    pub limit: Option<i64>,
    pub url: Option<String>,
    pub time_unit_ms: Option<u64>,
    pub summary_path: Option<PathBuf>,
    pub request_log_path: Option<PathBuf>,
}

impl RunConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("failed to parse config file {}", path.display()))
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Fold CLI overrides in. Function/node/url apply to a single implicit
    /// scenario when the file declares none, or to every declared scenario.
    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(path) = overrides.trace_path {
            self.trace.path = Some(path);
        }
        if let Some(limit) = overrides.limit {
            self.trace.limit = limit;
        }
        if let Some(unit) = overrides.time_unit_ms {
            self.trace.time_unit_ms = unit;
        }
        if let Some(path) = overrides.summary_path {
            self.output.summary_path = Some(path);
        }
        if let Some(path) = overrides.request_log_path {
            self.output.request_log_path = Some(path);
        }

        if self.scenarios.is_empty() {
            if let Some(url) = overrides.url.clone() {
                self.scenarios.push(ScenarioSection {
                    name: String::new(),
                    function: default_key(),
                    node: default_key(),
                    url,
                    start_delay_secs: 0,
                });
            }
        }
        for scenario in &mut self.scenarios {
            if let Some(function) = &overrides.function {
                scenario.function = function.clone();
            }
            if let Some(node) = &overrides.node {
                scenario.node = node.clone();
            }
            if let Some(url) = &overrides.url {
                scenario.url = url.clone();
            }
            if scenario.name.is_empty() {
                scenario.name = format!("trace_f{}_n{}", scenario.function, scenario.node);
            }
        }
    }

    pub fn time_unit(&self) -> Duration {
        Duration::from_millis(self.trace.time_unit_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RunConfig::parse("").unwrap();
        assert_eq!(config.request.method, "POST");
        assert_eq!(config.request.content_type, "text/plain");
        assert_eq!(config.request.timeout(), Duration::from_secs(8));
        assert_eq!(config.engine.pre_allocated, 3000);
        assert_eq!(config.engine.max_concurrency, 50_000);
        assert_eq!(config.attribution.responder_address_header, "X-Server");
        assert_eq!(config.attribution.responder_node_header, "Dfaas-Node-Id");
        assert_eq!(config.time_unit(), Duration::from_secs(1));
        assert!(config.scenarios.is_empty());
    }

    #[test]
    fn test_full_file() {
        let config = RunConfig::parse(
            r#"
            [trace]
            path = "traces/node.json"
            limit = 30

            [request]
            method = "GET"
            body = "Hello DFaaS World!"
            headers = { "X-Test" = "1" }

            [engine]
            max_concurrency = 100
            tick_ms = 20

            [[scenario]]
            name = "node-0"
            url = "http://10.0.2.38:30080/function/figlet"

            [[scenario]]
            name = "node-1"
            function = "0"
            node = "1"
            url = "http://10.0.2.39:30080/function/figlet"
            start_delay_secs = 300
            "#,
        )
        .unwrap();

        assert_eq!(config.trace.path.as_deref(), Some(Path::new("traces/node.json")));
        assert_eq!(config.trace.limit, 30);
        assert_eq!(config.request.method, "GET");
        assert_eq!(config.request.headers.get("X-Test").map(String::as_str), Some("1"));
        assert_eq!(config.engine.max_concurrency, 100);
        assert_eq!(config.engine.pre_allocated, 3000);
        assert_eq!(config.scenarios.len(), 2);
        assert_eq!(config.scenarios[1].node, "1");
        assert_eq!(config.scenarios[1].start_delay_secs, 300);
    }

    #[test]
    fn test_overrides_create_implicit_scenario() {
        let mut config = RunConfig::default();
        config.apply(Overrides {
            trace_path: Some(PathBuf::from("t.json")),
            function: Some("2".into()),
            url: Some("http://localhost:30080/function/figlet".into()),
            limit: Some(5),
            ..Default::default()
        });
        assert_eq!(config.trace.limit, 5);
        assert_eq!(config.scenarios.len(), 1);
        assert_eq!(config.scenarios[0].function, "2");
        assert_eq!(config.scenarios[0].node, "0");
        assert_eq!(config.scenarios[0].name, "trace_f2_n0");
    }

    #[test]
    fn test_rejects_unknown_types() {
        assert!(RunConfig::parse("[engine]\nmax_concurrency = \"lots\"").is_err());
    }
}
