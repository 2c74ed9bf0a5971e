/// Run summary and progress reporting.

use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use tracegen_core::attribution::{AttributionCounters, CounterEntry};
use tracegen_core::schedule::trace_index;
use tracegen_core::{ErrorKind, METRIC_NAME};

use crate::engine::{EngineCounts, EngineReport, EngineState, EngineStats};
use crate::scenario::ScenarioProgress;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Setup failed; nothing was sent
    NoTraffic { reason: String, error: String },
    Traffic {
        requests: u64,
        failed: u64,
        failure_percent: f64,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub scenarios: Vec<EngineReport>,
    pub metric: &'static str,
    /// Attribution counter table, sorted by label
    #[serde(rename = "dfaas_requests")]
    pub counters: Vec<CounterEntry>,
}

impl RunSummary {
    pub fn setup_failed(kind: ErrorKind, error: &dyn std::fmt::Display) -> Self {
        let reason = match kind {
            ErrorKind::Configuration => "configuration error",
            ErrorKind::ScheduleExhaustion => "empty schedule",
        };
        Self {
            outcome: RunOutcome::NoTraffic {
                reason: reason.to_string(),
                error: error.to_string(),
            },
            scenarios: Vec::new(),
            metric: METRIC_NAME,
            counters: Vec::new(),
        }
    }

    pub fn from_run(scenarios: Vec<EngineReport>, counters: &AttributionCounters) -> Self {
        let requests = counters.total();
        let failed = counters.failures();
        let failure_percent = if requests == 0 {
            0.0
        } else {
            failed as f64 / requests as f64 * 100.0
        };
        Self {
            outcome: RunOutcome::Traffic {
                requests,
                failed,
                failure_percent,
            },
            scenarios,
            metric: METRIC_NAME,
            counters: counters.snapshot(),
        }
    }

    /// The one line that tells a failed setup apart from a failing run.
    pub fn headline(&self) -> String {
        match &self.outcome {
            RunOutcome::NoTraffic { reason, error } => {
                format!("NO TRAFFIC GENERATED ({reason}): {error}")
            }
            RunOutcome::Traffic {
                requests,
                failure_percent,
                ..
            } => format!("TRAFFIC GENERATED: {requests} requests, {failure_percent:.1}% failed"),
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "╔═══════════════════════════════════════════════════╗");
        let _ = writeln!(out, "║                  TRACE RUN REPORT                 ║");
        let _ = writeln!(out, "╚═══════════════════════════════════════════════════╝");

        for report in &self.scenarios {
            let c = &report.counts;
            let _ = writeln!(out, "\n  {} -> {}", report.scenario, report.target);
            let _ = writeln!(out, "    Duration:     {:.1}s{}", report.elapsed_secs,
                if report.stopped_early { " (stopped early)" } else { "" });
            let _ = writeln!(out, "    Scheduled:    {} of {} expected", c.scheduled, report.expected);
            let _ = writeln!(out, "    Completed:    {} ({:.2}% failed)", c.completed, report.failure_percent());
            let _ = writeln!(out, "    Delayed:      {}", c.delayed);
            let _ = writeln!(out, "    Discarded:    {}", c.discarded);
            let _ = writeln!(out, "    Abandoned:    {}", c.abandoned);
            if c.log_dropped > 0 {
                let _ = writeln!(out, "    Log dropped:  {}", c.log_dropped);
            }
            let _ = writeln!(out, "    Latency:      mean={:.1}ms  max={:.1}ms", report.mean_latency_ms, report.max_latency_ms);
        }

        if !self.counters.is_empty() {
            let _ = writeln!(out, "\n  {}:", self.metric);
            let _ = writeln!(out, "    {:<8} {:<22} {:<16} {:<16} {:>8}", "status", "target", "x_server", "dfaas_node_id", "count");
            for entry in &self.counters {
                let labels = &entry.labels;
                let _ = writeln!(
                    out,
                    "    {:<8} {:<22} {:<16} {:<16} {:>8}",
                    labels.status.to_string(),
                    labels.target,
                    labels.responder_address.label(),
                    labels.responder_node_id.label(),
                    entry.count
                );
            }
        }

        let _ = writeln!(out, "\n  {}", self.headline());
        out
    }

    pub fn print(&self) {
        println!("\n{}", self.render());
    }

    pub fn write_json(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write summary {}", path.display()))?;
        info!(path = %path.display(), "Summary written");
        Ok(())
    }
}

/// Log progress every `every` until `done` fires: one line per scenario
/// still running, then the totals.
pub fn spawn_progress(
    scenarios: Vec<ScenarioProgress>,
    every: Duration,
    done: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // First tick is immediate
        interval.tick().await;
        loop {
            tokio::select! {
                _ = done.cancelled() => break,
                _ = interval.tick() => {}
            }
            for scenario in &scenarios {
                let state = *scenario.state.borrow();
                if let EngineState::Running { stage_index, elapsed_in_stage } = state {
                    let counts = scenario.stats.counts();
                    info!(
                        scenario = %scenario.name,
                        stage = stage_index,
                        trace_index = trace_index(stage_index),
                        elapsed_in_stage_secs = elapsed_in_stage.as_secs(),
                        scheduled = counts.scheduled,
                        completed = counts.completed,
                        "Scenario progress"
                    );
                }
            }
            let stats: Vec<&EngineStats> = scenarios.iter().map(|s| s.stats.as_ref()).collect();
            let total = aggregate(&stats);
            let in_flight: u64 = stats.iter().map(|s| s.in_flight()).sum();
            info!(
                scheduled = total.scheduled,
                completed = total.completed,
                failed = total.failed,
                delayed = total.delayed,
                in_flight,
                "Progress"
            );
        }
    })
}

fn aggregate(stats: &[&EngineStats]) -> EngineCounts {
    stats.iter().map(|s| s.counts()).fold(EngineCounts::default(), |mut acc, c| {
        acc.scheduled += c.scheduled;
        acc.dispatched += c.dispatched;
        acc.delayed += c.delayed;
        acc.discarded += c.discarded;
        acc.completed += c.completed;
        acc.failed += c.failed;
        acc.abandoned += c.abandoned;
        acc.log_dropped += c.log_dropped;
        acc
    })
}
