/// Stage schedule: a piecewise arrival-rate curve built from a rate series.
///
/// Every trace sample becomes two consecutive stages, a short ramp toward
/// the sample's rate followed by a hold at that rate, so stage `i` always
/// belongs to trace sample `i / 2`.
///
/// The schedule also answers the two questions the arrival engine asks on
/// every tick: which stage is active after `elapsed`, and how many requests
/// the curve calls for from the start up to `elapsed`.

use std::time::Duration;

use serde::Serialize;

use crate::error::TraceError;
use crate::{HOLD_UNITS, RAMP_UNITS, STAGES_PER_SAMPLE};

/// Slack absorbed when flooring accumulated request counts, so that a
/// curve integrating to exactly N never yields N - 1 from float error.
const FLOOR_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Linear transition from the previous stage's rate to `target_rate`
    Ramp,
    /// Constant `target_rate`
    Hold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Stage {
    pub kind: StageKind,
    pub duration: Duration,
    /// Requests per second at the end of the stage
    pub target_rate: u32,
}

/// Where the schedule is at a given instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StagePosition {
    pub stage_index: usize,
    pub elapsed_in_stage: Duration,
    /// Effective arrival rate (requests/second) at this instant
    pub rate: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageSchedule {
    stages: Vec<Stage>,
    initial_rate: u32,
    /// Start offset of each stage
    offsets: Vec<Duration>,
    /// Requests the curve calls for before each stage starts
    prefix_requests: Vec<f64>,
    total_duration: Duration,
}

/// Map a stage index back to the trace sample it was built from.
pub fn trace_index(stage_index: usize) -> usize {
    stage_index / STAGES_PER_SAMPLE
}

impl StageSchedule {
    /// Build the schedule for a series of whole-number rates, with stages
    /// measured in seconds (5 s ramp, 55 s hold).
    pub fn build(series: &[u32]) -> Result<Self, TraceError> {
        Self::build_with_unit(series, Duration::from_secs(1))
    }

    /// Build with a custom time unit; the ramp lasts `RAMP_UNITS` units and
    /// the hold `HOLD_UNITS` units.
    pub fn build_with_unit(series: &[u32], unit: Duration) -> Result<Self, TraceError> {
        let Some(&first) = series.first() else {
            return Err(TraceError::EmptySchedule);
        };
        if unit.is_zero() {
            return Err(TraceError::ZeroDuration("time unit"));
        }

        let mut stages = Vec::with_capacity(series.len() * STAGES_PER_SAMPLE);
        for &rate in series {
            stages.push(Stage {
                kind: StageKind::Ramp,
                duration: unit * RAMP_UNITS,
                target_rate: rate,
            });
            stages.push(Stage {
                kind: StageKind::Hold,
                duration: unit * HOLD_UNITS,
                target_rate: rate,
            });
        }

        Ok(Self::from_stages(stages, first))
    }

    /// A single hold stage at a constant rate (fixed-rate smoke runs).
    pub fn constant(rate: u32, duration: Duration) -> Result<Self, TraceError> {
        if duration.is_zero() {
            return Err(TraceError::ZeroDuration("duration"));
        }
        let stage = Stage {
            kind: StageKind::Hold,
            duration,
            target_rate: rate,
        };
        Ok(Self::from_stages(vec![stage], rate))
    }

    fn from_stages(stages: Vec<Stage>, initial_rate: u32) -> Self {
        let mut offsets = Vec::with_capacity(stages.len());
        let mut prefix_requests = Vec::with_capacity(stages.len());
        let mut at = Duration::ZERO;
        let mut requests = 0.0;
        let mut previous_rate = initial_rate;

        for stage in &stages {
            offsets.push(at);
            prefix_requests.push(requests);
            let secs = stage.duration.as_secs_f64();
            requests += requests_within(stage, previous_rate, secs, secs);
            at += stage.duration;
            previous_rate = stage.target_rate;
        }

        Self {
            stages,
            initial_rate,
            offsets,
            prefix_requests,
            total_duration: at,
        }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Throughput the engine starts from, before the first stage ramps.
    pub fn initial_rate(&self) -> u32 {
        self.initial_rate
    }

    pub fn total_duration(&self) -> Duration {
        self.total_duration
    }

    /// Rate the given stage ramps from.
    pub fn start_rate(&self, stage_index: usize) -> u32 {
        match stage_index {
            0 => self.initial_rate,
            i => self.stages[i - 1].target_rate,
        }
    }

    /// Stage active after `elapsed`. Past the end, the last stage is
    /// reported as fully elapsed.
    pub fn position_at(&self, elapsed: Duration) -> Option<StagePosition> {
        if self.stages.is_empty() {
            return None;
        }
        let elapsed = elapsed.min(self.total_duration);
        // Last stage whose start offset is <= elapsed
        let stage_index = self
            .offsets
            .partition_point(|&offset| offset <= elapsed)
            .saturating_sub(1);
        let stage_index = if elapsed == self.total_duration {
            self.stages.len() - 1
        } else {
            stage_index
        };
        let elapsed_in_stage = elapsed - self.offsets[stage_index];
        let stage = &self.stages[stage_index];

        Some(StagePosition {
            stage_index,
            elapsed_in_stage,
            rate: rate_within(
                stage,
                self.start_rate(stage_index),
                stage.duration.as_secs_f64(),
                elapsed_in_stage.as_secs_f64(),
            ),
        })
    }

    /// Requests the curve calls for over `[0, elapsed]`, fractional.
    pub fn cumulative_requests(&self, elapsed: Duration) -> f64 {
        let Some(position) = self.position_at(elapsed) else {
            return 0.0;
        };
        let stage = &self.stages[position.stage_index];
        self.prefix_requests[position.stage_index]
            + requests_within(
                stage,
                self.start_rate(position.stage_index),
                stage.duration.as_secs_f64(),
                position.elapsed_in_stage.as_secs_f64(),
            )
    }

    /// Whole requests due over `[0, elapsed]`; the fractional part carries
    /// into later ticks.
    pub fn requests_due(&self, elapsed: Duration) -> u64 {
        (self.cumulative_requests(elapsed) + FLOOR_EPSILON).floor() as u64
    }

    /// Whole requests a complete run issues.
    pub fn expected_requests(&self) -> u64 {
        self.requests_due(self.total_duration)
    }
}

fn rate_within(stage: &Stage, from: u32, duration_secs: f64, t: f64) -> f64 {
    let to = stage.target_rate as f64;
    match stage.kind {
        StageKind::Hold => to,
        StageKind::Ramp if duration_secs <= 0.0 => to,
        StageKind::Ramp => {
            let from = from as f64;
            from + (to - from) * (t / duration_secs).min(1.0)
        }
    }
}

/// Integral of the stage's rate over its first `t` seconds.
fn requests_within(stage: &Stage, from: u32, duration_secs: f64, t: f64) -> f64 {
    let to = stage.target_rate as f64;
    match stage.kind {
        StageKind::Hold => to * t,
        StageKind::Ramp if duration_secs <= 0.0 => 0.0,
        StageKind::Ramp => {
            let from = from as f64;
            let t = t.min(duration_secs);
            from * t + (to - from) * t * t / (2.0 * duration_secs)
        }
    }
}
