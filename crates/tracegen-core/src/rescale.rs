/// Trace rescaling.
///
/// Maps every sample of a trace into a new `[min, max]` range using the
/// global minimum and maximum of the whole trace, with an optional power
/// transform applied to the normalized value (`power = 1.0` is linear).

use crate::error::TraceError;
use crate::trace::RateTrace;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RescaleOptions {
    pub min: f64,
    pub max: f64,
    pub power: f64,
}

impl Default for RescaleOptions {
    fn default() -> Self {
        Self {
            min: 0.0,
            max: 800.0,
            power: 1.0,
        }
    }
}

impl RescaleOptions {
    fn validate(&self) -> Result<(), TraceError> {
        if !self.min.is_finite() || !self.max.is_finite() || self.min < 0.0 {
            return Err(TraceError::InvalidRescale(format!(
                "range [{}, {}] must be finite and non-negative",
                self.min, self.max
            )));
        }
        if self.min > self.max {
            return Err(TraceError::InvalidRescale(format!(
                "min {} is greater than max {}",
                self.min, self.max
            )));
        }
        if !self.power.is_finite() || self.power <= 0.0 {
            return Err(TraceError::InvalidRescale(format!(
                "power {} must be positive",
                self.power
            )));
        }
        Ok(())
    }
}

/// Smallest and largest sample across the whole trace.
pub fn sample_range(trace: &RateTrace) -> Option<(f64, f64)> {
    trace
        .iter()
        .flat_map(|(_, _, series)| series.iter().copied())
        .fold(None, |range, v| match range {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
}

pub fn rescale(trace: &RateTrace, options: RescaleOptions) -> Result<RateTrace, TraceError> {
    options.validate()?;

    let Some((old_min, old_max)) = sample_range(trace) else {
        return Ok(trace.clone());
    };
    let span = old_max - old_min;
    let RescaleOptions { min, max, power } = options;

    Ok(trace.map_samples(|v| {
        if span == 0.0 {
            min
        } else {
            let norm = (v - old_min) / span;
            min + (max - min) * norm.powf(power)
        }
    }))
}
