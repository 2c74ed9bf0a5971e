/// Errors raised while loading a trace and turning it into a schedule.
///
/// Every variant is fatal for a run: it is raised during setup, before
/// the first request leaves the process.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("failed to read trace '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid trace format: {0}")]
    Format(String),

    #[error("function '{function}' not found in trace")]
    FunctionNotFound { function: String },

    #[error("node '{node}' not found under function '{function}'")]
    NodeNotFound { function: String, node: String },

    #[error("limit {0} must be non-negative")]
    InvalidLimit(i64),

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("selected rate series is empty, refusing to run an empty schedule")]
    EmptySchedule,

    #[error("invalid rescale parameters: {0}")]
    InvalidRescale(String),
}

/// Coarse classification used by the run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad trace path, bad trace content, unknown key, negative limit,
    /// zero time unit
    Configuration,
    /// The schedule would contain no stages
    ScheduleExhaustion,
}

impl TraceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TraceError::EmptySchedule => ErrorKind::ScheduleExhaustion,
            _ => ErrorKind::Configuration,
        }
    }
}
