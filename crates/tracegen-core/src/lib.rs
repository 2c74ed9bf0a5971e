pub mod attribution;
pub mod error;
pub mod rescale;
pub mod schedule;
pub mod stats;
pub mod trace;

/// Name of the per-request counter emitted by a run
pub const METRIC_NAME: &str = "dfaas_requests";

/// Label used when a response carries no responder metadata
pub const UNKNOWN_LABEL: &str = "undefined";

/// Response headers identifying the node that actually served a request
pub const DEFAULT_RESPONDER_ADDRESS_HEADER: &str = "X-Server";
pub const DEFAULT_RESPONDER_NODE_HEADER: &str = "Dfaas-Node-Id";

/// Request header carrying the stage index of each outgoing request
pub const DEFAULT_STAGE_HEADER: &str = "X-Stage-Index";

/// Stage lengths, in time units, for each trace sample
pub const RAMP_UNITS: u32 = 5;
pub const HOLD_UNITS: u32 = 55;

/// Each trace sample produces a ramp stage followed by a hold stage
pub const STAGES_PER_SAMPLE: usize = 2;

pub use error::{ErrorKind, TraceError};
