/// Per-request JSON-lines log.
///
/// Workers hand completed records to a bounded channel; a single writer
/// task owns the file so workers never block on disk I/O.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use tracegen_core::attribution::ResponseRecord;

use crate::scenario::SetupError;

const LOG_CHANNEL_CAPACITY: usize = 10_000;

/// A completed request, tagged with the scenario that issued it.
#[derive(Debug, Clone)]
pub struct LoggedResponse {
    pub scenario: Arc<str>,
    pub record: ResponseRecord,
    pub completed_at_ms: u64,
}

impl LoggedResponse {
    pub fn new(scenario: Arc<str>, record: ResponseRecord) -> Self {
        Self {
            scenario,
            record,
            completed_at_ms: now_ms(),
        }
    }
}

#[derive(Debug, Serialize)]
struct LogLine<'a> {
    timestamp_ms: u64,
    scenario: &'a str,
    stage: usize,
    trace_index: usize,
    status: String,
    target: &'a str,
    x_server: &'a str,
    dfaas_node_id: &'a str,
    latency_ms: f64,
}

impl<'a> From<&'a LoggedResponse> for LogLine<'a> {
    fn from(entry: &'a LoggedResponse) -> Self {
        let record = &entry.record;
        Self {
            timestamp_ms: entry.completed_at_ms,
            scenario: &entry.scenario,
            stage: record.stage_index,
            trace_index: record.trace_index(),
            status: record.status.to_string(),
            target: &record.target,
            x_server: record.responder_address.label(),
            dfaas_node_id: record.responder_node_id.label(),
            latency_ms: record.latency.as_micros() as f64 / 1000.0,
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Create the log file and start the writer. The task finishes once every
/// sender is dropped, returning the number of lines written.
pub async fn spawn_writer(
    path: &Path,
) -> Result<(mpsc::Sender<LoggedResponse>, JoinHandle<anyhow::Result<u64>>), SetupError> {
    let file = File::create(path).await.map_err(|source| SetupError::RequestLog {
        path: path.to_path_buf(),
        source,
    })?;
    let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
    let handle = tokio::spawn(write_lines(file, path.to_path_buf(), rx));
    Ok((tx, handle))
}

async fn write_lines(
    file: File,
    path: PathBuf,
    mut rx: mpsc::Receiver<LoggedResponse>,
) -> anyhow::Result<u64> {
    let mut out = BufWriter::new(file);
    let mut written = 0u64;
    let mut buf = Vec::with_capacity(256);

    while let Some(entry) = rx.recv().await {
        buf.clear();
        serde_json::to_writer(&mut buf, &LogLine::from(&entry))?;
        buf.push(b'\n');
        if let Err(e) = out.write_all(&buf).await {
            warn!(path = %path.display(), error = %e, "Request log write failed, dropping remaining lines");
            return Err(e.into());
        }
        written += 1;
    }

    out.flush().await?;
    info!(path = %path.display(), lines = written, "Request log written");
    Ok(written)
}
