/// Open-model arrival engine.
///
/// The engine walks a `StageSchedule` on a fixed tick. On every tick it
/// computes how many whole requests the rate curve calls for so far and
/// hands the new ones to a dispatcher, regardless of whether earlier
/// requests have completed. The dispatcher starts one worker per request,
/// bounded by `max_concurrency` in-flight requests.
///
/// Lifecycle: Idle -> Running -> Draining -> Terminated. Draining begins
/// when the schedule is exhausted or the run is cancelled; in-flight
/// requests get `drain_timeout` to finish before they are abandoned.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tracegen_core::attribution::{AttributionCounters, ResponseRecord};
use tracegen_core::schedule::{trace_index, StageSchedule};

use crate::config::EngineSection;
use crate::issuer::{Issue, RequestTarget, ScheduledRequest};
use crate::request_log::LoggedResponse;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Dispatch queue capacity
    pub pre_allocated: usize,
    pub max_concurrency: usize,
    pub tick: Duration,
    pub drain_timeout: Duration,
}

impl EngineConfig {
    pub fn from_section(section: &EngineSection) -> Self {
        Self {
            pre_allocated: section.pre_allocated.max(1),
            max_concurrency: section.max_concurrency.max(1),
            tick: Duration::from_millis(section.tick_ms.max(1)),
            drain_timeout: Duration::from_millis(section.drain_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Running {
        stage_index: usize,
        elapsed_in_stage: Duration,
    },
    Draining,
    Terminated,
}

/// Live counters, shared with the progress reporter.
#[derive(Debug, Default)]
pub struct EngineStats {
    scheduled: AtomicU64,
    dispatched: AtomicU64,
    delayed: AtomicU64,
    discarded: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    abandoned: AtomicU64,
    log_dropped: AtomicU64,
    latency_sum_us: AtomicU64,
    latency_max_us: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineCounts {
    /// Requests the rate curve called for so far
    pub scheduled: u64,
    /// Requests handed to a worker
    pub dispatched: u64,
    /// Dispatched later than one tick after being scheduled
    pub delayed: u64,
    /// Scheduled but never dispatched because the run stopped
    pub discarded: u64,
    /// Dispatched and finished, success or failure
    pub completed: u64,
    /// Completed without a response
    pub failed: u64,
    /// Still in flight when the drain timeout expired
    pub abandoned: u64,
    /// Completed records the request log had no room for
    pub log_dropped: u64,
}

impl EngineStats {
    fn record_completion(&self, record: &ResponseRecord) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        if record.status.is_failure() {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        let us = record.latency.as_micros() as u64;
        self.latency_sum_us.fetch_add(us, Ordering::Relaxed);
        self.latency_max_us.fetch_max(us, Ordering::Relaxed);
    }

    pub fn counts(&self) -> EngineCounts {
        EngineCounts {
            scheduled: self.scheduled.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            delayed: self.delayed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            log_dropped: self.log_dropped.load(Ordering::Relaxed),
        }
    }

    pub fn in_flight(&self) -> u64 {
        let counts = self.counts();
        counts
            .dispatched
            .saturating_sub(counts.completed + counts.abandoned)
    }

    pub fn mean_latency(&self) -> Duration {
        let completed = self.completed.load(Ordering::Relaxed);
        if completed == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.latency_sum_us.load(Ordering::Relaxed) / completed)
    }

    pub fn max_latency(&self) -> Duration {
        Duration::from_micros(self.latency_max_us.load(Ordering::Relaxed))
    }
}

/// Final tally of one engine run.
#[derive(Debug, Clone, Serialize)]
pub struct EngineReport {
    pub scenario: String,
    pub target: String,
    /// Whole requests a complete run of the schedule issues
    pub expected: u64,
    #[serde(flatten)]
    pub counts: EngineCounts,
    pub elapsed_secs: f64,
    pub mean_latency_ms: f64,
    pub max_latency_ms: f64,
    /// Cancelled before the schedule was exhausted
    pub stopped_early: bool,
}

impl EngineReport {
    pub fn failure_percent(&self) -> f64 {
        if self.counts.dispatched == 0 {
            return 0.0;
        }
        self.counts.failed as f64 / self.counts.dispatched as f64 * 100.0
    }

    /// Nothing was scheduled.
    pub fn is_empty(&self) -> bool {
        self.counts == EngineCounts::default()
    }
}

/// Everything a worker task needs, shared across all of them.
struct Worker<I> {
    scenario: Arc<str>,
    issuer: Arc<I>,
    counters: Arc<AttributionCounters>,
    stats: Arc<EngineStats>,
    sink: Option<mpsc::Sender<LoggedResponse>>,
}

impl<I: Issue> Worker<I> {
    /// No await point after the record is counted, so an aborted worker is
    /// never both completed and abandoned.
    async fn handle(&self, request: ScheduledRequest, permit: OwnedSemaphorePermit) {
        let record = self.issuer.issue(request).await;
        drop(permit);
        self.counters.record(&record);
        self.stats.record_completion(&record);
        if let Some(sink) = &self.sink {
            let entry = LoggedResponse::new(Arc::clone(&self.scenario), record);
            if sink.try_send(entry).is_err() {
                self.stats.log_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

pub struct ArrivalEngine<I> {
    scenario: Arc<str>,
    schedule: Arc<StageSchedule>,
    target: Arc<RequestTarget>,
    issuer: Arc<I>,
    counters: Arc<AttributionCounters>,
    config: EngineConfig,
    stats: Arc<EngineStats>,
    state: watch::Sender<EngineState>,
    sink: Option<mpsc::Sender<LoggedResponse>>,
}

impl<I: Issue> ArrivalEngine<I> {
    pub fn new(
        scenario: &str,
        schedule: Arc<StageSchedule>,
        target: Arc<RequestTarget>,
        issuer: Arc<I>,
        counters: Arc<AttributionCounters>,
        config: EngineConfig,
    ) -> Self {
        let (state, _) = watch::channel(EngineState::Idle);
        Self {
            scenario: Arc::from(scenario),
            schedule,
            target,
            issuer,
            counters,
            config,
            stats: Arc::new(EngineStats::default()),
            state,
            sink: None,
        }
    }

    /// Forward every completed record to the request log.
    pub fn with_request_log(mut self, sink: mpsc::Sender<LoggedResponse>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn name(&self) -> &str {
        &self.scenario
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        Arc::clone(&self.stats)
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    /// Run the schedule to completion or until `cancel` fires, then drain.
    pub async fn run(self, cancel: CancellationToken) -> EngineReport {
        let started = Instant::now();
        let stop = cancel.child_token();
        let (queue_tx, queue_rx) = mpsc::channel(self.config.pre_allocated);

        let worker = Arc::new(Worker {
            scenario: Arc::clone(&self.scenario),
            issuer: Arc::clone(&self.issuer),
            counters: Arc::clone(&self.counters),
            stats: Arc::clone(&self.stats),
            sink: self.sink.clone(),
        });
        let dispatcher = tokio::spawn(dispatch(
            queue_rx,
            Arc::new(Semaphore::new(self.config.max_concurrency)),
            worker,
            stop.clone(),
            self.config.tick,
        ));

        info!(
            scenario = %self.scenario,
            endpoint = %self.target.label,
            stages = self.schedule.len(),
            initial_rate = self.schedule.initial_rate(),
            expected = self.schedule.expected_requests(),
            duration_secs = self.schedule.total_duration().as_secs_f64(),
            "Arrival engine starting"
        );

        self.tick_loop(queue_tx, &stop, started).await;

        self.state.send_replace(EngineState::Draining);
        let in_flight = match dispatcher.await {
            Ok(set) => set,
            Err(e) => {
                error!(scenario = %self.scenario, "Dispatcher task failed: {}", e);
                JoinSet::new()
            }
        };
        self.drain(in_flight).await;
        self.state.send_replace(EngineState::Terminated);

        let report = self.report(started.elapsed(), stop.is_cancelled());
        info!(
            scenario = %report.scenario,
            dispatched = report.counts.dispatched,
            failed = report.counts.failed,
            delayed = report.counts.delayed,
            discarded = report.counts.discarded,
            abandoned = report.counts.abandoned,
            "Arrival engine terminated"
        );
        if report.counts.log_dropped > 0 {
            warn!(
                scenario = %report.scenario,
                dropped = report.counts.log_dropped,
                "Request log fell behind, lines dropped"
            );
        }
        report
    }

    async fn tick_loop(
        &self,
        queue: mpsc::Sender<ScheduledRequest>,
        stop: &CancellationToken,
        started: Instant,
    ) {
        let mut interval = tokio::time::interval(self.config.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let total = self.schedule.total_duration();
        let mut backlog: VecDeque<ScheduledRequest> = VecDeque::new();
        let mut scheduled = 0u64;
        let mut current_stage = None;

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = interval.tick() => {}
            }

            let elapsed = started.elapsed();
            let Some(position) = self.schedule.position_at(elapsed) else {
                break;
            };
            if current_stage != Some(position.stage_index) {
                current_stage = Some(position.stage_index);
                let stage = &self.schedule.stages()[position.stage_index];
                info!(
                    scenario = %self.scenario,
                    stage = position.stage_index,
                    trace_index = trace_index(position.stage_index),
                    kind = ?stage.kind,
                    target_rate = stage.target_rate,
                    "Entering stage"
                );
            }
            self.state.send_replace(EngineState::Running {
                stage_index: position.stage_index,
                elapsed_in_stage: position.elapsed_in_stage,
            });

            let due = self.schedule.requests_due(elapsed).saturating_sub(scheduled);
            let now = Instant::now();
            for _ in 0..due {
                backlog.push_back(ScheduledRequest {
                    target: Arc::clone(&self.target),
                    stage_index: position.stage_index,
                    sequence: scheduled,
                    scheduled_at: now,
                });
                scheduled += 1;
            }
            self.stats.scheduled.store(scheduled, Ordering::Relaxed);

            // Hand over in order; whatever does not fit waits for the next tick
            while let Some(request) = backlog.pop_front() {
                match queue.try_send(request) {
                    Ok(()) => {}
                    Err(TrySendError::Full(request)) => {
                        backlog.push_front(request);
                        break;
                    }
                    Err(TrySendError::Closed(request)) => {
                        backlog.push_front(request);
                        stop.cancel();
                        break;
                    }
                }
            }
            if !backlog.is_empty() {
                debug!(scenario = %self.scenario, backlog = backlog.len(), "Dispatch queue full");
            }

            if elapsed >= total {
                break;
            }
        }

        // Schedule exhausted: everything already scheduled still goes out
        while let Some(request) = backlog.pop_front() {
            let sent = tokio::select! {
                biased;
                _ = stop.cancelled() => false,
                sent = queue.send(request) => sent.is_ok(),
            };
            if !sent {
                // Dropped along with the pending send
                self.stats.discarded.fetch_add(1, Ordering::Relaxed);
                break;
            }
        }

        if !backlog.is_empty() {
            self.stats
                .discarded
                .fetch_add(backlog.len() as u64, Ordering::Relaxed);
        }
        if stop.is_cancelled() {
            warn!(
                scenario = %self.scenario,
                scheduled,
                expected = self.schedule.expected_requests(),
                "Run stopped before the schedule was exhausted"
            );
        }
    }

    async fn drain(&self, mut in_flight: JoinSet<()>) {
        let pending = in_flight.len();
        if pending > 0 {
            info!(scenario = %self.scenario, pending, "Draining in-flight requests");
        }

        let drained = tokio::time::timeout(self.config.drain_timeout, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;
        if drained.is_ok() {
            return;
        }

        in_flight.abort_all();
        let mut abandoned = 0u64;
        while let Some(joined) = in_flight.join_next().await {
            if joined.is_err_and(|e| e.is_cancelled()) {
                abandoned += 1;
            }
        }
        self.stats.abandoned.fetch_add(abandoned, Ordering::Relaxed);
        warn!(
            scenario = %self.scenario,
            abandoned,
            timeout_ms = self.config.drain_timeout.as_millis() as u64,
            "Drain timeout expired, abandoning in-flight requests"
        );
    }

    /// Report for an engine stopped before it ever started.
    pub fn unstarted_report(&self) -> EngineReport {
        self.state.send_replace(EngineState::Terminated);
        self.report(Duration::ZERO, true)
    }

    fn report(&self, elapsed: Duration, stopped_early: bool) -> EngineReport {
        EngineReport {
            scenario: self.scenario.to_string(),
            target: self.target.label.clone(),
            expected: self.schedule.expected_requests(),
            counts: self.stats.counts(),
            elapsed_secs: elapsed.as_secs_f64(),
            mean_latency_ms: self.stats.mean_latency().as_micros() as f64 / 1000.0,
            max_latency_ms: self.stats.max_latency().as_micros() as f64 / 1000.0,
            stopped_early,
        }
    }
}

/// Pull requests off the queue and start a worker for each, holding one
/// concurrency permit per in-flight request. Returns the still-running
/// workers once the queue closes or the run is stopped.
async fn dispatch<I: Issue>(
    mut queue: mpsc::Receiver<ScheduledRequest>,
    permits: Arc<Semaphore>,
    worker: Arc<Worker<I>>,
    stop: CancellationToken,
    late_after: Duration,
) -> JoinSet<()> {
    let stats = Arc::clone(&worker.stats);
    let mut in_flight = JoinSet::new();

    loop {
        let request = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            next = queue.recv() => match next {
                Some(request) => request,
                None => break,
            },
        };

        // Reap finished workers so the set does not grow with the run
        while in_flight.try_join_next().is_some() {}

        let mut late = request.scheduled_at.elapsed() > late_after;
        let permit = match Arc::clone(&permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                late = true;
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => {
                        stats.discarded.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                    acquired = Arc::clone(&permits).acquire_owned() => match acquired {
                        Ok(permit) => permit,
                        Err(_) => {
                            stats.discarded.fetch_add(1, Ordering::Relaxed);
                            break;
                        }
                    },
                }
            }
        };

        if late {
            stats.delayed.fetch_add(1, Ordering::Relaxed);
        }
        stats.dispatched.fetch_add(1, Ordering::Relaxed);
        let worker = Arc::clone(&worker);
        in_flight.spawn(async move { worker.handle(request, permit).await });
    }

    // Whatever is still queued never goes out
    queue.close();
    let mut discarded = 0u64;
    while queue.try_recv().is_ok() {
        discarded += 1;
    }
    if discarded > 0 {
        stats.discarded.fetch_add(discarded, Ordering::Relaxed);
    }
    in_flight
}
