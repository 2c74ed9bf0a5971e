/// Scenario setup and orchestration.
///
/// All scenarios are prepared (trace selection, schedule build, target
/// parsing) before any traffic starts, so a bad key in the third scenario
/// fails the run before the first one sends anything. Prepared scenarios
/// then run concurrently, each with its own arrival engine, sharing one
/// issuer and one set of attribution counters.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tracegen_core::attribution::AttributionCounters;
use tracegen_core::schedule::StageSchedule;
use tracegen_core::trace::RateTrace;
use tracegen_core::{ErrorKind, TraceError};

use crate::config::{RequestSection, RunConfig};
use crate::engine::{ArrivalEngine, EngineConfig, EngineReport, EngineState, EngineStats};
use crate::issuer::{Issue, RequestTarget, TargetError};
use crate::request_log::LoggedResponse;

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("no trace file configured (set [trace].path, --trace or TRACE_PATH)")]
    MissingTracePath,
    #[error("no scenario configured (add a [[scenario]] block, or pass --url or TARGET_URL)")]
    NoScenario,
    #[error(transparent)]
    TraceFile(TraceError),
    #[error("scenario '{scenario}': {source}")]
    Trace {
        scenario: String,
        #[source]
        source: TraceError,
    },
    #[error("scenario '{scenario}': {source}")]
    Target {
        scenario: String,
        #[source]
        source: TargetError,
    },
    #[error("failed to create request log '{path}': {source}")]
    RequestLog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SetupError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SetupError::TraceFile(e) | SetupError::Trace { source: e, .. } => e.kind(),
            _ => ErrorKind::Configuration,
        }
    }
}

/// A scenario ready to run: schedule built, target parsed.
#[derive(Debug, Clone)]
pub struct PreparedScenario {
    pub name: String,
    pub schedule: Arc<StageSchedule>,
    pub target: Arc<RequestTarget>,
    pub start_delay: Duration,
}

/// Load the trace once and prepare every configured scenario from it.
pub fn prepare_trace_run(config: &RunConfig) -> Result<Vec<PreparedScenario>, SetupError> {
    let path = config.trace.path.as_ref().ok_or(SetupError::MissingTracePath)?;
    if config.scenarios.is_empty() {
        return Err(SetupError::NoScenario);
    }
    let trace = RateTrace::load(path).map_err(SetupError::TraceFile)?;
    prepare_from_trace(&trace, config)
}

pub fn prepare_from_trace(
    trace: &RateTrace,
    config: &RunConfig,
) -> Result<Vec<PreparedScenario>, SetupError> {
    if config.scenarios.is_empty() {
        return Err(SetupError::NoScenario);
    }

    config
        .scenarios
        .iter()
        .map(|scenario| {
            let trace_err = |source| SetupError::Trace {
                scenario: scenario.name.clone(),
                source,
            };
            let series = trace
                .select(&scenario.function, &scenario.node, config.trace.limit)
                .map_err(trace_err)?;
            let schedule =
                StageSchedule::build_with_unit(&series, config.time_unit()).map_err(trace_err)?;
            let target = RequestTarget::new(&scenario.url, &config.request).map_err(|source| {
                SetupError::Target {
                    scenario: scenario.name.clone(),
                    source,
                }
            })?;

            Ok(PreparedScenario {
                name: scenario.name.clone(),
                schedule: Arc::new(schedule),
                target: Arc::new(target),
                start_delay: Duration::from_secs(scenario.start_delay_secs),
            })
        })
        .collect()
}

/// Schedule a scenario would run, built without parsing its target.
#[derive(Debug, Clone)]
pub struct SchedulePreview {
    pub name: String,
    pub function: String,
    pub node: String,
    pub samples: usize,
    pub schedule: StageSchedule,
}

/// Preview every configured scenario, or the `implicit` (function, node)
/// series when the file declares none.
pub fn preview_from_trace(
    trace: &RateTrace,
    config: &RunConfig,
    implicit: (&str, &str),
) -> Result<Vec<SchedulePreview>, SetupError> {
    let keys: Vec<(String, &str, &str)> = if config.scenarios.is_empty() {
        let (function, node) = implicit;
        vec![(format!("trace_f{function}_n{node}"), function, node)]
    } else {
        config
            .scenarios
            .iter()
            .map(|s| (s.name.clone(), s.function.as_str(), s.node.as_str()))
            .collect()
    };

    keys.into_iter()
        .map(|(name, function, node)| {
            let series = trace.select(function, node, config.trace.limit);
            let schedule = series.and_then(|series| {
                StageSchedule::build_with_unit(&series, config.time_unit()).map(|s| (series.len(), s))
            });
            match schedule {
                Ok((samples, schedule)) => Ok(SchedulePreview {
                    function: function.to_string(),
                    node: node.to_string(),
                    name,
                    samples,
                    schedule,
                }),
                Err(source) => Err(SetupError::Trace { scenario: name, source }),
            }
        })
        .collect()
}

/// A single constant-rate scenario against one url.
pub fn prepare_fixed_run(
    url: &str,
    rate: u32,
    duration: Duration,
    request: &RequestSection,
) -> Result<PreparedScenario, SetupError> {
    let name = format!("fixed_{rate}rps");
    let schedule = StageSchedule::constant(rate, duration).map_err(|source| SetupError::Trace {
        scenario: name.clone(),
        source,
    })?;
    let target = RequestTarget::new(url, request).map_err(|source| SetupError::Target {
        scenario: name.clone(),
        source,
    })?;
    Ok(PreparedScenario {
        name,
        schedule: Arc::new(schedule),
        target: Arc::new(target),
        start_delay: Duration::ZERO,
    })
}

pub struct ScenarioProgress {
    pub name: String,
    pub stats: Arc<EngineStats>,
    pub state: watch::Receiver<EngineState>,
}

/// Engines built for a set of prepared scenarios, not yet started.
pub struct ScenarioRun<I> {
    engines: Vec<(ArrivalEngine<I>, Duration)>,
}

impl<I: Issue> ScenarioRun<I> {
    pub fn new(
        scenarios: Vec<PreparedScenario>,
        issuer: Arc<I>,
        counters: Arc<AttributionCounters>,
        config: &EngineConfig,
        request_log: Option<mpsc::Sender<LoggedResponse>>,
    ) -> Self {
        let engines = scenarios
            .into_iter()
            .map(|scenario| {
                let engine = ArrivalEngine::new(
                    &scenario.name,
                    scenario.schedule,
                    scenario.target,
                    Arc::clone(&issuer),
                    Arc::clone(&counters),
                    config.clone(),
                );
                let engine = match &request_log {
                    Some(sink) => engine.with_request_log(sink.clone()),
                    None => engine,
                };
                (engine, scenario.start_delay)
            })
            .collect();
        Self { engines }
    }

    /// Live counters and state per scenario, for progress reporting.
    pub fn progress(&self) -> Vec<ScenarioProgress> {
        self.engines
            .iter()
            .map(|(engine, _)| ScenarioProgress {
                name: engine.name().to_string(),
                stats: engine.stats(),
                state: engine.subscribe(),
            })
            .collect()
    }

    /// Start every engine after its delay; returns one report per scenario,
    /// in configuration order.
    pub async fn run(self, cancel: CancellationToken) -> Vec<EngineReport> {
        let handles: Vec<_> = self
            .engines
            .into_iter()
            .map(|(engine, start_delay)| {
                let cancel = cancel.clone();
                tokio::spawn(async move { run_delayed(engine, start_delay, cancel).await })
            })
            .collect();

        let mut reports = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(report) => reports.push(report),
                Err(e) => warn!("Scenario task failed: {}", e),
            }
        }
        reports
    }
}

async fn run_delayed<I: Issue>(
    engine: ArrivalEngine<I>,
    start_delay: Duration,
    cancel: CancellationToken,
) -> EngineReport {
    if !start_delay.is_zero() {
        info!(scenario = %engine.name(), delay_secs = start_delay.as_secs(), "Waiting before start");
        tokio::select! {
            _ = cancel.cancelled() => {
                warn!(scenario = %engine.name(), "Run stopped before scenario started");
                return engine.unstarted_report();
            }
            _ = tokio::time::sleep(start_delay) => {}
        }
    }
    engine.run(cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::future::Future;

    use tracegen_core::attribution::{Responder, ResponseRecord, ResponseStatus};

    use crate::config::Overrides;
    use crate::issuer::ScheduledRequest;

    struct EchoIssuer;

    impl Issue for EchoIssuer {
        fn issue(&self, request: ScheduledRequest) -> impl Future<Output = ResponseRecord> + Send {
            async move {
                ResponseRecord {
                    status: ResponseStatus::Http(200),
                    target: request.target.label.clone(),
                    responder_address: Responder::Unknown,
                    responder_node_id: Responder::Known(request.target.label.clone()),
                    stage_index: request.stage_index,
                    latency: Duration::ZERO,
                }
            }
        }
    }

    fn two_node_config() -> RunConfig {
        let mut config = RunConfig::parse(
            r#"
            [trace]
            time_unit_ms = 2

            [[scenario]]
            name = "a"
            node = "0"
            url = "http://10.0.0.1:8080/function/figlet"

            [[scenario]]
            name = "b"
            node = "1"
            url = "http://10.0.0.2:8080/function/figlet"
            "#,
        )
        .unwrap();
        config.apply(Overrides::default());
        config
    }

    fn trace() -> RateTrace {
        RateTrace::from_json(r#"{"0":{"0":[1000,2000],"1":[500]}}"#).unwrap()
    }

    #[test]
    fn test_prepare_all_scenarios() {
        let prepared = prepare_from_trace(&trace(), &two_node_config()).unwrap();
        assert_eq!(prepared.len(), 2);
        assert_eq!(prepared[0].schedule.len(), 4);
        assert_eq!(prepared[1].schedule.len(), 2);
        assert_eq!(prepared[1].target.label, "10.0.0.2:8080");
        assert_eq!(prepared[0].schedule.total_duration(), Duration::from_millis(240));
    }

    #[test]
    fn test_bad_scenario_fails_whole_setup() {
        let mut config = two_node_config();
        config.scenarios[1].node = "7".into();
        let err = prepare_from_trace(&trace(), &config).unwrap_err();
        assert!(matches!(
            &err,
            SetupError::Trace { scenario, source: TraceError::NodeNotFound { .. } } if scenario == "b"
        ));
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let mut config = two_node_config();
        config.trace.limit = -1;
        assert!(matches!(
            prepare_from_trace(&trace(), &config),
            Err(SetupError::Trace { source: TraceError::InvalidLimit(-1), .. })
        ));
    }

    #[test]
    fn test_empty_series_is_schedule_exhaustion() {
        let trace = RateTrace::from_json(r#"{"0":{"0":[],"1":[5]}}"#).unwrap();
        let err = prepare_from_trace(&trace, &two_node_config()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ScheduleExhaustion);
    }

    #[test]
    fn test_missing_inputs() {
        let config = RunConfig::default();
        assert!(matches!(prepare_trace_run(&config), Err(SetupError::MissingTracePath)));

        let mut config = RunConfig::default();
        config.trace.path = Some("trace.json".into());
        assert!(matches!(prepare_trace_run(&config), Err(SetupError::NoScenario)));

        let mut config = two_node_config();
        config.trace.path = Some("/nonexistent/trace.json".into());
        assert!(matches!(
            prepare_trace_run(&config),
            Err(SetupError::TraceFile(TraceError::Io { .. }))
        ));
    }

    #[test]
    fn test_fixed_run() {
        let prepared =
            prepare_fixed_run("http://localhost:30080/", 110, Duration::from_secs(180), &RequestSection::default())
                .unwrap();
        assert_eq!(prepared.name, "fixed_110rps");
        assert_eq!(prepared.schedule.expected_requests(), 110 * 180);
        assert!(prepare_fixed_run("localhost", 1, Duration::from_secs(1), &RequestSection::default()).is_err());
        assert!(prepare_fixed_run("http://x/", 1, Duration::ZERO, &RequestSection::default()).is_err());
    }

    #[tokio::test]
    async fn test_scenarios_share_counters() {
        let prepared = prepare_from_trace(&trace(), &two_node_config()).unwrap();
        let expected: u64 = prepared.iter().map(|s| s.schedule.expected_requests()).sum();

        let counters = Arc::new(AttributionCounters::new());
        let config = EngineConfig {
            pre_allocated: 100,
            max_concurrency: 100,
            tick: Duration::from_millis(5),
            drain_timeout: Duration::from_secs(5),
        };
        let run = ScenarioRun::new(prepared, Arc::new(EchoIssuer), Arc::clone(&counters), &config, None);
        let progress = run.progress();
        assert_eq!(progress.len(), 2);
        assert_eq!(*progress[0].state.borrow(), EngineState::Idle);

        let reports = run.run(CancellationToken::new()).await;
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].scenario, "a");
        assert_eq!(reports[1].target, "10.0.0.2:8080");
        assert_eq!(counters.total(), expected);

        let by_node = counters.by_responder_node();
        assert_eq!(by_node.len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_during_start_delay() {
        let mut config = two_node_config();
        config.scenarios[1].start_delay_secs = 3600;
        let prepared = prepare_from_trace(&trace(), &config).unwrap();

        let engine_config = EngineConfig {
            pre_allocated: 100,
            max_concurrency: 100,
            tick: Duration::from_millis(5),
            drain_timeout: Duration::from_secs(5),
        };
        let run = ScenarioRun::new(
            prepared,
            Arc::new(EchoIssuer),
            Arc::new(AttributionCounters::new()),
            &engine_config,
            None,
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(400)).await;
            trigger.cancel();
        });

        let reports = run.run(cancel).await;
        assert!(!reports[0].stopped_early);
        assert!(reports[1].stopped_early);
        assert!(reports[1].is_empty());
    }

    #[test]
    fn test_zero_time_unit_is_configuration_error() {
        let mut config = two_node_config();
        config.trace.time_unit_ms = 0;
        let err = prepare_from_trace(&trace(), &config).unwrap_err();
        assert!(matches!(&err, SetupError::Trace { source: TraceError::ZeroDuration(_), .. }));
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_https_scenario_fails_setup() {
        let mut config = two_node_config();
        config.scenarios[0].url = "https://10.0.0.1:8443/function/figlet".into();
        let err = prepare_from_trace(&trace(), &config).unwrap_err();
        assert!(matches!(&err, SetupError::Target { scenario, .. } if scenario == "a"));
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_preview_follows_configured_scenarios() {
        let previews = preview_from_trace(&trace(), &two_node_config(), ("0", "0")).unwrap();
        assert_eq!(previews.len(), 2);
        assert_eq!(previews[1].name, "b");
        assert_eq!(previews[1].node, "1");
        assert_eq!(previews[1].samples, 1);
        assert_eq!(previews[1].schedule.initial_rate(), 500);

        let previews = preview_from_trace(&trace(), &RunConfig::default(), ("0", "1")).unwrap();
        assert_eq!(previews.len(), 1);
        assert_eq!(previews[0].name, "trace_f0_n1");
        assert_eq!(previews[0].schedule.len(), 2);

        let mut config = two_node_config();
        config.scenarios[1].node = "9".into();
        assert!(matches!(
            preview_from_trace(&trace(), &config, ("0", "0")),
            Err(SetupError::Trace { source: TraceError::NodeNotFound { .. }, .. })
        ));
    }
}
