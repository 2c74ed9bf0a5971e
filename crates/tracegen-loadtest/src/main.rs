/// Trace-driven arrival-rate load generator.
///
/// Replays a recorded request-rate trace against HTTP function endpoints
/// as open-model load, and attributes every response to the node that
/// actually served it.
///
/// Usage:
///   tracegen-loadtest run --config run.toml        Replay a trace against every configured scenario
///   tracegen-loadtest fixed --url URL --rate 110   Constant arrival rate against one endpoint
///   tracegen-loadtest schedule --trace t.json      Print the stage schedule a run would execute
///   tracegen-loadtest stats t.json                 Descriptive statistics per function and node
///   tracegen-loadtest rescale in.json out.json     Min-max rescale every sample of a trace

mod config;
mod engine;
mod issuer;
mod request_log;
mod scenario;
mod summary;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tracegen_core::attribution::AttributionCounters;
use tracegen_core::rescale::{rescale, sample_range, RescaleOptions};
use tracegen_core::schedule::trace_index;
use tracegen_core::stats::{describe_trace, PERCENTILES};
use tracegen_core::trace::RateTrace;
use tracegen_core::ErrorKind;

use crate::config::{OutputSection, Overrides, RunConfig};
use crate::engine::EngineConfig;
use crate::issuer::HttpIssuer;
use crate::scenario::{
    prepare_fixed_run, prepare_trace_run, preview_from_trace, PreparedScenario, ScenarioRun,
};
use crate::summary::{spawn_progress, RunSummary};

/// Exit status when setup fails and no request was sent
const EXIT_NO_TRAFFIC: i32 = 2;

// ── CLI ──────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "tracegen-loadtest", about = "Trace-driven arrival-rate load generator")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

/// Trace selection, by flag or environment.
#[derive(clap::Args)]
struct TraceArgs {
    /// Rate trace file
    #[arg(long = "trace", env = "TRACE_PATH")]
    path: Option<PathBuf>,
    /// Function key in the trace
    #[arg(long, env = "FUNCTION")]
    function: Option<String>,
    /// Node key under the function
    #[arg(long, env = "NODE")]
    node: Option<String>,
    /// Keep only the first N samples (0 = all)
    #[arg(long, env = "LIMIT", allow_negative_numbers = true)]
    limit: Option<i64>,
    /// Stage time unit in milliseconds (stages last 5 and 55 units)
    #[arg(long)]
    time_unit_ms: Option<u64>,
}

#[derive(Subcommand)]
enum Command {
    /// Replay a rate trace against the configured scenarios
    Run {
        /// Run file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[command(flatten)]
        trace: TraceArgs,
        /// Target url; applies to every scenario
        #[arg(long, env = "TARGET_URL")]
        url: Option<String>,
        /// Write the summary as JSON here
        #[arg(long)]
        summary: Option<PathBuf>,
        /// Write one JSON line per request here
        #[arg(long)]
        request_log: Option<PathBuf>,
    },
    /// Constant arrival rate against a single endpoint
    Fixed {
        /// Run file (TOML); only request, engine and output sections are used
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(long, env = "TARGET_URL")]
        url: String,
        /// Requests per second
        #[arg(short, long, default_value = "110")]
        rate: u32,
        #[arg(short, long, default_value = "180")]
        duration_secs: u64,
        #[arg(long)]
        summary: Option<PathBuf>,
        #[arg(long)]
        request_log: Option<PathBuf>,
    },
    /// Print the stage schedule a run would execute, without sending traffic
    Schedule {
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[command(flatten)]
        trace: TraceArgs,
    },
    /// Descriptive statistics for every series of a trace
    Stats {
        trace: PathBuf,
    },
    /// Min-max rescale every sample of a trace into a new range
    Rescale {
        input: PathBuf,
        output: PathBuf,
        #[arg(long, default_value = "0")]
        min: f64,
        #[arg(long, default_value = "800")]
        max: f64,
        #[arg(long, default_value = "1.0")]
        power: f64,
    },
}

impl TraceArgs {
    fn into_overrides(self) -> Overrides {
        Overrides {
            trace_path: self.path,
            function: self.function,
            node: self.node,
            limit: self.limit,
            time_unit_ms: self.time_unit_ms,
            ..Default::default()
        }
    }
}

fn load_config(path: Option<&Path>, output: &OutputSection) -> RunConfig {
    match path {
        None => RunConfig::default(),
        Some(path) => match RunConfig::load(path) {
            Ok(config) => config,
            Err(e) => fail_setup(output, ErrorKind::Configuration, &format!("{e:#}")),
        },
    }
}

/// Report a setup failure the same way a run reports its outcome, then exit.
fn fail_setup(output: &OutputSection, kind: ErrorKind, error: &dyn std::fmt::Display) -> ! {
    let summary = RunSummary::setup_failed(kind, error);
    tracing::error!("{}", error);
    println!("\n  {}", summary.headline());
    if let Some(path) = &output.summary_path {
        if let Err(e) = summary.write_json(path) {
            warn!("{:#}", e);
        }
    }
    std::process::exit(EXIT_NO_TRAFFIC);
}

// ── Load runs ────────────────────────────────────────────────

async fn run_trace(mut config: RunConfig, overrides: Overrides) -> anyhow::Result<()> {
    config.apply(overrides);
    let scenarios = match prepare_trace_run(&config) {
        Ok(scenarios) => scenarios,
        Err(e) => fail_setup(&config.output, e.kind(), &e),
    };
    execute(scenarios, &config).await
}

async fn run_fixed(config: RunConfig, url: &str, rate: u32, duration: Duration) -> anyhow::Result<()> {
    let scenario = match prepare_fixed_run(url, rate, duration, &config.request) {
        Ok(scenario) => scenario,
        Err(e) => fail_setup(&config.output, e.kind(), &e),
    };
    execute(vec![scenario], &config).await
}

async fn execute(scenarios: Vec<PreparedScenario>, config: &RunConfig) -> anyhow::Result<()> {
    let client = HttpIssuer::build_client(config.engine.pre_allocated)
        .context("failed to build HTTP client")?;
    let issuer = match HttpIssuer::new(client, &config.attribution) {
        Ok(issuer) => Arc::new(issuer),
        Err(e) => fail_setup(&config.output, ErrorKind::Configuration, &e),
    };
    let counters = Arc::new(AttributionCounters::new());

    let (log_tx, log_writer) = match &config.output.request_log_path {
        Some(path) => match request_log::spawn_writer(path).await {
            Ok((tx, handle)) => (Some(tx), Some(handle)),
            Err(e) => fail_setup(&config.output, e.kind(), &e),
        },
        None => (None, None),
    };

    for scenario in &scenarios {
        info!(
            scenario = %scenario.name,
            endpoint = %scenario.target.url,
            stages = scenario.schedule.len(),
            expected = scenario.schedule.expected_requests(),
            start_delay_secs = scenario.start_delay.as_secs(),
            "Scenario ready"
        );
    }

    let run = ScenarioRun::new(
        scenarios,
        issuer,
        Arc::clone(&counters),
        &EngineConfig::from_section(&config.engine),
        log_tx,
    );

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, draining in-flight requests");
            interrupt.cancel();
        }
    });
    if config.engine.run_deadline_secs > 0 {
        let deadline = Duration::from_secs(config.engine.run_deadline_secs);
        let expire = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = expire.cancelled() => {}
                _ = tokio::time::sleep(deadline) => {
                    warn!(deadline_secs = deadline.as_secs(), "Run deadline reached, stopping");
                    expire.cancel();
                }
            }
        });
    }

    let progress_done = CancellationToken::new();
    let progress = (config.output.progress_interval_secs > 0).then(|| {
        spawn_progress(
            run.progress(),
            Duration::from_secs(config.output.progress_interval_secs),
            progress_done.clone(),
        )
    });

    let reports = run.run(cancel.clone()).await;

    progress_done.cancel();
    if let Some(handle) = progress {
        let _ = handle.await;
    }
    // Releases the deadline timer
    cancel.cancel();

    if let Some(handle) = log_writer {
        match handle.await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Request log incomplete: {:#}", e),
            Err(e) => warn!("Request log writer failed: {}", e),
        }
    }

    let summary = RunSummary::from_run(reports, &counters);
    summary.print();
    if let Some(path) = &config.output.summary_path {
        summary.write_json(path)?;
    }
    Ok(())
}

// ── Trace tooling ────────────────────────────────────────────

fn print_schedule(mut config: RunConfig, overrides: Overrides) -> anyhow::Result<()> {
    let function = overrides.function.clone().unwrap_or_else(|| "0".to_string());
    let node = overrides.node.clone().unwrap_or_else(|| "0".to_string());
    config.apply(overrides);

    let path = config
        .trace
        .path
        .as_ref()
        .context("no trace file configured (set [trace].path, --trace or TRACE_PATH)")?;
    let trace = RateTrace::load(path)?;

    for preview in preview_from_trace(&trace, &config, (function.as_str(), node.as_str()))? {
        let schedule = &preview.schedule;
        println!(
            "\n=== SCHEDULE: {} (function {}, node {}) ===",
            preview.name, preview.function, preview.node
        );
        println!("  Samples:       {}", preview.samples);
        println!("  Stages:        {}", schedule.len());
        println!("  Initial rate:  {} req/s", schedule.initial_rate());
        println!("  Duration:      {:.1}s", schedule.total_duration().as_secs_f64());
        println!("  Expected:      {} requests\n", schedule.expected_requests());
        println!("  {:>6} {:>6}  {:<5} {:>10} {:>8}", "stage", "trace", "kind", "duration", "target");
        for (i, stage) in schedule.stages().iter().enumerate() {
            println!(
                "  {:>6} {:>6}  {:<5} {:>9.1}s {:>8}",
                i,
                trace_index(i),
                format!("{:?}", stage.kind).to_lowercase(),
                stage.duration.as_secs_f64(),
                stage.target_rate
            );
        }
    }
    Ok(())
}

fn print_stats(path: &Path) -> anyhow::Result<()> {
    let trace = RateTrace::load(path)?;
    let mut current_function = None;

    for node in describe_trace(&trace) {
        if current_function.as_deref() != Some(node.function.as_str()) {
            println!("\n=== FUNCTION {} ===", node.function);
            let header: Vec<String> = PERCENTILES
                .iter()
                .map(|q| format!("{:>8}", format!("p{}", (q * 100.0).round())))
                .collect();
            println!(
                "  {:<8} {:>6} {:>9} {:>9} {:>8} {} {:>8}",
                "node", "count", "mean", "std", "min", header.join(" "), "max"
            );
            current_function = Some(node.function.clone());
        }
        match node.stats {
            None => println!("  {:<8} {:>6}", node.node, 0),
            Some(s) => {
                let percentiles: Vec<String> =
                    s.percentiles.iter().map(|p| format!("{p:>8.2}")).collect();
                println!(
                    "  {:<8} {:>6} {:>9.2} {:>9.2} {:>8.2} {} {:>8.2}",
                    node.node,
                    s.count,
                    s.mean,
                    s.std_dev,
                    s.min,
                    percentiles.join(" "),
                    s.max
                );
            }
        }
    }
    Ok(())
}

fn rescale_file(input: &Path, output: &Path, options: RescaleOptions) -> anyhow::Result<()> {
    let trace = RateTrace::load(input)?;
    let scaled = rescale(&trace, options)?;
    std::fs::write(output, scaled.to_json_pretty())
        .with_context(|| format!("failed to write {}", output.display()))?;

    if let (Some((old_min, old_max)), Some((new_min, new_max))) =
        (sample_range(&trace), sample_range(&scaled))
    {
        info!(
            from = %format!("[{old_min}, {old_max}]"),
            to = %format!("[{new_min}, {new_max}]"),
            power = options.power,
            output = %output.display(),
            "Trace rescaled"
        );
    }
    Ok(())
}

// ── Main ─────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Command::Run { config, trace, url, summary, request_log } => {
            let overrides = Overrides {
                url,
                summary_path: summary,
                request_log_path: request_log,
                ..trace.into_overrides()
            };
            let early_output = OutputSection {
                summary_path: overrides.summary_path.clone(),
                ..OutputSection::default()
            };
            let config = load_config(config.as_deref(), &early_output);
            run_trace(config, overrides).await?;
        }
        Command::Fixed { config, url, rate, duration_secs, summary, request_log } => {
            let early_output = OutputSection {
                summary_path: summary.clone(),
                ..OutputSection::default()
            };
            let mut config = load_config(config.as_deref(), &early_output);
            config.apply(Overrides {
                summary_path: summary,
                request_log_path: request_log,
                ..Default::default()
            });
            run_fixed(config, &url, rate, Duration::from_secs(duration_secs)).await?;
        }
        Command::Schedule { config, trace } => {
            let config = match config {
                Some(path) => RunConfig::load(&path)?,
                None => RunConfig::default(),
            };
            print_schedule(config, trace.into_overrides())?;
        }
        Command::Stats { trace } => print_stats(&trace)?,
        Command::Rescale { input, output, min, max, power } => {
            rescale_file(&input, &output, RescaleOptions { min, max, power })?;
        }
    }

    Ok(())
}
