//! Runs a set of scenarios against one shared clock, recorder and aggregator.
use crate::aggregator::Aggregator;
use crate::executor::{self, cancelled, ExecutorContext, ScenarioProgress};
use crate::recorder::{spawn_pump, Recorder};
use crate::registry::Registry;
use crate::scenario::{Scenario, Workload};
use crate::threshold::Evaluator;
use crate::transaction::TransactionData;
use arc_swap::ArcSwap;
use futures_util::future::join_all;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::collections::HashSet;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, PoisonError};
use surge_core::{
    ConfigError, PlanConfig, RunOptions, RunReport, ScenarioConfig, ScenarioPhase,
    ThresholdExpr, ThresholdVerdict, RECONCILE_INTERVAL, SCENARIO_TAG,
};
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
#[allow(unused_imports)]
use tracing::{debug, error, info, instrument, trace, warn, Instrument};

/// A validated set of scenarios ready to run.
///
/// # Example
/// ```no_run
/// use surge::prelude::*;
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() -> Result<(), ConfigError> {
///     let report = Scheduler::new([
///         reads().constant(10, Duration::from_secs(60)),
///         writes()
///             .constant(2, Duration::from_secs(30))
///             .start_offset(Duration::from_secs(30)),
///     ])?
///     .threshold("http_req{type:read}", "p(95)<300")?
///     .threshold("http_req", "rate<0.01")?
///     .run()
///     .await;
///
///     println!("{report}");
///     Ok(())
/// }
///
/// #[scenario]
/// async fn reads() {
/// }
///
/// #[scenario]
/// async fn writes() {
/// }
/// ```
#[derive(Debug)]
pub struct Scheduler {
    scenarios: Vec<Scenario>,
    thresholds: Vec<ThresholdExpr>,
    options: RunOptions,
}

impl Scheduler {
    /// Validate `scenarios`. Nothing is spawned until [`Scheduler::start`].
    pub fn new(scenarios: impl IntoIterator<Item = Scenario>) -> Result<Self, ConfigError> {
        let scenarios: Vec<Scenario> = scenarios.into_iter().collect();
        if scenarios.is_empty() {
            return Err(ConfigError::NoScenarios);
        }

        let mut names = HashSet::new();
        for scenario in &scenarios {
            if !names.insert(scenario.name()) {
                return Err(ConfigError::DuplicateScenario(scenario.name().to_string()));
            }
            scenario.config().validate()?;
        }

        Ok(Self {
            scenarios,
            thresholds: vec![],
            options: RunOptions::default(),
        })
    }

    /// Build a scheduler from a plan document, resolving each scenario's workload by name.
    pub fn from_config(
        plan: &PlanConfig,
        registry: &Registry,
        env_base_url: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let mut scenarios = vec![];
        for config in plan.scenarios() {
            let workload = registry.get(config.exec_name()).ok_or_else(|| {
                ConfigError::UnknownWorkload {
                    scenario: config.name.clone(),
                    exec: config.exec_name().to_string(),
                }
            })?;
            scenarios.push(Scenario::from_config(config, workload.clone()));
        }

        Ok(Self::new(scenarios)?
            .thresholds(plan.thresholds()?)
            .options(plan.run_options(env_base_url)?))
    }

    pub fn threshold(mut self, selector: &str, expr: &str) -> Result<Self, ConfigError> {
        self.thresholds.push(ThresholdExpr::parse(selector, expr)?);
        Ok(self)
    }

    pub fn thresholds(mut self, thresholds: impl IntoIterator<Item = ThresholdExpr>) -> Self {
        self.thresholds.extend(thresholds);
        self
    }

    pub fn options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Start the run in the background. The run clock starts now.
    pub fn start(self) -> RunHandle {
        let started = Instant::now();
        let started_at = OffsetDateTime::now_utc();

        let evaluator = Evaluator::new(self.thresholds);
        let aggregator = Arc::new(Aggregator::with_selectors(evaluator.selectors()));
        let (recorder, rx) =
            Recorder::bounded(self.options.recorder_capacity, self.options.overflow);
        let pump = spawn_pump(rx, aggregator.clone());
        let (cancel, _) = watch::channel(false);

        let scenarios: Vec<(ScenarioConfig, Workload)> =
            self.scenarios.into_iter().map(Scenario::into_parts).collect();
        let progress = scenarios
            .iter()
            .map(|(config, _)| Arc::new(ScenarioProgress::new(&config.name)))
            .collect();

        let control = RunControl {
            state: Arc::new(RunState {
                started,
                started_at,
                aggregator,
                recorder,
                evaluator,
                progress,
                cancel,
                verdicts: ArcSwap::from_pointee(vec![]),
                abort_reason: Mutex::new(None),
                fatal: Mutex::new(None),
            }),
        };

        let limiter = self.options.max_rps.map(|rps| Arc::new(rate_limiter(rps)));
        let run = run_all(
            control.clone(),
            scenarios,
            pump,
            limiter,
            Arc::new(self.options.base_url),
            self.options.live_evaluation,
        );
        let task = tokio::spawn(run.instrument(tracing::info_span!("run")));

        RunHandle { control, task }
    }

    /// Run every scenario to completion and return the final report.
    pub async fn run(self) -> RunReport {
        self.start().wait().await
    }
}

struct RunState {
    started: Instant,
    started_at: OffsetDateTime,
    aggregator: Arc<Aggregator>,
    recorder: Recorder,
    evaluator: Evaluator,
    /// One entry per scenario, in declaration order.
    progress: Vec<Arc<ScenarioProgress>>,
    cancel: watch::Sender<bool>,
    verdicts: ArcSwap<Vec<ThresholdVerdict>>,
    abort_reason: Mutex<Option<String>>,
    fatal: Mutex<Option<String>>,
}

/// Cloneable control surface of a running test.
#[derive(Clone)]
pub struct RunControl {
    state: Arc<RunState>,
}

impl RunControl {
    /// Stop the run. Scenarios drain within their grace period; the first reason given wins.
    pub fn abort(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut current = self
                .state
                .abort_reason
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if current.is_none() {
                warn!("Aborting run: {reason}");
                *current = Some(reason);
            }
        }
        self.state.cancel.send_replace(true);
    }

    /// Stop the run on a fatal error. The report exits with a fatal status.
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut current = self
                .state
                .fatal
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if current.is_none() {
                error!("Fatal run error: {reason}");
                *current = Some(reason);
            }
        }
        self.state.cancel.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.state.cancel.borrow()
    }

    /// Active VUs of a scenario right now.
    pub fn active_vus(&self, scenario: &str) -> Option<usize> {
        self.state
            .progress
            .iter()
            .find(|p| p.name() == scenario)
            .map(|p| p.active_vus())
    }

    /// Verdicts of the most recent periodic evaluation.
    pub fn verdicts(&self) -> Arc<Vec<ThresholdVerdict>> {
        self.state.verdicts.load_full()
    }

    /// Report of the run so far. Thresholds are evaluated against the current aggregates.
    pub fn live_report(&self) -> RunReport {
        let snapshot = self.state.aggregator.snapshot_all();
        let verdicts = self.state.evaluator.evaluate(&snapshot);
        self.report(snapshot.stats(), verdicts)
    }

    fn report(
        &self,
        series: Vec<surge_core::SeriesStats>,
        thresholds: Vec<ThresholdVerdict>,
    ) -> RunReport {
        let state = &self.state;
        RunReport {
            started_at: state.started_at,
            elapsed: state.started.elapsed(),
            scenarios: state.progress.iter().map(|p| p.stats()).collect(),
            series,
            thresholds,
            dropped_samples: state.recorder.dropped(),
            abort_reason: state
                .abort_reason
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            fatal: state
                .fatal
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    fn evaluate_live(&self) {
        let snapshot = self.state.aggregator.snapshot_all();
        let verdicts = self.state.evaluator.evaluate(&snapshot);

        // An empty series is not a failure yet while the run is in progress.
        let tripped = verdicts
            .iter()
            .find(|v| v.abort_on_fail && !v.passed && v.observed.is_some());
        if let Some(verdict) = tripped {
            self.abort(format!(
                "threshold {} {} failed",
                verdict.selector, verdict.expression
            ));
        }

        trace!("Live verdicts: {verdicts:?}");
        self.state.verdicts.store(Arc::new(verdicts));
    }
}

/// Handle to a run started with [`Scheduler::start`].
pub struct RunHandle {
    control: RunControl,
    task: JoinHandle<RunReport>,
}

impl RunHandle {
    pub fn control(&self) -> RunControl {
        self.control.clone()
    }

    pub fn abort(&self, reason: impl Into<String>) {
        self.control.abort(reason);
    }

    pub fn live_report(&self) -> RunReport {
        self.control.live_report()
    }

    /// Wait for the run to finish.
    pub async fn wait(self) -> RunReport {
        match self.task.await {
            Ok(report) => report,
            Err(err) => {
                self.control.fail(format!("run task failed: {err}"));
                self.control.live_report()
            }
        }
    }
}

async fn run_all(
    control: RunControl,
    scenarios: Vec<(ScenarioConfig, Workload)>,
    pump: JoinHandle<u64>,
    limiter: Option<Arc<DefaultDirectRateLimiter>>,
    base_url: Arc<surge_core::Url>,
    live_evaluation: std::time::Duration,
) -> RunReport {
    let state = control.state.clone();
    info!(
        "Starting run with {} scenarios: {:?}",
        scenarios.len(),
        scenarios.iter().map(|(c, _)| &c.name).collect::<Vec<_>>()
    );

    let handles: Vec<_> = scenarios
        .into_iter()
        .zip(state.progress.iter().cloned())
        .map(|((config, workload), progress)| {
            let mut tags = config.tags.clone();
            tags.insert(SCENARIO_TAG, config.name.as_str());
            let hook = TransactionData {
                recorder: state.recorder.clone(),
                run_start: state.started,
                tags: Arc::new(tags),
                policy: Arc::new(config.accept_status.clone()),
                limiter: limiter.clone(),
                base_url: base_url.clone(),
                control: control.clone(),
            };
            let ctx = ExecutorContext {
                config: Arc::new(config),
                workload,
                progress,
                hook,
                cancel: state.cancel.subscribe(),
            };
            tokio::spawn(run_scenario(state.started, ctx).in_current_span())
        })
        .collect();

    let scenarios = join_all(handles);
    tokio::pin!(scenarios);

    let live_evaluation = live_evaluation.max(RECONCILE_INTERVAL);
    let mut live = interval_at(state.started + live_evaluation, live_evaluation);
    live.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let results = loop {
        tokio::select! {
            results = &mut scenarios => break results,
            _ = live.tick() => control.evaluate_live(),
        }
    };
    for res in results {
        if let Err(err) = res {
            error!("Scenario task failed: {err}");
            control.fail(format!("scenario task failed: {err}"));
        }
    }

    state.recorder.close();
    match pump.await {
        Ok(ingested) => debug!("Aggregated {ingested} samples"),
        Err(err) => error!("Sample pump failed: {err}"),
    }

    let snapshot = state.aggregator.snapshot_all();
    let verdicts = state.evaluator.evaluate(&snapshot);
    state.verdicts.store(Arc::new(verdicts.clone()));

    let report = control.report(snapshot.stats(), verdicts);
    info!("Run complete in {:?}; exit code {}", report.elapsed, report.exit_code());
    report
}

#[instrument(name = "scenario", skip_all, fields(name = %ctx.config.name))]
async fn run_scenario(run_start: Instant, mut ctx: ExecutorContext) {
    let begin = run_start + ctx.config.start_offset;
    tokio::select! {
        biased;
        _ = cancelled(&mut ctx.cancel) => {
            debug!("Run cancelled before scenario start");
            ctx.progress.set_phase(ScenarioPhase::Aborted);
            return;
        }
        _ = sleep_until(begin) => {}
    }

    info!("Scenario starting");
    ctx.progress.set_phase(ScenarioPhase::Running);
    let progress = ctx.progress.clone();
    let was_cancelled = executor::drive(ctx).await;
    info!(
        "Scenario {}: {} iterations",
        if was_cancelled { "aborted" } else { "finished" },
        progress.stats().iterations
    );
}

fn rate_limiter(max_rps: NonZeroU32) -> DefaultDirectRateLimiter {
    RateLimiter::direct(Quota::per_second(max_rps).allow_burst(NonZeroU32::MIN))
}
