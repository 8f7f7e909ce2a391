//! Scenario builder and workload plumbing
use crate::scheduler::Scheduler;
use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};
use surge_core::{ConfigError, ExecutorKind, RunReport, ScenarioConfig, Stage, StatusPolicy};
#[allow(unused_imports)]
use tracing::{debug, error, info, instrument, trace, warn, Instrument};

pub(crate) type BoxedIteration = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

/// What a workload iteration may return. An `Err` counts as a failed iteration.
pub trait IterationOutcome {
    fn into_outcome(self) -> Result<(), String>;
}

impl IterationOutcome for () {
    fn into_outcome(self) -> Result<(), String> {
        Ok(())
    }
}

impl<E: fmt::Display> IterationOutcome for Result<(), E> {
    fn into_outcome(self) -> Result<(), String> {
        self.map_err(|e| e.to_string())
    }
}

/// A workload function: called once per VU iteration.
#[derive(Clone)]
pub struct Workload(Arc<dyn Fn() -> BoxedIteration + Send + Sync>);

impl Workload {
    pub fn new<T, F>(func: T) -> Self
    where
        T: Fn() -> F + Send + Sync + 'static,
        F: Future + Send + 'static,
        F::Output: IterationOutcome,
    {
        Self(Arc::new(move || {
            let fut = func();
            Box::pin(async move { fut.await.into_outcome() })
        }))
    }

    pub(crate) fn call(&self) -> BoxedIteration {
        (self.0)()
    }
}

impl fmt::Debug for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Workload")
    }
}

/// Load test scenario structure
///
/// Pairs a workload with the executor that drives it. Usually created with the
/// [`#[scenario]`](surge_macros::scenario) macro. Awaiting a scenario runs it on its own; use a
/// [`Scheduler`] to run several together or to attach thresholds.
#[pin_project::pin_project]
pub struct Scenario {
    workload: Workload,
    config: ScenarioConfig,
    runner_fut: Option<Pin<Box<dyn Future<Output = Result<RunReport, ConfigError>> + Send>>>,
}

impl Scenario {
    #[doc(hidden)]
    pub fn new<T, F>(name: &str, func: T) -> Self
    where
        T: Fn() -> F + Send + Sync + 'static,
        F: Future + Send + 'static,
        F::Output: IterationOutcome,
    {
        Self::from_config(ScenarioConfig::new(name), Workload::new(func))
    }

    /// Scenario from a declarative config, e.g. one entry of a plan document.
    pub fn from_config(config: ScenarioConfig, workload: Workload) -> Self {
        Self {
            workload,
            config,
            runner_fut: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ScenarioConfig {
        &self.config
    }

    pub(crate) fn into_parts(self) -> (ScenarioConfig, Workload) {
        (self.config, self.workload)
    }
}

impl fmt::Debug for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scenario")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Future for Scenario {
    type Output = Result<RunReport, ConfigError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let (config, workload) = (this.config, this.workload);
        let runner = this.runner_fut.get_or_insert_with(|| {
            let single = Scenario::from_config(config.clone(), workload.clone());
            let span = tracing::info_span!("scenario", name = %single.name());
            Box::pin(
                async move {
                    let report = Scheduler::new([single])?.run().await;
                    info!("Scenario complete: {}", report.exit_code());
                    Ok(report)
                }
                .instrument(span),
            )
        });
        runner.as_mut().poll(cx)
    }
}

pub trait ConfigurableScenario: Future<Output = Result<RunReport, ConfigError>> + Sized + Send {
    fn ramping(self, stages: impl IntoIterator<Item = Stage>) -> Self;
    fn start_vus(self, vus: usize) -> Self;
    fn constant(self, vus: usize, duration: Duration) -> Self;
    fn start_offset(self, offset: Duration) -> Self;
    fn graceful_stop(self, grace: Duration) -> Self;
    fn think_time(self, pause: Duration) -> Self;
    fn accept_status(self, codes: impl IntoIterator<Item = u16>) -> Self;
    fn tag(self, key: &str, value: &str) -> Self;
}

impl ConfigurableScenario for Scenario {
    /// Ramp VUs linearly through the given stages.
    ///
    /// # Example
    /// ```no_run
    /// use surge::prelude::*;
    /// use std::time::Duration;
    ///
    /// #[tokio::main]
    /// async fn main() {
    ///     my_scenario()
    ///         .ramping([
    ///             Stage::new(Duration::from_secs(30), 10),
    ///             Stage::new(Duration::from_secs(60), 10),
    ///             Stage::new(Duration::from_secs(30), 0),
    ///         ])
    ///         .await
    ///         .unwrap();
    /// }
    ///
    /// #[scenario]
    /// async fn my_scenario() {
    /// }
    /// ```
    fn ramping(mut self, stages: impl IntoIterator<Item = Stage>) -> Self {
        let start_vus = match self.config.executor {
            ExecutorKind::Ramping { start_vus, .. } => start_vus,
            ExecutorKind::Constant { .. } => 0,
        };
        self.config.executor = ExecutorKind::Ramping {
            start_vus,
            stages: stages.into_iter().collect(),
        };
        self
    }

    /// VUs the first ramping stage starts from.
    ///
    /// NOTE: Must supply `.ramping()` as well
    fn start_vus(mut self, vus: usize) -> Self {
        match &mut self.config.executor {
            ExecutorKind::Ramping { start_vus, .. } => *start_vus = vus,
            ExecutorKind::Constant { .. } => {
                self.config.executor = ExecutorKind::Ramping {
                    start_vus: vus,
                    stages: vec![],
                }
            }
        }
        self
    }

    /// Run a fixed number of VUs for a fixed duration.
    ///
    /// # Example
    /// ```no_run
    /// use surge::prelude::*;
    /// use std::time::Duration;
    ///
    /// #[tokio::main]
    /// async fn main() {
    ///     my_scenario()
    ///         .constant(5, Duration::from_secs(120))
    ///         .await
    ///         .unwrap();
    /// }
    ///
    /// #[scenario]
    /// async fn my_scenario() {
    /// }
    /// ```
    fn constant(mut self, vus: usize, duration: Duration) -> Self {
        self.config.executor = ExecutorKind::Constant { vus, duration };
        self
    }

    /// Delay the scenario's start relative to the start of the run.
    fn start_offset(mut self, offset: Duration) -> Self {
        self.config.start_offset = offset;
        self
    }

    /// Time stopped VUs get to finish their iteration before being aborted. Defaults to 30s.
    fn graceful_stop(mut self, grace: Duration) -> Self {
        self.config.graceful_stop = grace;
        self
    }

    /// Pause between iterations of each VU.
    fn think_time(mut self, pause: Duration) -> Self {
        self.config.think_time = pause;
        self
    }

    /// Status codes counted as successes. Replaces the default 200-399 range.
    ///
    /// # Example
    /// ```no_run
    /// use surge::prelude::*;
    /// use std::time::Duration;
    ///
    /// #[tokio::main]
    /// async fn main() {
    ///     my_scenario()
    ///         .constant(5, Duration::from_secs(120))
    ///         .accept_status([201, 409, 422, 400])
    ///         .await
    ///         .unwrap();
    /// }
    ///
    /// #[scenario]
    /// async fn my_scenario() {
    /// }
    /// ```
    fn accept_status(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.config.accept_status = StatusPolicy::accept(codes);
        self
    }

    /// Tag added to every sample of this scenario.
    fn tag(mut self, key: &str, value: &str) -> Self {
        self.config.tags.insert(key, value);
        self
    }
}
