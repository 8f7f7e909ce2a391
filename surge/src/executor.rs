//! Executors: drive a scenario's VU count over time.
mod vu;

use crate::scenario::Workload;
use crate::transaction::TransactionData;
use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc, Mutex, PoisonError,
};
use surge_core::{ScenarioConfig, ScenarioPhase, ScenarioStats, RECONCILE_INTERVAL};
use tokio::sync::watch;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
#[allow(unused_imports)]
use tracing::{debug, error, info, instrument, trace, warn};

pub(crate) use vu::cancelled;
use vu::VuPool;

/// Live counters of one scenario, shared between its executor, its VUs and the run report.
#[derive(Debug)]
pub(crate) struct ScenarioProgress {
    name: String,
    phase: Mutex<ScenarioPhase>,
    iterations: AtomicU64,
    failed_iterations: AtomicU64,
    active_vus: AtomicUsize,
    peak_vus: AtomicUsize,
    aborted_vus: AtomicU64,
}

impl ScenarioProgress {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            phase: Mutex::new(ScenarioPhase::Pending),
            iterations: AtomicU64::new(0),
            failed_iterations: AtomicU64::new(0),
            active_vus: AtomicUsize::new(0),
            peak_vus: AtomicUsize::new(0),
            aborted_vus: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> ScenarioPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_phase(&self, phase: ScenarioPhase) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = phase;
    }

    pub fn active_vus(&self) -> usize {
        self.active_vus.load(Ordering::Relaxed)
    }

    pub(crate) fn iteration_done(&self, failed: bool) {
        self.iterations.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.failed_iterations.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn vu_started(&self) {
        let active = self.active_vus.fetch_add(1, Ordering::Relaxed) + 1;
        let peak = self.peak_vus.fetch_max(active, Ordering::Relaxed).max(active);

        #[cfg(feature = "metrics")]
        {
            metrics::gauge!("surge_vus", "scenario" => self.name.clone()).set(active as f64);
            metrics::gauge!("surge_vus_max", "scenario" => self.name.clone()).set(peak as f64);
        }
        #[cfg(not(feature = "metrics"))]
        let _ = peak;
    }

    fn vu_stopped(&self) {
        let _active = self.active_vus.fetch_sub(1, Ordering::Relaxed) - 1;

        #[cfg(feature = "metrics")]
        metrics::gauge!("surge_vus", "scenario" => self.name.clone()).set(_active as f64);
    }

    fn vus_aborted(&self, count: u64) {
        self.aborted_vus.fetch_add(count, Ordering::Relaxed);
    }

    pub fn stats(&self) -> ScenarioStats {
        ScenarioStats {
            name: self.name.clone(),
            phase: self.phase(),
            iterations: self.iterations.load(Ordering::Relaxed),
            failed_iterations: self.failed_iterations.load(Ordering::Relaxed),
            active_vus: self.active_vus(),
            peak_vus: self.peak_vus.load(Ordering::Relaxed),
            aborted_vus: self.aborted_vus.load(Ordering::Relaxed),
        }
    }
}

/// Everything an executor needs to run one scenario.
pub(crate) struct ExecutorContext {
    pub config: Arc<ScenarioConfig>,
    pub workload: Workload,
    pub progress: Arc<ScenarioProgress>,
    pub hook: TransactionData,
    /// Run-wide cancellation.
    pub cancel: watch::Receiver<bool>,
}

/// Reconcile active VUs against the executor's target until its declared duration elapses or
/// the run is cancelled, then drain.
///
/// Returns `true` when the scenario was cut short by cancellation.
#[instrument(name = "executor", skip_all, fields(scenario = %ctx.config.name))]
pub(crate) async fn drive(ctx: ExecutorContext) -> bool {
    let ExecutorContext {
        config,
        workload,
        progress,
        hook,
        mut cancel,
    } = ctx;

    let start = Instant::now();
    let deadline = sleep_until(start + config.executor.total_duration());
    tokio::pin!(deadline);

    let mut tick = interval(RECONCILE_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut pool = VuPool::new(config.clone(), workload, progress.clone(), hook);

    let was_cancelled = loop {
        tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => break true,
            _ = &mut deadline => break false,
            _ = tick.tick() => {
                let target = config.executor.target_vus(start.elapsed());
                pool.reconcile(target);
            }
        }
    };

    if was_cancelled {
        info!("Scenario cancelled; draining VUs");
    } else {
        debug!("Executor reached its end; draining VUs");
    }
    pool.shutdown(config.graceful_stop).await;

    progress.set_phase(if was_cancelled {
        ScenarioPhase::Aborted
    } else {
        ScenarioPhase::Finished
    });
    was_cancelled
}
