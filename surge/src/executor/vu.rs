use super::ScenarioProgress;
use crate::scenario::Workload;
use crate::transaction::{TransactionData, TRANSACTION_HOOK};
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use surge_core::{Sample, ScenarioConfig, Status, ERROR_TAG, ITERATION_DURATION};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
#[allow(unused_imports)]
use tracing::{debug, error, info, trace, warn, Instrument};

/// Resolves once `rx` reads `true`. Never resolves if the sender is gone.
pub(crate) async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

struct Vu {
    id: u64,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Keeps the active VU gauge honest however the VU task ends, including abort.
struct ActiveVu(Arc<ScenarioProgress>);

impl ActiveVu {
    fn new(progress: Arc<ScenarioProgress>) -> Self {
        progress.vu_started();
        Self(progress)
    }
}

impl Drop for ActiveVu {
    fn drop(&mut self) {
        self.0.vu_stopped();
    }
}

pub(super) struct VuPool {
    config: Arc<ScenarioConfig>,
    workload: Workload,
    progress: Arc<ScenarioProgress>,
    hook: TransactionData,
    active: Vec<Vu>,
    /// VUs told to stop that are finishing their current iteration.
    draining: Vec<Vu>,
    next_id: u64,
}

impl VuPool {
    pub fn new(
        config: Arc<ScenarioConfig>,
        workload: Workload,
        progress: Arc<ScenarioProgress>,
        hook: TransactionData,
    ) -> Self {
        Self {
            config,
            workload,
            progress,
            hook,
            active: vec![],
            draining: vec![],
            next_id: 0,
        }
    }

    /// Spawn or stop VUs until `target` are active. Stopped VUs finish their iteration first.
    pub fn reconcile(&mut self, target: usize) {
        self.draining.retain(|vu| !vu.handle.is_finished());

        if self.active.len() == target {
            return;
        }

        trace!("Reconciling VUs {} -> {target}", self.active.len());
        while self.active.len() < target {
            let vu = self.spawn();
            self.active.push(vu);
        }
        while self.active.len() > target {
            if let Some(vu) = self.active.pop() {
                let _ = vu.stop.send(true);
                self.draining.push(vu);
            }
        }
    }

    fn spawn(&mut self) -> Vu {
        let id = self.next_id;
        self.next_id += 1;

        let (stop, stop_rx) = watch::channel(false);
        let guard = ActiveVu::new(self.progress.clone());
        let span = tracing::debug_span!("vu", id);
        let handle = tokio::spawn(
            TRANSACTION_HOOK
                .scope(
                    self.hook.clone(),
                    run_vu(
                        self.workload.clone(),
                        self.config.think_time,
                        self.hook.clone(),
                        stop_rx,
                        guard,
                    ),
                )
                .instrument(span),
        );

        Vu { id, stop, handle }
    }

    /// Stop every VU, wait up to `grace` for in-flight iterations, then abort the stragglers.
    pub async fn shutdown(self, grace: Duration) {
        let mut vus: Vec<Vu> = self.active.into_iter().chain(self.draining).collect();
        for vu in &vus {
            let _ = vu.stop.send(true);
        }

        let drained = timeout(grace, async {
            while let Some(vu) = vus.last_mut() {
                if let Err(err) = (&mut vu.handle).await {
                    if err.is_panic() {
                        error!("VU {} panicked outside its workload: {err}", vu.id);
                    }
                }
                vus.pop();
            }
        })
        .await;

        // Handles still in `vus` have not been awaited yet.
        if drained.is_err() {
            vus.retain(|vu| !vu.handle.is_finished());
            let stragglers: Vec<u64> = vus.iter().map(|vu| vu.id).collect();
            warn!(
                "Aborting {} VUs still running after {}: {stragglers:?}",
                stragglers.len(),
                humantime::format_duration(grace)
            );
            self.progress.vus_aborted(stragglers.len() as u64);

            for vu in vus {
                vu.handle.abort();
                let _ = vu.handle.await;
            }
        }
    }
}

async fn run_vu(
    workload: Workload,
    think_time: Duration,
    hook: TransactionData,
    mut stop: watch::Receiver<bool>,
    guard: ActiveVu,
) {
    let progress = &guard.0;
    loop {
        if *stop.borrow() {
            break;
        }

        let started = Instant::now();
        let outcome = AssertUnwindSafe(workload.call()).catch_unwind().await;
        let elapsed = started.elapsed();

        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err),
            Err(panic) => Some(panic_message(&*panic)),
        };
        progress.iteration_done(error.is_some());

        let mut sample = Sample::new(ITERATION_DURATION, elapsed)
            .at(started.saturating_duration_since(hook.run_start))
            .tags(hook.tags.as_ref().clone());
        if let Some(err) = error {
            debug!("Iteration failed: {err}");
            sample = sample.status(Status::Error).failed(true).tag(ERROR_TAG, err);
        }
        hook.recorder.record(sample).await;

        if think_time.is_zero() {
            // Workloads that never suspend must not starve the executor.
            tokio::task::yield_now().await;
        } else {
            tokio::select! {
                _ = sleep(think_time) => {}
                _ = cancelled(&mut stop) => break,
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("panic: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("panic: {msg}")
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_messages() {
        let payload: Box<dyn Any + Send> = Box::new("index out of bounds");
        assert_eq!(panic_message(&*payload), "panic: index out of bounds");

        let payload: Box<dyn Any + Send> = Box::new(String::from("bad state"));
        assert_eq!(panic_message(&*payload), "panic: bad state");

        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(&*payload), "panic");
    }

    #[tokio::test]
    async fn cancelled_resolves_on_true() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { cancelled(&mut rx).await });
        tx.send_replace(true);
        waiter.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_pends_when_sender_dropped() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        let res = timeout(Duration::from_secs(60), cancelled(&mut rx)).await;
        assert!(res.is_err());
    }
}
