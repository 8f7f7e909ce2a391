//! Buffered sink between VUs and the aggregator.
use crate::aggregator::Aggregator;
use async_channel::{bounded, Receiver, Sender};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use surge_core::{OverflowPolicy, Sample};
use tokio::task::JoinHandle;
#[allow(unused_imports)]
use tracing::{debug, error, trace, warn};

/// Cloneable handle VUs use to submit samples.
///
/// With [`OverflowPolicy::Block`] a full buffer suspends the recording task until the pump
/// catches up. With [`OverflowPolicy::DropOldest`] the oldest buffered sample is discarded and
/// counted instead.
#[derive(Clone, Debug)]
pub struct Recorder {
    tx: Sender<Sample>,
    policy: OverflowPolicy,
    dropped: Arc<AtomicU64>,
}

impl Recorder {
    pub fn bounded(capacity: usize, policy: OverflowPolicy) -> (Self, Receiver<Sample>) {
        let (tx, rx) = bounded(capacity.max(1));
        (
            Self {
                tx,
                policy,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    pub async fn record(&self, sample: Sample) {
        #[cfg(feature = "metrics")]
        mirror(&sample);

        match self.policy {
            OverflowPolicy::Block => {
                if self.tx.send(sample).await.is_err() {
                    debug!("Recorder closed; discarding late sample.");
                }
            }
            OverflowPolicy::DropOldest => match self.tx.force_send(sample) {
                Ok(Some(_displaced)) => {
                    let prev = self.dropped.fetch_add(1, Ordering::Relaxed);
                    if prev == 0 {
                        warn!("Sample buffer is full; dropping oldest samples.");
                    }
                }
                Ok(None) => {}
                Err(_) => debug!("Recorder closed; discarding late sample."),
            },
        }
    }

    /// Samples discarded by the overflow policy so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Samples accepted but not yet aggregated.
    pub fn pending(&self) -> usize {
        self.tx.len()
    }

    /// Stop accepting samples. Buffered samples are still delivered to the pump.
    pub fn close(&self) {
        self.tx.close();
    }
}

/// Spawn the task that folds recorded samples into `aggregator`.
///
/// The task ends once the recorder is closed and the buffer is drained, so awaiting it after
/// [`Recorder::close`] guarantees every accepted sample has been aggregated.
pub(crate) fn spawn_pump(rx: Receiver<Sample>, aggregator: Arc<Aggregator>) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let mut ingested = 0;
        while let Ok(sample) = rx.recv().await {
            aggregator.ingest(&sample);
            ingested += 1;
        }
        trace!("Sample pump finished after {ingested} samples");
        ingested
    })
}

#[cfg(feature = "metrics")]
fn mirror(sample: &Sample) {
    metrics::histogram!(format!("surge_{}_duration", sample.metric))
        .record(sample.duration.as_nanos() as f64);
    if sample.failed {
        metrics::counter!(format!("surge_{}_error", sample.metric)).increment(1);
    } else {
        metrics::counter!(format!("surge_{}_success", sample.metric)).increment(1);
    }
}
