use crate::recorder::Recorder;
use crate::scheduler::RunControl;
use governor::DefaultDirectRateLimiter;
use std::{future::Future, sync::Arc};
use surge_core::{RunOptions, Sample, Status, StatusPolicy, TagSet, Url, STATUS_TAG};
use tokio::time::Instant;

pub use surge_core::TransactionLabels;

/// Transaction hook used by the `#[transaction]` macro. Not intended to be used manually.
pub async fn transaction_hook<T, R, E>(labels: TransactionLabels, func: T) -> T::Output
where
    T: Future<Output = Result<R, E>>,
    R: ResponseStatus,
{
    if let Ok(hook) = TRANSACTION_HOOK.try_with(|v| v.clone()) {
        if let Some(limiter) = &hook.limiter {
            limiter.until_ready().await;
        }

        let start = Instant::now();
        let res = func.await;
        let elapsed = start.elapsed();

        let status = match &res {
            Ok(r) => r.status(),
            Err(_) => Status::Error,
        };

        let mut tags = TagSet::clone(&hook.tags);
        for (key, value) in labels.tags {
            tags.insert(*key, *value);
        }
        tags.insert(STATUS_TAG, status.to_string());

        let sample = Sample::new(labels.metric, elapsed)
            .at(start.saturating_duration_since(hook.run_start))
            .status(status)
            .failed(!hook.policy.is_success(status))
            .tags(tags);
        hook.recorder.record(sample).await;

        res
    } else {
        tracing::error!("No hook available.");
        func.await
    }
}

/// Record a custom sample from inside a workload.
///
/// The scenario's tags are merged under the sample's own, and an unset timestamp is filled in.
pub async fn record(mut sample: Sample) {
    if let Ok(hook) = TRANSACTION_HOOK.try_with(|v| v.clone()) {
        let mut tags = TagSet::clone(&hook.tags);
        tags.merge(&sample.tags);
        sample.tags = tags;
        if sample.timestamp.is_zero() {
            sample.timestamp = hook.run_start.elapsed();
        }
        hook.recorder.record(sample).await;
    } else {
        tracing::error!("No hook available.");
    }
}

/// End the whole run with a fatal error. In-flight scenarios drain and are marked aborted.
pub fn abort_run(reason: impl Into<String>) {
    match TRANSACTION_HOOK.try_with(|v| v.control.clone()) {
        Ok(control) => control.fail(reason),
        Err(_) => tracing::error!("No hook available."),
    }
}

/// Base URL of the system under test for the current run.
pub fn base_url() -> Url {
    TRANSACTION_HOOK
        .try_with(|v| Url::clone(&v.base_url))
        .unwrap_or_else(|_| RunOptions::default().base_url)
}

/// Maps a successful transaction result to the [`Status`] its sample records.
///
/// Results without a protocol status count as [`Status::Ok`].
pub trait ResponseStatus {
    fn status(&self) -> Status {
        Status::Ok
    }
}

impl ResponseStatus for () {}
impl ResponseStatus for bool {}
impl ResponseStatus for String {}
impl ResponseStatus for Vec<u8> {}

impl ResponseStatus for u16 {
    fn status(&self) -> Status {
        Status::Code(*self)
    }
}

impl ResponseStatus for Status {
    fn status(&self) -> Status {
        *self
    }
}

/// A `(status, body)` pair takes the status of its first element.
impl<S: ResponseStatus, B> ResponseStatus for (S, B) {
    fn status(&self) -> Status {
        self.0.status()
    }
}

#[cfg(feature = "http")]
impl ResponseStatus for reqwest::Response {
    fn status(&self) -> Status {
        Status::Code(reqwest::Response::status(self).as_u16())
    }
}

#[cfg(feature = "http")]
impl ResponseStatus for reqwest::StatusCode {
    fn status(&self) -> Status {
        Status::Code(self.as_u16())
    }
}

#[derive(Clone)]
pub(crate) struct TransactionData {
    pub recorder: Recorder,
    pub run_start: Instant,
    /// Scenario tags, including the scenario name.
    pub tags: Arc<TagSet>,
    pub policy: Arc<StatusPolicy>,
    pub limiter: Option<Arc<DefaultDirectRateLimiter>>,
    pub base_url: Arc<Url>,
    pub control: RunControl,
}

tokio::task_local! {
    pub(crate) static TRANSACTION_HOOK: TransactionData;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use crate::{prelude::*, Scenario};
    use std::time::Duration;

    #[transaction(metric = "http_req", tags(type = "write"))]
    async fn create(code: u16) -> Result<u16, String> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(code)
    }

    #[transaction]
    async fn broken() -> Result<(), String> {
        Err("connection reset".to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn transactions_become_tagged_samples() {
        let scenario = Scenario::new("writer", || async {
            let _ = create(201).await;
            let _ = create(409).await;
            let _ = create(500).await;
            let _ = broken().await;
        })
        .constant(1, Duration::from_millis(50))
        .accept_status([201, 409]);

        let report = Scheduler::new([scenario])
            .unwrap()
            .threshold("http_req{type:write,status:409}", "count>=1")
            .unwrap()
            .threshold("broken{scenario:writer}", "rate==1")
            .unwrap()
            .run()
            .await;

        // One iteration: 3 x 20ms then the deadline.
        let writes = report.series("http_req").unwrap();
        assert_eq!(writes.count, 3);
        assert_eq!(writes.failures, 1);
        assert!(writes.min >= Duration::from_millis(20));
        assert!(report.thresholds_passed(), "{report}");
        assert_eq!(report.scenario("writer").unwrap().iterations, 1);
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    async fn transaction_without_hook_still_runs() {
        assert_eq!(create(201).await, Ok(201));
        assert!(logs_contain("No hook available."));
        assert_eq!(base_url().as_str(), "http://localhost:8004/");
    }
}
