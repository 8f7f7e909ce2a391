#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

// Lets the attribute macros refer to `::surge` from inside this crate.
extern crate self as surge;

pub mod aggregator;
pub mod recorder;
pub mod registry;
pub mod scenario;
pub mod scheduler;
pub mod threshold;
#[doc(hidden)]
pub mod transaction;

pub(crate) mod executor;

pub use registry::Registry;
pub use scenario::{Scenario, Workload};
pub use scheduler::{RunControl, RunHandle, Scheduler};
pub use surge_macros::{scenario, transaction};

pub use surge_core::{
    ConfigError, ExecutorKind, MetricSelector, OverflowPolicy, PlanConfig, RunOptions, RunReport,
    Sample, ScenarioConfig, ScenarioPhase, ScenarioStats, SeriesStats, Stage, Statistic, Status,
    StatusPolicy, TagSet, ThresholdExpr, ThresholdVerdict, Url,
};

/// Constants shared with the runtime and plan documents.
pub mod constants {
    pub use surge_core::{
        BASE_URL_ENV, DEFAULT_BASE_URL, DEFAULT_GRACEFUL_STOP, DEFAULT_LIVE_EVALUATION_INTERVAL,
        DEFAULT_RECORDER_CAPACITY, ERROR_TAG, EXIT_ABORTED, EXIT_FATAL, EXIT_SUCCESS,
        EXIT_THRESHOLDS_FAILED, ITERATION_DURATION, SCENARIO_TAG, STATUS_TAG,
    };
}

pub mod prelude {
    pub use crate::registry::Registry;
    pub use crate::scenario::{ConfigurableScenario, Scenario};
    pub use crate::scheduler::{RunHandle, Scheduler};
    pub use crate::transaction::{abort_run, base_url, record, ResponseStatus};
    pub use surge_macros::{scenario, transaction};

    pub use surge_core::{
        ConfigError, OverflowPolicy, PlanConfig, RunOptions, RunReport, Sample, ScenarioPhase,
        Stage, Status, ThresholdExpr,
    };
}
