use std::time::Duration;

/// Base URL used when neither the environment nor the plan provides one.
pub const DEFAULT_BASE_URL: &str = "http://localhost:8004";

/// Environment variable consulted for the base URL of the system under test.
pub const BASE_URL_ENV: &str = "BASE_URL";

/// Time stopped VUs get to finish their current iteration before being aborted.
pub const DEFAULT_GRACEFUL_STOP: Duration = Duration::from_secs(30);

/// Number of samples buffered between the VUs and the aggregator.
pub const DEFAULT_RECORDER_CAPACITY: usize = 65_536;

/// How often an executor reconciles running VUs against its target.
pub const RECONCILE_INTERVAL: Duration = Duration::from_millis(100);

/// How often thresholds are evaluated while a run is in progress.
pub const DEFAULT_LIVE_EVALUATION_INTERVAL: Duration = Duration::from_secs(2);

/// Metric recorded once per VU iteration.
pub const ITERATION_DURATION: &str = "iteration_duration";

pub const SCENARIO_TAG: &str = "scenario";
pub const STATUS_TAG: &str = "status";
pub const ERROR_TAG: &str = "error";

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FATAL: u8 = 1;
pub const EXIT_THRESHOLDS_FAILED: u8 = 99;
pub const EXIT_ABORTED: u8 = 105;
