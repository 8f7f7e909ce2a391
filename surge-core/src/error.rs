use thiserror::Error;

/// Problems with a test plan. All of these are reported before any VU is spawned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("No scenarios configured")]
    NoScenarios,

    #[error("Duplicate scenario name `{0}`")]
    DuplicateScenario(String),

    #[error("Scenario `{scenario}` has an invalid executor: {reason}")]
    InvalidExecutor { scenario: String, reason: String },

    #[error("Invalid metric selector `{0}`")]
    InvalidSelector(String),

    #[error("Invalid threshold `{expr}` on `{selector}`: {reason}")]
    InvalidThreshold {
        selector: String,
        expr: String,
        reason: String,
    },

    #[error("Scenario `{scenario}` references unknown workload `{exec}`")]
    UnknownWorkload { scenario: String, exec: String },

    #[error("Invalid base URL `{url}`: {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("Recorder capacity must be non-zero")]
    ZeroCapacity,
}
