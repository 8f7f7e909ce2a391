use crate::{
    ConfigError, TagSet, ThresholdExpr, Status, DEFAULT_BASE_URL, DEFAULT_GRACEFUL_STOP,
    DEFAULT_LIVE_EVALUATION_INTERVAL, DEFAULT_RECORDER_CAPACITY,
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_with::{serde_as, DeserializeAs, SerializeAs};
use std::collections::{BTreeMap, BTreeSet};
use std::num::NonZeroU32;
use std::time::Duration;
use url::Url;

/// Serializes a [`Duration`] in humantime form, e.g. `"1m 30s"`, and accepts `"90s"`/`"1m30s"`.
pub struct HumanDuration;

impl SerializeAs<Duration> for HumanDuration {
    fn serialize_as<S: Serializer>(source: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*source))
    }
}

impl<'de> DeserializeAs<'de, Duration> for HumanDuration {
    fn deserialize_as<D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
    }
}

/// One ramp segment: move linearly to `target` VUs over `duration`.
#[serde_as]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    #[serde_as(as = "HumanDuration")]
    pub duration: Duration,
    pub target: usize,
}

impl Stage {
    pub fn new(duration: Duration, target: usize) -> Self {
        Self { duration, target }
    }
}

/// How many VUs a scenario runs over time.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "executor", rename_all = "kebab-case")]
pub enum ExecutorKind {
    #[serde(alias = "ramping-vus")]
    Ramping {
        #[serde(default)]
        start_vus: usize,
        stages: Vec<Stage>,
    },
    #[serde(alias = "constant-vus")]
    Constant {
        vus: usize,
        #[serde_as(as = "HumanDuration")]
        duration: Duration,
    },
}

impl ExecutorKind {
    pub fn ramping(stages: impl IntoIterator<Item = Stage>) -> Self {
        Self::Ramping {
            start_vus: 0,
            stages: stages.into_iter().collect(),
        }
    }

    pub fn constant(vus: usize, duration: Duration) -> Self {
        Self::Constant { vus, duration }
    }

    /// Sum of stage durations, or the fixed duration.
    pub fn total_duration(&self) -> Duration {
        match self {
            Self::Ramping { stages, .. } => stages.iter().map(|s| s.duration).sum(),
            Self::Constant { duration, .. } => *duration,
        }
    }

    /// Target VU count at `elapsed` since the executor started.
    ///
    /// Within ramping stage `i` the target moves linearly from the previous stage's target (or
    /// `start_vus`) to stage `i`'s target. At a stage boundary the result is exactly the
    /// finished stage's target. Past the end the final target is held.
    pub fn target_vus(&self, elapsed: Duration) -> usize {
        match self {
            Self::Constant { vus, .. } => *vus,
            Self::Ramping { start_vus, stages } => {
                let mut from = *start_vus;
                let mut stage_start = Duration::ZERO;
                for stage in stages {
                    let stage_end = stage_start + stage.duration;
                    if elapsed < stage_end {
                        let progress = (elapsed - stage_start).as_secs_f64()
                            / stage.duration.as_secs_f64();
                        return interpolate(from, stage.target, progress);
                    }
                    from = stage.target;
                    stage_start = stage_end;
                }
                from
            }
        }
    }

    /// Highest VU count this executor can ask for.
    pub fn max_vus(&self) -> usize {
        match self {
            Self::Constant { vus, .. } => *vus,
            Self::Ramping { start_vus, stages } => stages
                .iter()
                .map(|s| s.target)
                .max()
                .unwrap_or(0)
                .max(*start_vus),
        }
    }

    pub fn validate(&self, scenario: &str) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidExecutor {
            scenario: scenario.to_string(),
            reason: reason.to_string(),
        };

        match self {
            Self::Ramping { stages, .. } if stages.is_empty() => Err(invalid("no stages")),
            Self::Ramping { .. } if self.total_duration().is_zero() => {
                Err(invalid("stages have zero total duration"))
            }
            Self::Ramping { .. } if self.max_vus() == 0 => Err(invalid("no stage targets any VUs")),
            Self::Constant { vus: 0, .. } => Err(invalid("vus must be non-zero")),
            Self::Constant { duration, .. } if duration.is_zero() => {
                Err(invalid("duration must be non-zero"))
            }
            _ => Ok(()),
        }
    }
}

fn interpolate(from: usize, to: usize, progress: f64) -> usize {
    let (from, to) = (from as f64, to as f64);
    (from + (to - from) * progress).round().max(0.) as usize
}

/// Which status outcomes a scenario counts as success.
///
/// By default `Ok` and codes `200..400` succeed. An explicit accept list replaces the code
/// range, e.g. `[201, 409, 422, 400]` for endpoints where conflicts are expected.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusPolicy {
    accepted: Option<BTreeSet<u16>>,
}

impl StatusPolicy {
    pub fn accept(codes: impl IntoIterator<Item = u16>) -> Self {
        Self {
            accepted: Some(codes.into_iter().collect()),
        }
    }

    pub fn is_success(&self, status: Status) -> bool {
        match (status, &self.accepted) {
            (Status::Ok, _) => true,
            (Status::Error, _) => false,
            (Status::Code(code), None) => (200..400).contains(&code),
            (Status::Code(code), Some(accepted)) => accepted.contains(&code),
        }
    }
}

fn default_graceful_stop() -> Duration {
    DEFAULT_GRACEFUL_STOP
}

/// Declarative description of one scenario.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScenarioConfig {
    /// Filled from the key of the plan's scenario map when loaded from a document.
    #[serde(default, skip_serializing)]
    pub name: String,
    #[serde(flatten)]
    pub executor: ExecutorKind,
    /// Name of the registered workload; defaults to the scenario name.
    #[serde(default)]
    pub exec: Option<String>,
    #[serde_as(as = "HumanDuration")]
    #[serde(default)]
    pub start_offset: Duration,
    #[serde_as(as = "HumanDuration")]
    #[serde(default = "default_graceful_stop")]
    pub graceful_stop: Duration,
    /// Engine-level pause between iterations. Cut short by a stop signal.
    #[serde_as(as = "HumanDuration")]
    #[serde(default)]
    pub think_time: Duration,
    #[serde(default)]
    pub accept_status: StatusPolicy,
    /// Added to every sample the scenario produces.
    #[serde(default)]
    pub tags: TagSet,
}

impl ScenarioConfig {
    /// A scenario with a placeholder executor; `validate` rejects it until one is configured.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            executor: ExecutorKind::Constant {
                vus: 1,
                duration: Duration::ZERO,
            },
            exec: None,
            start_offset: Duration::ZERO,
            graceful_stop: DEFAULT_GRACEFUL_STOP,
            think_time: Duration::ZERO,
            accept_status: StatusPolicy::default(),
            tags: TagSet::new(),
        }
    }

    pub fn exec_name(&self) -> &str {
        self.exec.as_deref().unwrap_or(&self.name)
    }

    /// Offset from run start at which the executor stops.
    pub fn end_offset(&self) -> Duration {
        self.start_offset + self.executor.total_duration()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.executor.validate(&self.name)
    }
}

/// What the recorder does when its buffer is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Suspend the producing VU until there is room.
    #[default]
    Block,
    /// Drop the oldest buffered sample and count it.
    DropOldest,
}

/// Run-wide settings resolved from a plan.
#[derive(Clone, Debug, PartialEq)]
pub struct RunOptions {
    pub base_url: Url,
    pub recorder_capacity: usize,
    pub overflow: OverflowPolicy,
    pub max_rps: Option<NonZeroU32>,
    pub live_evaluation: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            recorder_capacity: DEFAULT_RECORDER_CAPACITY,
            overflow: OverflowPolicy::default(),
            max_rps: None,
            live_evaluation: DEFAULT_LIVE_EVALUATION_INTERVAL,
        }
    }
}

fn default_base_url() -> Url {
    Url::parse(DEFAULT_BASE_URL).expect("DEFAULT_BASE_URL is a valid URL")
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThresholdEntry {
    Expr(String),
    Detailed {
        threshold: String,
        #[serde(default)]
        abort_on_fail: bool,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThresholdList {
    One(ThresholdEntry),
    Many(Vec<ThresholdEntry>),
}

fn default_live_evaluation() -> Duration {
    DEFAULT_LIVE_EVALUATION_INTERVAL
}

fn default_recorder_capacity() -> usize {
    DEFAULT_RECORDER_CAPACITY
}

/// A complete test plan document.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    pub scenarios: BTreeMap<String, ScenarioConfig>,
    #[serde(default)]
    pub thresholds: BTreeMap<String, ThresholdList>,
    #[serde(default)]
    pub max_rps: Option<NonZeroU32>,
    #[serde(default = "default_recorder_capacity")]
    pub recorder_capacity: usize,
    #[serde(default)]
    pub overflow: OverflowPolicy,
    #[serde_as(as = "HumanDuration")]
    #[serde(default = "default_live_evaluation")]
    pub live_evaluation: Duration,
}

impl PlanConfig {
    /// Scenario configs with their names filled in from the map keys.
    pub fn scenarios(&self) -> Vec<ScenarioConfig> {
        self.scenarios
            .iter()
            .map(|(name, config)| ScenarioConfig {
                name: name.clone(),
                ..config.clone()
            })
            .collect()
    }

    pub fn thresholds(&self) -> Result<Vec<ThresholdExpr>, ConfigError> {
        let mut out = vec![];
        for (selector, list) in &self.thresholds {
            let entries = match list {
                ThresholdList::One(entry) => std::slice::from_ref(entry),
                ThresholdList::Many(entries) => entries.as_slice(),
            };
            for entry in entries {
                let expr = match entry {
                    ThresholdEntry::Expr(expr) => ThresholdExpr::parse(selector, expr)?,
                    ThresholdEntry::Detailed {
                        threshold,
                        abort_on_fail,
                    } => ThresholdExpr::parse(selector, threshold)?.abort_on_fail(*abort_on_fail),
                };
                out.push(expr);
            }
        }
        Ok(out)
    }

    /// Base URL precedence: the environment value, then the document, then the default.
    pub fn resolve_base_url(&self, env: Option<&str>) -> Result<Url, ConfigError> {
        let raw = env
            .filter(|v| !v.trim().is_empty())
            .or(self.base_url.as_deref())
            .unwrap_or(DEFAULT_BASE_URL);

        Url::parse(raw.trim()).map_err(|err| ConfigError::InvalidBaseUrl {
            url: raw.to_string(),
            reason: err.to_string(),
        })
    }

    pub fn run_options(&self, env_base_url: Option<&str>) -> Result<RunOptions, ConfigError> {
        if self.recorder_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }

        Ok(RunOptions {
            base_url: self.resolve_base_url(env_base_url)?,
            recorder_capacity: self.recorder_capacity,
            overflow: self.overflow,
            max_rps: self.max_rps,
            live_evaluation: self.live_evaluation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Comparison, Statistic};

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn read_load() -> ExecutorKind {
        ExecutorKind::ramping([
            Stage::new(secs(30), 10),
            Stage::new(secs(60), 10),
            Stage::new(secs(30), 0),
        ])
    }

    #[test]
    fn ramping_boundaries_are_exact() {
        let kind = read_load();
        assert_eq!(kind.target_vus(Duration::ZERO), 0);
        assert_eq!(kind.target_vus(secs(15)), 5);
        assert_eq!(kind.target_vus(secs(30)), 10);
        assert_eq!(kind.target_vus(secs(60)), 10);
        assert_eq!(kind.target_vus(secs(90)), 10);
        assert_eq!(kind.target_vus(secs(105)), 5);
        assert_eq!(kind.target_vus(secs(120)), 0);
        assert_eq!(kind.target_vus(secs(500)), 0);
        assert_eq!(kind.total_duration(), secs(120));
    }

    #[test]
    fn ramping_boundary_property_over_many_stage_lists() {
        let lists: Vec<Vec<Stage>> = vec![
            vec![Stage::new(secs(7), 3), Stage::new(secs(13), 17), Stage::new(secs(1), 2)],
            vec![Stage::new(Duration::from_millis(333), 1), Stage::new(secs(9), 100)],
            vec![Stage::new(secs(3), 50), Stage::new(Duration::ZERO, 5), Stage::new(secs(4), 7)],
        ];

        for stages in lists {
            let kind = ExecutorKind::Ramping {
                start_vus: 2,
                stages: stages.clone(),
            };
            let mut boundary = Duration::ZERO;
            for (idx, stage) in stages.iter().enumerate() {
                boundary += stage.duration;
                // A zero-length stage shares its boundary with the stage after it.
                let next_is_instant = stages
                    .get(idx + 1)
                    .is_some_and(|next| next.duration.is_zero());
                if !next_is_instant {
                    assert_eq!(kind.target_vus(boundary), stage.target, "{stages:?} @ {idx}");
                }
            }
        }
    }

    #[test]
    fn ramping_from_start_vus() {
        let kind = ExecutorKind::Ramping {
            start_vus: 10,
            stages: vec![Stage::new(secs(10), 0)],
        };
        assert_eq!(kind.target_vus(Duration::ZERO), 10);
        assert_eq!(kind.target_vus(secs(5)), 5);
        assert_eq!(kind.target_vus(secs(10)), 0);
    }

    #[test]
    fn constant_target() {
        let kind = ExecutorKind::constant(5, secs(120));
        assert_eq!(kind.target_vus(Duration::ZERO), 5);
        assert_eq!(kind.target_vus(secs(119)), 5);
        assert_eq!(kind.total_duration(), secs(120));
    }

    #[test]
    fn executor_validation() {
        assert!(read_load().validate("a").is_ok());
        assert!(ExecutorKind::ramping([]).validate("a").is_err());
        assert!(ExecutorKind::ramping([Stage::new(Duration::ZERO, 3)])
            .validate("a")
            .is_err());
        assert!(ExecutorKind::ramping([Stage::new(secs(3), 0)])
            .validate("a")
            .is_err());
        assert!(ExecutorKind::constant(0, secs(1)).validate("a").is_err());
        assert!(ExecutorKind::constant(1, Duration::ZERO).validate("a").is_err());
        assert!(ScenarioConfig::new("unconfigured").validate().is_err());
    }

    #[test]
    fn status_policy() {
        let default = StatusPolicy::default();
        assert!(default.is_success(Status::Ok));
        assert!(default.is_success(Status::Code(201)));
        assert!(default.is_success(Status::Code(304)));
        assert!(!default.is_success(Status::Code(409)));
        assert!(!default.is_success(Status::Error));

        let conflicts = StatusPolicy::accept([201, 409, 422, 400]);
        assert!(conflicts.is_success(Status::Code(409)));
        assert!(conflicts.is_success(Status::Code(400)));
        assert!(!conflicts.is_success(Status::Code(200)));
        assert!(!conflicts.is_success(Status::Code(500)));
    }

    const PLAN: &str = r#"{
        "base_url": "http://sut.internal:8004",
        "scenarios": {
            "read_load": {
                "executor": "ramping-vus",
                "stages": [
                    { "duration": "30s", "target": 10 },
                    { "duration": "1m", "target": 10 },
                    { "duration": "30s", "target": 0 }
                ],
                "exec": "read_employees",
                "tags": { "type": "read" }
            },
            "write_load": {
                "executor": "constant",
                "vus": 5,
                "duration": "2m",
                "start_offset": "10s",
                "accept_status": [201, 409]
            }
        },
        "thresholds": {
            "http_req{type:read}": ["p(95)<300"],
            "http_req": "p(95)<800",
            "http_req_failed": [{ "threshold": "rate<0.01", "abort_on_fail": true }]
        }
    }"#;

    #[test]
    fn parse_plan_document() {
        let plan: PlanConfig = serde_json::from_str(PLAN).unwrap();

        let scenarios = plan.scenarios();
        assert_eq!(scenarios.len(), 2);
        let read = &scenarios[0];
        assert_eq!(read.name, "read_load");
        assert_eq!(read.exec_name(), "read_employees");
        assert_eq!(read.executor, read_load());
        assert_eq!(read.graceful_stop, DEFAULT_GRACEFUL_STOP);
        assert_eq!(read.tags.get("type"), Some("read"));

        let write = &scenarios[1];
        assert_eq!(write.exec_name(), "write_load");
        assert_eq!(write.executor, ExecutorKind::constant(5, secs(120)));
        assert_eq!(write.start_offset, secs(10));
        assert_eq!(write.end_offset(), secs(130));
        assert!(write.accept_status.is_success(Status::Code(409)));

        let thresholds = plan.thresholds().unwrap();
        assert_eq!(thresholds.len(), 3);
        let failed = thresholds
            .iter()
            .find(|t| t.selector.name == "http_req_failed")
            .unwrap();
        assert!(failed.abort_on_fail);
        assert_eq!(failed.statistic, Statistic::Rate);
        assert_eq!(failed.comparison, Comparison::Lt);
    }

    #[test]
    fn base_url_precedence() {
        let plan: PlanConfig = serde_json::from_str(PLAN).unwrap();
        assert_eq!(
            plan.resolve_base_url(Some("http://env:1")).unwrap().as_str(),
            "http://env:1/"
        );
        assert_eq!(
            plan.resolve_base_url(None).unwrap().as_str(),
            "http://sut.internal:8004/"
        );

        let bare: PlanConfig = serde_json::from_str(r#"{ "scenarios": {} }"#).unwrap();
        assert_eq!(
            bare.resolve_base_url(Some("  ")).unwrap().as_str(),
            "http://localhost:8004/"
        );
        assert!(matches!(
            bare.resolve_base_url(Some("not a url")),
            Err(ConfigError::InvalidBaseUrl { .. })
        ));
    }

    #[test]
    fn invalid_threshold_in_plan() {
        let plan: PlanConfig = serde_json::from_str(
            r#"{ "scenarios": {}, "thresholds": { "http_req": "p95 < 3" } }"#,
        )
        .unwrap();
        assert!(matches!(
            plan.thresholds(),
            Err(ConfigError::InvalidThreshold { .. })
        ));
    }
}
