use crate::{EXIT_ABORTED, EXIT_FATAL, EXIT_SUCCESS, EXIT_THRESHOLDS_FAILED};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSecondsWithFrac};
use std::fmt;
use std::time::Duration;
use time::OffsetDateTime;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioPhase {
    Pending,
    Running,
    Finished,
    Aborted,
}

impl fmt::Display for ScenarioPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScenarioPhase::Pending => "pending",
            ScenarioPhase::Running => "running",
            ScenarioPhase::Finished => "finished",
            ScenarioPhase::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Per-scenario execution counters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScenarioStats {
    pub name: String,
    pub phase: ScenarioPhase,
    pub iterations: u64,
    pub failed_iterations: u64,
    pub active_vus: usize,
    pub peak_vus: usize,
    /// VUs force-terminated after the grace period. These are not failures.
    pub aborted_vus: u64,
}

/// Summary statistics of one metric series.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SeriesStats {
    pub selector: String,
    pub count: u64,
    pub failures: u64,
    pub rate: f64,
    #[serde_as(as = "DurationMilliSecondsWithFrac<f64>")]
    pub avg: Duration,
    #[serde_as(as = "DurationMilliSecondsWithFrac<f64>")]
    pub min: Duration,
    #[serde_as(as = "DurationMilliSecondsWithFrac<f64>")]
    pub med: Duration,
    #[serde_as(as = "DurationMilliSecondsWithFrac<f64>")]
    pub p90: Duration,
    #[serde_as(as = "DurationMilliSecondsWithFrac<f64>")]
    pub p95: Duration,
    #[serde_as(as = "DurationMilliSecondsWithFrac<f64>")]
    pub p99: Duration,
    #[serde_as(as = "DurationMilliSecondsWithFrac<f64>")]
    pub max: Duration,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThresholdVerdict {
    pub selector: String,
    pub expression: String,
    /// `None` when the series has no samples.
    pub observed: Option<f64>,
    pub passed: bool,
    pub abort_on_fail: bool,
}

/// Final (or live) output of a run.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde_as(as = "DurationMilliSecondsWithFrac<f64>")]
    pub elapsed: Duration,
    pub scenarios: Vec<ScenarioStats>,
    pub series: Vec<SeriesStats>,
    pub thresholds: Vec<ThresholdVerdict>,
    pub dropped_samples: u64,
    /// Why the run was stopped early, if it was.
    pub abort_reason: Option<String>,
    /// Set when the run ended on a fatal error.
    pub fatal: Option<String>,
}

impl RunReport {
    pub fn thresholds_passed(&self) -> bool {
        self.thresholds.iter().all(|t| t.passed)
    }

    pub fn aborted(&self) -> bool {
        self.abort_reason.is_some() || self.fatal.is_some()
    }

    /// `0` when every threshold passed; non-zero otherwise.
    pub fn exit_code(&self) -> u8 {
        if self.fatal.is_some() {
            EXIT_FATAL
        } else if !self.thresholds_passed() {
            EXIT_THRESHOLDS_FAILED
        } else if self.abort_reason.is_some() {
            EXIT_ABORTED
        } else {
            EXIT_SUCCESS
        }
    }

    pub fn series(&self, selector: &str) -> Option<&SeriesStats> {
        self.series.iter().find(|s| s.selector == selector)
    }

    pub fn scenario(&self, name: &str) -> Option<&ScenarioStats> {
        self.scenarios.iter().find(|s| s.name == name)
    }
}

fn ms(d: Duration) -> String {
    format!("{:.2}ms", d.as_secs_f64() * 1e3)
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "run started {} and took {}",
            self.started_at,
            humantime::format_duration(Duration::from_millis(self.elapsed.as_millis() as u64))
        )?;

        writeln!(f, "\nscenarios:")?;
        for s in &self.scenarios {
            writeln!(
                f,
                "  {:<24} {:<9} iterations={} failed={} peak_vus={} aborted_vus={}",
                s.name, s.phase, s.iterations, s.failed_iterations, s.peak_vus, s.aborted_vus
            )?;
        }

        writeln!(f, "\nmetrics:")?;
        for s in &self.series {
            writeln!(
                f,
                "  {:<40} count={} failed={:.2}% avg={} min={} med={} p(90)={} p(95)={} max={}",
                s.selector,
                s.count,
                s.rate * 100.,
                ms(s.avg),
                ms(s.min),
                ms(s.med),
                ms(s.p90),
                ms(s.p95),
                ms(s.max),
            )?;
        }

        if !self.thresholds.is_empty() {
            writeln!(f, "\nthresholds:")?;
            for t in &self.thresholds {
                let observed = t
                    .observed
                    .map(|v| format!("{v:.3}"))
                    .unwrap_or_else(|| "no samples".to_string());
                writeln!(
                    f,
                    "  [{}] {} {} (observed {observed})",
                    if t.passed { "PASS" } else { "FAIL" },
                    t.selector,
                    t.expression,
                )?;
            }
        }

        if self.dropped_samples > 0 {
            writeln!(f, "\nWARNING: {} samples dropped", self.dropped_samples)?;
        }
        if let Some(reason) = &self.abort_reason {
            writeln!(f, "\nrun aborted: {reason}")?;
        }
        if let Some(fatal) = &self.fatal {
            writeln!(f, "\nfatal error: {fatal}")?;
        }
        Ok(())
    }
}
