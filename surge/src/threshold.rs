//! Pass/fail evaluation of thresholds against aggregated series.
use crate::aggregator::RunSnapshot;
use surge_core::{MetricSelector, ThresholdExpr, ThresholdVerdict};
#[allow(unused_imports)]
use tracing::{debug, error, info, trace, warn};

#[derive(Clone, Debug, Default)]
pub struct Evaluator {
    thresholds: Vec<ThresholdExpr>,
}

impl Evaluator {
    pub fn new(thresholds: Vec<ThresholdExpr>) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &[ThresholdExpr] {
        &self.thresholds
    }

    /// Selectors the aggregator must maintain for evaluation to see their samples.
    pub fn selectors(&self) -> impl Iterator<Item = &MetricSelector> {
        self.thresholds.iter().map(|t| &t.selector)
    }

    /// Evaluate every threshold against `snapshot`.
    ///
    /// A threshold whose series has no samples (or was never tracked) fails with no observed
    /// value. Evaluation does not mutate anything, so repeated calls on one snapshot agree.
    pub fn evaluate(&self, snapshot: &RunSnapshot) -> Vec<ThresholdVerdict> {
        self.thresholds
            .iter()
            .map(|threshold| evaluate_one(threshold, snapshot))
            .collect()
    }
}

fn evaluate_one(threshold: &ThresholdExpr, snapshot: &RunSnapshot) -> ThresholdVerdict {
    let observed = snapshot
        .get(&threshold.selector)
        .and_then(|series| series.statistic(threshold.statistic));

    let passed = match observed {
        Some(value) => threshold.comparison.holds(value, threshold.limit),
        None => {
            debug!("No samples for threshold {threshold}");
            false
        }
    };

    ThresholdVerdict {
        selector: threshold.selector.to_string(),
        expression: threshold.expression(),
        observed,
        passed,
        abort_on_fail: threshold.abort_on_fail,
    }
}
