//! Streaming per-series statistics.
use arc_swap::ArcSwap;
use pdatastructs::tdigest::{TDigest, K1};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use surge_core::{MetricSelector, Sample, SeriesStats, Statistic};
use tracing::error;

const TDIGEST_COMPRESSION: f64 = 100.;
const TDIGEST_BACKLOG_SIZE: usize = 100;

fn default_tdigest() -> TDigest<K1> {
    TDigest::new(K1::new(TDIGEST_COMPRESSION), TDIGEST_BACKLOG_SIZE)
}

/// Running summary of every sample matching one selector.
#[derive(Debug, Clone)]
pub struct MetricSeries {
    count: u64,
    failures: u64,
    sum: Duration,
    min: Duration,
    max: Duration,
    latency: TDigest<K1>,
}

impl Default for MetricSeries {
    fn default() -> Self {
        Self {
            count: 0,
            failures: 0,
            sum: Duration::ZERO,
            min: Duration::MAX,
            max: Duration::ZERO,
            latency: default_tdigest(),
        }
    }
}

impl MetricSeries {
    fn fold(&mut self, sample: &Sample) {
        self.count += 1;
        if sample.failed {
            self.failures += 1;
        }
        self.sum = self.sum.saturating_add(sample.duration);
        self.min = self.min.min(sample.duration);
        self.max = self.max.max(sample.duration);
        self.latency.insert(sample.duration.as_secs_f64());
    }
}

/// Immutable copy of a series taken under its lock.
#[derive(Debug, Clone)]
pub struct SeriesSnapshot {
    selector: MetricSelector,
    series: MetricSeries,
}

impl SeriesSnapshot {
    pub fn selector(&self) -> &MetricSelector {
        &self.selector
    }

    pub fn count(&self) -> u64 {
        self.series.count
    }

    pub fn failures(&self) -> u64 {
        self.series.failures
    }

    /// Failures over total, `None` for an empty series.
    pub fn rate(&self) -> Option<f64> {
        (self.series.count > 0).then(|| self.series.failures as f64 / self.series.count as f64)
    }

    pub fn min(&self) -> Option<Duration> {
        (self.series.count > 0).then_some(self.series.min)
    }

    pub fn max(&self) -> Option<Duration> {
        (self.series.count > 0).then_some(self.series.max)
    }

    pub fn mean(&self) -> Option<Duration> {
        match u32::try_from(self.series.count) {
            Ok(0) => None,
            Ok(n) => Some(self.series.sum / n),
            Err(_) => Some(Duration::from_secs_f64(
                self.series.sum.as_secs_f64() / self.series.count as f64,
            )),
        }
    }

    /// Estimated quantile `q` in `[0, 1]`, clamped to the observed range.
    pub fn quantile(&self, q: f64) -> Option<Duration> {
        if self.series.count == 0 {
            return None;
        }

        let secs = self.series.latency.quantile(q.clamp(0., 1.));
        let secs = if secs.is_finite() {
            secs
        } else {
            error!("Non-finite quantile estimate for {}", self.selector);
            self.series.max.as_secs_f64()
        };

        let estimate = Duration::from_secs_f64(secs.max(0.));
        Some(estimate.clamp(self.series.min, self.series.max))
    }

    /// Observed value of `statistic`. Duration statistics are reported in milliseconds.
    ///
    /// `count` is always defined; every other statistic is `None` for an empty series.
    pub fn statistic(&self, statistic: Statistic) -> Option<f64> {
        let ms = |d: Duration| d.as_secs_f64() * 1e3;
        match statistic {
            Statistic::Count => Some(self.count() as f64),
            Statistic::Rate => self.rate(),
            Statistic::Avg => self.mean().map(ms),
            Statistic::Min => self.min().map(ms),
            Statistic::Max => self.max().map(ms),
            Statistic::Med => self.quantile(0.5).map(ms),
            Statistic::Percentile(p) => self.quantile(p / 100.).map(ms),
        }
    }

    pub fn stats(&self) -> SeriesStats {
        let q = |q| self.quantile(q).unwrap_or_default();
        SeriesStats {
            selector: self.selector.to_string(),
            count: self.count(),
            failures: self.failures(),
            rate: self.rate().unwrap_or(0.),
            avg: self.mean().unwrap_or_default(),
            min: self.min().unwrap_or_default(),
            med: q(0.5),
            p90: q(0.9),
            p95: q(0.95),
            p99: q(0.99),
            max: self.max().unwrap_or_default(),
        }
    }
}

/// Every series snapshot of a run, taken together.
#[derive(Debug, Clone, Default)]
pub struct RunSnapshot {
    series: HashMap<MetricSelector, SeriesSnapshot>,
}

impl RunSnapshot {
    pub fn get(&self, selector: &MetricSelector) -> Option<&SeriesSnapshot> {
        self.series.get(selector)
    }

    /// Series ordered by selector.
    pub fn stats(&self) -> Vec<SeriesStats> {
        let mut selectors: Vec<_> = self.series.keys().collect();
        selectors.sort();
        selectors
            .into_iter()
            .filter_map(|s| self.series.get(s))
            .map(SeriesSnapshot::stats)
            .collect()
    }
}

type SharedSeries = Arc<Mutex<MetricSeries>>;

#[derive(Clone, Default)]
struct Index {
    series: HashMap<MetricSelector, SharedSeries>,
    /// Selectors with a non-empty tag filter.
    filtered: Vec<(MetricSelector, SharedSeries)>,
}

/// Folds samples into per-selector series.
///
/// Every sample updates the unfiltered series of its metric plus each tracked filtered series
/// whose filter is a subset of the sample's tags. Each series has its own lock, and the series
/// index is swapped atomically, so samples touching disjoint series never share a lock.
#[derive(Default)]
pub struct Aggregator {
    index: ArcSwap<Index>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Aggregator that tracks `selectors` from the first sample on.
    pub fn with_selectors<'a>(selectors: impl IntoIterator<Item = &'a MetricSelector>) -> Self {
        let aggregator = Self::new();
        for selector in selectors {
            aggregator.track(selector);
        }
        aggregator
    }

    /// Start maintaining `selector`. Samples ingested earlier are not replayed.
    pub fn track(&self, selector: &MetricSelector) {
        self.series_for(selector);
    }

    pub fn ingest(&self, sample: &Sample) {
        let index = self.index.load();

        let overall = match index.series.get(&MetricSelector::metric(&sample.metric)) {
            Some(series) => series.clone(),
            None => self.series_for(&MetricSelector::metric(&sample.metric)),
        };
        fold(&overall, sample);

        for (_, series) in index.filtered.iter().filter(|(sel, _)| sel.matches(sample)) {
            fold(series, sample);
        }
    }

    pub fn snapshot(&self, selector: &MetricSelector) -> Option<SeriesSnapshot> {
        let series = self.index.load().series.get(selector).cloned()?;
        let series = series.lock().unwrap_or_else(PoisonError::into_inner).clone();
        Some(SeriesSnapshot {
            selector: selector.clone(),
            series,
        })
    }

    pub fn snapshot_all(&self) -> RunSnapshot {
        let index = self.index.load();
        let series = index
            .series
            .iter()
            .map(|(selector, series)| {
                let series = series.lock().unwrap_or_else(PoisonError::into_inner).clone();
                (
                    selector.clone(),
                    SeriesSnapshot {
                        selector: selector.clone(),
                        series,
                    },
                )
            })
            .collect();
        RunSnapshot { series }
    }

    fn series_for(&self, selector: &MetricSelector) -> SharedSeries {
        if let Some(series) = self.index.load().series.get(selector) {
            return series.clone();
        }

        let fresh = SharedSeries::default();
        self.index.rcu(|index| {
            let mut next = Index::clone(index);
            if !next.series.contains_key(selector) {
                next.series.insert(selector.clone(), fresh.clone());
                if !selector.filter.is_empty() {
                    next.filtered.push((selector.clone(), fresh.clone()));
                }
            }
            next
        });

        self.index
            .load()
            .series
            .get(selector)
            .cloned()
            .unwrap_or(fresh)
    }
}

fn fold(series: &SharedSeries, sample: &Sample) {
    series
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .fold(sample);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::SmallRng, seq::SliceRandom, SeedableRng};
    use surge_core::TagSet;

    fn sample(ms: u64, kind: &str) -> Sample {
        Sample::new("http_req", Duration::from_millis(ms)).tag("type", kind)
    }

    fn read_selector() -> MetricSelector {
        "http_req{type:read}".parse().unwrap()
    }

    #[test]
    fn sample_updates_every_matching_series() {
        let aggregator = Aggregator::with_selectors([&read_selector()]);
        aggregator.ingest(&sample(10, "read"));
        aggregator.ingest(&sample(20, "write"));
        aggregator.ingest(&sample(30, "read").failed(true));

        let all = aggregator
            .snapshot(&MetricSelector::metric("http_req"))
            .unwrap();
        assert_eq!(all.count(), 3);
        assert_eq!(all.failures(), 1);

        let reads = aggregator.snapshot(&read_selector()).unwrap();
        assert_eq!(reads.count(), 2);
        assert_eq!(reads.rate(), Some(0.5));
        assert_eq!(reads.min(), Some(Duration::from_millis(10)));
        assert_eq!(reads.max(), Some(Duration::from_millis(30)));
        assert_eq!(reads.mean(), Some(Duration::from_millis(20)));
    }

    #[test]
    fn untracked_selector_has_no_snapshot() {
        let aggregator = Aggregator::new();
        aggregator.ingest(&sample(10, "read"));
        assert!(aggregator.snapshot(&read_selector()).is_none());

        let tracked = Aggregator::with_selectors([&read_selector()]);
        let empty = tracked.snapshot(&read_selector()).unwrap();
        assert_eq!(empty.count(), 0);
        assert_eq!(empty.rate(), None);
        assert_eq!(empty.statistic(Statistic::Percentile(95.)), None);
        assert_eq!(empty.statistic(Statistic::Count), Some(0.));
    }

    #[test]
    fn multi_tag_filters() {
        let narrow: MetricSelector = "http_req{type:read,endpoint:employees}".parse().unwrap();
        let aggregator = Aggregator::with_selectors([&narrow, &read_selector()]);
        aggregator.ingest(&sample(1, "read"));
        aggregator.ingest(&sample(1, "read").tag("endpoint", "employees"));
        aggregator.ingest(
            &Sample::new("iteration_duration", Duration::from_millis(1))
                .tags(TagSet::new().with("type", "read").with("endpoint", "employees")),
        );

        assert_eq!(aggregator.snapshot(&narrow).unwrap().count(), 1);
        assert_eq!(aggregator.snapshot(&read_selector()).unwrap().count(), 2);
    }

    #[test]
    fn concurrent_ingest_is_order_independent() {
        let aggregator = Arc::new(Aggregator::with_selectors([&read_selector()]));
        let mut samples: Vec<Sample> = (0..4_000)
            .map(|i| sample(i % 500, if i % 4 == 0 { "read" } else { "write" }))
            .collect();
        samples.shuffle(&mut SmallRng::seed_from_u64(7));

        std::thread::scope(|scope| {
            for chunk in samples.chunks(500) {
                let aggregator = aggregator.clone();
                scope.spawn(move || {
                    for s in chunk {
                        aggregator.ingest(s);
                    }
                });
            }
        });

        let all = aggregator
            .snapshot(&MetricSelector::metric("http_req"))
            .unwrap();
        assert_eq!(all.count(), 4_000);
        assert_eq!(aggregator.snapshot(&read_selector()).unwrap().count(), 1_000);
    }

    #[test]
    fn p95_converges_within_five_percent() {
        let mut values: Vec<u64> = (1..=10_000).collect();
        values.shuffle(&mut SmallRng::seed_from_u64(42));

        let aggregator = Aggregator::new();
        for v in &values {
            aggregator.ingest(&Sample::new("http_req", Duration::from_micros(*v * 100)));
        }

        let snapshot = aggregator
            .snapshot(&MetricSelector::metric("http_req"))
            .unwrap();
        // True p95 is the 9,500th value: 950ms.
        let p95 = snapshot.statistic(Statistic::Percentile(95.)).unwrap();
        assert!((p95 - 950.).abs() / 950. <= 0.05, "p95 estimate {p95}");

        let med = snapshot.statistic(Statistic::Med).unwrap();
        assert!((med - 500.).abs() / 500. <= 0.05, "median estimate {med}");
    }

    #[test]
    fn p95_converges_for_skewed_latencies() {
        use rand_distr::{Distribution, LogNormal};

        let mut rng = SmallRng::seed_from_u64(3);
        let dist = LogNormal::new(4.5, 0.6).unwrap();
        let mut values: Vec<f64> = (0..5_000).map(|_| dist.sample(&mut rng)).collect();

        let aggregator = Aggregator::new();
        for v in &values {
            aggregator.ingest(&Sample::new("http_req", Duration::from_secs_f64(v / 1e3)));
        }

        values.sort_by(|a, b| a.total_cmp(b));
        let truth = values[(values.len() as f64 * 0.95) as usize];
        let p95 = aggregator
            .snapshot(&MetricSelector::metric("http_req"))
            .unwrap()
            .statistic(Statistic::Percentile(95.))
            .unwrap();
        assert!((p95 - truth).abs() / truth <= 0.05, "p95 {p95} vs {truth}");
    }

    #[test]
    fn snapshot_is_isolated_from_later_ingest() {
        let aggregator = Aggregator::new();
        aggregator.ingest(&sample(10, "read"));
        let before = aggregator
            .snapshot(&MetricSelector::metric("http_req"))
            .unwrap();
        aggregator.ingest(&sample(20, "read"));

        assert_eq!(before.count(), 1);
        assert_eq!(before.max(), Some(Duration::from_millis(10)));
    }
}
