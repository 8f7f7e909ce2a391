use crate::{ConfigError, Sample, TagSet};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Names a metric series: a metric name plus an optional tag filter.
///
/// Textual form is `name` or `name{key:value,key2:value2}`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MetricSelector {
    pub name: String,
    pub filter: TagSet,
}

impl MetricSelector {
    /// The unfiltered series of a metric.
    pub fn metric(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filter: TagSet::new(),
        }
    }

    pub fn with_filter(mut self, filter: TagSet) -> Self {
        self.filter = filter;
        self
    }

    pub fn matches(&self, sample: &Sample) -> bool {
        self.name == sample.metric && self.filter.is_subset_of(&sample.tags)
    }
}

impl FromStr for MetricSelector {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidSelector(raw.to_string());
        let s = raw.trim();

        let (name, filter) = match s.find('{') {
            None => (s, TagSet::new()),
            Some(open) => {
                let body = s[open + 1..].strip_suffix('}').ok_or_else(invalid)?;
                let mut filter = TagSet::new();
                for pair in body.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                    let (k, v) = pair.split_once(':').ok_or_else(invalid)?;
                    let (k, v) = (k.trim(), v.trim());
                    if k.is_empty() || v.is_empty() {
                        return Err(invalid());
                    }
                    filter.insert(k, v);
                }
                (s[..open].trim_end(), filter)
            }
        };

        let valid_name = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-');
        if !valid_name {
            return Err(invalid());
        }

        Ok(Self {
            name: name.to_string(),
            filter,
        })
    }
}

impl TryFrom<String> for MetricSelector {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MetricSelector> for String {
    fn from(value: MetricSelector) -> Self {
        value.to_string()
    }
}

impl fmt::Display for MetricSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.name, self.filter)
    }
}

/// Statistic computed over a series snapshot. Duration statistics are in milliseconds.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Statistic {
    /// Percentile in `(0, 100]`, e.g. `p(95)`.
    Percentile(f64),
    Avg,
    Min,
    Med,
    Max,
    Count,
    /// Failures divided by total samples.
    Rate,
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statistic::Percentile(p) => write!(f, "p({p})"),
            Statistic::Avg => write!(f, "avg"),
            Statistic::Min => write!(f, "min"),
            Statistic::Med => write!(f, "med"),
            Statistic::Max => write!(f, "max"),
            Statistic::Count => write!(f, "count"),
            Statistic::Rate => write!(f, "rate"),
        }
    }
}

fn parse_statistic(s: &str) -> Result<Statistic, String> {
    let stat = match s {
        "avg" => Statistic::Avg,
        "min" => Statistic::Min,
        "med" => Statistic::Med,
        "max" => Statistic::Max,
        "count" => Statistic::Count,
        "rate" => Statistic::Rate,
        other => {
            let inner = other
                .strip_prefix("p(")
                .and_then(|rest| rest.strip_suffix(')'))
                .ok_or_else(|| format!("unknown statistic `{other}`"))?;
            let p: f64 = inner
                .trim()
                .parse()
                .map_err(|_| format!("invalid percentile `{inner}`"))?;
            if !(p > 0. && p <= 100.) {
                return Err(format!("percentile {p} is outside (0, 100]"));
            }
            Statistic::Percentile(p)
        }
    };
    Ok(stat)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparison {
    pub fn holds(&self, observed: f64, limit: f64) -> bool {
        match self {
            Comparison::Lt => observed < limit,
            Comparison::Le => observed <= limit,
            Comparison::Gt => observed > limit,
            Comparison::Ge => observed >= limit,
            Comparison::Eq => observed == limit,
            Comparison::Ne => observed != limit,
        }
    }

    fn token(&self) -> &'static str {
        match self {
            Comparison::Lt => "<",
            Comparison::Le => "<=",
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
            Comparison::Eq => "==",
            Comparison::Ne => "!=",
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

// Two-character operators first so `<=` is not read as `<`.
const OPERATORS: [(&str, Comparison); 6] = [
    ("<=", Comparison::Le),
    (">=", Comparison::Ge),
    ("==", Comparison::Eq),
    ("!=", Comparison::Ne),
    ("<", Comparison::Lt),
    (">", Comparison::Gt),
];

/// A pass/fail criterion such as `http_req{type:read}` / `p(95)<300`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThresholdExpr {
    pub selector: MetricSelector,
    pub statistic: Statistic,
    pub comparison: Comparison,
    pub limit: f64,
    /// Abort the whole run as soon as live evaluation sees this threshold fail.
    #[serde(default)]
    pub abort_on_fail: bool,
}

impl ThresholdExpr {
    pub fn parse(selector: &str, expr: &str) -> Result<Self, ConfigError> {
        let selector_parsed: MetricSelector = selector.parse()?;
        let invalid = |reason: String| ConfigError::InvalidThreshold {
            selector: selector.to_string(),
            expr: expr.to_string(),
            reason,
        };

        let compact: String = expr.chars().filter(|c| !c.is_whitespace()).collect();
        let (idx, token, comparison) = compact
            .char_indices()
            .find_map(|(idx, _)| {
                OPERATORS
                    .iter()
                    .find(|(token, _)| compact[idx..].starts_with(token))
                    .map(|(token, cmp)| (idx, *token, *cmp))
            })
            .ok_or_else(|| invalid("missing comparison operator".to_string()))?;

        let statistic = parse_statistic(&compact[..idx]).map_err(invalid)?;
        let raw_limit = &compact[idx + token.len()..];
        let limit: f64 = raw_limit
            .parse()
            .map_err(|_| invalid(format!("invalid limit `{raw_limit}`")))?;
        if !limit.is_finite() {
            return Err(invalid(format!("limit `{raw_limit}` is not finite")));
        }

        Ok(Self {
            selector: selector_parsed,
            statistic,
            comparison,
            limit,
            abort_on_fail: false,
        })
    }

    pub fn abort_on_fail(mut self, abort: bool) -> Self {
        self.abort_on_fail = abort;
        self
    }

    /// The expression part, e.g. `p(95)<300`.
    pub fn expression(&self) -> String {
        format!("{}{}{}", self.statistic, self.comparison, self.limit)
    }
}

impl fmt::Display for ThresholdExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.selector, self.expression())
    }
}
