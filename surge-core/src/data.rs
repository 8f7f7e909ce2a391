use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Key/value metadata attached to a [`Sample`].
///
/// Tags only group samples into series; two samples with identical tags are still distinct
/// samples. Keys are kept ordered so rendering is stable.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSet(BTreeMap<String, String>);

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// True when every tag in `self` is present in `other` with the same value.
    pub fn is_subset_of(&self, other: &TagSet) -> bool {
        self.0.iter().all(|(k, v)| other.0.get(k) == Some(v))
    }

    /// Copy tags from `other`, overwriting keys already present.
    pub fn merge(&mut self, other: &TagSet) {
        for (k, v) in other.iter() {
            self.insert(k, v);
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TagSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Renders as `{k:v,k2:v2}`, or nothing for an empty set.
impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }
        write!(f, "{{")?;
        for (idx, (k, v)) in self.iter().enumerate() {
            if idx > 0 {
                write!(f, ",")?;
            }
            write!(f, "{k}:{v}")?;
        }
        write!(f, "}}")
    }
}

/// Outcome of a single operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// Completed without a protocol status.
    Ok,
    /// Completed with a protocol status code, e.g. an HTTP status.
    Code(u16),
    /// The operation itself failed (transport error, workload error, panic).
    Error,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ok => write!(f, "ok"),
            Status::Code(code) => write!(f, "{code}"),
            Status::Error => write!(f, "error"),
        }
    }
}

/// A single measured outcome. Immutable once created.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub metric: String,
    /// Offset from the start of the run.
    pub timestamp: Duration,
    pub duration: Duration,
    pub status: Status,
    /// Whether the owning scenario's status policy counted this outcome as a failure.
    pub failed: bool,
    pub tags: TagSet,
}

impl Sample {
    pub fn new(metric: impl Into<String>, duration: Duration) -> Self {
        Self {
            metric: metric.into(),
            timestamp: Duration::ZERO,
            duration,
            status: Status::Ok,
            failed: false,
            tags: TagSet::new(),
        }
    }

    pub fn at(mut self, timestamp: Duration) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    pub fn failed(mut self, failed: bool) -> Self {
        self.failed = failed;
        self
    }

    pub fn tags(mut self, tags: TagSet) -> Self {
        self.tags = tags;
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key, value);
        self
    }
}
