//! Metric identity, label model, and sample state.
//!
//! These types are shared by every storage backend. Persistent backends
//! JSON-encode descriptors and samples; label sets encode canonically so the
//! same labels always map to the same storage key.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{MetricsError, MetricsResult};

/// Histogram boundaries used when the caller supplies none.
pub const DEFAULT_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 5.0];

// ── Kind ───────────────────────────────────────────────────────────

/// The three supported metric types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl MetricKind {
    /// The `# TYPE` token for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Identity ───────────────────────────────────────────────────────

/// Canonical identity of a metric family.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricIdentity {
    pub namespace: String,
    pub name: String,
    /// Declared label names, in exposition order. Fixed at first registration.
    pub label_names: Vec<String>,
}

impl MetricIdentity {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, label_names: &[&str]) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            label_names: label_names.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Namespace and name joined by plain concatenation.
    pub fn full_name(&self) -> String {
        format!("{}{}", self.namespace, self.name)
    }

    /// True if `other` declares the same label names, in any order.
    pub fn same_label_names<S: AsRef<str>>(&self, other: &[S]) -> bool {
        if self.label_names.len() != other.len() {
            return false;
        }
        let mut ours: Vec<&str> = self.label_names.iter().map(String::as_str).collect();
        let mut theirs: Vec<&str> = other.iter().map(AsRef::as_ref).collect();
        ours.sort_unstable();
        theirs.sort_unstable();
        ours == theirs
    }
}

// ── Descriptor ─────────────────────────────────────────────────────

/// Metadata for one metric family, created once per distinct name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDescriptor {
    pub identity: MetricIdentity,
    pub kind: MetricKind,
    pub help: String,
    /// Histogram upper bounds, strictly ascending. The `+Inf` bucket is implicit.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buckets: Vec<f64>,
}

impl MetricDescriptor {
    pub fn counter(identity: MetricIdentity, help: impl Into<String>) -> Self {
        Self {
            identity,
            kind: MetricKind::Counter,
            help: help.into(),
            buckets: Vec::new(),
        }
    }

    pub fn gauge(identity: MetricIdentity, help: impl Into<String>) -> Self {
        Self {
            identity,
            kind: MetricKind::Gauge,
            help: help.into(),
            buckets: Vec::new(),
        }
    }

    /// Build a histogram descriptor, validating the bucket boundaries.
    pub fn histogram(
        identity: MetricIdentity,
        help: impl Into<String>,
        buckets: Vec<f64>,
    ) -> MetricsResult<Self> {
        let invalid = |reason: &str| MetricsError::InvalidBuckets {
            name: identity.full_name(),
            reason: reason.to_string(),
        };
        if buckets.is_empty() {
            return Err(invalid("at least one boundary is required"));
        }
        if buckets.iter().any(|b| !b.is_finite()) {
            return Err(invalid("boundaries must be finite (+Inf is implicit)"));
        }
        if buckets.windows(2).any(|w| w[0] >= w[1]) {
            return Err(invalid("boundaries must be strictly ascending"));
        }
        Ok(Self {
            identity,
            kind: MetricKind::Histogram,
            help: help.into(),
            buckets,
        })
    }

    pub fn full_name(&self) -> String {
        self.identity.full_name()
    }

    /// Check that `requested` may reuse this (already registered) descriptor.
    pub fn check_compatible(&self, requested: &MetricDescriptor) -> MetricsResult<()> {
        if self.kind != requested.kind {
            return Err(MetricsError::TypeMismatch {
                name: self.full_name(),
                existing: self.kind,
                requested: requested.kind,
            });
        }
        if !self.identity.same_label_names(&requested.identity.label_names) {
            return Err(MetricsError::LabelArityMismatch {
                name: self.full_name(),
                expected: self.identity.label_names.clone(),
                actual: requested.identity.label_names.clone(),
            });
        }
        Ok(())
    }

    /// Check that a label set carries exactly the declared label names.
    pub fn check_labels(&self, labels: &LabelSet) -> MetricsResult<()> {
        let names: Vec<&str> = labels.names().collect();
        if self.identity.same_label_names(&names) {
            return Ok(());
        }
        Err(MetricsError::LabelArityMismatch {
            name: self.full_name(),
            expected: self.identity.label_names.clone(),
            actual: names.into_iter().map(str::to_string).collect(),
        })
    }

    /// The zero value a new series starts from.
    pub fn zero_sample(&self) -> Sample {
        match self.kind {
            MetricKind::Counter => Sample::Counter { value: 0.0 },
            MetricKind::Gauge => Sample::Gauge { value: 0.0 },
            MetricKind::Histogram => Sample::Histogram(HistogramSample::new(self.buckets.len())),
        }
    }
}

// ── Labels ─────────────────────────────────────────────────────────

/// Label name → value mapping.
///
/// Backed by a `BTreeMap`, so equality, hashing and the storage encoding do
/// not depend on insertion order. Exposition order comes from the
/// descriptor via [`LabelSet::ordered`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelSet(BTreeMap<String, String>);

impl LabelSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// `(name, value)` pairs in the given declared order. Missing names yield `""`.
    pub fn ordered<'a>(&'a self, label_names: &'a [String]) -> impl Iterator<Item = (&'a str, &'a str)> {
        label_names
            .iter()
            .map(move |name| (name.as_str(), self.get(name).unwrap_or("")))
    }

    /// Canonical storage encoding (a JSON object with sorted keys).
    pub fn encode(&self) -> MetricsResult<String> {
        serde_json::to_string(&self.0).map_err(|e| MetricsError::Serialization(e.to_string()))
    }

    pub fn decode(encoded: &str) -> MetricsResult<Self> {
        serde_json::from_str(encoded).map_err(|e| MetricsError::Serialization(e.to_string()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for LabelSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

// ── Samples ────────────────────────────────────────────────────────

/// A single change applied to one series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Mutation {
    /// Add to a counter or gauge (negative values subtract from gauges).
    Add(f64),
    /// Overwrite a gauge.
    Set(f64),
    /// Record one histogram observation.
    Observe(f64),
}

/// Numeric state of one series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Sample {
    Counter {
        #[serde(with = "float_repr")]
        value: f64,
    },
    Gauge {
        #[serde(with = "float_repr")]
        value: f64,
    },
    Histogram(HistogramSample),
}

impl Sample {
    /// Apply a mutation. Combinations that do not fit the sample kind are ignored;
    /// the registry only routes matching mutations.
    pub fn apply(&mut self, mutation: Mutation, boundaries: &[f64]) {
        match (self, mutation) {
            (Sample::Counter { value }, Mutation::Add(delta)) => *value += delta,
            (Sample::Gauge { value }, Mutation::Add(delta)) => *value += delta,
            (Sample::Gauge { value }, Mutation::Set(v)) => *value = v,
            (Sample::Histogram(h), Mutation::Observe(v)) => h.observe(boundaries, v),
            _ => {}
        }
    }

    /// The scalar value of a counter or gauge.
    pub fn value(&self) -> Option<f64> {
        match self {
            Sample::Counter { value } | Sample::Gauge { value } => Some(*value),
            Sample::Histogram(_) => None,
        }
    }
}

/// Cumulative histogram state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramSample {
    /// Cumulative counts, one per boundary plus the trailing `+Inf` bucket.
    pub buckets: Vec<u64>,
    #[serde(with = "float_repr")]
    pub sum: f64,
    pub count: u64,
}

impl HistogramSample {
    pub fn new(boundary_count: usize) -> Self {
        Self {
            buckets: vec![0; boundary_count + 1],
            sum: 0.0,
            count: 0,
        }
    }

    pub fn observe(&mut self, boundaries: &[f64], value: f64) {
        let start = first_bucket(boundaries, value);
        for bucket in self.buckets.iter_mut().skip(start) {
            *bucket += 1;
        }
        self.sum += value;
        self.count += 1;
    }
}

/// Index of the first bucket whose upper bound is `>= value`.
///
/// Every bucket from that index on (including `+Inf`, at `boundaries.len()`)
/// counts the observation. NaN only lands in `+Inf`.
pub fn first_bucket(boundaries: &[f64], value: f64) -> usize {
    if value.is_nan() {
        return boundaries.len();
    }
    boundaries.partition_point(|b| *b < value)
}

/// A metric family as read back from storage.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricFamily {
    pub descriptor: MetricDescriptor,
    /// Series in first-observed order.
    pub samples: Vec<(LabelSet, Sample)>,
}

// ── Float encoding ─────────────────────────────────────────────────

/// Render a float using the exposition-format tokens for non-finite values.
pub fn format_float(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "+Inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        value.to_string()
    }
}

/// Parse a float, accepting the exposition-format tokens.
pub fn parse_float(s: &str) -> Option<f64> {
    match s.trim() {
        "+Inf" | "Inf" | "inf" | "+inf" => Some(f64::INFINITY),
        "-Inf" | "-inf" => Some(f64::NEG_INFINITY),
        "NaN" | "nan" => Some(f64::NAN),
        other => other.parse().ok(),
    }
}

/// JSON has no non-finite numbers; store them as exposition tokens instead.
mod float_repr {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else {
            serializer.serialize_str(&super::format_float(*value))
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Token(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(v) => Ok(v),
            Repr::Token(t) => super::parse_float(&t)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid float token {t:?}"))),
        }
    }
}
