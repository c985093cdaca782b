//! Metric handles returned by the registry.
//!
//! A handle borrows the registry and carries the confirmed descriptor.
//! Every call validates the label set against the declared label names
//! before anything reaches the backend.

use tally_core::{LabelSet, MetricDescriptor, MetricsError, MetricsResult, Mutation};

use crate::registry::Registry;

/// Monotonically non-decreasing value.
#[derive(Clone)]
pub struct Counter<'a> {
    registry: &'a Registry,
    descriptor: MetricDescriptor,
}

impl<'a> Counter<'a> {
    pub(crate) fn new(registry: &'a Registry, descriptor: MetricDescriptor) -> Self {
        Self { registry, descriptor }
    }

    pub fn descriptor(&self) -> &MetricDescriptor {
        &self.descriptor
    }

    /// Add `delta` to the series. Negative and NaN deltas are rejected.
    pub fn increment(&self, labels: &LabelSet, delta: f64) -> MetricsResult<()> {
        if delta.is_nan() || delta < 0.0 {
            return Err(MetricsError::InvalidDelta {
                name: self.descriptor.full_name(),
                delta,
            });
        }
        self.descriptor.check_labels(labels)?;
        self.registry.write(&self.descriptor, labels, Mutation::Add(delta))
    }
}

/// Freely settable value.
#[derive(Clone)]
pub struct Gauge<'a> {
    registry: &'a Registry,
    descriptor: MetricDescriptor,
}

impl<'a> Gauge<'a> {
    pub(crate) fn new(registry: &'a Registry, descriptor: MetricDescriptor) -> Self {
        Self { registry, descriptor }
    }

    pub fn descriptor(&self) -> &MetricDescriptor {
        &self.descriptor
    }

    pub fn set(&self, labels: &LabelSet, value: f64) -> MetricsResult<()> {
        self.mutate(labels, Mutation::Set(value))
    }

    pub fn increment(&self, labels: &LabelSet, delta: f64) -> MetricsResult<()> {
        self.mutate(labels, Mutation::Add(delta))
    }

    pub fn decrement(&self, labels: &LabelSet, delta: f64) -> MetricsResult<()> {
        self.mutate(labels, Mutation::Add(-delta))
    }

    /// Increment and return the reset generation the increment landed in.
    pub fn increment_tracked(&self, labels: &LabelSet, delta: f64) -> MetricsResult<u64> {
        self.descriptor.check_labels(labels)?;
        self.registry.write_tracked(&self.descriptor, labels, Mutation::Add(delta))
    }

    /// Decrement only if no reset happened since `generation`.
    ///
    /// Pairs with [`Gauge::increment_tracked`] so a reset between the two
    /// never leaves the series off by one in either direction.
    pub fn decrement_if_generation(
        &self,
        labels: &LabelSet,
        delta: f64,
        generation: u64,
    ) -> MetricsResult<bool> {
        self.descriptor.check_labels(labels)?;
        self.registry
            .write_if_generation(&self.descriptor, labels, Mutation::Add(-delta), generation)
    }

    fn mutate(&self, labels: &LabelSet, mutation: Mutation) -> MetricsResult<()> {
        self.descriptor.check_labels(labels)?;
        self.registry.write(&self.descriptor, labels, mutation)
    }
}

/// Cumulative bucketed distribution.
#[derive(Clone)]
pub struct Histogram<'a> {
    registry: &'a Registry,
    descriptor: MetricDescriptor,
}

impl<'a> Histogram<'a> {
    pub(crate) fn new(registry: &'a Registry, descriptor: MetricDescriptor) -> Self {
        Self { registry, descriptor }
    }

    pub fn descriptor(&self) -> &MetricDescriptor {
        &self.descriptor
    }

    /// Count `value` in every bucket whose boundary is `>= value`, plus `+Inf`.
    pub fn observe(&self, labels: &LabelSet, value: f64) -> MetricsResult<()> {
        self.descriptor.check_labels(labels)?;
        self.registry.write(&self.descriptor, labels, Mutation::Observe(value))
    }
}
