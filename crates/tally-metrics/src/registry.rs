//! Collector registry — descriptor cache and backend routing.
//!
//! The registry is constructed explicitly and shared through an `Arc`.
//! Descriptors are cached after the backend confirms them, so the hot path
//! (an already-registered metric) only takes a read lock.
//!
//! If the backend reports `BackendUnavailable`, the registry swaps in a
//! fresh [`MemoryBackend`] once, logs the downgrade, and retries the call.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;
use tally_core::config::StorageKind;
use tally_core::{
    LabelSet, MetricDescriptor, MetricFamily, MetricIdentity, MetricsError, MetricsResult,
    Mutation,
};
use tally_store::{MemoryBackend, StorageBackend};
use tracing::{debug, info, warn};

use crate::kinds::{Counter, Gauge, Histogram};

pub struct Registry {
    backend: RwLock<Arc<dyn StorageBackend>>,
    /// full name → confirmed descriptor.
    descriptors: RwLock<HashMap<String, MetricDescriptor>>,
    degraded: AtomicBool,
    /// Bumped by every successful `reset`.
    generation: AtomicU64,
    /// Mutations and reads hold this shared; `reset` holds it exclusively.
    gate: RwLock<()>,
}

impl Registry {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend: RwLock::new(backend),
            descriptors: RwLock::new(HashMap::new()),
            degraded: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            gate: RwLock::new(()),
        }
    }

    /// A registry over a fresh in-memory backend.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Kind of the backend currently in use.
    pub fn backend_kind(&self) -> StorageKind {
        self.backend.read().kind()
    }

    /// True once the configured backend has been replaced by memory.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Number of resets performed so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    // ── Registration ───────────────────────────────────────────────

    pub fn get_or_register_counter(
        &self,
        namespace: &str,
        name: &str,
        help: &str,
        label_names: &[&str],
    ) -> MetricsResult<Counter<'_>> {
        let identity = MetricIdentity::new(namespace, name, label_names);
        let descriptor = self.register(MetricDescriptor::counter(identity, help))?;
        Ok(Counter::new(self, descriptor))
    }

    pub fn get_or_register_gauge(
        &self,
        namespace: &str,
        name: &str,
        help: &str,
        label_names: &[&str],
    ) -> MetricsResult<Gauge<'_>> {
        let identity = MetricIdentity::new(namespace, name, label_names);
        let descriptor = self.register(MetricDescriptor::gauge(identity, help))?;
        Ok(Gauge::new(self, descriptor))
    }

    /// `buckets` defaults to [`tally_core::DEFAULT_BUCKETS`]. An existing
    /// histogram keeps the boundaries it was first registered with.
    pub fn get_or_register_histogram(
        &self,
        namespace: &str,
        name: &str,
        help: &str,
        label_names: &[&str],
        buckets: Option<Vec<f64>>,
    ) -> MetricsResult<Histogram<'_>> {
        let identity = MetricIdentity::new(namespace, name, label_names);
        let buckets = buckets.unwrap_or_else(|| tally_core::DEFAULT_BUCKETS.to_vec());
        let descriptor = self.register(MetricDescriptor::histogram(identity, help, buckets)?)?;
        Ok(Histogram::new(self, descriptor))
    }

    fn register(&self, requested: MetricDescriptor) -> MetricsResult<MetricDescriptor> {
        let _gate = self.gate.read();
        let name = requested.full_name();

        if let Some(existing) = self.descriptors.read().get(&name) {
            existing.check_compatible(&requested)?;
            return Ok(existing.clone());
        }

        let stored = self.with_backend(|backend| backend.get_or_create_descriptor(&requested))?;
        debug!(%name, kind = %stored.kind, "metric registered");
        self.descriptors
            .write()
            .entry(name)
            .or_insert_with(|| stored.clone());
        Ok(stored)
    }

    // ── Backend routing ────────────────────────────────────────────

    pub(crate) fn write(
        &self,
        descriptor: &MetricDescriptor,
        labels: &LabelSet,
        mutation: Mutation,
    ) -> MetricsResult<()> {
        let _gate = self.gate.read();
        self.with_backend(|backend| backend.write_sample(descriptor, labels, mutation))
    }

    /// Like `write`, returning the reset generation the mutation landed in.
    pub(crate) fn write_tracked(
        &self,
        descriptor: &MetricDescriptor,
        labels: &LabelSet,
        mutation: Mutation,
    ) -> MetricsResult<u64> {
        let _gate = self.gate.read();
        self.with_backend(|backend| backend.write_sample(descriptor, labels, mutation))?;
        Ok(self.generation())
    }

    /// Apply `mutation` only if no reset happened since `generation`.
    pub(crate) fn write_if_generation(
        &self,
        descriptor: &MetricDescriptor,
        labels: &LabelSet,
        mutation: Mutation,
        generation: u64,
    ) -> MetricsResult<bool> {
        let _gate = self.gate.read();
        if self.generation() != generation {
            return Ok(false);
        }
        self.with_backend(|backend| backend.write_sample(descriptor, labels, mutation))?;
        Ok(true)
    }

    /// Run `op` against the backend, downgrading to memory on `BackendUnavailable`.
    fn with_backend<T>(
        &self,
        op: impl Fn(&dyn StorageBackend) -> MetricsResult<T>,
    ) -> MetricsResult<T> {
        let backend = Arc::clone(&self.backend.read());
        match op(backend.as_ref()) {
            Err(e) if e.is_backend_unavailable() => {
                self.degrade(&e);
                let backend = Arc::clone(&self.backend.read());
                op(backend.as_ref())
            }
            other => other,
        }
    }

    fn degrade(&self, err: &MetricsError) {
        if self
            .degraded
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let previous = self.backend.read().kind();
            warn!(
                backend = previous.as_str(),
                error = %err,
                "metrics storage unavailable, continuing in memory"
            );
            *self.backend.write() = Arc::new(MemoryBackend::new());
        }
    }

    // ── Snapshot / reset ───────────────────────────────────────────

    /// All families sorted by full name, series in first-observed order.
    pub fn render_snapshot(&self) -> MetricsResult<Vec<MetricFamily>> {
        let _gate = self.gate.read();
        let mut families = self.with_backend(|backend| backend.read_all())?;
        families.sort_by_key(|f| f.descriptor.full_name());
        Ok(families)
    }

    /// Clear the backend and forget every cached descriptor.
    ///
    /// Mutations racing with a reset land wholly before or wholly after it.
    pub fn reset(&self) -> MetricsResult<()> {
        let _gate = self.gate.write();
        self.with_backend(|backend| backend.clear())?;
        self.generation.fetch_add(1, Ordering::AcqRel);
        let forgotten = {
            let mut descriptors = self.descriptors.write();
            let n = descriptors.len();
            descriptors.clear();
            n
        };
        info!(backend = self.backend_kind().as_str(), forgotten, "metrics reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::{MetricKind, Sample};

    /// A backend whose every call fails as unavailable.
    struct DownBackend;

    impl StorageBackend for DownBackend {
        fn kind(&self) -> StorageKind {
            StorageKind::Redis
        }
        fn get_or_create_descriptor(&self, _: &MetricDescriptor) -> MetricsResult<MetricDescriptor> {
            Err(MetricsError::BackendUnavailable("connection refused".into()))
        }
        fn write_sample(&self, _: &MetricDescriptor, _: &LabelSet, _: Mutation) -> MetricsResult<()> {
            Err(MetricsError::BackendUnavailable("connection refused".into()))
        }
        fn read_all(&self) -> MetricsResult<Vec<MetricFamily>> {
            Err(MetricsError::BackendUnavailable("connection refused".into()))
        }
        fn clear(&self) -> MetricsResult<()> {
            Err(MetricsError::BackendUnavailable("connection refused".into()))
        }
    }

    #[test]
    fn registration_is_cached() {
        let registry = Registry::in_memory();
        let a = registry.get_or_register_counter("", "hits", "help", &["method"]).unwrap();
        let b = registry.get_or_register_counter("", "hits", "other", &["method"]).unwrap();
        assert_eq!(a.descriptor(), b.descriptor());
        assert_eq!(registry.descriptors.read().len(), 1);
    }

    #[test]
    fn cached_descriptor_still_checked() {
        let registry = Registry::in_memory();
        registry.get_or_register_counter("", "hits", "help", &["method"]).unwrap();
        let err = registry
            .get_or_register_counter("", "hits", "help", &["method", "route"])
            .err()
            .unwrap();
        assert!(matches!(err, MetricsError::LabelArityMismatch { .. }));
    }

    #[test]
    fn histogram_keeps_first_boundaries() {
        let registry = Registry::in_memory();
        registry
            .get_or_register_histogram("", "latency", "help", &[], Some(vec![1.0, 2.0]))
            .unwrap();
        let again = registry
            .get_or_register_histogram("", "latency", "help", &[], None)
            .unwrap();
        assert_eq!(again.descriptor().buckets, vec![1.0, 2.0]);
    }

    #[test]
    fn unavailable_backend_degrades_to_memory() {
        let registry = Registry::new(Arc::new(DownBackend));
        assert_eq!(registry.backend_kind(), StorageKind::Redis);

        let counter = registry.get_or_register_counter("", "hits", "help", &[]).unwrap();
        counter.increment(&LabelSet::new(), 1.0).unwrap();

        assert!(registry.is_degraded());
        assert_eq!(registry.backend_kind(), StorageKind::Memory);
        let families = registry.render_snapshot().unwrap();
        assert_eq!(families[0].descriptor.kind, MetricKind::Counter);
        assert_eq!(families[0].samples[0].1, Sample::Counter { value: 1.0 });
    }

    #[test]
    fn snapshot_sorted_by_name() {
        let registry = Registry::in_memory();
        for name in ["zeta", "alpha", "mid"] {
            registry
                .get_or_register_gauge("", name, "help", &[])
                .unwrap()
                .set(&LabelSet::new(), 1.0)
                .unwrap();
        }
        let names: Vec<String> = registry
            .render_snapshot()
            .unwrap()
            .iter()
            .map(|f| f.descriptor.full_name())
            .collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn reset_forgets_descriptors() {
        let registry = Registry::in_memory();
        registry.get_or_register_counter("", "hits", "help", &[]).unwrap();
        registry.reset().unwrap();

        // The name is free again, even for another kind.
        registry.get_or_register_gauge("", "hits", "help", &[]).unwrap();
        assert_eq!(registry.generation(), 1);
    }
}
