//! MemoryBackend — process-local sample storage.
//!
//! Families live in a map guarded by a read-mostly lock; each family keeps
//! its own series map, and each series its own mutex. Writers to different
//! series only contend on the short read-lock acquisitions, and a series is
//! inserted under the family's write lock at most once.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tally_core::config::StorageKind;
use tally_core::{
    LabelSet, MetricDescriptor, MetricFamily, MetricsError, MetricsResult, Mutation, Sample,
};
use tracing::debug;

use crate::StorageBackend;

/// One metric family and its series.
struct Family {
    descriptor: MetricDescriptor,
    order: u64,
    series: RwLock<HashMap<LabelSet, Arc<Series>>>,
}

/// One series (descriptor + concrete label values).
struct Series {
    order: u64,
    sample: Mutex<Sample>,
}

/// In-process backend; everything is lost when the process exits.
pub struct MemoryBackend {
    families: RwLock<HashMap<String, Arc<Family>>>,
    /// Shared sequence for first-observed ordering of families and series.
    sequence: AtomicU64,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            families: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(0),
        }
    }

    fn next_order(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Look up or insert a family. The returned family may predate `descriptor`.
    fn family(&self, descriptor: &MetricDescriptor) -> Arc<Family> {
        let name = descriptor.full_name();
        if let Some(family) = self.families.read().get(&name) {
            return Arc::clone(family);
        }

        let mut families = self.families.write();
        let family = families.entry(name).or_insert_with(|| {
            debug!(name = %descriptor.full_name(), kind = %descriptor.kind, "family created");
            Arc::new(Family {
                descriptor: descriptor.clone(),
                order: self.next_order(),
                series: RwLock::new(HashMap::new()),
            })
        });
        Arc::clone(family)
    }

    fn series(&self, family: &Family, labels: &LabelSet) -> Arc<Series> {
        if let Some(series) = family.series.read().get(labels) {
            return Arc::clone(series);
        }

        let mut series = family.series.write();
        let entry = series.entry(labels.clone()).or_insert_with(|| {
            Arc::new(Series {
                order: self.next_order(),
                sample: Mutex::new(family.descriptor.zero_sample()),
            })
        });
        Arc::clone(entry)
    }
}

impl StorageBackend for MemoryBackend {
    fn kind(&self) -> StorageKind {
        StorageKind::Memory
    }

    fn get_or_create_descriptor(&self, descriptor: &MetricDescriptor) -> MetricsResult<MetricDescriptor> {
        let family = self.family(descriptor);
        family.descriptor.check_compatible(descriptor)?;
        Ok(family.descriptor.clone())
    }

    fn write_sample(
        &self,
        descriptor: &MetricDescriptor,
        labels: &LabelSet,
        mutation: Mutation,
    ) -> MetricsResult<()> {
        let family = self.family(descriptor);
        if family.descriptor.kind != descriptor.kind {
            return Err(MetricsError::TypeMismatch {
                name: descriptor.full_name(),
                existing: family.descriptor.kind,
                requested: descriptor.kind,
            });
        }

        let series = self.series(&family, labels);
        series.sample.lock().apply(mutation, &family.descriptor.buckets);
        Ok(())
    }

    fn read_all(&self) -> MetricsResult<Vec<MetricFamily>> {
        let mut families: Vec<Arc<Family>> = self.families.read().values().cloned().collect();
        families.sort_by_key(|f| f.order);

        let snapshot = families
            .iter()
            .map(|family| {
                let mut series: Vec<(u64, LabelSet, Sample)> = family
                    .series
                    .read()
                    .iter()
                    .map(|(labels, s)| (s.order, labels.clone(), s.sample.lock().clone()))
                    .collect();
                series.sort_by_key(|(order, _, _)| *order);

                MetricFamily {
                    descriptor: family.descriptor.clone(),
                    samples: series.into_iter().map(|(_, l, s)| (l, s)).collect(),
                }
            })
            .collect();

        Ok(snapshot)
    }

    fn clear(&self) -> MetricsResult<()> {
        let mut families = self.families.write();
        let dropped = families.len();
        families.clear();
        debug!(dropped, "memory backend cleared");
        Ok(())
    }
}
