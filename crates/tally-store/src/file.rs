//! FileBackend — redb-backed sample persistence.
//!
//! One database file (`metrics.redb`) under the configured data directory.
//! Every mutation runs in its own write transaction; redb serializes write
//! transactions, so concurrent writers (threads sharing the handle) never
//! lose updates. Values are JSON records carrying a first-observed
//! sequence number used to order the snapshot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::{Deserialize, Serialize};
use tally_core::config::StorageKind;
use tally_core::{
    LabelSet, MetricDescriptor, MetricFamily, MetricsError, MetricsResult, Mutation, Sample,
};
use tracing::debug;

use crate::StorageBackend;
use crate::tables::*;

/// Convert any `Display` error into a `MetricsError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| MetricsError::$variant(e.to_string())
    };
}

/// File name of the database inside the data directory.
pub const DATABASE_FILE: &str = "metrics.redb";

#[derive(Debug, Serialize, Deserialize)]
struct StoredDescriptor {
    order: u64,
    descriptor: MetricDescriptor,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredSample {
    order: u64,
    family: String,
    labels: LabelSet,
    sample: Sample,
}

/// Durable single-node backend.
pub struct FileBackend {
    path: PathBuf,
    db: Database,
}

impl FileBackend {
    /// Open (or create) the database under `dir`, creating the directory if needed.
    pub fn open(dir: &Path) -> MetricsResult<Self> {
        std::fs::create_dir_all(dir).map_err(map_err!(BackendUnavailable))?;
        let path = dir.join(DATABASE_FILE);
        let db = Database::create(&path).map_err(map_err!(BackendUnavailable))?;
        let backend = Self { path, db };
        backend.ensure_tables()?;
        debug!(path = ?backend.path, "file backend opened");
        Ok(backend)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> MetricsResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(BackendUnavailable))?;
        txn.open_table(DESCRIPTORS).map_err(map_err!(BackendUnavailable))?;
        txn.open_table(SAMPLES).map_err(map_err!(BackendUnavailable))?;
        txn.open_table(META).map_err(map_err!(BackendUnavailable))?;
        txn.commit().map_err(map_err!(BackendUnavailable))?;
        Ok(())
    }

    /// Insert `descriptor` if its name is new; return whatever is stored.
    fn upsert_descriptor(
        txn: &redb::WriteTransaction,
        descriptor: &MetricDescriptor,
    ) -> MetricsResult<MetricDescriptor> {
        let name = descriptor.full_name();
        let mut table = txn.open_table(DESCRIPTORS).map_err(map_err!(BackendUnavailable))?;

        let existing = match table.get(name.as_str()).map_err(map_err!(BackendUnavailable))? {
            Some(guard) => Some(
                serde_json::from_slice::<StoredDescriptor>(guard.value())
                    .map_err(map_err!(Serialization))?,
            ),
            None => None,
        };
        if let Some(stored) = existing {
            return Ok(stored.descriptor);
        }

        let record = StoredDescriptor {
            order: Self::next_order(txn)?,
            descriptor: descriptor.clone(),
        };
        let value = serde_json::to_vec(&record).map_err(map_err!(Serialization))?;
        table
            .insert(name.as_str(), value.as_slice())
            .map_err(map_err!(BackendUnavailable))?;
        debug!(%name, kind = %descriptor.kind, "descriptor stored");
        Ok(record.descriptor)
    }

    fn next_order(txn: &redb::WriteTransaction) -> MetricsResult<u64> {
        let mut meta = txn.open_table(META).map_err(map_err!(BackendUnavailable))?;
        let next = meta
            .get(SEQUENCE_KEY)
            .map_err(map_err!(BackendUnavailable))?
            .map(|guard| guard.value())
            .unwrap_or(0);
        meta.insert(SEQUENCE_KEY, next + 1)
            .map_err(map_err!(BackendUnavailable))?;
        Ok(next)
    }
}

impl StorageBackend for FileBackend {
    fn kind(&self) -> StorageKind {
        StorageKind::File
    }

    fn get_or_create_descriptor(&self, descriptor: &MetricDescriptor) -> MetricsResult<MetricDescriptor> {
        let txn = self.db.begin_write().map_err(map_err!(BackendUnavailable))?;
        let stored = Self::upsert_descriptor(&txn, descriptor)?;
        stored.check_compatible(descriptor)?;
        txn.commit().map_err(map_err!(BackendUnavailable))?;
        Ok(stored)
    }

    fn write_sample(
        &self,
        descriptor: &MetricDescriptor,
        labels: &LabelSet,
        mutation: Mutation,
    ) -> MetricsResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(BackendUnavailable))?;
        let stored = Self::upsert_descriptor(&txn, descriptor)?;
        if stored.kind != descriptor.kind {
            return Err(MetricsError::TypeMismatch {
                name: descriptor.full_name(),
                existing: stored.kind,
                requested: descriptor.kind,
            });
        }

        let family = stored.full_name();
        let key = sample_key(&family, &labels.encode()?);
        let current = {
            let table = txn.open_table(SAMPLES).map_err(map_err!(BackendUnavailable))?;
            let guard = table.get(key.as_str()).map_err(map_err!(BackendUnavailable))?;
            match guard {
                Some(guard) => Some(
                    serde_json::from_slice::<StoredSample>(guard.value())
                        .map_err(map_err!(Serialization))?,
                ),
                None => None,
            }
        };
        let mut record = match current {
            Some(record) => record,
            None => StoredSample {
                order: Self::next_order(&txn)?,
                family,
                labels: labels.clone(),
                sample: stored.zero_sample(),
            },
        };
        record.sample.apply(mutation, &stored.buckets);

        let value = serde_json::to_vec(&record).map_err(map_err!(Serialization))?;
        {
            let mut table = txn.open_table(SAMPLES).map_err(map_err!(BackendUnavailable))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(BackendUnavailable))?;
        }
        txn.commit().map_err(map_err!(BackendUnavailable))?;
        Ok(())
    }

    fn read_all(&self) -> MetricsResult<Vec<MetricFamily>> {
        let txn = self.db.begin_read().map_err(map_err!(BackendUnavailable))?;

        let mut families: HashMap<String, (u64, MetricDescriptor, Vec<StoredSample>)> =
            HashMap::new();
        let descriptors = txn.open_table(DESCRIPTORS).map_err(map_err!(BackendUnavailable))?;
        for entry in descriptors.iter().map_err(map_err!(BackendUnavailable))? {
            let (key, value) = entry.map_err(map_err!(BackendUnavailable))?;
            let stored: StoredDescriptor =
                serde_json::from_slice(value.value()).map_err(map_err!(Serialization))?;
            families.insert(
                key.value().to_string(),
                (stored.order, stored.descriptor, Vec::new()),
            );
        }

        let samples = txn.open_table(SAMPLES).map_err(map_err!(BackendUnavailable))?;
        for entry in samples.iter().map_err(map_err!(BackendUnavailable))? {
            let (_, value) = entry.map_err(map_err!(BackendUnavailable))?;
            let stored: StoredSample =
                serde_json::from_slice(value.value()).map_err(map_err!(Serialization))?;
            if let Some((_, _, series)) = families.get_mut(&stored.family) {
                series.push(stored);
            }
        }

        let mut ordered: Vec<_> = families.into_values().collect();
        ordered.sort_by_key(|(order, _, _)| *order);

        Ok(ordered
            .into_iter()
            .map(|(_, descriptor, mut series)| {
                series.sort_by_key(|s| s.order);
                MetricFamily {
                    descriptor,
                    samples: series.into_iter().map(|s| (s.labels, s.sample)).collect(),
                }
            })
            .collect())
    }

    fn clear(&self) -> MetricsResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(BackendUnavailable))?;
        txn.delete_table(DESCRIPTORS).map_err(map_err!(BackendUnavailable))?;
        txn.delete_table(SAMPLES).map_err(map_err!(BackendUnavailable))?;
        txn.delete_table(META).map_err(map_err!(BackendUnavailable))?;
        txn.open_table(DESCRIPTORS).map_err(map_err!(BackendUnavailable))?;
        txn.open_table(SAMPLES).map_err(map_err!(BackendUnavailable))?;
        txn.open_table(META).map_err(map_err!(BackendUnavailable))?;
        txn.commit().map_err(map_err!(BackendUnavailable))?;
        debug!(path = ?self.path, "file backend cleared");
        Ok(())
    }
}
