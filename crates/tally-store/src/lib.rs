//! tally-store — storage backends for the tally metrics engine.
//!
//! Every backend implements [`StorageBackend`]. One is chosen at startup by
//! [`select_backend`] and never re-selected per call.
//!
//! # Backends
//!
//! ```text
//! StorageBackend
//!   ├── MemoryBackend  per-family / per-series locks, lost on exit
//!   ├── FileBackend    redb single-file database, one write txn per mutation
//!   └── RedisBackend   RESP over TCP, MULTI/EXEC per mutation, shared across processes
//! ```
//!
//! Selection never fails: if the configured backend cannot be opened the
//! caller gets a [`MemoryBackend`] and the downgrade is logged.

pub mod file;
pub mod memory;
pub mod redis;
pub mod resp;
pub mod tables;

use std::sync::Arc;

use tally_core::config::{MetricsConfig, RedisConfig, StorageKind};
use tally_core::{LabelSet, MetricDescriptor, MetricFamily, MetricsResult, Mutation};
use tracing::{error, info};

pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use redis::RedisBackend;

/// Persistence capability shared by all backends.
///
/// Implementations must apply each `write_sample` call atomically with
/// respect to concurrent writes of the same series.
pub trait StorageBackend: Send + Sync {
    fn kind(&self) -> StorageKind;

    /// Return the stored descriptor for `descriptor`'s name, creating it if absent.
    ///
    /// Fails with `TypeMismatch` or `LabelArityMismatch` when a descriptor
    /// with the same name but a different kind or label set already exists.
    fn get_or_create_descriptor(&self, descriptor: &MetricDescriptor) -> MetricsResult<MetricDescriptor>;

    /// Apply one mutation to the series identified by `labels`, creating it at zero.
    fn write_sample(
        &self,
        descriptor: &MetricDescriptor,
        labels: &LabelSet,
        mutation: Mutation,
    ) -> MetricsResult<()>;

    /// Every family with its series in first-observed order.
    fn read_all(&self) -> MetricsResult<Vec<MetricFamily>>;

    /// Drop all descriptors and samples.
    fn clear(&self) -> MetricsResult<()>;
}

/// Construct the configured backend exactly once, falling back to memory.
pub fn select_backend(metrics: &MetricsConfig, redis: &RedisConfig) -> Arc<dyn StorageBackend> {
    match metrics.storage {
        StorageKind::Memory => {
            info!(backend = "memory", "metrics storage selected");
            Arc::new(MemoryBackend::new())
        }
        StorageKind::File => match FileBackend::open(&metrics.data_dir) {
            Ok(backend) => {
                info!(backend = "file", path = ?backend.path(), "metrics storage selected");
                Arc::new(backend)
            }
            Err(e) => fallback(StorageKind::File, &e),
        },
        StorageKind::Redis => match RedisBackend::connect(redis) {
            Ok(backend) => {
                info!(
                    backend = "redis",
                    host = %redis.host,
                    port = redis.port,
                    key_prefix = %redis.key_prefix,
                    "metrics storage selected"
                );
                Arc::new(backend)
            }
            Err(e) => fallback(StorageKind::Redis, &e),
        },
    }
}

fn fallback(requested: StorageKind, err: &dyn std::fmt::Display) -> Arc<dyn StorageBackend> {
    error!(
        requested = requested.as_str(),
        error = %err,
        "metrics storage unavailable, falling back to memory"
    );
    Arc::new(MemoryBackend::new())
}
