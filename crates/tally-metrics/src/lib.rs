//! tally-metrics — the metrics aggregation engine.
//!
//! Owns metric metadata, routes every mutation to the selected storage
//! backend, and renders the Prometheus text exposition format.
//!
//! # Architecture
//!
//! ```text
//! Metrics (namespace + help table)
//!   └── Registry
//!         ├── get_or_register_{counter,gauge,histogram}() → handle
//!         │     ├── Counter::increment()
//!         │     ├── Gauge::set() / increment() / decrement()
//!         │     └── Histogram::observe()
//!         ├── render_snapshot() → Vec<MetricFamily>
//!         ├── reset()           → backend.clear()
//!         └── Arc<dyn StorageBackend>  (swapped to memory if it becomes unavailable)
//!
//! Text exposition
//!   └── render_text() → text/plain; version=0.0.4 for /metrics
//! ```

pub mod exposition;
pub mod kinds;
pub mod metrics;
pub mod registry;

pub use exposition::{CONTENT_TYPE, render_text};
pub use kinds::{Counter, Gauge, Histogram};
pub use metrics::Metrics;
pub use registry::Registry;
