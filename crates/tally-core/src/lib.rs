//! tally-core — shared types for the tally metrics engine.
//!
//! Defines the metric identity and label model, the per-series sample state
//! and its mutations, the error taxonomy, and the daemon configuration.
//!
//! # Model
//!
//! ```text
//! MetricDescriptor (one per `{namespace}{name}`)
//!   ├── MetricIdentity  namespace, name, declared label names
//!   ├── MetricKind      counter | gauge | histogram
//!   └── Sample × N      one per distinct LabelSet, created on first write
//! ```
//!
//! Storage backends and the registry exchange these types; nothing here
//! performs I/O apart from reading a config file.

pub mod config;
pub mod error;
pub mod types;

pub use config::TallyConfig;
pub use error::{MetricsError, MetricsResult};
pub use types::*;
