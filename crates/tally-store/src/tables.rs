//! redb table definitions for the file backend.
//!
//! Values are JSON-serialized records. Sample keys are
//! `{full_name}\x1f{encoded labels}`; the separator cannot occur in the
//! JSON label encoding.

use redb::TableDefinition;

/// Stored descriptors keyed by full metric name.
pub const DESCRIPTORS: TableDefinition<&str, &[u8]> = TableDefinition::new("descriptors");

/// Stored samples keyed by `{full_name}\x1f{labels}`.
pub const SAMPLES: TableDefinition<&str, &[u8]> = TableDefinition::new("samples");

/// Counters used for first-observed ordering.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Key in [`META`] holding the next sequence number.
pub const SEQUENCE_KEY: &str = "sequence";

/// Separator between family name and labels in sample keys.
pub const KEY_SEPARATOR: char = '\u{1f}';

pub fn sample_key(full_name: &str, encoded_labels: &str) -> String {
    format!("{full_name}{KEY_SEPARATOR}{encoded_labels}")
}
