//! Metrics facade — name-based recording with a configured namespace.
//!
//! Callers pass a metric name and ordered `(label, value)` pairs; the pair
//! order becomes the declared label order on first registration. Help
//! text comes from the configured help table.

use std::sync::Arc;

use tally_core::config::MetricsConfig;
use tally_core::{LabelSet, MetricsResult};

use crate::exposition::render_text;
use crate::registry::Registry;

pub struct Metrics {
    registry: Arc<Registry>,
    config: MetricsConfig,
}

impl Metrics {
    pub fn new(registry: Arc<Registry>, config: MetricsConfig) -> Self {
        Self { registry, config }
    }

    /// In-memory registry with default configuration.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(Registry::in_memory()), MetricsConfig::default())
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn namespace(&self) -> &str {
        &self.config.prefix
    }

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)], value: f64) -> MetricsResult<()> {
        let (names, set) = split(labels);
        self.registry
            .get_or_register_counter(self.namespace(), name, &self.config.help_for(name), &names)?
            .increment(&set, value)
    }

    pub fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) -> MetricsResult<()> {
        let (names, set) = split(labels);
        self.registry
            .get_or_register_gauge(self.namespace(), name, &self.config.help_for(name), &names)?
            .set(&set, value)
    }

    pub fn increment_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) -> MetricsResult<()> {
        let (names, set) = split(labels);
        self.registry
            .get_or_register_gauge(self.namespace(), name, &self.config.help_for(name), &names)?
            .increment(&set, value)
    }

    pub fn decrement_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) -> MetricsResult<()> {
        let (names, set) = split(labels);
        self.registry
            .get_or_register_gauge(self.namespace(), name, &self.config.help_for(name), &names)?
            .decrement(&set, value)
    }

    /// Increment a gauge, returning the reset generation it landed in.
    pub fn increment_gauge_tracked(
        &self,
        name: &str,
        labels: &[(&str, &str)],
        value: f64,
    ) -> MetricsResult<u64> {
        let (names, set) = split(labels);
        self.registry
            .get_or_register_gauge(self.namespace(), name, &self.config.help_for(name), &names)?
            .increment_tracked(&set, value)
    }

    /// Decrement a gauge unless a reset happened since `generation`.
    pub fn decrement_gauge_if_generation(
        &self,
        name: &str,
        labels: &[(&str, &str)],
        value: f64,
        generation: u64,
    ) -> MetricsResult<bool> {
        let (names, set) = split(labels);
        self.registry
            .get_or_register_gauge(self.namespace(), name, &self.config.help_for(name), &names)?
            .decrement_if_generation(&set, value, generation)
    }

    /// Observe into a histogram using the configured default buckets.
    pub fn observe_histogram(&self, name: &str, labels: &[(&str, &str)], value: f64) -> MetricsResult<()> {
        let (names, set) = split(labels);
        self.registry
            .get_or_register_histogram(
                self.namespace(),
                name,
                &self.config.help_for(name),
                &names,
                Some(self.config.default_buckets.clone()),
            )?
            .observe(&set, value)
    }

    /// Render every family in text exposition format.
    pub fn render(&self) -> MetricsResult<String> {
        Ok(render_text(&self.registry.render_snapshot()?))
    }

    pub fn reset(&self) -> MetricsResult<()> {
        self.registry.reset()
    }
}

fn split<'a>(labels: &[(&'a str, &'a str)]) -> (Vec<&'a str>, LabelSet) {
    let names = labels.iter().map(|(k, _)| *k).collect();
    let set = labels.iter().copied().collect();
    (names, set)
}
