//! Prometheus text exposition format.
//!
//! Renders registry snapshots into the plaintext format scraped by a
//! Prometheus server or compatible agent. The output is a wire contract:
//! one `# HELP` and one `# TYPE` line per family, then one line per
//! sample, every line newline-terminated.

use tally_core::{MetricFamily, MetricKind, Sample, format_float};

/// `Content-Type` of the rendered body.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Render metric families into Prometheus text format.
///
/// Histograms expand into `_bucket` lines (one per boundary plus `+Inf`),
/// `_sum` and `_count`. Label order follows the declared label names.
pub fn render_text(families: &[MetricFamily]) -> String {
    let mut out = String::new();

    for family in families {
        let descriptor = &family.descriptor;
        let name = descriptor.full_name();
        let label_names = &descriptor.identity.label_names;

        out.push_str(&format!("# HELP {name} {}\n", escape_help(&descriptor.help)));
        out.push_str(&format!("# TYPE {name} {}\n", descriptor.kind));

        for (labels, sample) in &family.samples {
            let pairs: Vec<(&str, String)> = labels
                .ordered(label_names)
                .map(|(k, v)| (k, v.to_string()))
                .collect();

            match (descriptor.kind, sample) {
                (MetricKind::Histogram, Sample::Histogram(h)) => {
                    let bounds = descriptor
                        .buckets
                        .iter()
                        .copied()
                        .chain(std::iter::once(f64::INFINITY));
                    for (bound, count) in bounds.zip(&h.buckets) {
                        let mut with_le = pairs.clone();
                        with_le.push(("le", format_float(bound)));
                        out.push_str(&format!(
                            "{name}_bucket{} {count}\n",
                            label_block(&with_le)
                        ));
                    }
                    let block = label_block(&pairs);
                    out.push_str(&format!("{name}_sum{block} {}\n", format_float(h.sum)));
                    out.push_str(&format!("{name}_count{block} {}\n", h.count));
                }
                (_, sample) => {
                    let value = sample.value().unwrap_or(0.0);
                    out.push_str(&format!(
                        "{name}{} {}\n",
                        label_block(&pairs),
                        format_float(value)
                    ));
                }
            }
        }
    }

    out
}

/// `{a="1",b="2"}`, or nothing when there are no labels.
fn label_block(pairs: &[(&str, String)]) -> String {
    if pairs.is_empty() {
        return String::new();
    }
    let inner: Vec<String> = pairs
        .iter()
        .map(|(k, v)| format!("{k}=\"{}\"", escape_label_value(v)))
        .collect();
    format!("{{{}}}", inner.join(","))
}

fn escape_label_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '"' => out.push_str("\\\""),
            _ => out.push(c),
        }
    }
    out
}

/// HELP text escapes only backslash and newline.
fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}
