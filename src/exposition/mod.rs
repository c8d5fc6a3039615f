//! Prometheus text exposition format support.
//!
//! Implements the parsing and serialization half of the
//! [text format](https://prometheus.io/docs/instrumenting/exposition_formats/#text-based-format),
//! version 0.0.4, as produced by node-exporter style agents.

use std::collections::BTreeMap;

mod parser;
mod writer;

pub use parser::{ParseError, collect, parse};
pub use writer::{format_value, write_text};

/// Content-Type header value for text format version 0.0.4.
pub const CONTENT_TYPE_004: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Metric family type as declared by a `# TYPE` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Gauge,
    Summary,
    Histogram,
    Untyped,
}

impl MetricType {
    /// The keyword used in `# TYPE` lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
            MetricType::Summary => "summary",
            MetricType::Histogram => "histogram",
            MetricType::Untyped => "untyped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "counter" => Some(MetricType::Counter),
            "gauge" => Some(MetricType::Gauge),
            "summary" => Some(MetricType::Summary),
            "histogram" => Some(MetricType::Histogram),
            "untyped" => Some(MetricType::Untyped),
            _ => None,
        }
    }
}

/// A single sample line.
///
/// Label names and values are positional: `label_names[i]` pairs with
/// `label_values[i]`. The order is the order the labels appeared in the
/// input (injected tags are appended at the end).
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub name: String,
    pub label_names: Vec<String>,
    pub label_values: Vec<String>,
    pub value: f64,
    /// Explicit capture time in milliseconds since the epoch, when the
    /// sample line carried one. `None` means "no explicit time", not "now".
    pub timestamp_ms: Option<i64>,
}

impl Sample {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            label_names: Vec::new(),
            label_values: Vec::new(),
            value,
            timestamp_ms: None,
        }
    }

    /// Appends a label pair, keeping positional correspondence.
    pub fn push_label(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.label_names.push(name.into());
        self.label_values.push(value.into());
    }
}

/// A named group of samples sharing a `# TYPE` declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricFamily {
    pub name: String,
    pub typ: MetricType,
    pub help: Option<String>,
    pub samples: Vec<Sample>,
}

impl MetricFamily {
    pub fn new(name: impl Into<String>, typ: MetricType, help: Option<String>) -> Self {
        Self {
            name: name.into(),
            typ,
            help,
            samples: Vec::new(),
        }
    }
}

/// Identity of a sample for cross-family grouping and arithmetic.
///
/// Equality and hashing ignore label ordering, so samples whose label
/// pairs are permutations of each other compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SampleKey {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

impl SampleKey {
    pub fn of(sample: &Sample) -> Self {
        let labels = sample
            .label_names
            .iter()
            .cloned()
            .zip(sample.label_values.iter().cloned())
            .collect();
        Self {
            name: sample.name.clone(),
            labels,
        }
    }

    /// The same key under a different metric name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: self.labels.clone(),
        }
    }

    /// Rebuilds a sample carrying this key's labels in sorted order.
    pub fn to_sample(&self, value: f64) -> Sample {
        let mut sample = Sample::new(self.name.clone(), value);
        for (k, v) in &self.labels {
            sample.push_label(k.clone(), v.clone());
        }
        sample
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_key_ignores_label_order() {
        let mut a = Sample::new("m", 1.0);
        a.push_label("cpu", "0");
        a.push_label("mode", "idle");
        let mut b = Sample::new("m", 2.0);
        b.push_label("mode", "idle");
        b.push_label("cpu", "0");

        assert_eq!(SampleKey::of(&a), SampleKey::of(&b));
    }

    #[test]
    fn sample_key_distinguishes_values_and_names() {
        let mut a = Sample::new("m", 1.0);
        a.push_label("cpu", "0");
        let mut b = Sample::new("m", 1.0);
        b.push_label("cpu", "1");

        assert_ne!(SampleKey::of(&a), SampleKey::of(&b));
        assert_ne!(SampleKey::of(&a), SampleKey::of(&a).renamed("other"));
    }

    #[test]
    fn sample_key_round_trips_labels_sorted() {
        let mut s = Sample::new("m", 3.5);
        s.push_label("zone", "a");
        s.push_label("cpu", "0");
        let rebuilt = SampleKey::of(&s).to_sample(3.5);
        assert_eq!(rebuilt.label_names, vec!["cpu", "zone"]);
        assert_eq!(rebuilt.label_values, vec!["0", "a"]);
    }
}
