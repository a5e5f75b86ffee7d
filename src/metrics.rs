//! Per-run metrics.
//!
//! Steps record named timings and counters; the whole set is flushed to
//! `metrics/metrics.json` when the build scope exits. Plotting is left to
//! external tooling.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

use anyhow::Result;
use serde::Serialize;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum MetricValue {
    Seconds(f64),
    Count(u64),
    Text(String),
}

/// Thread-safe metric recorder, owned by the build configuration.
#[derive(Debug, Default)]
pub struct Metrics {
    values: Mutex<BTreeMap<String, BTreeMap<String, MetricValue>>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&self, group: &str, name: &str, value: MetricValue) {
        self.values
            .lock()
            .unwrap()
            .entry(group.to_string())
            .or_default()
            .insert(name.to_string(), value);
    }

    pub fn send_seconds(&self, group: &str, name: &str, seconds: f64) {
        self.send(group, name, MetricValue::Seconds(seconds));
    }

    pub fn send_count(&self, group: &str, name: &str, count: u64) {
        self.send(group, name, MetricValue::Count(count));
    }

    /// Write all recorded metrics to `<folder>/metrics.json`.
    pub fn flush(&self, folder: &Path) -> Result<()> {
        let values = self.values.lock().unwrap();
        let rendered = serde_json::to_string_pretty(&*values)?;
        crate::util::fs::write_string(&folder.join("metrics.json"), &rendered)
    }
}

/// Times a labelled activity and reports it to the metric recorder on drop.
pub struct StepTimer<'a> {
    metrics: &'a Metrics,
    group: &'a str,
    name: String,
    start: Instant,
}

impl<'a> StepTimer<'a> {
    pub fn start(metrics: &'a Metrics, group: &'a str, name: impl Into<String>) -> Self {
        StepTimer {
            metrics,
            group,
            name: name.into(),
            start: Instant::now(),
        }
    }
}

impl Drop for StepTimer<'_> {
    fn drop(&mut self) {
        let taken = self.start.elapsed().as_secs_f64();
        self.metrics.send_seconds(self.group, &self.name, taken);
        tracing::debug!("{} took {:.3}s", self.name, taken);
    }
}
