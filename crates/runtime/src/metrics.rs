use std::collections::BTreeMap;

use serde::Serialize;

/// Counters, gauges and latency summaries keyed by static names.
///
/// Sorted maps keep snapshots in a stable order for logs and `/stats`.
#[derive(Debug, Default, Clone)]
pub struct Metrics {
    counters: BTreeMap<&'static str, u64>,
    gauges: BTreeMap<&'static str, i64>,
    latencies: BTreeMap<&'static str, Latency>,
}

/// Running summary of observed durations in milliseconds.
#[derive(Debug, Copy, Clone, PartialEq, Default, Serialize)]
pub struct Latency {
    pub count: u64,
    pub total_ms: f64,
    pub max_ms: f64,
}

impl Latency {
    pub fn record(&mut self, ms: f64) {
        self.count += 1;
        self.total_ms += ms;
        self.max_ms = self.max_ms.max(ms);
    }

    pub fn mean_ms(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.total_ms / self.count as f64
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, i64>,
    pub latencies: BTreeMap<String, Latency>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn incr(&mut self, name: &'static str) {
        self.add(name, 1);
    }

    pub fn add(&mut self, name: &'static str, by: u64) {
        *self.counters.entry(name).or_insert(0) += by;
    }

    pub fn set_gauge(&mut self, name: &'static str, value: i64) {
        self.gauges.insert(name, value);
    }

    pub fn gauge(&self, name: &str) -> Option<i64> {
        self.gauges.get(name).copied()
    }

    pub fn observe_ms(&mut self, name: &'static str, ms: f64) {
        self.latencies.entry(name).or_default().record(ms);
    }

    pub fn latency(&self, name: &str) -> Option<Latency> {
        self.latencies.get(name).copied()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self
                .counters
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            gauges: self.gauges.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            latencies: self
                .latencies
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
        }
    }
}
