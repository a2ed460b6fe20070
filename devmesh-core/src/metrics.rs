use std::collections::HashMap;
use std::sync::Mutex;

/// A flat label set attached to a metric observation, e.g. `[("tenant",
/// "acme"), ("outcome", "exact")]`.
pub type Labels<'a> = &'a [(&'a str, &'a str)];

/// Sink for counters, histograms, and gauges, injected into every component
/// that needs to observe cache behavior (hit/miss counts, eviction rounds,
/// access-tracker overflow). The core never talks to a metrics backend
/// directly; it only calls this trait.
pub trait Metrics: Send + Sync {
    fn incr_counter(&self, name: &str, labels: Labels<'_>, value: u64);
    fn observe_histogram(&self, name: &str, labels: Labels<'_>, value: f64);
    fn set_gauge(&self, name: &str, labels: Labels<'_>, value: f64);
}

#[derive(Debug, Default)]
struct RecordedMetrics {
    counters: HashMap<String, u64>,
    histograms: HashMap<String, Vec<f64>>,
    gauges: HashMap<String, f64>,
}

fn key(name: &str, labels: Labels<'_>) -> String {
    let mut parts: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    parts.sort();
    if parts.is_empty() {
        name.to_string()
    } else {
        format!("{name}{{{}}}", parts.join(","))
    }
}

/// In-memory reference implementation, used in tests and as a default when no
/// real metrics backend is wired up.
#[derive(Default)]
pub struct InMemoryMetrics {
    state: Mutex<RecordedMetrics>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_value(&self, name: &str, labels: Labels<'_>) -> u64 {
        let state = self.state.lock().expect("metrics lock poisoned");
        state.counters.get(&key(name, labels)).copied().unwrap_or(0)
    }

    pub fn gauge_value(&self, name: &str, labels: Labels<'_>) -> Option<f64> {
        let state = self.state.lock().expect("metrics lock poisoned");
        state.gauges.get(&key(name, labels)).copied()
    }

    pub fn histogram_samples(&self, name: &str, labels: Labels<'_>) -> Vec<f64> {
        let state = self.state.lock().expect("metrics lock poisoned");
        state
            .histograms
            .get(&key(name, labels))
            .cloned()
            .unwrap_or_default()
    }
}

impl Metrics for InMemoryMetrics {
    fn incr_counter(&self, name: &str, labels: Labels<'_>, value: u64) {
        let mut state = self.state.lock().expect("metrics lock poisoned");
        *state.counters.entry(key(name, labels)).or_insert(0) += value;
    }

    fn observe_histogram(&self, name: &str, labels: Labels<'_>, value: f64) {
        let mut state = self.state.lock().expect("metrics lock poisoned");
        state
            .histograms
            .entry(key(name, labels))
            .or_default()
            .push(value);
    }

    fn set_gauge(&self, name: &str, labels: Labels<'_>, value: f64) {
        let mut state = self.state.lock().expect("metrics lock poisoned");
        state.gauges.insert(key(name, labels), value);
    }
}

/// No-op sink for deployments that disable metrics via `enable_metrics =
/// false`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpMetrics;

impl Metrics for NoOpMetrics {
    fn incr_counter(&self, _name: &str, _labels: Labels<'_>, _value: u64) {}
    fn observe_histogram(&self, _name: &str, _labels: Labels<'_>, _value: f64) {}
    fn set_gauge(&self, _name: &str, _labels: Labels<'_>, _value: f64) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_accumulates_per_label_set() {
        let metrics = InMemoryMetrics::new();
        metrics.incr_counter("cache.hit", &[("outcome", "exact")], 1);
        metrics.incr_counter("cache.hit", &[("outcome", "exact")], 2);
        metrics.incr_counter("cache.hit", &[("outcome", "similarity")], 5);

        assert_eq!(metrics.counter_value("cache.hit", &[("outcome", "exact")]), 3);
        assert_eq!(
            metrics.counter_value("cache.hit", &[("outcome", "similarity")]),
            5
        );
    }

    #[test]
    fn gauge_overwrites() {
        let metrics = InMemoryMetrics::new();
        metrics.set_gauge("tenant.entries", &[("tenant", "t1")], 3.0);
        metrics.set_gauge("tenant.entries", &[("tenant", "t1")], 7.0);
        assert_eq!(metrics.gauge_value("tenant.entries", &[("tenant", "t1")]), Some(7.0));
    }
}
