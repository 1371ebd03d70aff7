//! In-process counter/gauge/histogram registries (spec §6 "Observability").
//!
//! The exposition format (Prometheus text, JSON, etc.) is an external
//! collaborator's concern; this module only owns the numbers, as small
//! snapshot-able registries rather than free functions (spec §9 "Global
//! mutable counters").

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;

/// A monotonically increasing named counter, keyed by an optional label
/// (e.g. universe number, outcome).
#[derive(Default)]
pub struct CounterRegistry {
    values: DashMap<String, AtomicU64>,
}

impl CounterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, key: impl Into<String>) {
        self.incr_by(key, 1);
    }

    pub fn incr_by(&self, key: impl Into<String>, delta: u64) {
        self.values
            .entry(key.into())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self, key: &str) -> u64 {
        self.values.get(key).map(|v| v.load(Ordering::Relaxed)).unwrap_or(0)
    }

    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.values
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect()
    }
}

/// A point-in-time named gauge (e.g. queue depth, offline device count).
#[derive(Default)]
pub struct GaugeRegistry {
    values: DashMap<String, AtomicI64>,
}

impl GaugeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: i64) {
        self.values
            .entry(key.into())
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    pub fn add(&self, key: impl Into<String>, delta: i64) {
        self.values
            .entry(key.into())
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self, key: &str) -> i64 {
        self.values.get(key).map(|v| v.load(Ordering::Relaxed)).unwrap_or(0)
    }

    pub fn snapshot(&self) -> HashMap<String, i64> {
        self.values
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect()
    }
}

/// A crude duration histogram keyed by name: count, sum, min, max in
/// milliseconds. Sufficient for snapshot assertions in tests; an external
/// collector can derive percentiles if it cares to.
#[derive(Default)]
struct HistogramState {
    count: u64,
    sum_ms: u64,
    min_ms: u64,
    max_ms: u64,
}

#[derive(Default)]
pub struct HistogramRegistry {
    values: Mutex<HashMap<String, HistogramState>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
}

impl HistogramRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, key: impl Into<String>, duration: std::time::Duration) {
        let ms = duration.as_millis() as u64;
        let mut values = self.values.lock();
        let entry = values.entry(key.into()).or_default();
        entry.count += 1;
        entry.sum_ms += ms;
        entry.min_ms = if entry.count == 1 { ms } else { entry.min_ms.min(ms) };
        entry.max_ms = entry.max_ms.max(ms);
    }

    pub fn snapshot(&self, key: &str) -> HistogramSnapshot {
        self.values
            .lock()
            .get(key)
            .map(|s| HistogramSnapshot {
                count: s.count,
                sum_ms: s.sum_ms,
                min_ms: s.min_ms,
                max_ms: s.max_ms,
            })
            .unwrap_or_default()
    }
}

/// Aggregates the counter/gauge/histogram registries the bridge's
/// components emit into (spec §6). Shared via `Arc` from the supervisor.
#[derive(Default)]
pub struct MetricsRegistry {
    pub counters: CounterRegistry,
    pub gauges: GaugeRegistry,
    pub histograms: HistogramRegistry,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn counter_accumulates_per_key() {
        let counters = CounterRegistry::new();
        counters.incr("artnet_packets:1");
        counters.incr("artnet_packets:1");
        counters.incr("artnet_packets:2");
        assert_eq!(counters.get("artnet_packets:1"), 2);
        assert_eq!(counters.get("artnet_packets:2"), 1);
    }

    #[test]
    fn gauge_set_overwrites_and_add_accumulates() {
        let gauges = GaugeRegistry::new();
        gauges.set("queue_depth:dev-1", 5);
        gauges.add("queue_depth:dev-1", -2);
        assert_eq!(gauges.get("queue_depth:dev-1"), 3);
    }

    #[test]
    fn histogram_tracks_count_sum_min_max() {
        let histograms = HistogramRegistry::new();
        histograms.observe("send_duration:udp", Duration::from_millis(10));
        histograms.observe("send_duration:udp", Duration::from_millis(30));
        let snapshot = histograms.snapshot("send_duration:udp");
        assert_eq!(snapshot.count, 2);
        assert_eq!(snapshot.sum_ms, 40);
        assert_eq!(snapshot.min_ms, 10);
        assert_eq!(snapshot.max_ms, 30);
    }
}
