use std::collections::BTreeMap;

/// Well-known metric names.
pub mod names {
    pub const FETCH_REQUESTS: &str = "fetch.requests";
    pub const FETCH_CACHE_HITS: &str = "fetch.cache_hits";
    pub const FETCH_FAILED: &str = "fetch.failed";
    pub const CACHE_EVICTIONS: &str = "cache.evictions";
    pub const REPROJECT_COMMITTED: &str = "reproject.committed";
    pub const REPROJECT_STALE: &str = "reproject.stale";
    pub const REPROJECT_FAILED: &str = "reproject.failed";
    pub const TIME_SNAPS: &str = "time.snaps";
    pub const SIMULATION_STEPS: &str = "simulation.steps";
    /// Histogram of steps completed per `update` call.
    pub const SIMULATION_BATCH: &str = "simulation.batch";
}

/// Deterministic metrics aggregation.
///
/// Sorted maps keep snapshots in a stable order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Metrics {
    counters: BTreeMap<&'static str, u64>,
    histograms: BTreeMap<&'static str, Histogram>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Histogram {
    pub count: u64,
    pub sum: i64,
    pub min: i64,
    pub max: i64,
}

impl Histogram {
    pub fn record(&mut self, value: i64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub counters: Vec<(&'static str, u64)>,
    pub histograms: Vec<(&'static str, Histogram)>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn inc(&mut self, name: &'static str) {
        self.inc_by(name, 1);
    }

    pub fn inc_by(&mut self, name: &'static str, by: u64) {
        *self.counters.entry(name).or_insert(0) += by;
    }

    pub fn record(&mut self, name: &'static str, value: i64) {
        self.histograms.entry(name).or_default().record(value);
    }

    pub fn histogram(&self, name: &str) -> Option<Histogram> {
        self.histograms.get(name).copied()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.counters.iter().map(|(k, v)| (*k, *v)).collect(),
            histograms: self.histograms.iter().map(|(k, v)| (*k, *v)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Histogram, Metrics, names};
    use pretty_assertions::assert_eq;

    #[test]
    fn counters_accumulate() {
        let mut m = Metrics::new();
        m.inc(names::FETCH_REQUESTS);
        m.inc_by(names::FETCH_REQUESTS, 2);
        assert_eq!(m.counter(names::FETCH_REQUESTS), 3);
        assert_eq!(m.counter("missing"), 0);
    }

    #[test]
    fn histogram_tracks_min_max_sum_count() {
        let mut h = Histogram::default();
        h.record(5);
        h.record(-2);
        h.record(7);
        assert_eq!(h.count, 3);
        assert_eq!(h.sum, 10);
        assert_eq!(h.min, -2);
        assert_eq!(h.max, 7);
    }

    #[test]
    fn snapshot_is_stably_sorted() {
        let mut m = Metrics::new();
        m.inc(names::REPROJECT_STALE);
        m.inc(names::FETCH_REQUESTS);
        m.record(names::SIMULATION_STEPS, 3);

        let snap = m.snapshot();
        assert_eq!(
            snap.counters,
            vec![(names::FETCH_REQUESTS, 1), (names::REPROJECT_STALE, 1)]
        );
        assert_eq!(snap.histograms.len(), 1);
    }
}
