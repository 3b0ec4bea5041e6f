//! # Statistics Module
//!
//! Rather than integrate with a specific observability platform, profdb
//! exposes metrics through a poll-based [`StatRegistry`]. Applications get
//! the registry and poll it periodically to export compactor metrics to
//! their own observability systems (the metric names follow the Prometheus
//! naming conventions and are part of the stable contract).
//!
//! ## Components
//!
//! * [`ReadableStat`]: Core trait implemented by all metric types, providing
//!   a way to read the current value as an `i64`.
//!
//! * [`StatRegistry`]: Central repository for registering and looking up
//!   metrics by name. Provides atomic, thread-safe access to all registered
//!   metrics.
//!
//! * [`Counter`]: Atomic counter for tracking incrementing values.
//!
//! * [`Gauge<T>`]: Generic value holder for any type that implements
//!   `NoUninit + Debug`.
//!
//! * [`Histogram`]: Fixed-bucket histogram for durations and deltas. Bucket
//!   upper bounds are set at construction; observations are recorded into
//!   atomic per-bucket counters and read back as a cumulative snapshot.
//!
//! All metric types are thread-safe.

use std::collections::BTreeMap;
use std::sync::Arc;

use atomic::{Atomic, Ordering};
use bytemuck::NoUninit;
use parking_lot::Mutex;
use tracing::warn;

pub trait ReadableStat: Send + Sync + std::fmt::Debug {
    fn get(&self) -> i64;
}

pub struct StatRegistry {
    stats: Mutex<BTreeMap<&'static str, Arc<dyn ReadableStat>>>,
}

impl Default for StatRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StatRegistry {
    pub fn new() -> Self {
        Self {
            stats: Mutex::new(BTreeMap::new()),
        }
    }

    /// Get a metric with a specific name, or `None` if no metric was
    /// registered for the name.
    pub fn lookup(&self, name: &'static str) -> Option<Arc<dyn ReadableStat>> {
        let guard = self.stats.lock();
        guard.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let guard = self.stats.lock();
        guard.keys().copied().collect()
    }

    /// Register a new metric with the registry.
    pub(crate) fn register(&self, name: &'static str, stat: Arc<dyn ReadableStat>) {
        let mut guard = self.stats.lock();
        debug_assert!(!guard.contains_key(name));
        if guard.contains_key(name) {
            warn!(
                "registry already contains metric with name: {}. will not register again",
                name
            );
            return;
        }
        guard.insert(name, stat);
    }
}

#[derive(Clone)]
pub struct Counter {
    pub(crate) value: Arc<Atomic<u64>>,
}

impl std::fmt::Debug for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.value.load(Ordering::Relaxed))
    }
}

impl ReadableStat for Counter {
    fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed) as i64
    }
}

impl Counter {
    pub fn inc(&self) -> u64 {
        self.value.fetch_add(1, Ordering::Relaxed)
    }

    pub fn add(&self, value: u64) -> u64 {
        self.value.fetch_add(value, Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self {
            value: Arc::new(Atomic::<u64>::default()),
        }
    }
}

#[derive(Clone)]
pub struct Gauge<T: std::fmt::Debug + NoUninit> {
    value: Arc<Atomic<T>>,
}

impl<T: std::fmt::Debug + NoUninit> std::fmt::Debug for Gauge<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.value.load(Ordering::Relaxed))
    }
}

impl ReadableStat for Gauge<i64> {
    fn get(&self) -> i64 {
        self.value()
    }
}

impl ReadableStat for Gauge<u64> {
    fn get(&self) -> i64 {
        self.value() as i64
    }
}

impl ReadableStat for Gauge<bool> {
    fn get(&self) -> i64 {
        self.value() as i64
    }
}

impl<T: NoUninit + std::fmt::Debug> Gauge<T> {
    pub fn set(&self, value: T) -> T {
        self.value.swap(value, Ordering::Relaxed)
    }

    pub fn value(&self) -> T {
        self.value.load(Ordering::Relaxed)
    }
}

impl<T: Default + NoUninit + std::fmt::Debug> Default for Gauge<T> {
    fn default() -> Self {
        Self {
            value: Arc::new(Atomic::<T>::default()),
        }
    }
}

/// A histogram with fixed upper bounds. Observations land in atomic
/// per-bucket counters; bounds and observed values are `f64` (seconds for
/// duration histograms).
pub struct Histogram {
    bounds: Vec<f64>,
    // One counter per bound plus a trailing +Inf bucket.
    buckets: Vec<Atomic<u64>>,
    count: Atomic<u64>,
}

impl std::fmt::Debug for Histogram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "count={:?}", self.count.load(Ordering::Relaxed))
    }
}

impl ReadableStat for Histogram {
    fn get(&self) -> i64 {
        self.count.load(Ordering::Relaxed) as i64
    }
}

impl Histogram {
    /// Creates a histogram with the provided bucket upper bounds, which must
    /// be sorted ascending.
    pub fn with_bounds(bounds: Vec<f64>) -> Self {
        debug_assert!(bounds.windows(2).all(|w| w[0] < w[1]));
        let buckets = (0..bounds.len() + 1).map(|_| Atomic::new(0u64)).collect();
        Self {
            bounds,
            buckets,
            count: Atomic::new(0),
        }
    }

    /// Creates a histogram with `count` buckets of equal `width` starting at
    /// `start`.
    pub fn linear(start: f64, width: f64, count: usize) -> Self {
        let bounds = (0..count).map(|i| start + width * i as f64).collect();
        Self::with_bounds(bounds)
    }

    pub fn observe(&self, value: f64) {
        let idx = self
            .bounds
            .iter()
            .position(|bound| value <= *bound)
            .unwrap_or(self.bounds.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Returns `(upper_bound, cumulative_count)` pairs; the final pair is the
    /// +Inf bucket carrying the total observation count.
    pub fn snapshot(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0;
        let mut out = Vec::with_capacity(self.buckets.len());
        for (i, bucket) in self.buckets.iter().enumerate() {
            cumulative += bucket.load(Ordering::Relaxed);
            let bound = self.bounds.get(i).copied().unwrap_or(f64::INFINITY);
            out.push((bound, cumulative));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_lookup_stat_by_name() {
        let registry = StatRegistry::new();
        let stat1 = Arc::new(Gauge::<i64>::default());
        stat1.set(1);
        registry.register("stat1", stat1);
        let stat2 = Arc::new(Gauge::<i64>::default());
        stat2.set(2);
        registry.register("stat2", stat2);

        assert_eq!(registry.lookup("stat1").unwrap().get(), 1);
        assert_eq!(registry.lookup("stat2").unwrap().get(), 2);
        assert!(registry.lookup("stat3").is_none());
    }

    #[test]
    fn test_should_list_registered_stats() {
        let registry = StatRegistry::new();
        registry.register("stat1", Arc::new(Counter::default()));
        registry.register("stat2", Arc::new(Counter::default()));

        assert_eq!(registry.names(), vec!["stat1", "stat2"]);
    }

    #[test]
    fn test_counter() {
        let counter = Counter::default();
        counter.inc();
        assert_eq!(counter.get(), 1);
        counter.inc();
        assert_eq!(counter.get(), 2);
    }

    #[test]
    fn test_gauge_i64() {
        let gauge = Gauge::<i64>::default();
        assert_eq!(gauge.get(), 0);
        gauge.set(200);
        assert_eq!(gauge.get(), 200);
    }

    #[test]
    fn test_histogram_buckets_observations() {
        let histogram = Histogram::with_bounds(vec![1.0, 5.0, 10.0]);
        histogram.observe(0.5);
        histogram.observe(4.0);
        histogram.observe(4.5);
        histogram.observe(100.0);

        assert_eq!(histogram.count(), 4);
        assert_eq!(
            histogram.snapshot(),
            vec![(1.0, 1), (5.0, 3), (10.0, 3), (f64::INFINITY, 4)]
        );
    }

    #[test]
    fn test_histogram_linear_bounds() {
        let histogram = Histogram::linear(86400.0, 43200.0, 8);
        let snapshot = histogram.snapshot();
        assert_eq!(snapshot.len(), 9);
        assert_eq!(snapshot[0].0, 86400.0);
        assert_eq!(snapshot[7].0, 86400.0 + 43200.0 * 7.0);
        assert_eq!(snapshot[8].0, f64::INFINITY);
    }
}
