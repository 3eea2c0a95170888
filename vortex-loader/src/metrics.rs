//! Prometheus-style loader metrics
//!
//! Counters, gauges and histograms rendered in the Prometheus text format.
//! Counters and gauges are const-constructible so they can live in plain
//! statics; histograms allocate their buckets lazily.

use std::fmt::Write;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Latency buckets in seconds, from a page-cache hit to a cold network mount
pub const LOAD_LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Anything that can render itself into an exposition page
pub trait Metric: Sync {
    fn name(&self) -> &str;
    fn help(&self) -> &str;
    /// Prometheus `TYPE` keyword
    fn kind(&self) -> &'static str;
    fn write_samples(&self, out: &mut String);

    /// Append `# HELP`, `# TYPE` and the sample lines
    fn render(&self, out: &mut String) {
        let _ = writeln!(out, "# HELP {} {}", self.name(), self.help());
        let _ = writeln!(out, "# TYPE {} {}", self.name(), self.kind());
        self.write_samples(out);
    }

    fn to_prometheus(&self) -> String {
        let mut out = String::new();
        self.render(&mut out);
        out
    }
}

/// Monotonic count
pub struct Counter {
    name: &'static str,
    help: &'static str,
    value: AtomicU64,
}

impl Counter {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Metric for Counter {
    fn name(&self) -> &str {
        self.name
    }

    fn help(&self) -> &str {
        self.help
    }

    fn kind(&self) -> &'static str {
        "counter"
    }

    fn write_samples(&self, out: &mut String) {
        let _ = writeln!(out, "{} {}", self.name, self.get());
    }
}

/// Point-in-time value
pub struct Gauge {
    name: &'static str,
    help: &'static str,
    value: AtomicI64,
}

impl Gauge {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicI64::new(0),
        }
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn add(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Metric for Gauge {
    fn name(&self) -> &str {
        self.name
    }

    fn help(&self) -> &str {
        self.help
    }

    fn kind(&self) -> &'static str {
        "gauge"
    }

    fn write_samples(&self, out: &mut String) {
        let _ = writeln!(out, "{} {}", self.name, self.get());
    }
}

/// Distribution of observed durations
///
/// Buckets hold per-range counts and are summed into cumulative `le`
/// buckets at render time. The sum is kept as `f64` bits.
pub struct Histogram {
    name: &'static str,
    help: &'static str,
    bounds: &'static [f64],
    /// One slot per bound plus the overflow slot
    counts: Vec<AtomicU64>,
    sum_bits: AtomicU64,
}

impl Histogram {
    pub fn new(name: &'static str, help: &'static str) -> Self {
        Self::with_bounds(name, help, LOAD_LATENCY_BUCKETS)
    }

    /// `bounds` must be sorted ascending
    pub fn with_bounds(name: &'static str, help: &'static str, bounds: &'static [f64]) -> Self {
        Self {
            name,
            help,
            bounds,
            counts: (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect(),
            sum_bits: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn observe(&self, value: f64) {
        let slot = self.bounds.partition_point(|bound| *bound < value);
        self.counts[slot].fetch_add(1, Ordering::Relaxed);

        let mut current = self.sum_bits.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + value).to_bits();
            match self
                .sum_bits
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn observe_duration(&self, elapsed: Duration) {
        self.observe(elapsed.as_secs_f64());
    }

    /// Records the time until the returned guard is dropped
    pub fn start_timer(&self) -> HistogramTimer<'_> {
        HistogramTimer {
            histogram: self,
            start: Instant::now(),
        }
    }

    pub fn count(&self) -> u64 {
        self.counts.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    pub fn sum(&self) -> f64 {
        f64::from_bits(self.sum_bits.load(Ordering::Relaxed))
    }
}

impl Metric for Histogram {
    fn name(&self) -> &str {
        self.name
    }

    fn help(&self) -> &str {
        self.help
    }

    fn kind(&self) -> &'static str {
        "histogram"
    }

    fn write_samples(&self, out: &mut String) {
        let mut cumulative = 0;
        for (bound, count) in self.bounds.iter().zip(&self.counts) {
            cumulative += count.load(Ordering::Relaxed);
            let _ = writeln!(out, "{}_bucket{{le=\"{}\"}} {}", self.name, bound, cumulative);
        }
        let total = self.count();
        let _ = writeln!(out, "{}_bucket{{le=\"+Inf\"}} {}", self.name, total);
        let _ = writeln!(out, "{}_sum {}", self.name, self.sum());
        let _ = writeln!(out, "{}_count {}", self.name, total);
    }
}

/// Observes elapsed time into its histogram on drop
pub struct HistogramTimer<'a> {
    histogram: &'a Histogram,
    start: Instant,
}

impl Drop for HistogramTimer<'_> {
    fn drop(&mut self) {
        self.histogram.observe_duration(self.start.elapsed());
    }
}

/// Process-wide loader metrics
pub mod standard {
    use super::*;
    use std::sync::LazyLock;

    pub static SHARDS_LOADED: Counter =
        Counter::new("vortex_loader_shards_loaded_total", "Shards decoded successfully");

    pub static SHARD_LOAD_FAILURES: Counter = Counter::new(
        "vortex_loader_shard_load_failures_total",
        "Shard loads that failed and were served empty",
    );

    pub static SHARDS_EVICTED: Counter =
        Counter::new("vortex_loader_shards_evicted_total", "Shards released from the window");

    pub static BYTES_READ: Counter =
        Counter::new("vortex_loader_bytes_read_total", "Shard bytes read from disk");

    pub static SAMPLES_DECODED: Counter =
        Counter::new("vortex_loader_samples_decoded_total", "Samples decoded");

    pub static RESIDENT_SHARDS: Gauge =
        Gauge::new("vortex_loader_resident_shards", "Decoded shards held by the window");

    pub static CURRENT_EPOCH: Gauge =
        Gauge::new("vortex_loader_current_epoch", "Passes completed over the catalog");

    pub static SHARD_LOAD_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
        Histogram::new("vortex_loader_shard_load_duration_seconds", "Read plus decode latency")
    });

    pub static CONSUMER_WAIT_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
        Histogram::new(
            "vortex_loader_consumer_wait_seconds",
            "Time the training thread waited for the active shard",
        )
    });

    /// Every loader metric, in exposition order
    pub fn all() -> [&'static dyn Metric; 9] {
        [
            &SHARDS_LOADED,
            &SHARD_LOAD_FAILURES,
            &SHARDS_EVICTED,
            &BYTES_READ,
            &SAMPLES_DECODED,
            &RESIDENT_SHARDS,
            &CURRENT_EPOCH,
            &*SHARD_LOAD_DURATION,
            &*CONSUMER_WAIT_DURATION,
        ]
    }
}

/// Render all loader metrics
pub fn gather_loader_metrics() -> String {
    let mut out = String::new();
    for metric in standard::all() {
        metric.render(&mut out);
    }
    out
}
