//! Lock-free metrics collection and periodic reporting
//!
//! Session tasks record into atomics; the reporter and the Prometheus
//! endpoint read them. Periodic counters are reset via atomic swap in
//! `report()`, monotonic counters are never reset.
//!
//! NOTE: All atomics use Relaxed ordering. These are statistical counters
//! only and must not be used for coordination.

use crate::domain::types::{DetectionResult, FloorId};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Cycle duration bucket boundaries (milliseconds)
/// Buckets: ≤25, ≤50, ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, >12800
const BUCKET_BOUNDS: [u64; 10] = [25, 50, 100, 200, 400, 800, 1600, 3200, 6400, 12800];
const NUM_BUCKETS: usize = 11;

#[inline]
fn bucket_index(duration_ms: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < duration_ms)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    std::array::from_fn(|i| buckets[i].swap(0, Ordering::Relaxed))
}

#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    std::array::from_fn(|i| buckets[i].load(Ordering::Relaxed))
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Last bucket uses 2x the previous bound
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [25, 50, 100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Latest occupancy snapshot for one floor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FloorGauge {
    pub persons: u64,
    pub occupied_tables: u64,
    pub total_tables: u64,
}

/// Lock-free metrics collector
pub struct Metrics {
    /// Completed detection cycles (monotonic)
    cycles_total: AtomicU64,
    /// Cycles since last report (reset on report)
    cycles_since_report: AtomicU64,
    /// Sum of cycle durations in ms (reset on report)
    cycle_ms_sum: AtomicU64,
    /// Max cycle duration in ms (reset on report)
    cycle_ms_max: AtomicU64,
    /// Cycle duration histogram (reset on report)
    cycle_buckets: [AtomicU64; NUM_BUCKETS],
    /// Cycle duration histogram for Prometheus (monotonic)
    cycle_buckets_total: [AtomicU64; NUM_BUCKETS],
    cycle_ms_total: AtomicU64,
    /// Person observations across all cycles (monotonic)
    persons_detected_total: AtomicU64,
    connect_failures_total: AtomicU64,
    read_failures_total: AtomicU64,
    detector_failures_total: AtomicU64,
    resolver_failures_total: AtomicU64,
    /// Sessions ended by a lost camera (monotonic)
    streams_unavailable_total: AtomicU64,
    /// Any other absorbed per-cycle error (monotonic)
    cycle_errors_total: AtomicU64,
    subscriber_failures_total: AtomicU64,
    /// Egress messages dropped due to channel full (monotonic)
    egress_dropped_total: AtomicU64,
    sessions_started_total: AtomicU64,
    sessions_failed_total: AtomicU64,
    /// Sessions currently in the registry as starting or running
    active_sessions: AtomicU64,
    /// Per-floor gauges, written once per cycle
    floors: RwLock<FxHashMap<FloorId, FloorGauge>>,
    last_report_time: Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            cycles_total: AtomicU64::new(0),
            cycles_since_report: AtomicU64::new(0),
            cycle_ms_sum: AtomicU64::new(0),
            cycle_ms_max: AtomicU64::new(0),
            cycle_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            cycle_buckets_total: std::array::from_fn(|_| AtomicU64::new(0)),
            cycle_ms_total: AtomicU64::new(0),
            persons_detected_total: AtomicU64::new(0),
            connect_failures_total: AtomicU64::new(0),
            read_failures_total: AtomicU64::new(0),
            detector_failures_total: AtomicU64::new(0),
            resolver_failures_total: AtomicU64::new(0),
            streams_unavailable_total: AtomicU64::new(0),
            cycle_errors_total: AtomicU64::new(0),
            subscriber_failures_total: AtomicU64::new(0),
            egress_dropped_total: AtomicU64::new(0),
            sessions_started_total: AtomicU64::new(0),
            sessions_failed_total: AtomicU64::new(0),
            active_sessions: AtomicU64::new(0),
            floors: RwLock::new(FxHashMap::default()),
            last_report_time: Mutex::new(Instant::now()),
        }
    }

    /// Record a completed detection cycle
    pub fn record_cycle(&self, result: &DetectionResult) {
        let duration_ms = result.processing_time_ms.max(0.0).round() as u64;
        self.cycles_total.fetch_add(1, Ordering::Relaxed);
        self.cycles_since_report.fetch_add(1, Ordering::Relaxed);
        self.cycle_ms_sum.fetch_add(duration_ms, Ordering::Relaxed);
        let bucket = bucket_index(duration_ms);
        self.cycle_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.cycle_buckets_total[bucket].fetch_add(1, Ordering::Relaxed);
        self.cycle_ms_total.fetch_add(duration_ms, Ordering::Relaxed);
        update_atomic_max(&self.cycle_ms_max, duration_ms);
        self.persons_detected_total.fetch_add(result.person_count as u64, Ordering::Relaxed);

        let gauge = FloorGauge {
            persons: result.person_count as u64,
            occupied_tables: result.occupied_count() as u64,
            total_tables: result.table_occupancies.len() as u64,
        };
        self.floors.write().insert(result.floor_id, gauge);
    }

    #[inline]
    pub fn record_connect_failure(&self) {
        self.connect_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_read_failure(&self) {
        self.read_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_detector_failure(&self) {
        self.detector_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_resolver_failure(&self) {
        self.resolver_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_stream_unavailable(&self) {
        self.streams_unavailable_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_cycle_error(&self) {
        self.cycle_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_subscriber_failure(&self) {
        self.subscriber_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_egress_dropped(&self) {
        self.egress_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_started(&self) {
        self.sessions_started_total.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a session leaving the active set
    pub fn record_session_ended(&self, floor_id: FloorId, failed: bool) {
        if failed {
            self.sessions_failed_total.fetch_add(1, Ordering::Relaxed);
        }
        // Saturating decrement
        let _ = self
            .active_sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
        self.floors.write().remove(&floor_id);
    }

    pub fn cycles_total(&self) -> u64 {
        self.cycles_total.load(Ordering::Relaxed)
    }

    pub fn connect_failures_total(&self) -> u64 {
        self.connect_failures_total.load(Ordering::Relaxed)
    }

    pub fn read_failures_total(&self) -> u64 {
        self.read_failures_total.load(Ordering::Relaxed)
    }

    pub fn detector_failures_total(&self) -> u64 {
        self.detector_failures_total.load(Ordering::Relaxed)
    }

    pub fn resolver_failures_total(&self) -> u64 {
        self.resolver_failures_total.load(Ordering::Relaxed)
    }

    pub fn streams_unavailable_total(&self) -> u64 {
        self.streams_unavailable_total.load(Ordering::Relaxed)
    }

    pub fn cycle_errors_total(&self) -> u64 {
        self.cycle_errors_total.load(Ordering::Relaxed)
    }

    pub fn subscriber_failures_total(&self) -> u64 {
        self.subscriber_failures_total.load(Ordering::Relaxed)
    }

    pub fn egress_dropped_total(&self) -> u64 {
        self.egress_dropped_total.load(Ordering::Relaxed)
    }

    pub fn persons_detected_total(&self) -> u64 {
        self.persons_detected_total.load(Ordering::Relaxed)
    }

    pub fn sessions_started_total(&self) -> u64 {
        self.sessions_started_total.load(Ordering::Relaxed)
    }

    pub fn sessions_failed_total(&self) -> u64 {
        self.sessions_failed_total.load(Ordering::Relaxed)
    }

    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(Ordering::Relaxed)
    }

    /// Lifetime cycle histogram, never reset by `report()`
    pub fn cycle_buckets_total(&self) -> [u64; NUM_BUCKETS] {
        load_buckets(&self.cycle_buckets_total)
    }

    pub fn cycle_ms_total(&self) -> u64 {
        self.cycle_ms_total.load(Ordering::Relaxed)
    }

    /// Per-floor gauges sorted by floor id
    pub fn floor_gauges(&self) -> Vec<(FloorId, FloorGauge)> {
        let mut gauges: Vec<_> = self.floors.read().iter().map(|(k, v)| (*k, *v)).collect();
        gauges.sort_by_key(|(floor_id, _)| *floor_id);
        gauges
    }

    /// Calculate and return metrics summary, then reset periodic counters
    pub fn report(&self) -> MetricsSummary {
        let cycles = self.cycles_since_report.swap(0, Ordering::Relaxed);
        let cycle_ms_sum = self.cycle_ms_sum.swap(0, Ordering::Relaxed);
        let cycle_ms_max = self.cycle_ms_max.swap(0, Ordering::Relaxed);
        let cycle_buckets = swap_buckets(&self.cycle_buckets);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let cycles_per_sec = if elapsed.as_secs_f64() > 0.0 {
            cycles as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        MetricsSummary {
            cycles_total: self.cycles_total(),
            cycles_per_sec,
            avg_cycle_ms: if cycles > 0 { cycle_ms_sum / cycles } else { 0 },
            max_cycle_ms: cycle_ms_max,
            cycle_p50_ms: percentile_from_buckets(&cycle_buckets, 0.50),
            cycle_p95_ms: percentile_from_buckets(&cycle_buckets, 0.95),
            cycle_p99_ms: percentile_from_buckets(&cycle_buckets, 0.99),
            cycle_buckets,
            persons_detected_total: self.persons_detected_total(),
            connect_failures_total: self.connect_failures_total(),
            read_failures_total: self.read_failures_total(),
            detector_failures_total: self.detector_failures_total(),
            resolver_failures_total: self.resolver_failures_total(),
            streams_unavailable_total: self.streams_unavailable_total(),
            cycle_errors_total: self.cycle_errors_total(),
            subscriber_failures_total: self.subscriber_failures_total(),
            egress_dropped_total: self.egress_dropped_total(),
            active_sessions: self.active_sessions(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for Prometheus formatting)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug)]
pub struct MetricsSummary {
    pub cycles_total: u64,
    pub cycles_per_sec: f64,
    pub avg_cycle_ms: u64,
    pub max_cycle_ms: u64,
    pub cycle_p50_ms: u64,
    pub cycle_p95_ms: u64,
    pub cycle_p99_ms: u64,
    pub cycle_buckets: [u64; NUM_BUCKETS],
    pub persons_detected_total: u64,
    pub connect_failures_total: u64,
    pub read_failures_total: u64,
    pub detector_failures_total: u64,
    pub resolver_failures_total: u64,
    pub streams_unavailable_total: u64,
    pub cycle_errors_total: u64,
    pub subscriber_failures_total: u64,
    pub egress_dropped_total: u64,
    pub active_sessions: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            cycles_total = %self.cycles_total,
            cycles_per_sec = format!("{:.2}", self.cycles_per_sec),
            avg_cycle_ms = %self.avg_cycle_ms,
            max_cycle_ms = %self.max_cycle_ms,
            p50_ms = %self.cycle_p50_ms,
            p95_ms = %self.cycle_p95_ms,
            p99_ms = %self.cycle_p99_ms,
            active_sessions = %self.active_sessions,
            connect_failures = %self.connect_failures_total,
            detector_failures = %self.detector_failures_total,
            egress_dropped = %self.egress_dropped_total,
            "metrics"
        );
    }
}
