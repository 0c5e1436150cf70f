//! Lock-free relay metrics
//!
//! Counter updates are plain atomic adds so the device I/O path never contends on a
//! lock. `report()` swaps the per-interval counters to zero for the periodic log line;
//! monotonic totals are left untouched for the Prometheus endpoint.
//!
//! NOTE: All atomics use Relaxed ordering, these are statistical counters only.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Backend round-trip histogram bounds (milliseconds)
/// Buckets: ≤10, ≤25, ≤50, ≤100, ≤250, ≤500, ≤1000, ≤2500, ≤5000, ≤10000, >10000 ms
pub const BACKEND_LATENCY_BOUNDS_MS: [u64; 10] = [10, 25, 50, 100, 250, 500, 1000, 2500, 5000, 10000];
pub const NUM_BUCKETS: usize = 11;

#[inline]
fn bucket_index(latency_ms: u64) -> usize {
    BACKEND_LATENCY_BOUNDS_MS.partition_point(|&bound| bound < latency_ms)
}

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

/// Relay metrics collector, shared as `Arc<Metrics>`
pub struct Metrics {
    // Device connections (monotonic)
    connects_total: AtomicU64,
    disconnects_total: AtomicU64,
    connect_failures_total: AtomicU64,
    reconnect_attempts_total: AtomicU64,
    /// Sessions currently registered
    connections_active: AtomicU64,

    // Inbound frames (monotonic)
    frames_total: AtomicU64,
    breaker_frames_total: AtomicU64,
    paystation_frames_total: AtomicU64,
    decode_failures_total: AtomicU64,
    oversize_frames_total: AtomicU64,
    facility_lookups_total: AtomicU64,
    facility_misses_total: AtomicU64,

    // Outbound device commands (monotonic)
    sends_total: AtomicU64,
    sends_dropped_total: AtomicU64,

    // Backend (monotonic)
    backend_requests_total: AtomicU64,
    backend_failures_total: AtomicU64,
    backend_retries_total: AtomicU64,
    images_deleted_total: AtomicU64,
    images_retained_total: AtomicU64,
    backend_latency_buckets: [AtomicU64; NUM_BUCKETS],
    backend_latency_total_ms: AtomicU64,

    // Per-interval (reset on report)
    frames_since_report: AtomicU64,
    backend_latency_sum_ms: AtomicU64,
    backend_latency_max_ms: AtomicU64,
    backend_requests_since_report: AtomicU64,

    last_report_time: parking_lot::Mutex<Instant>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connects_total: AtomicU64::new(0),
            disconnects_total: AtomicU64::new(0),
            connect_failures_total: AtomicU64::new(0),
            reconnect_attempts_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            frames_total: AtomicU64::new(0),
            breaker_frames_total: AtomicU64::new(0),
            paystation_frames_total: AtomicU64::new(0),
            decode_failures_total: AtomicU64::new(0),
            oversize_frames_total: AtomicU64::new(0),
            facility_lookups_total: AtomicU64::new(0),
            facility_misses_total: AtomicU64::new(0),
            sends_total: AtomicU64::new(0),
            sends_dropped_total: AtomicU64::new(0),
            backend_requests_total: AtomicU64::new(0),
            backend_failures_total: AtomicU64::new(0),
            backend_retries_total: AtomicU64::new(0),
            images_deleted_total: AtomicU64::new(0),
            images_retained_total: AtomicU64::new(0),
            backend_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            backend_latency_total_ms: AtomicU64::new(0),
            frames_since_report: AtomicU64::new(0),
            backend_latency_sum_ms: AtomicU64::new(0),
            backend_latency_max_ms: AtomicU64::new(0),
            backend_requests_since_report: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_connected(&self) {
        self.connects_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_disconnected(&self) {
        self.disconnects_total.fetch_add(1, Ordering::Relaxed);
        // Saturating: never underflow the gauge
        let _ = self.connections_active.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(1))
        });
    }

    #[inline]
    pub fn record_connect_failure(&self) {
        self.connect_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reconnect_attempt(&self) {
        self.reconnect_attempts_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_breaker_frame(&self) {
        self.record_frame();
        self.breaker_frames_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_paystation_frame(&self) {
        self.record_frame();
        self.paystation_frames_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_frame(&self) {
        self.frames_total.fetch_add(1, Ordering::Relaxed);
        self.frames_since_report.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_decode_failure(&self) {
        self.decode_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_oversize_frame(&self) {
        self.oversize_frames_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_facility_lookup(&self, found: bool) {
        self.facility_lookups_total.fetch_add(1, Ordering::Relaxed);
        if !found {
            self.facility_misses_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_send(&self, queued: bool) {
        if queued {
            self.sends_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.sends_dropped_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record one completed backend round trip (success or not)
    #[inline]
    pub fn record_backend_request(&self, latency_ms: u64) {
        self.backend_requests_total.fetch_add(1, Ordering::Relaxed);
        self.backend_requests_since_report.fetch_add(1, Ordering::Relaxed);
        self.backend_latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.backend_latency_total_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.backend_latency_buckets[bucket_index(latency_ms)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.backend_latency_max_ms, latency_ms);
    }

    #[inline]
    pub fn record_backend_failure(&self) {
        self.backend_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_backend_retry(&self) {
        self.backend_retries_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_image_deleted(&self) {
        self.images_deleted_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_image_retained(&self) {
        self.images_retained_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connects_total(&self) -> u64 {
        self.connects_total.load(Ordering::Relaxed)
    }

    pub fn disconnects_total(&self) -> u64 {
        self.disconnects_total.load(Ordering::Relaxed)
    }

    pub fn reconnect_attempts_total(&self) -> u64 {
        self.reconnect_attempts_total.load(Ordering::Relaxed)
    }

    pub fn connections_active(&self) -> u64 {
        self.connections_active.load(Ordering::Relaxed)
    }

    pub fn frames_total(&self) -> u64 {
        self.frames_total.load(Ordering::Relaxed)
    }

    pub fn decode_failures_total(&self) -> u64 {
        self.decode_failures_total.load(Ordering::Relaxed)
    }

    pub fn facility_lookups_total(&self) -> u64 {
        self.facility_lookups_total.load(Ordering::Relaxed)
    }

    pub fn backend_failures_total(&self) -> u64 {
        self.backend_failures_total.load(Ordering::Relaxed)
    }

    pub fn backend_retries_total(&self) -> u64 {
        self.backend_retries_total.load(Ordering::Relaxed)
    }

    /// Snapshot of all monotonic totals (does not reset anything)
    pub fn totals(&self) -> MetricsTotals {
        MetricsTotals {
            connects: self.connects_total(),
            disconnects: self.disconnects_total(),
            connect_failures: self.connect_failures_total.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts_total(),
            connections_active: self.connections_active(),
            frames: self.frames_total(),
            breaker_frames: self.breaker_frames_total.load(Ordering::Relaxed),
            paystation_frames: self.paystation_frames_total.load(Ordering::Relaxed),
            decode_failures: self.decode_failures_total(),
            oversize_frames: self.oversize_frames_total.load(Ordering::Relaxed),
            facility_lookups: self.facility_lookups_total(),
            facility_misses: self.facility_misses_total.load(Ordering::Relaxed),
            sends: self.sends_total.load(Ordering::Relaxed),
            sends_dropped: self.sends_dropped_total.load(Ordering::Relaxed),
            backend_requests: self.backend_requests_total.load(Ordering::Relaxed),
            backend_failures: self.backend_failures_total(),
            backend_retries: self.backend_retries_total(),
            images_deleted: self.images_deleted_total.load(Ordering::Relaxed),
            images_retained: self.images_retained_total.load(Ordering::Relaxed),
            backend_latency_buckets: std::array::from_fn(|i| {
                self.backend_latency_buckets[i].load(Ordering::Relaxed)
            }),
            backend_latency_total_ms: self.backend_latency_total_ms.load(Ordering::Relaxed),
        }
    }

    /// Interval report: swaps per-interval counters and returns a summary
    pub fn report(&self) -> MetricsSummary {
        let elapsed_secs = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed().as_secs_f64();
            *last = Instant::now();
            elapsed
        };

        let frames = self.frames_since_report.swap(0, Ordering::Relaxed);
        let requests = self.backend_requests_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.backend_latency_sum_ms.swap(0, Ordering::Relaxed);
        let latency_max = self.backend_latency_max_ms.swap(0, Ordering::Relaxed);

        MetricsSummary {
            frames_per_sec: if elapsed_secs > 0.0 { frames as f64 / elapsed_secs } else { 0.0 },
            frames_since_report: frames,
            backend_requests_since_report: requests,
            backend_avg_latency_ms: if requests > 0 { latency_sum / requests } else { 0 },
            backend_max_latency_ms: latency_max,
            totals: self.totals(),
        }
    }
}

/// Monotonic counters at one point in time
#[derive(Debug, Clone, Default)]
pub struct MetricsTotals {
    pub connects: u64,
    pub disconnects: u64,
    pub connect_failures: u64,
    pub reconnect_attempts: u64,
    pub connections_active: u64,
    pub frames: u64,
    pub breaker_frames: u64,
    pub paystation_frames: u64,
    pub decode_failures: u64,
    pub oversize_frames: u64,
    pub facility_lookups: u64,
    pub facility_misses: u64,
    pub sends: u64,
    pub sends_dropped: u64,
    pub backend_requests: u64,
    pub backend_failures: u64,
    pub backend_retries: u64,
    pub images_deleted: u64,
    pub images_retained: u64,
    pub backend_latency_buckets: [u64; NUM_BUCKETS],
    pub backend_latency_total_ms: u64,
}

/// Periodic summary logged by the reporter task
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub frames_per_sec: f64,
    pub frames_since_report: u64,
    pub backend_requests_since_report: u64,
    pub backend_avg_latency_ms: u64,
    pub backend_max_latency_ms: u64,
    pub totals: MetricsTotals,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            frames = %self.frames_since_report,
            frames_per_sec = format!("{:.1}", self.frames_per_sec),
            connections_active = %self.totals.connections_active,
            reconnects = %self.totals.reconnect_attempts,
            decode_failures = %self.totals.decode_failures,
            backend_requests = %self.backend_requests_since_report,
            backend_avg_ms = %self.backend_avg_latency_ms,
            backend_max_ms = %self.backend_max_latency_ms,
            backend_failures = %self.totals.backend_failures,
            "metrics_report"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_connection_gauge_never_underflows() {
        let metrics = Metrics::new();
        metrics.record_disconnected();
        assert_eq!(metrics.connections_active(), 0);

        metrics.record_connected();
        metrics.record_connected();
        metrics.record_disconnected();
        assert_eq!(metrics.connections_active(), 1);
        assert_eq!(metrics.connects_total(), 2);
        assert_eq!(metrics.disconnects_total(), 2);
    }

    #[test]
    fn test_frame_counters() {
        let metrics = Metrics::new();
        metrics.record_breaker_frame();
        metrics.record_paystation_frame();
        metrics.record_paystation_frame();

        let totals = metrics.totals();
        assert_eq!(totals.frames, 3);
        assert_eq!(totals.breaker_frames, 1);
        assert_eq!(totals.paystation_frames, 2);
    }

    #[test]
    fn test_report_resets_interval_counters() {
        let metrics = Metrics::new();
        metrics.record_breaker_frame();
        metrics.record_backend_request(20);
        metrics.record_backend_request(40);

        let summary = metrics.report();
        assert_eq!(summary.frames_since_report, 1);
        assert_eq!(summary.backend_avg_latency_ms, 30);
        assert_eq!(summary.backend_max_latency_ms, 40);

        let again = metrics.report();
        assert_eq!(again.frames_since_report, 0);
        assert_eq!(again.backend_avg_latency_ms, 0);
        // Totals survive the interval reset
        assert_eq!(again.totals.frames, 1);
        assert_eq!(again.totals.backend_requests, 2);
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(10), 0);
        assert_eq!(bucket_index(11), 1);
        assert_eq!(bucket_index(10000), 9);
        assert_eq!(bucket_index(10001), 10);
    }

    #[test]
    fn test_concurrent_updates() {
        let metrics = Arc::new(Metrics::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = metrics.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        m.record_paystation_frame();
                        m.record_facility_lookup(false);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let totals = metrics.totals();
        assert_eq!(totals.frames, 4000);
        assert_eq!(totals.facility_lookups, 4000);
        assert_eq!(totals.facility_misses, 4000);
    }
}
