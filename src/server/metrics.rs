// src/server/metrics.rs
//! Request-path metrics
//!
//! Atomic counters exposed on the `/metrics` endpoint in Prometheus text
//! format.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

#[derive(Default)]
pub struct ServerMetrics {
    requests_total: AtomicU64,
    faults_total: AtomicU64,
    configs_served: AtomicU64,
    probes_served: AtomicU64,
    stats_received: AtomicU64,
    start_time: OnceLock<Instant>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        let metrics = Self::default();
        let _ = metrics.start_time.set(Instant::now());
        metrics
    }

    pub fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fault(&self) {
        self.faults_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_config(&self) {
        self.configs_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_probes(&self) {
        self.probes_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stats(&self) {
        self.stats_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Render the Prometheus exposition text; `stats_dropped` comes from
    /// the intake queue
    pub fn to_prometheus(&self, stats_dropped: u64) -> String {
        let uptime = self
            .start_time
            .get()
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0);
        format!(
            "# TYPE tailor_requests_total counter\n\
             tailor_requests_total {}\n\
             # TYPE tailor_faults_total counter\n\
             tailor_faults_total {}\n\
             # TYPE tailor_configs_served_total counter\n\
             tailor_configs_served_total {}\n\
             # TYPE tailor_probes_served_total counter\n\
             tailor_probes_served_total {}\n\
             # TYPE tailor_stats_received_total counter\n\
             tailor_stats_received_total {}\n\
             # TYPE tailor_stats_dropped_total counter\n\
             tailor_stats_dropped_total {}\n\
             # TYPE tailor_uptime_seconds gauge\n\
             tailor_uptime_seconds {}\n",
            self.requests_total.load(Ordering::Relaxed),
            self.faults_total.load(Ordering::Relaxed),
            self.configs_served.load(Ordering::Relaxed),
            self.probes_served.load(Ordering::Relaxed),
            self.stats_received.load(Ordering::Relaxed),
            stats_dropped,
            uptime,
        )
    }
}
