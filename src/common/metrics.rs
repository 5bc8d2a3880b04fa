//! Consensus metrics
//!
//! Counters, gauges and an RPC latency histogram, rendered in the
//! Prometheus text format by the admin API.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Histogram bucket boundaries for RPC latency (in milliseconds)
const LATENCY_BUCKETS: [f64; 10] = [
    1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0,
];

#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        Self::with_buckets(&LATENCY_BUCKETS)
    }

    pub fn with_buckets(boundaries: &[f64]) -> Self {
        let buckets = (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            boundaries: boundaries.to_vec(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        let bucket_idx = self
            .boundaries
            .iter()
            .position(|&boundary| value <= boundary)
            .unwrap_or(self.boundaries.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        // stored as microseconds
        self.sum
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative `(upper bound, count)` pairs, ending with `+Inf`
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0u64;
        let mut result = Vec::with_capacity(self.boundaries.len() + 1);

        for (i, &boundary) in self.boundaries.iter().enumerate() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            result.push((boundary, cumulative));
        }

        cumulative += self.buckets[self.boundaries.len()].load(Ordering::Relaxed);
        result.push((f64::INFINITY, cumulative));

        result
    }

    pub fn sum(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Per-server consensus metrics
#[derive(Debug)]
pub struct RaftMetrics {
    pub elections_started: Counter,
    pub elections_won: Counter,
    pub votes_granted: Counter,
    pub votes_rejected: Counter,
    pub entries_appended: Counter,
    pub entries_applied: Counter,
    pub entries_truncated: Counter,
    pub append_rejections: Counter,
    pub heartbeats_sent: Counter,
    pub heartbeat_failures: Counter,
    pub fed_records_shipped: Counter,
    pub fed_resends: Counter,
    pub fed_records_applied: Counter,

    pub term: Gauge,
    pub commit_index: Gauge,

    pub rpc_latency: Histogram,

    start_time: Instant,
}

impl RaftMetrics {
    pub fn new() -> Self {
        Self {
            elections_started: Counter::new(),
            elections_won: Counter::new(),
            votes_granted: Counter::new(),
            votes_rejected: Counter::new(),
            entries_appended: Counter::new(),
            entries_applied: Counter::new(),
            entries_truncated: Counter::new(),
            append_rejections: Counter::new(),
            heartbeats_sent: Counter::new(),
            heartbeat_failures: Counter::new(),
            fed_records_shipped: Counter::new(),
            fed_resends: Counter::new(),
            fed_records_applied: Counter::new(),
            term: Gauge::new(),
            commit_index: Gauge::new(),
            rpc_latency: Histogram::new(),
            start_time: Instant::now(),
        }
    }

    pub fn observe_rpc(&self, elapsed: Duration) {
        self.rpc_latency.observe(elapsed.as_secs_f64() * 1000.0);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();

        let counters: [(&str, &str, &Counter); 13] = [
            ("zonelog_elections_started_total", "Elections started by this server", &self.elections_started),
            ("zonelog_elections_won_total", "Elections won by this server", &self.elections_won),
            ("zonelog_votes_granted_total", "Votes granted to candidates", &self.votes_granted),
            ("zonelog_votes_rejected_total", "Vote requests rejected", &self.votes_rejected),
            ("zonelog_entries_appended_total", "Log records appended", &self.entries_appended),
            ("zonelog_entries_applied_total", "Log records applied", &self.entries_applied),
            ("zonelog_entries_truncated_total", "Log records removed on conflict", &self.entries_truncated),
            ("zonelog_append_rejections_total", "Replication requests rejected", &self.append_rejections),
            ("zonelog_heartbeats_sent_total", "Heartbeats sent to followers", &self.heartbeats_sent),
            ("zonelog_heartbeat_failures_total", "Heartbeats that failed or timed out", &self.heartbeat_failures),
            ("zonelog_fed_records_shipped_total", "Federation records accepted by slaves", &self.fed_records_shipped),
            ("zonelog_fed_resends_total", "Federation catch-up signals received", &self.fed_resends),
            ("zonelog_fed_records_applied_total", "Federation records applied on this slave", &self.fed_records_applied),
        ];
        for (name, help, counter) in counters {
            writeln!(out, "# HELP {} {}", name, help).ok();
            writeln!(out, "# TYPE {} counter", name).ok();
            writeln!(out, "{} {}", name, counter.get()).ok();
        }

        let gauges: [(&str, &str, u64); 3] = [
            ("zonelog_current_term", "Current consensus term", self.term.get()),
            ("zonelog_commit_index", "Highest committed log index", self.commit_index.get()),
            ("zonelog_uptime_seconds", "Server uptime in seconds", self.uptime_seconds()),
        ];
        for (name, help, value) in gauges {
            writeln!(out, "# HELP {} {}", name, help).ok();
            writeln!(out, "# TYPE {} gauge", name).ok();
            writeln!(out, "{} {}", name, value).ok();
        }

        out.push_str("# HELP zonelog_rpc_duration_ms Outbound peer RPC duration in milliseconds\n");
        out.push_str("# TYPE zonelog_rpc_duration_ms histogram\n");
        for (le, count) in self.rpc_latency.get_buckets() {
            if le.is_infinite() {
                writeln!(out, "zonelog_rpc_duration_ms_bucket{{le=\"+Inf\"}} {}", count).ok();
            } else {
                writeln!(out, "zonelog_rpc_duration_ms_bucket{{le=\"{}\"}} {}", le, count).ok();
            }
        }
        writeln!(out, "zonelog_rpc_duration_ms_sum {}", self.rpc_latency.sum()).ok();
        writeln!(out, "zonelog_rpc_duration_ms_count {}", self.rpc_latency.count()).ok();

        out
    }
}

impl Default for RaftMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram() {
        let hist = Histogram::new();

        hist.observe(0.5);
        hist.observe(30.0);
        hist.observe(5000.0);

        assert_eq!(hist.count(), 3);
        let buckets = hist.get_buckets();
        assert_eq!(buckets.first().unwrap().1, 1);
        assert_eq!(buckets.last().unwrap().1, 3);
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = RaftMetrics::new();
        metrics.elections_started.inc();
        metrics.term.set(4);
        metrics.observe_rpc(Duration::from_millis(3));

        let text = metrics.to_prometheus();
        assert!(text.contains("zonelog_elections_started_total 1"));
        assert!(text.contains("zonelog_current_term 4"));
        assert!(text.contains("zonelog_rpc_duration_ms_count 1"));
    }
}
