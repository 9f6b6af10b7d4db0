//! Request metrics and Prometheus text exposition.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

#[derive(Default)]
struct RouteStats {
    requests: AtomicU64,
    latency_sum_ms: AtomicU64,
}

/// Per-route counters plus one global latency histogram. Counters are
/// lock-free; a scrape renders a point-in-time snapshot.
pub struct Metrics {
    routes: DashMap<(String, String), RouteStats>,
    hist_buckets: Vec<u64>,
    hist_counts: Vec<AtomicU64>,
    hist_sum_ms: AtomicU64,
    hist_count: AtomicU64,
    process_start_epoch: f64,
    process_start_instant: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        let hist_buckets: Vec<u64> = vec![1, 2, 5, 10, 20, 50, 100, 200, 500, 1000, 2000];
        let hist_counts = hist_buckets.iter().map(|_| AtomicU64::new(0)).collect();
        let process_start_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        Self {
            routes: DashMap::new(),
            hist_buckets,
            hist_counts,
            hist_sum_ms: AtomicU64::new(0),
            hist_count: AtomicU64::new(0),
            process_start_epoch,
            process_start_instant: Instant::now(),
        }
    }

    /// Records one finished request.
    pub fn observe(&self, method: &str, path: &str, latency_ms: u64) {
        {
            let stats = self
                .routes
                .entry((method.to_string(), path.to_string()))
                .or_insert_with(RouteStats::default);
            stats.requests.fetch_add(1, Ordering::Relaxed);
            stats.latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        }
        for (idx, upper) in self.hist_buckets.iter().enumerate() {
            if latency_ms <= *upper {
                self.hist_counts[idx].fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
        self.hist_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.hist_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Renders the Prometheus text format, version 0.0.4.
    pub fn render(&self) -> String {
        let mut buf = String::new();

        writeln!(
            &mut buf,
            "# HELP saferoute_requests_total Total requests handled per route."
        )
        .ok();
        writeln!(&mut buf, "# TYPE saferoute_requests_total counter").ok();
        for entry in self.routes.iter() {
            let (method, path) = entry.key();
            writeln!(
                &mut buf,
                "saferoute_requests_total{{method=\"{}\",path=\"{}\"}} {}",
                method,
                path,
                entry.requests.load(Ordering::Relaxed)
            )
            .ok();
        }

        writeln!(
            &mut buf,
            "# HELP saferoute_request_latency_ms_sum Summed request latency per route in milliseconds."
        )
        .ok();
        writeln!(&mut buf, "# TYPE saferoute_request_latency_ms_sum counter").ok();
        for entry in self.routes.iter() {
            let (method, path) = entry.key();
            writeln!(
                &mut buf,
                "saferoute_request_latency_ms_sum{{method=\"{}\",path=\"{}\"}} {}",
                method,
                path,
                entry.latency_sum_ms.load(Ordering::Relaxed)
            )
            .ok();
        }

        writeln!(
            &mut buf,
            "# HELP saferoute_request_latency_ms Request latency distribution in milliseconds."
        )
        .ok();
        writeln!(&mut buf, "# TYPE saferoute_request_latency_ms histogram").ok();
        let mut cumulative = 0u64;
        for (idx, upper) in self.hist_buckets.iter().enumerate() {
            cumulative += self.hist_counts[idx].load(Ordering::Relaxed);
            writeln!(
                &mut buf,
                "saferoute_request_latency_ms_bucket{{le=\"{}\"}} {}",
                upper, cumulative
            )
            .ok();
        }
        let total = self.hist_count.load(Ordering::Relaxed);
        writeln!(
            &mut buf,
            "saferoute_request_latency_ms_bucket{{le=\"+Inf\"}} {}",
            total
        )
        .ok();
        writeln!(
            &mut buf,
            "saferoute_request_latency_ms_sum {}",
            self.hist_sum_ms.load(Ordering::Relaxed)
        )
        .ok();
        writeln!(&mut buf, "saferoute_request_latency_ms_count {}", total).ok();

        writeln!(
            &mut buf,
            "# HELP saferoute_build_info Build information for this binary."
        )
        .ok();
        writeln!(&mut buf, "# TYPE saferoute_build_info gauge").ok();
        writeln!(
            &mut buf,
            "saferoute_build_info{{version=\"{}\"}} 1",
            env!("CARGO_PKG_VERSION")
        )
        .ok();

        writeln!(
            &mut buf,
            "# HELP saferoute_process_start_time_seconds Unix time the process started."
        )
        .ok();
        writeln!(&mut buf, "# TYPE saferoute_process_start_time_seconds gauge").ok();
        writeln!(
            &mut buf,
            "saferoute_process_start_time_seconds {:.3}",
            self.process_start_epoch
        )
        .ok();

        writeln!(
            &mut buf,
            "# HELP saferoute_process_uptime_seconds Seconds since the process started."
        )
        .ok();
        writeln!(&mut buf, "# TYPE saferoute_process_uptime_seconds gauge").ok();
        writeln!(
            &mut buf,
            "saferoute_process_uptime_seconds {:.3}",
            self.process_start_instant.elapsed().as_secs_f64()
        )
        .ok();

        buf
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
