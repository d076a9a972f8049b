use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::error::ErrorKind;

/// Upper bounds (ms) of the provider latency histogram buckets.
const UPSTREAM_BUCKETS_MS: [u64; 10] = [50, 100, 250, 500, 1000, 2000, 5000, 10000, 20000, 30000];

/// Process-wide counters rendered in Prometheus text format.
pub struct Metrics {
    requests_total: AtomicU64,
    errors_by_kind: [AtomicU64; ErrorKind::ALL.len()],
    questions_answered_total: AtomicU64,
    upstream_counts: [AtomicU64; UPSTREAM_BUCKETS_MS.len()],
    upstream_sum_ms: AtomicU64,
    upstream_count: AtomicU64,
    // Shared with the telemetry sink.
    telemetry_lines_total: Arc<AtomicU64>,
    telemetry_write_errors_total: Arc<AtomicU64>,
    log_file_size_bytes: Arc<AtomicU64>,
    process_start_epoch: f64,
    process_start_instant: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        let start = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            requests_total: AtomicU64::new(0),
            errors_by_kind: Default::default(),
            questions_answered_total: AtomicU64::new(0),
            upstream_counts: Default::default(),
            upstream_sum_ms: AtomicU64::new(0),
            upstream_count: AtomicU64::new(0),
            telemetry_lines_total: Arc::new(AtomicU64::new(0)),
            telemetry_write_errors_total: Arc::new(AtomicU64::new(0)),
            log_file_size_bytes: Arc::new(AtomicU64::new(0)),
            process_start_epoch: start.as_secs_f64(),
            process_start_instant: Instant::now(),
        }
    }
}

fn kind_index(kind: ErrorKind) -> usize {
    ErrorKind::ALL
        .iter()
        .position(|k| *k == kind)
        .unwrap_or(ErrorKind::ALL.len() - 1)
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, kind: ErrorKind) {
        self.errors_by_kind[kind_index(kind)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_answer(&self) {
        self.questions_answered_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_upstream(&self, ms: u64) {
        self.upstream_sum_ms.fetch_add(ms, Ordering::Relaxed);
        self.upstream_count.fetch_add(1, Ordering::Relaxed);
        if let Some(idx) = UPSTREAM_BUCKETS_MS.iter().position(|ub| ms <= *ub) {
            self.upstream_counts[idx].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn requests_total(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    pub fn errors_total(&self, kind: ErrorKind) -> u64 {
        self.errors_by_kind[kind_index(kind)].load(Ordering::Relaxed)
    }

    pub fn questions_answered_total(&self) -> u64 {
        self.questions_answered_total.load(Ordering::Relaxed)
    }

    pub fn telemetry_lines_total(&self) -> &Arc<AtomicU64> {
        &self.telemetry_lines_total
    }

    pub fn telemetry_write_errors_total(&self) -> &Arc<AtomicU64> {
        &self.telemetry_write_errors_total
    }

    pub fn log_file_size_bytes(&self) -> &Arc<AtomicU64> {
        &self.log_file_size_bytes
    }

    /// Prometheus text exposition (format 0.0.4).
    pub fn render(&self) -> String {
        let mut buf = String::new();
        counter(
            &mut buf,
            "parley_requests_total",
            "Total operation requests received",
            self.requests_total(),
        );

        writeln!(
            buf,
            "# HELP parley_operation_errors_total Operations that ended with an error, by code\n# TYPE parley_operation_errors_total counter"
        )
        .ok();
        for kind in ErrorKind::ALL {
            writeln!(
                buf,
                "parley_operation_errors_total{{code=\"{}\"}} {}",
                kind.code(),
                self.errors_total(kind)
            )
            .ok();
        }

        counter(
            &mut buf,
            "parley_questions_answered_total",
            "Questions answered and persisted",
            self.questions_answered_total(),
        );

        writeln!(
            buf,
            "# HELP parley_upstream_latency_ms Completion provider latency histogram milliseconds\n# TYPE parley_upstream_latency_ms histogram"
        )
        .ok();
        let total = self.upstream_count.load(Ordering::Relaxed);
        let mut cumulative = 0u64;
        for (i, ub) in UPSTREAM_BUCKETS_MS.iter().enumerate() {
            cumulative += self.upstream_counts[i].load(Ordering::Relaxed);
            writeln!(buf, "parley_upstream_latency_ms_bucket{{le=\"{}\"}} {}", ub, cumulative).ok();
        }
        writeln!(buf, "parley_upstream_latency_ms_bucket{{le=\"+Inf\"}} {}", total).ok();
        writeln!(
            buf,
            "parley_upstream_latency_ms_sum {}",
            self.upstream_sum_ms.load(Ordering::Relaxed)
        )
        .ok();
        writeln!(buf, "parley_upstream_latency_ms_count {}", total).ok();

        counter(
            &mut buf,
            "parley_telemetry_lines_total",
            "Telemetry JSON lines written",
            self.telemetry_lines_total.load(Ordering::Relaxed),
        );
        counter(
            &mut buf,
            "parley_telemetry_write_errors_total",
            "Telemetry JSON line write failures",
            self.telemetry_write_errors_total.load(Ordering::Relaxed),
        );

        writeln!(
            buf,
            "# HELP parley_log_file_size_bytes Current size in bytes of active telemetry log file (0 if disabled)\n# TYPE parley_log_file_size_bytes gauge"
        )
        .ok();
        writeln!(
            buf,
            "parley_log_file_size_bytes {}",
            self.log_file_size_bytes.load(Ordering::Relaxed)
        )
        .ok();

        writeln!(
            buf,
            "# HELP parley_build_info Build information\n# TYPE parley_build_info gauge"
        )
        .ok();
        writeln!(
            buf,
            "parley_build_info{{version=\"{}\",schemaVersion=\"1\"}} 1",
            env!("CARGO_PKG_VERSION")
        )
        .ok();

        writeln!(
            buf,
            "# HELP parley_process_start_time_seconds Process start time (Unix epoch seconds)\n# TYPE parley_process_start_time_seconds gauge"
        )
        .ok();
        writeln!(buf, "parley_process_start_time_seconds {}", self.process_start_epoch).ok();
        writeln!(
            buf,
            "# HELP parley_process_uptime_seconds Process uptime seconds\n# TYPE parley_process_uptime_seconds gauge"
        )
        .ok();
        writeln!(
            buf,
            "parley_process_uptime_seconds {}",
            self.process_start_instant.elapsed().as_secs_f64()
        )
        .ok();
        buf
    }
}

fn counter(buf: &mut String, name: &str, help: &str, value: u64) {
    writeln!(buf, "# HELP {} {}\n# TYPE {} counter\n{} {}", name, help, name, name, value).ok();
}
