//! Client metrics in Prometheus text format (RED: Rate, Errors, Duration).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::result_code::ResultCode;

/// Upper bounds of the duration histogram buckets, in seconds. +Inf is the count.
const DURATION_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

const OPERATIONS: [&str; 7] = ["bind", "search", "add", "modify", "delete", "modify_dn", "compare"];

/// Histogram for one operation: buckets + count + sum (in microseconds).
#[derive(Debug, Default)]
struct DurationHistogram {
    buckets: [AtomicU64; 11],
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl DurationHistogram {
    fn observe(&self, duration: Duration) {
        let micros = duration.as_micros().min(u64::MAX as u128) as u64;
        let secs = duration.as_secs_f64();
        // Only the first bucket with secs <= le is incremented; render accumulates.
        if let Some(i) = DURATION_BUCKETS.iter().position(|&le| secs <= le) {
            self.buckets[i].fetch_add(1, Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct OperationCounters {
    requests: AtomicU64,
    errors: AtomicU64,
    duration: DurationHistogram,
}

/// Metric counters (thread-safe, lock-free).
#[derive(Debug, Default)]
pub struct Metrics {
    operations: [OperationCounters; 7],
    /// Failed operations by (op, result code).
    result_codes: dashmap::DashMap<(&'static str, ResultCode), AtomicU64>,
    /// Response controls that failed to decode.
    pub decode_errors: AtomicU64,
    pub sessions_created: AtomicU64,
    pub sessions_destroyed: AtomicU64,
    pub validation_failures: AtomicU64,
    pub checkouts: AtomicU64,
    pub checkouts_exhausted: AtomicU64,
    pub sessions_pruned: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self, op: &str) -> Option<&OperationCounters> {
        OPERATIONS
            .iter()
            .position(|name| *name == op)
            .map(|i| &self.operations[i])
    }

    /// Counts a successful operation.
    #[inline]
    pub fn inc_request(&self, op: &str) {
        if let Some(c) = self.counters(op) {
            c.requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Counts a failed operation, by result code when one is known.
    #[inline]
    pub fn inc_error(&self, op: &str, code: Option<ResultCode>) {
        let Some(index) = OPERATIONS.iter().position(|name| *name == op) else {
            return;
        };
        self.operations[index].errors.fetch_add(1, Ordering::Relaxed);
        if let Some(code) = code {
            self.result_codes
                .entry((OPERATIONS[index], code))
                .or_insert_with(AtomicU64::default)
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records request duration. Call after success or failure.
    #[inline]
    pub fn observe_duration(&self, op: &str, duration: Duration) {
        if let Some(c) = self.counters(op) {
            c.duration.observe(duration);
        }
    }

    #[inline]
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests(&self, op: &str) -> u64 {
        self.counters(op)
            .map(|c| c.requests.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn errors(&self, op: &str) -> u64 {
        self.counters(op)
            .map(|c| c.errors.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Renders all metrics in the Prometheus exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();

        out.push_str("# HELP ldap_client_requests_total Total LDAP operations by operation (success).\n");
        out.push_str("# TYPE ldap_client_requests_total counter\n");
        for (op, c) in OPERATIONS.iter().zip(&self.operations) {
            out.push_str(&format!(
                "ldap_client_requests_total{{op=\"{}\"}} {}\n",
                op,
                c.requests.load(Ordering::Relaxed)
            ));
        }

        out.push_str("# HELP ldap_client_errors_total Total failed LDAP operations by operation.\n");
        out.push_str("# TYPE ldap_client_errors_total counter\n");
        for (op, c) in OPERATIONS.iter().zip(&self.operations) {
            out.push_str(&format!(
                "ldap_client_errors_total{{op=\"{}\"}} {}\n",
                op,
                c.errors.load(Ordering::Relaxed)
            ));
        }

        out.push_str("# HELP ldap_client_result_codes_total Failed LDAP operations by operation and result code.\n");
        out.push_str("# TYPE ldap_client_result_codes_total counter\n");
        let mut codes: Vec<((&str, ResultCode), u64)> = self
            .result_codes
            .iter()
            .map(|e| (*e.key(), e.value().load(Ordering::Relaxed)))
            .collect();
        codes.sort();
        for ((op, code), count) in codes {
            out.push_str(&format!(
                "ldap_client_result_codes_total{{op=\"{}\",code=\"{}\"}} {}\n",
                op,
                code.code(),
                count
            ));
        }

        for (name, help, counter) in [
            ("ldap_client_decode_errors_total", "Response controls or entries that failed to decode.", &self.decode_errors),
            ("ldap_client_pool_sessions_created_total", "Sessions opened by the pool.", &self.sessions_created),
            ("ldap_client_pool_sessions_destroyed_total", "Sessions closed by the pool.", &self.sessions_destroyed),
            ("ldap_client_pool_validation_failures_total", "Sessions that failed validation.", &self.validation_failures),
            ("ldap_client_pool_checkouts_total", "Successful pool checkouts.", &self.checkouts),
            ("ldap_client_pool_checkouts_exhausted_total", "Checkouts that timed out.", &self.checkouts_exhausted),
            ("ldap_client_pool_sessions_pruned_total", "Idle sessions removed by the prune sweep.", &self.sessions_pruned),
        ] {
            out.push_str(&format!("# HELP {} {}\n", name, help));
            out.push_str(&format!("# TYPE {} counter\n", name));
            out.push_str(&format!("{} {}\n", name, counter.load(Ordering::Relaxed)));
        }

        out.push_str("# HELP ldap_client_request_duration_seconds Operation duration in seconds by operation.\n");
        out.push_str("# TYPE ldap_client_request_duration_seconds histogram\n");
        for (op, c) in OPERATIONS.iter().zip(&self.operations) {
            let hist = &c.duration;
            let count = hist.count.load(Ordering::Relaxed);
            let mut cum = 0u64;
            for (i, &le) in DURATION_BUCKETS.iter().enumerate() {
                cum += hist.buckets[i].load(Ordering::Relaxed);
                out.push_str(&format!(
                    "ldap_client_request_duration_seconds_bucket{{op=\"{}\",le=\"{}\"}} {}\n",
                    op, le, cum
                ));
            }
            out.push_str(&format!(
                "ldap_client_request_duration_seconds_bucket{{op=\"{}\",le=\"+Inf\"}} {}\n",
                op, count
            ));
            let sum_secs = hist.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
            out.push_str(&format!(
                "ldap_client_request_duration_seconds_sum{{op=\"{}\"}} {}\n",
                op, sum_secs
            ));
            out.push_str(&format!(
                "ldap_client_request_duration_seconds_count{{op=\"{}\"}} {}\n",
                op, count
            ));
        }

        out
    }
}
