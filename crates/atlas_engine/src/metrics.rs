//! Telemetry sink - in-memory counters for card runs.
//!
//! Lock-free atomics, process-wide, exported in Prometheus text format by
//! the server's `/metrics` route.

use atlas_protocol::{RunStatus, StepOutcome};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Global metrics instance
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    // Card runs
    pub runs_started: AtomicU64,
    pub runs_completed: AtomicU64,
    pub runs_blocked: AtomicU64,
    pub runs_failed: AtomicU64,

    // Steps
    pub steps_ok: AtomicU64,
    pub steps_failed: AtomicU64,
    pub steps_blocked: AtomicU64,

    // Components
    pub backend_calls: AtomicU64,
    pub backend_timeouts: AtomicU64,
    pub backend_errors: AtomicU64,
    pub policy_checks: AtomicU64,
    pub redactions: AtomicU64,
    pub evidence_grounds: AtomicU64,
    pub evidence_writes: AtomicU64,

    // Timing (cumulative microseconds)
    pub step_time_us: AtomicU64,
    pub backend_time_us: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            runs_started: AtomicU64::new(0),
            runs_completed: AtomicU64::new(0),
            runs_blocked: AtomicU64::new(0),
            runs_failed: AtomicU64::new(0),
            steps_ok: AtomicU64::new(0),
            steps_failed: AtomicU64::new(0),
            steps_blocked: AtomicU64::new(0),
            backend_calls: AtomicU64::new(0),
            backend_timeouts: AtomicU64::new(0),
            backend_errors: AtomicU64::new(0),
            policy_checks: AtomicU64::new(0),
            redactions: AtomicU64::new(0),
            evidence_grounds: AtomicU64::new(0),
            evidence_writes: AtomicU64::new(0),
            step_time_us: AtomicU64::new(0),
            backend_time_us: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc_runs_started(&self) {
        self.runs_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a finished run under its final status.
    #[inline]
    pub fn record_run(&self, status: RunStatus) {
        let counter = match status {
            RunStatus::Completed => &self.runs_completed,
            RunStatus::Blocked => &self.runs_blocked,
            RunStatus::Failed => &self.runs_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a finished step and add its duration.
    #[inline]
    pub fn record_step(&self, outcome: StepOutcome, start: Instant) {
        let counter = match outcome {
            StepOutcome::Ok => &self.steps_ok,
            StepOutcome::Failed => &self.steps_failed,
            StepOutcome::Blocked => &self.steps_blocked,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.step_time_us
            .fetch_add(start.elapsed().as_micros() as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_backend_call(&self, start: Instant) {
        self.backend_calls.fetch_add(1, Ordering::Relaxed);
        self.backend_time_us
            .fetch_add(start.elapsed().as_micros() as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_backend_timeouts(&self) {
        self.backend_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_backend_errors(&self) {
        self.backend_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_policy_checks(&self) {
        self.policy_checks.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_redactions(&self, n: u64) {
        self.redactions.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_evidence_grounds(&self) {
        self.evidence_grounds.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_evidence_writes(&self, n: u64) {
        self.evidence_writes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            runs_started: self.runs_started.load(Ordering::Relaxed),
            runs_completed: self.runs_completed.load(Ordering::Relaxed),
            runs_blocked: self.runs_blocked.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
            steps_ok: self.steps_ok.load(Ordering::Relaxed),
            steps_failed: self.steps_failed.load(Ordering::Relaxed),
            steps_blocked: self.steps_blocked.load(Ordering::Relaxed),
            backend_calls: self.backend_calls.load(Ordering::Relaxed),
            backend_timeouts: self.backend_timeouts.load(Ordering::Relaxed),
            backend_errors: self.backend_errors.load(Ordering::Relaxed),
            policy_checks: self.policy_checks.load(Ordering::Relaxed),
            redactions: self.redactions.load(Ordering::Relaxed),
            evidence_grounds: self.evidence_grounds.load(Ordering::Relaxed),
            evidence_writes: self.evidence_writes.load(Ordering::Relaxed),
            step_time_us: self.step_time_us.load(Ordering::Relaxed),
            backend_time_us: self.backend_time_us.load(Ordering::Relaxed),
        }
    }

    /// Format as Prometheus exposition format
    pub fn prometheus_format(&self) -> String {
        let s = self.snapshot();
        let rows: [(&str, &str, u64); 16] = [
            ("atlas_runs_started_total", "Card runs started", s.runs_started),
            ("atlas_runs_completed_total", "Card runs completed", s.runs_completed),
            ("atlas_runs_blocked_total", "Card runs halted by a policy gate", s.runs_blocked),
            ("atlas_runs_failed_total", "Card runs aborted by a failed required step", s.runs_failed),
            ("atlas_steps_ok_total", "Steps that succeeded", s.steps_ok),
            ("atlas_steps_failed_total", "Steps that failed", s.steps_failed),
            ("atlas_steps_blocked_total", "Gate steps that blocked", s.steps_blocked),
            ("atlas_backend_calls_total", "Backend invocations", s.backend_calls),
            ("atlas_backend_timeouts_total", "Backend invocations that timed out", s.backend_timeouts),
            ("atlas_backend_errors_total", "Backend invocations that failed", s.backend_errors),
            ("atlas_policy_checks_total", "Policy gate evaluations", s.policy_checks),
            ("atlas_redactions_total", "Masked policy matches", s.redactions),
            ("atlas_evidence_grounds_total", "Evidence grounding queries", s.evidence_grounds),
            ("atlas_evidence_writes_total", "Evidence documents written", s.evidence_writes),
            ("atlas_step_time_microseconds_total", "Cumulative step time in microseconds", s.step_time_us),
            ("atlas_backend_time_microseconds_total", "Cumulative backend time in microseconds", s.backend_time_us),
        ];

        let mut out = String::new();
        for (name, help, value) in rows {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n\n"
            ));
        }
        out
    }
}

/// Immutable snapshot of metrics for reading
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub runs_started: u64,
    pub runs_completed: u64,
    pub runs_blocked: u64,
    pub runs_failed: u64,
    pub steps_ok: u64,
    pub steps_failed: u64,
    pub steps_blocked: u64,
    pub backend_calls: u64,
    pub backend_timeouts: u64,
    pub backend_errors: u64,
    pub policy_checks: u64,
    pub redactions: u64,
    pub evidence_grounds: u64,
    pub evidence_writes: u64,
    pub step_time_us: u64,
    pub backend_time_us: u64,
}

impl MetricsSnapshot {
    pub fn avg_step_time_ms(&self) -> f64 {
        let steps = self.steps_ok + self.steps_failed + self.steps_blocked;
        if steps == 0 {
            0.0
        } else {
            (self.step_time_us as f64 / steps as f64) / 1000.0
        }
    }

    pub fn avg_backend_time_ms(&self) -> f64 {
        if self.backend_calls == 0 {
            0.0
        } else {
            (self.backend_time_us as f64 / self.backend_calls as f64) / 1000.0
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "Runs: {} started, {} completed, {} blocked, {} failed | \
             Backends: {} calls, {} timeouts, {} errors | \
             Avg step: {:.2}ms, Avg backend: {:.2}ms",
            self.runs_started,
            self.runs_completed,
            self.runs_blocked,
            self.runs_failed,
            self.backend_calls,
            self.backend_timeouts,
            self.backend_errors,
            self.avg_step_time_ms(),
            self.avg_backend_time_ms(),
        )
    }
}
