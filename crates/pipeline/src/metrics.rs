use extract::{AggregatedJudgment, AttemptState, ExtractionAttempt, ParseStatus, RelationshipRecord};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

#[derive(Default)]
pub struct PipelineMetrics {
    // Units and attempts
    units_dispatched: AtomicUsize,
    attempts_ok: AtomicUsize,
    attempts_malformed: AtomicUsize,
    attempts_timeout: AtomicUsize,
    attempts_refused: AtomicUsize,
    attempts_validated: AtomicUsize,
    attempts_rejected: AtomicUsize,
    model_retries: AtomicUsize,

    // Outputs
    records_emitted: AtomicUsize,
    records_not_discussed: AtomicUsize,
    judgments_emitted: AtomicUsize,
    judgments_insufficient: AtomicUsize,
    speeches_skipped: AtomicUsize,

    // Timing (in microseconds)
    total_model_time_us: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_dispatch(&self) {
        self.units_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_attempt(&self, attempt: &ExtractionAttempt, duration: Duration) {
        let counter = match attempt.status() {
            Some(ParseStatus::Ok) => &self.attempts_ok,
            Some(ParseStatus::Malformed) => &self.attempts_malformed,
            Some(ParseStatus::Timeout) => &self.attempts_timeout,
            Some(ParseStatus::Refused) => &self.attempts_refused,
            None => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        match attempt.state() {
            AttemptState::Validated => {
                self.attempts_validated.fetch_add(1, Ordering::Relaxed);
            }
            AttemptState::Rejected => {
                self.attempts_rejected.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }

        self.model_retries
            .fetch_add(attempt.tries().saturating_sub(1), Ordering::Relaxed);
        self.total_model_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_record(&self, record: &RelationshipRecord) {
        self.records_emitted.fetch_add(1, Ordering::Relaxed);
        if record.is_not_discussed() {
            self.records_not_discussed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_judgment(&self, judgment: &AggregatedJudgment) {
        self.judgments_emitted.fetch_add(1, Ordering::Relaxed);
        if judgment.is_insufficient() {
            self.judgments_insufficient.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_skip(&self) {
        self.speeches_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let attempts = self.attempts_ok.load(Ordering::Relaxed)
            + self.attempts_malformed.load(Ordering::Relaxed)
            + self.attempts_timeout.load(Ordering::Relaxed)
            + self.attempts_refused.load(Ordering::Relaxed);

        MetricsSnapshot {
            units_dispatched: self.units_dispatched.load(Ordering::Relaxed),
            attempts_ok: self.attempts_ok.load(Ordering::Relaxed),
            attempts_malformed: self.attempts_malformed.load(Ordering::Relaxed),
            attempts_timeout: self.attempts_timeout.load(Ordering::Relaxed),
            attempts_refused: self.attempts_refused.load(Ordering::Relaxed),
            attempts_validated: self.attempts_validated.load(Ordering::Relaxed),
            attempts_rejected: self.attempts_rejected.load(Ordering::Relaxed),
            model_retries: self.model_retries.load(Ordering::Relaxed),
            records_emitted: self.records_emitted.load(Ordering::Relaxed),
            records_not_discussed: self.records_not_discussed.load(Ordering::Relaxed),
            judgments_emitted: self.judgments_emitted.load(Ordering::Relaxed),
            judgments_insufficient: self.judgments_insufficient.load(Ordering::Relaxed),
            speeches_skipped: self.speeches_skipped.load(Ordering::Relaxed),
            total_model_time_us: self.total_model_time_us.load(Ordering::Relaxed),
            avg_model_time_ms: avg_time_ms(self.total_model_time_us.load(Ordering::Relaxed), attempts),
        }
    }
}

fn avg_time_ms(total_us: u64, count: usize) -> f64 {
    if count > 0 {
        total_us as f64 / count as f64 / 1000.0 // Convert to ms
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub units_dispatched: usize,
    pub attempts_ok: usize,
    pub attempts_malformed: usize,
    pub attempts_timeout: usize,
    pub attempts_refused: usize,
    pub attempts_validated: usize,
    pub attempts_rejected: usize,
    pub model_retries: usize,
    pub records_emitted: usize,
    pub records_not_discussed: usize,
    pub judgments_emitted: usize,
    pub judgments_insufficient: usize,
    pub speeches_skipped: usize,
    pub total_model_time_us: u64,
    pub avg_model_time_ms: f64,
}

impl MetricsSnapshot {
    /// Counts accumulated after `earlier` was taken. Work from other
    /// batches running at the same time is included.
    pub fn since(&self, earlier: &MetricsSnapshot) -> MetricsSnapshot {
        let attempts_ok = self.attempts_ok.saturating_sub(earlier.attempts_ok);
        let attempts_malformed = self.attempts_malformed.saturating_sub(earlier.attempts_malformed);
        let attempts_timeout = self.attempts_timeout.saturating_sub(earlier.attempts_timeout);
        let attempts_refused = self.attempts_refused.saturating_sub(earlier.attempts_refused);
        let total_model_time_us = self.total_model_time_us.saturating_sub(earlier.total_model_time_us);

        MetricsSnapshot {
            units_dispatched: self.units_dispatched.saturating_sub(earlier.units_dispatched),
            attempts_ok,
            attempts_malformed,
            attempts_timeout,
            attempts_refused,
            attempts_validated: self.attempts_validated.saturating_sub(earlier.attempts_validated),
            attempts_rejected: self.attempts_rejected.saturating_sub(earlier.attempts_rejected),
            model_retries: self.model_retries.saturating_sub(earlier.model_retries),
            records_emitted: self.records_emitted.saturating_sub(earlier.records_emitted),
            records_not_discussed: self.records_not_discussed.saturating_sub(earlier.records_not_discussed),
            judgments_emitted: self.judgments_emitted.saturating_sub(earlier.judgments_emitted),
            judgments_insufficient: self.judgments_insufficient.saturating_sub(earlier.judgments_insufficient),
            speeches_skipped: self.speeches_skipped.saturating_sub(earlier.speeches_skipped),
            total_model_time_us,
            avg_model_time_ms: avg_time_ms(
                total_model_time_us,
                attempts_ok + attempts_malformed + attempts_timeout + attempts_refused,
            ),
        }
    }
}

pub struct TimedOperation {
    start: Instant,
}

impl TimedOperation {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
