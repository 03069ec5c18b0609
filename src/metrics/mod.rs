// Private module declaration
mod server;

use prometheus::{
    HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry,
};

// Re-export for public API
pub use server::start_metrics_server;

// ============================================================================
// Metrics Module - Prometheus metrics for observability
// ============================================================================
//
// Covers:
// - Appends and optimistic concurrency conflicts
// - Snapshot saves, failures and archival
// - Stored events skipped because their type is no longer known
// - Rehydration latency
// - Retry attempts and outcomes
//
// All metrics are registered with Prometheus and can be scraped via /metrics
// ============================================================================

/// Central metrics registry for the engine
pub struct Metrics {
    registry: Registry,

    // Append Metrics
    pub events_appended: IntCounterVec,
    pub concurrency_conflicts: IntCounterVec,

    // Snapshot Metrics
    pub snapshots_saved: IntCounterVec,
    pub snapshot_failures: IntCounterVec,
    pub events_archived: IntCounterVec,

    // Read Metrics
    pub unknown_events_skipped: IntCounterVec,
    pub rehydration_duration: HistogramVec,

    // Retry Metrics
    pub retry_attempts_total: IntCounterVec,
    pub retry_success: IntCounterVec,
    pub retry_failure: IntCounterVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let events_appended = IntCounterVec::new(
            Opts::new("events_appended_total", "Total events appended to the store"),
            &["aggregate_type"],
        )?;
        registry.register(Box::new(events_appended.clone()))?;

        let concurrency_conflicts = IntCounterVec::new(
            Opts::new("concurrency_conflicts_total", "Appends rejected because the sequence was taken"),
            &["aggregate_type"],
        )?;
        registry.register(Box::new(concurrency_conflicts.clone()))?;

        let snapshots_saved = IntCounterVec::new(
            Opts::new("snapshots_saved_total", "Total snapshots persisted"),
            &["aggregate_type"],
        )?;
        registry.register(Box::new(snapshots_saved.clone()))?;

        let snapshot_failures = IntCounterVec::new(
            Opts::new("snapshot_failures_total", "Snapshot attempts that failed after commit"),
            &["aggregate_type", "stage"],
        )?;
        registry.register(Box::new(snapshot_failures.clone()))?;

        let events_archived = IntCounterVec::new(
            Opts::new("events_archived_total", "Events removed or moved after a snapshot"),
            &["behavior"],
        )?;
        registry.register(Box::new(events_archived.clone()))?;

        let unknown_events_skipped = IntCounterVec::new(
            Opts::new("unknown_events_skipped_total", "Stored events skipped because their type is unknown"),
            &["event_type"],
        )?;
        registry.register(Box::new(unknown_events_skipped.clone()))?;

        let rehydration_duration = HistogramVec::new(
            HistogramOpts::new("rehydration_duration_seconds", "Time to rebuild an aggregate from storage")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["aggregate_type"],
        )?;
        registry.register(Box::new(rehydration_duration.clone()))?;

        // Retry Metrics
        let retry_attempts_total = IntCounterVec::new(
            Opts::new("retry_attempts_total", "Total retry attempts"),
            &["operation", "attempt"],
        )?;
        registry.register(Box::new(retry_attempts_total.clone()))?;

        let retry_success = IntCounterVec::new(
            Opts::new("retry_success_total", "Total successful retries"),
            &["operation"],
        )?;
        registry.register(Box::new(retry_success.clone()))?;

        let retry_failure = IntCounterVec::new(
            Opts::new("retry_failure_total", "Total failed retries after all attempts"),
            &["operation"],
        )?;
        registry.register(Box::new(retry_failure.clone()))?;

        Ok(Self {
            registry,
            events_appended,
            concurrency_conflicts,
            snapshots_saved,
            snapshot_failures,
            events_archived,
            unknown_events_skipped,
            rehydration_duration,
            retry_attempts_total,
            retry_success,
            retry_failure,
        })
    }

    /// Get the Prometheus registry for exposing metrics via HTTP
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_append(&self, aggregate_type: &str, count: usize) {
        self.events_appended.with_label_values(&[aggregate_type]).inc_by(count as u64);
    }

    pub fn record_conflict(&self, aggregate_type: &str) {
        self.concurrency_conflicts.with_label_values(&[aggregate_type]).inc();
    }

    pub fn record_snapshot_saved(&self, aggregate_type: &str) {
        self.snapshots_saved.with_label_values(&[aggregate_type]).inc();
    }

    /// `stage` is one of "generate", "serialize", "save", "archive"
    pub fn record_snapshot_failure(&self, aggregate_type: &str, stage: &str) {
        self.snapshot_failures.with_label_values(&[aggregate_type, stage]).inc();
    }

    pub fn record_archived(&self, behavior: &str, count: usize) {
        self.events_archived.with_label_values(&[behavior]).inc_by(count as u64);
    }

    pub fn record_unknown_event(&self, event_type: &str) {
        self.unknown_events_skipped.with_label_values(&[event_type]).inc();
    }

    pub fn record_rehydration(&self, aggregate_type: &str, duration_secs: f64) {
        self.rehydration_duration.with_label_values(&[aggregate_type]).observe(duration_secs);
    }

    /// Helper to record retry attempt
    pub fn record_retry_attempt(&self, operation: &str, attempt: u32) {
        self.retry_attempts_total.with_label_values(&[operation, &attempt.to_string()]).inc();
    }

    /// Helper to record retry outcome
    pub fn record_retry_outcome(&self, operation: &str, success: bool) {
        if success {
            self.retry_success.with_label_values(&[operation]).inc();
        } else {
            self.retry_failure.with_label_values(&[operation]).inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        metrics.record_append("Order", 1);
        assert!(!metrics.registry.gather().is_empty());
    }

    #[test]
    fn test_record_append_counts_events() {
        let metrics = Metrics::new().unwrap();
        metrics.record_append("Order", 3);
        metrics.record_append("Order", 2);

        let gathered = metrics.registry.gather();
        let appended = gathered.iter().find(|m| m.name() == "events_appended_total").unwrap();
        assert_eq!(appended.metric[0].counter.value, Some(5.0));
    }

    #[test]
    fn test_snapshot_failures_by_stage() {
        let metrics = Metrics::new().unwrap();
        metrics.record_snapshot_failure("Order", "save");
        metrics.record_snapshot_failure("Order", "archive");

        let gathered = metrics.registry.gather();
        let failures = gathered.iter().find(|m| m.name() == "snapshot_failures_total").unwrap();
        assert_eq!(failures.metric.len(), 2); // One series per stage
    }

    #[test]
    fn test_record_retry() {
        let metrics = Metrics::new().unwrap();
        metrics.record_retry_attempt("order_command", 1);
        metrics.record_retry_attempt("order_command", 2);
        metrics.record_retry_outcome("order_command", true);

        let gathered = metrics.registry.gather();
        let attempts = gathered.iter().find(|m| m.name() == "retry_attempts_total").unwrap();
        assert_eq!(attempts.metric.len(), 2); // Two different attempt labels
    }

    #[test]
    fn test_unknown_events_skipped() {
        let metrics = Metrics::new().unwrap();
        metrics.record_unknown_event("OrderRefunded");

        let gathered = metrics.registry.gather();
        let skipped = gathered.iter().find(|m| m.name() == "unknown_events_skipped_total").unwrap();
        assert_eq!(skipped.metric[0].counter.value, Some(1.0));
    }
}
