use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Trait for metrics backends. Implementations can forward to Prometheus,
/// StatsD, or simply log metrics.
pub trait MetricsBackend: Send + Sync {
    fn record_counter(&self, name: &str, value: u64);
}

/// In-memory counters for the intake pipeline.
pub struct PipelineMetrics {
    pub messages_received: AtomicU64,
    pub records_created: AtomicU64,
    pub submissions_failed: AtomicU64,
    pub duplicate_deliveries: AtomicU64,
    pub messages_dead_lettered: AtomicU64,
    pub summaries_llm: AtomicU64,
    pub summaries_external: AtomicU64,
    pub summaries_local: AtomicU64,
    pub risk_assessments: AtomicU64,
    backend: Option<Arc<dyn MetricsBackend>>,
}

impl std::fmt::Debug for PipelineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            records_created: AtomicU64::new(0),
            submissions_failed: AtomicU64::new(0),
            duplicate_deliveries: AtomicU64::new(0),
            messages_dead_lettered: AtomicU64::new(0),
            summaries_llm: AtomicU64::new(0),
            summaries_external: AtomicU64::new(0),
            summaries_local: AtomicU64::new(0),
            risk_assessments: AtomicU64::new(0),
            backend: None,
        }
    }

    pub fn with_backend(backend: Arc<dyn MetricsBackend>) -> Self {
        Self {
            backend: Some(backend),
            ..Self::new()
        }
    }

    fn bump(&self, counter: &AtomicU64, name: &str) {
        let val = counter.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(backend) = &self.backend {
            backend.record_counter(name, val);
        }
    }

    pub fn record_message_received(&self) {
        self.bump(&self.messages_received, "kyc.intake.messages_received");
    }

    pub fn record_record_created(&self) {
        self.bump(&self.records_created, "kyc.intake.records_created");
    }

    pub fn record_submission_failed(&self) {
        self.bump(&self.submissions_failed, "kyc.intake.submissions_failed");
    }

    pub fn record_duplicate_delivery(&self) {
        self.bump(&self.duplicate_deliveries, "kyc.intake.duplicate_deliveries");
    }

    pub fn record_dead_lettered(&self) {
        self.bump(&self.messages_dead_lettered, "kyc.queue.dead_lettered");
    }

    pub fn record_risk_assessment(&self) {
        self.bump(&self.risk_assessments, "kyc.enrichment.risk_assessments");
    }

    /// Count a summary by the cascade step that produced it.
    pub fn record_summary(&self, step: &str) {
        match step {
            "llm" => self.bump(&self.summaries_llm, "kyc.summary.llm"),
            "external" => self.bump(&self.summaries_external, "kyc.summary.external"),
            _ => self.bump(&self.summaries_local, "kyc.summary.local"),
        }
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            records_created: self.records_created.load(Ordering::Relaxed),
            submissions_failed: self.submissions_failed.load(Ordering::Relaxed),
            duplicate_deliveries: self.duplicate_deliveries.load(Ordering::Relaxed),
            messages_dead_lettered: self.messages_dead_lettered.load(Ordering::Relaxed),
            summaries_llm: self.summaries_llm.load(Ordering::Relaxed),
            summaries_external: self.summaries_external.load(Ordering::Relaxed),
            summaries_local: self.summaries_local.load(Ordering::Relaxed),
            risk_assessments: self.risk_assessments.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of pipeline metrics.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MetricsSnapshot {
    pub messages_received: u64,
    pub records_created: u64,
    pub submissions_failed: u64,
    pub duplicate_deliveries: u64,
    pub messages_dead_lettered: u64,
    pub summaries_llm: u64,
    pub summaries_external: u64,
    pub summaries_local: u64,
    pub risk_assessments: u64,
}

/// Logging-based metrics backend. Emits metrics as structured log events.
pub struct LoggingMetricsBackend;

impl MetricsBackend for LoggingMetricsBackend {
    fn record_counter(&self, name: &str, value: u64) {
        tracing::info!(metric = name, value = value, kind = "counter", "metric");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn default_metrics_start_at_zero() {
        let snap = PipelineMetrics::new().snapshot();
        assert_eq!(snap.messages_received, 0);
        assert_eq!(snap.records_created, 0);
        assert_eq!(snap.messages_dead_lettered, 0);
    }

    #[test]
    fn summaries_counted_by_step() {
        let metrics = PipelineMetrics::new();
        metrics.record_summary("llm");
        metrics.record_summary("local");
        metrics.record_summary("local");
        metrics.record_summary("external");

        let snap = metrics.snapshot();
        assert_eq!(snap.summaries_llm, 1);
        assert_eq!(snap.summaries_external, 1);
        assert_eq!(snap.summaries_local, 2);
    }

    #[derive(Default)]
    struct RecordingBackend {
        seen: Mutex<Vec<(String, u64)>>,
    }

    impl MetricsBackend for RecordingBackend {
        fn record_counter(&self, name: &str, value: u64) {
            self.seen.lock().unwrap().push((name.to_string(), value));
        }
    }

    #[test]
    fn backend_receives_running_totals() {
        let backend = Arc::new(RecordingBackend::default());
        let metrics = PipelineMetrics::with_backend(backend.clone());
        metrics.record_message_received();
        metrics.record_message_received();
        metrics.record_dead_lettered();

        let seen = backend.seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                ("kyc.intake.messages_received".to_string(), 1),
                ("kyc.intake.messages_received".to_string(), 2),
                ("kyc.queue.dead_lettered".to_string(), 1),
            ]
        );
    }

    #[test]
    fn with_logging_backend() {
        let metrics = PipelineMetrics::with_backend(Arc::new(LoggingMetricsBackend));
        metrics.record_record_created();
        assert_eq!(metrics.snapshot().records_created, 1);
    }

    #[test]
    fn concurrent_increments() {
        let metrics = Arc::new(PipelineMetrics::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let m = Arc::clone(&metrics);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    m.record_message_received();
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(metrics.snapshot().messages_received, 1000);
    }
}
