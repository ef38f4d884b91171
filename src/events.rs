/// Event sink for check-cycle outcomes.
///
/// The watcher reports exactly one record per branch it reaches. Where the
/// records end up is the sink's business: `TracingSink` forwards them to the
/// tracing subscriber, `RecordingSink` keeps them in memory.
use std::sync::Mutex;

/// Severity of an event record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Information,
    Warning,
    Error,
}

/// Minimal logging capability handed to the watcher at construction.
pub trait EventSink: Send + Sync + 'static {
    fn record(&self, severity: Severity, message: &str);
}

/// Sink that emits records as tracing events tagged with the watched service.
pub struct TracingSink {
    service: String,
}

impl TracingSink {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

impl EventSink for TracingSink {
    fn record(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Information => tracing::info!(service = %self.service, "{message}"),
            Severity::Warning => tracing::warn!(service = %self.service, "{message}"),
            Severity::Error => tracing::error!(service = %self.service, "{message}"),
        }
    }
}

/// In-memory sink. `--once` prints its records as the cycle summary.
#[derive(Default)]
pub struct RecordingSink {
    records: Mutex<Vec<(Severity, String)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far, oldest first.
    pub fn records(&self) -> Vec<(Severity, String)> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Number of records at the given severity.
    #[cfg(test)]
    pub fn count(&self, severity: Severity) -> usize {
        self.records()
            .iter()
            .filter(|(s, _)| *s == severity)
            .count()
    }
}

impl EventSink for RecordingSink {
    fn record(&self, severity: Severity, message: &str) {
        if let Ok(mut records) = self.records.lock() {
            records.push((severity, message.to_string()));
        }
    }
}

impl<S: EventSink> EventSink for std::sync::Arc<S> {
    fn record(&self, severity: Severity, message: &str) {
        (**self).record(severity, message);
    }
}
