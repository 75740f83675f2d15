//! Progress events and audit records (C12).
//!
//! Two fire-and-forget channels, both constructor-injected rather than
//! reached for as process-wide singletons: a [`ProgressSink`] the driver
//! wires up to a UI or a plain stderr printer, and an [`AuditSink`] that
//! always logs through `tracing` at a dedicated `audit` target so audit
//! records can be filtered or routed independently of operational logs.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Phase of a pipeline run. Transitions are monotonic within one pipeline:
/// `Scanning -> Archiving -> Uploading -> Complete|Error` (or the
/// download/delete analogues).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Scanning,
    Archiving,
    Uploading,
    Downloading,
    Extracting,
    Complete,
    Error,
}

/// A single progress update emitted by any fan-out stage.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub phase: Phase,
    pub current: usize,
    pub total: usize,
    pub message: String,
    /// 0 when not applicable to a particular batch.
    pub batch_id: usize,
    pub success: bool,
    pub errors: Vec<String>,
}

impl ProgressEvent {
    pub fn new(phase: Phase, message: impl Into<String>) -> Self {
        Self {
            phase,
            current: 0,
            total: 0,
            message: message.into(),
            batch_id: 0,
            success: true,
            errors: Vec::new(),
        }
    }

    pub fn with_progress(mut self, current: usize, total: usize) -> Self {
        self.current = current;
        self.total = total;
        self
    }

    pub fn with_batch(mut self, batch_id: usize) -> Self {
        self.batch_id = batch_id;
        self
    }

    pub fn failed(mut self, errors: Vec<String>) -> Self {
        self.success = false;
        self.errors = errors;
        self
    }
}

/// Receives fire-and-forget progress events. No backpressure: a slow or
/// absent consumer must never block the pipeline. Implementations must be
/// `Send + Sync` since every fan-out worker holds a clone.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Discards every event. The default for non-interactive driver paths.
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Logs each event through `tracing` at `debug` (or `warn` on failure).
pub struct LoggingProgressSink;

impl ProgressSink for LoggingProgressSink {
    fn emit(&self, event: ProgressEvent) {
        if event.success {
            tracing::debug!(
                phase = ?event.phase,
                current = event.current,
                total = event.total,
                batch_id = event.batch_id,
                "{}",
                event.message
            );
        } else {
            tracing::warn!(
                phase = ?event.phase,
                current = event.current,
                total = event.total,
                batch_id = event.batch_id,
                errors = ?event.errors,
                "{}",
                event.message
            );
        }
    }
}

/// Type-erased handle to a progress sink, cheap to clone and pass into
/// spawned workers.
pub type SharedProgressSink = Arc<dyn ProgressSink>;

/// An audit record: one durable fact about an operation's outcome,
/// independent of the live progress stream.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub correlation_id: String,
    pub user: String,
    pub project: Option<String>,
    pub subject: Option<String>,
    pub session: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
    pub details: BTreeMap<String, Value>,
}

/// Builder for an [`AuditRecord`]. `Utc::now()` is read once at `finish()`.
pub struct AuditRecordBuilder {
    operation: String,
    correlation_id: String,
    user: String,
    project: Option<String>,
    subject: Option<String>,
    session: Option<String>,
    duration_ms: Option<u64>,
    details: BTreeMap<String, Value>,
}

impl AuditRecordBuilder {
    pub fn new(operation: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            correlation_id: crate::correlation::current(),
            user: user.into(),
            project: None,
            subject: None,
            session: None,
            duration_ms: None,
            details: BTreeMap::new(),
        }
    }

    pub fn target(mut self, project: Option<&str>, subject: Option<&str>, session: Option<&str>) -> Self {
        self.project = project.map(str::to_string);
        self.subject = subject.map(str::to_string);
        self.session = session.map(str::to_string);
        self
    }

    pub fn duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    pub fn detail(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.insert(key.into(), v);
        }
        self
    }

    pub fn finish(self, success: bool, error: Option<String>) -> AuditRecord {
        AuditRecord {
            timestamp: Utc::now(),
            operation: self.operation,
            correlation_id: self.correlation_id,
            user: self.user,
            project: self.project,
            subject: self.subject,
            session: self.session,
            success,
            error,
            duration_ms: self.duration_ms,
            details: self.details,
        }
    }
}

/// Consumes audit records. The default implementation logs through
/// `tracing` at `target: "audit"`, success at INFO and failure at WARNING
/// — mirroring the source's dedicated audit logger, but constructor
/// injected instead of a process-wide singleton.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord);
}

pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: AuditRecord) {
        let json = serde_json::to_string(&record).unwrap_or_default();
        if record.success {
            tracing::info!(target: "audit", audit = true, "{}", json);
        } else {
            tracing::warn!(target: "audit", audit = true, "{}", json);
        }
    }
}

pub type SharedAuditSink = Arc<dyn AuditSink>;

/// Default pair of sinks for drivers that don't need to customize them.
pub fn default_sinks() -> (SharedProgressSink, SharedAuditSink) {
    (Arc::new(LoggingProgressSink), Arc::new(TracingAuditSink))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CollectingSink(Mutex<Vec<ProgressEvent>>);

    impl ProgressSink for CollectingSink {
        fn emit(&self, event: ProgressEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[test]
    fn events_flow_through_a_collecting_sink() {
        let sink = CollectingSink(Mutex::new(Vec::new()));
        sink.emit(ProgressEvent::new(Phase::Scanning, "scanning").with_progress(1, 3));
        let events = sink.0.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].current, 1);
        assert_eq!(events[0].total, 3);
    }

    #[test]
    fn audit_builder_captures_target_and_details() {
        let record = AuditRecordBuilder::new("import", "alice")
            .target(Some("P1"), Some("S1"), Some("E1"))
            .duration_ms(42)
            .detail("batches", 3)
            .finish(true, None);
        assert_eq!(record.operation, "import");
        assert_eq!(record.project.as_deref(), Some("P1"));
        assert_eq!(record.duration_ms, Some(42));
        assert_eq!(record.details.get("batches"), Some(&Value::from(3)));
    }
}
