//! Fan-out of named lifecycle/status events to the external pub/sub bus and
//! the transient alert sink.
//!
//! Connection and recovery problems surface as transient toasts; only the
//! lifecycle rollback and the terminal `Closed` state are persistent,
//! user-actionable failures.

use std::sync::Arc;

use serde_json::{Value, json};
use strum_macros::{Display, EnumString};

use crate::lifecycle::StartReport;
use crate::recovery::execution::{RecoveryExecution, RecoveryOutcome};

/// Severity of a user-facing alert.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// Decoupled notification bus provided by the host application.
pub trait EventBus: Send + Sync {
    fn publish(&self, topic: &str, payload: Value);
}

/// Transient toast/alert sink provided by the host application.
pub trait AlertSink: Send + Sync {
    fn show(&self, message: &str, severity: Severity);
}

/// Bus that drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullBus;

impl EventBus for NullBus {
    fn publish(&self, _topic: &str, _payload: Value) {}
}

/// Alert sink that drops every alert.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullAlertSink;

impl AlertSink for NullAlertSink {
    fn show(&self, _message: &str, _severity: Severity) {}
}

/// Topics published on the event bus.
pub mod topics {
    pub const CONNECTION_ESTABLISHED: &str = "connection.established";
    pub const CONNECTION_LOST: &str = "connection.lost";
    pub const CONNECTION_RECONNECTING: &str = "connection.reconnecting";
    pub const CONNECTION_CLOSED: &str = "connection.closed";
    pub const LIFECYCLE_STARTED: &str = "lifecycle.started";
    pub const LIFECYCLE_START_FAILED: &str = "lifecycle.start_failed";
    pub const LIFECYCLE_STOPPED: &str = "lifecycle.stopped";
    pub const STATUS_BATCH: &str = "status.batch";
    pub const RECOVERY_STARTED: &str = "recovery.started";
    pub const RECOVERY_COMPLETED: &str = "recovery.completed";
    pub const RECOVERY_FALLBACK_PROMPT: &str = "recovery.fallback_prompt";
}

/// Thin fan-out of named events to the bus and severity-mapped toasts to the
/// alert sink.
#[derive(Clone)]
pub struct NotificationEmitter {
    bus: Arc<dyn EventBus>,
    alerts: Arc<dyn AlertSink>,
}

impl NotificationEmitter {
    #[must_use]
    pub fn new(bus: Arc<dyn EventBus>, alerts: Arc<dyn AlertSink>) -> Self {
        Self { bus, alerts }
    }

    /// Emitter wired to the null bus and sink.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(Arc::new(NullBus), Arc::new(NullAlertSink))
    }

    pub fn publish(&self, topic: &str, payload: Value) {
        self.bus.publish(topic, payload);
    }

    pub fn toast(&self, message: &str, severity: Severity) {
        self.alerts.show(message, severity);
    }

    pub fn connection_established(&self, version: Option<&str>) {
        self.publish(
            topics::CONNECTION_ESTABLISHED,
            json!({ "version": version }),
        );
        self.toast("Live status connection established", Severity::Success);
    }

    pub fn connection_lost(&self) {
        self.publish(topics::CONNECTION_LOST, Value::Null);
        self.toast("Live status connection lost", Severity::Warning);
    }

    pub fn reconnecting(&self, attempt: u32, max_attempts: u32) {
        self.publish(
            topics::CONNECTION_RECONNECTING,
            json!({ "attempt": attempt, "max_attempts": max_attempts }),
        );
        self.toast(
            &format!("Reconnecting to status feed ({attempt}/{max_attempts})"),
            Severity::Info,
        );
    }

    /// Terminal closure after exhausted reconnect attempts, a persistent and
    /// user-actionable failure.
    pub fn connection_closed(&self) {
        self.publish(topics::CONNECTION_CLOSED, Value::Null);
        self.toast(
            "Reconnect failed; live status updates are suspended",
            Severity::Error,
        );
    }

    pub fn lifecycle_started(&self, report: &StartReport) {
        self.publish(
            topics::LIFECYCLE_STARTED,
            serde_json::to_value(report).unwrap_or(Value::Null),
        );
        self.toast("Live status synchronization running", Severity::Success);
    }

    pub fn lifecycle_start_failed(&self, reason: &str) {
        self.publish(
            topics::LIFECYCLE_START_FAILED,
            json!({ "reason": reason }),
        );
        self.toast(
            &format!("Live status startup failed: {reason}"),
            Severity::Error,
        );
    }

    pub fn lifecycle_stopped(&self) {
        self.publish(topics::LIFECYCLE_STOPPED, Value::Null);
    }

    pub fn status_batch(&self, count: usize) {
        self.publish(topics::STATUS_BATCH, json!({ "count": count }));
    }

    pub fn recovery_started(&self, mode: &str, message: Option<&str>) {
        self.publish(
            topics::RECOVERY_STARTED,
            json!({ "mode": mode, "message": message }),
        );
        if let Some(message) = message {
            self.toast(message, Severity::Info);
        }
    }

    pub fn recovery_completed(&self, execution: &RecoveryExecution) {
        self.publish(
            topics::RECOVERY_COMPLETED,
            serde_json::to_value(execution).unwrap_or(Value::Null),
        );
        let severity = match execution.outcome {
            RecoveryOutcome::Success => Severity::Success,
            RecoveryOutcome::Partial => Severity::Warning,
            RecoveryOutcome::Failed | RecoveryOutcome::Timeout => Severity::Error,
            RecoveryOutcome::Skipped => return,
        };
        self.toast(
            &format!("Recovery for mode `{}` finished: {}", execution.mode, execution.outcome),
            severity,
        );
    }

    /// The fallback policy requires the user's decision before the action of
    /// last resort runs.
    pub fn fallback_prompt(&self, mode: &str, message: Option<&str>, action: &str) {
        self.publish(
            topics::RECOVERY_FALLBACK_PROMPT,
            json!({ "mode": mode, "message": message, "action": action }),
        );
        self.toast(
            message.unwrap_or("Recovery failed; manual intervention required"),
            Severity::Warning,
        );
    }
}
