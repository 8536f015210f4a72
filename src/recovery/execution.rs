//! Records of recovery attempts.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_with::{DurationMilliSeconds, serde_as};
use strum_macros::Display;
use uuid::Uuid;

use super::plan::RecoveryAction;

/// How a single action inside a plan ended.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ActionStatus {
    Success,
    Failed,
    /// Not executed: an earlier required action failed, or the plan deadline
    /// had already passed.
    Skipped,
    /// The deadline won the race against the handler. Distinct from `Failed`
    /// so the elapsed duration is meaningful.
    TimedOut,
}

/// Result of one action within a recovery execution.
#[non_exhaustive]
#[serde_as]
#[derive(Clone, Debug, Serialize)]
pub struct ActionOutcome {
    pub action_type: String,
    pub required: bool,
    pub status: ActionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "elapsed_ms")]
    pub elapsed: Duration,
}

impl ActionOutcome {
    pub(crate) fn success(
        action: &RecoveryAction,
        detail: Option<String>,
        elapsed: Duration,
    ) -> Self {
        Self {
            action_type: action.action_type.clone(),
            required: action.required,
            status: ActionStatus::Success,
            detail,
            elapsed,
        }
    }

    pub(crate) fn failed<S: Into<String>>(
        action: &RecoveryAction,
        detail: S,
        elapsed: Duration,
    ) -> Self {
        Self {
            action_type: action.action_type.clone(),
            required: action.required,
            status: ActionStatus::Failed,
            detail: Some(detail.into()),
            elapsed,
        }
    }

    pub(crate) fn skipped<S: Into<String>>(action: &RecoveryAction, reason: S) -> Self {
        Self {
            action_type: action.action_type.clone(),
            required: action.required,
            status: ActionStatus::Skipped,
            detail: Some(reason.into()),
            elapsed: Duration::ZERO,
        }
    }

    pub(crate) fn timed_out(action: &RecoveryAction, elapsed: Duration) -> Self {
        Self {
            action_type: action.action_type.clone(),
            required: action.required,
            status: ActionStatus::TimedOut,
            detail: Some(format!(
                "no result within {} ms",
                action.timeout.as_millis()
            )),
            elapsed,
        }
    }
}

/// Aggregate outcome of one recovery execution.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RecoveryOutcome {
    /// Every action succeeded.
    Success,
    /// Optional actions failed; no required action did.
    Partial,
    /// A required action failed (or the mode had no plan).
    Failed,
    /// Rejected without running: another execution was already in flight.
    Skipped,
    /// The plan's total deadline passed before all actions ran.
    Timeout,
}

/// Ephemeral record of one recovery attempt.
#[non_exhaustive]
#[serde_as]
#[derive(Clone, Debug, Serialize)]
pub struct RecoveryExecution {
    pub id: Uuid,
    pub mode: String,
    pub started_at: DateTime<Utc>,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "elapsed_ms")]
    pub elapsed: Duration,
    pub actions: Vec<ActionOutcome>,
    pub outcome: RecoveryOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RecoveryExecution {
    pub(crate) fn skipped(mode: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            mode: mode.to_owned(),
            started_at: Utc::now(),
            elapsed: Duration::ZERO,
            actions: Vec::new(),
            outcome: RecoveryOutcome::Skipped,
            reason: Some("another recovery execution is in flight".to_owned()),
        }
    }

    pub(crate) fn failed<S: Into<String>>(
        mode: &str,
        started_at: DateTime<Utc>,
        reason: S,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            mode: mode.to_owned(),
            started_at,
            elapsed: Duration::ZERO,
            actions: Vec::new(),
            outcome: RecoveryOutcome::Failed,
            reason: Some(reason.into()),
        }
    }
}

/// Aggregate counters across every recorded execution.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryStats {
    pub total: u64,
    pub success: u64,
    pub partial: u64,
    pub failed: u64,
}
