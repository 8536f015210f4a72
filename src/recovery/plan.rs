//! Static recovery configuration, keyed by operating mode.
//!
//! Plans are loaded or overridden at construction time and never mutated
//! during execution.

use std::collections::HashMap;
use std::time::Duration;

use bon::Builder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{DurationMilliSeconds, serde_as};

const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_TOTAL_TIMEOUT: Duration = Duration::from_secs(120);

fn default_action_timeout() -> Duration {
    DEFAULT_ACTION_TIMEOUT
}

fn default_total_timeout() -> Duration {
    DEFAULT_TOTAL_TIMEOUT
}

/// One remediation step inside a recovery plan.
#[non_exhaustive]
#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize, Builder)]
pub struct RecoveryAction {
    /// Key into the orchestrator's handler registry.
    #[builder(into)]
    pub action_type: String,
    /// A required action's failure aborts the remaining plan.
    #[serde(default)]
    #[builder(default = false)]
    pub required: bool,
    /// Deadline raced against the handler; losing the race is a failure of
    /// this action, not an exception.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "timeout_ms", default = "default_action_timeout")]
    #[builder(default = DEFAULT_ACTION_TIMEOUT)]
    pub timeout: Duration,
    /// Handler-specific parameters.
    #[serde(default)]
    #[builder(default)]
    pub params: Value,
}

/// Action of last resort when a plan's outcome is `Failed`.
#[non_exhaustive]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackAction {
    /// Do nothing.
    #[default]
    None,
    /// Dispatch this handler-registry action type.
    Action(String),
}

/// What happens after a plan fails outright.
#[non_exhaustive]
#[derive(Clone, Debug, Default, Serialize, Deserialize, Builder)]
pub struct FallbackPolicy {
    #[serde(default)]
    #[builder(default)]
    pub action: FallbackAction,
    /// When set, the fallback is not executed directly; a prompt notification
    /// carrying `prompt_message` is emitted and the caller decides.
    #[serde(default)]
    #[builder(default = false)]
    pub prompt_required: bool,
    #[serde(default)]
    #[builder(into)]
    pub prompt_message: Option<String>,
}

/// Ordered, timeout-bounded remediation plan for one operating mode.
#[non_exhaustive]
#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize, Builder)]
pub struct RecoveryPlan {
    #[serde(default)]
    #[builder(into)]
    pub description: Option<String>,
    /// Message published (and toasted) when execution begins.
    #[serde(default)]
    #[builder(into)]
    pub start_message: Option<String>,
    /// Settling delay before the first action runs.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "initial_delay_ms", default)]
    #[builder(default = Duration::ZERO)]
    pub initial_delay: Duration,
    /// Delay between actions, applied regardless of outcome.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "inter_action_delay_ms", default)]
    #[builder(default = Duration::ZERO)]
    pub inter_action_delay: Duration,
    /// Deadline for the plan as a whole; actions still pending once it passes
    /// are skipped and the execution aggregates to `Timeout`.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "total_timeout_ms", default = "default_total_timeout")]
    #[builder(default = DEFAULT_TOTAL_TIMEOUT)]
    pub total_timeout: Duration,
    /// Re-runs granted to a failing action beyond its first attempt.
    #[serde(default)]
    #[builder(default)]
    pub retry_count: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "retry_delay_ms", default)]
    #[builder(default = Duration::ZERO)]
    pub retry_delay: Duration,
    /// Executed strictly in declared order, never concurrently.
    pub actions: Vec<RecoveryAction>,
    #[serde(default)]
    #[builder(default)]
    pub fallback: FallbackPolicy,
}

/// Plans shipped for the stock operating modes.
///
/// `live` repairs the streaming pipeline end to end; `review` only refreshes
/// baseline data, since that mode has no live connection worth recycling.
#[must_use]
pub fn default_plans() -> HashMap<String, RecoveryPlan> {
    let mut plans = HashMap::new();

    plans.insert(
        "live".to_owned(),
        RecoveryPlan::builder()
            .description("Restore the live streaming pipeline")
            .start_message("Attempting live status recovery")
            .initial_delay(Duration::from_millis(500))
            .inter_action_delay(Duration::from_millis(250))
            .retry_count(1)
            .retry_delay(Duration::from_millis(500))
            .actions(vec![
                RecoveryAction::builder()
                    .action_type("reconnect")
                    .required(true)
                    .timeout(Duration::from_secs(10))
                    .build(),
                RecoveryAction::builder()
                    .action_type("resubscribe")
                    .required(true)
                    .timeout(Duration::from_secs(5))
                    .build(),
                RecoveryAction::builder()
                    .action_type("reload_baseline")
                    .timeout(Duration::from_secs(15))
                    .build(),
            ])
            .fallback(
                FallbackPolicy::builder()
                    .action(FallbackAction::Action("restart_service".to_owned()))
                    .prompt_required(true)
                    .prompt_message(
                        "Live recovery failed. Restart the synchronization service?",
                    )
                    .build(),
            )
            .build(),
    );

    plans.insert(
        "review".to_owned(),
        RecoveryPlan::builder()
            .description("Refresh review-mode baseline data")
            .initial_delay(Duration::from_millis(250))
            .actions(vec![
                RecoveryAction::builder()
                    .action_type("reload_baseline")
                    .required(true)
                    .timeout(Duration::from_secs(15))
                    .build(),
                RecoveryAction::builder()
                    .action_type("purge_stale")
                    .timeout(Duration::from_secs(5))
                    .build(),
            ])
            .build(),
    );

    plans
}
