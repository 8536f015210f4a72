//! Executes per-operating-mode recovery plans.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use super::execution::{
    ActionOutcome, ActionStatus, RecoveryExecution, RecoveryOutcome, RecoveryStats,
};
use super::plan::{FallbackAction, FallbackPolicy, RecoveryAction, RecoveryPlan};
use crate::Result;
use crate::notify::NotificationEmitter;
use crate::services::{
    BaselineLoader, ConnectionControl, EmptyBaseline, LifecycleControl, NullConnectionControl,
    NullLifecycleControl,
};
use crate::status::StatusCache;

const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Result a handler reports back to the orchestrator.
#[non_exhaustive]
#[derive(Clone, Debug, Default)]
pub struct ActionReport {
    pub success: bool,
    pub detail: Option<String>,
}

impl ActionReport {
    #[must_use]
    pub fn succeeded() -> Self {
        Self {
            success: true,
            detail: None,
        }
    }

    #[must_use]
    pub fn succeeded_with<S: Into<String>>(detail: S) -> Self {
        Self {
            success: true,
            detail: Some(detail.into()),
        }
    }

    #[must_use]
    pub fn failed<S: Into<String>>(detail: S) -> Self {
        Self {
            success: false,
            detail: Some(detail.into()),
        }
    }
}

/// Service handles passed to every action handler.
///
/// Absent collaborators are explicit null implementations, never probed
/// `Option`s.
#[non_exhaustive]
#[derive(Clone)]
pub struct ServiceHandles {
    pub connection: Arc<dyn ConnectionControl>,
    pub lifecycle: Arc<dyn LifecycleControl>,
    pub loader: Arc<dyn BaselineLoader>,
    pub cache: Arc<StatusCache>,
    pub emitter: Arc<NotificationEmitter>,
}

impl ServiceHandles {
    #[must_use]
    pub fn new(
        connection: Arc<dyn ConnectionControl>,
        lifecycle: Arc<dyn LifecycleControl>,
        loader: Arc<dyn BaselineLoader>,
        cache: Arc<StatusCache>,
        emitter: Arc<NotificationEmitter>,
    ) -> Self {
        Self {
            connection,
            lifecycle,
            loader,
            cache,
            emitter,
        }
    }

    /// Handles wired entirely to null collaborators; useful in tests and for
    /// plans made of custom handlers only.
    #[must_use]
    pub fn detached() -> Self {
        Self::new(
            Arc::new(NullConnectionControl),
            Arc::new(NullLifecycleControl),
            Arc::new(EmptyBaseline),
            Arc::new(StatusCache::new()),
            Arc::new(NotificationEmitter::disabled()),
        )
    }
}

/// Pluggable handler for one recovery action type.
///
/// A handler returning `Err` is treated identically to a handler reporting
/// `success: false`.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn execute(&self, params: &Value, services: &ServiceHandles) -> Result<ActionReport>;
}

/// Holds one recovery plan per operating mode and executes them.
///
/// At most one execution is in flight system-wide; the in-flight flag is the
/// system's only mutual-exclusion primitive and guards exactly that slot. A
/// second request while one runs is rejected with
/// [`RecoveryOutcome::Skipped`] without invoking any handler.
pub struct RecoveryOrchestrator {
    plans: HashMap<String, RecoveryPlan>,
    handlers: DashMap<String, Arc<dyn ActionHandler>>,
    services: ServiceHandles,
    in_flight: AtomicBool,
    history: Mutex<VecDeque<RecoveryExecution>>,
    history_limit: usize,
    stats: Mutex<RecoveryStats>,
}

impl RecoveryOrchestrator {
    /// Create an orchestrator with the given plans and register the built-in
    /// action handlers.
    #[must_use]
    pub fn new(plans: HashMap<String, RecoveryPlan>, services: ServiceHandles) -> Self {
        let orchestrator = Self {
            plans,
            handlers: DashMap::new(),
            services,
            in_flight: AtomicBool::new(false),
            history: Mutex::new(VecDeque::with_capacity(DEFAULT_HISTORY_LIMIT)),
            history_limit: DEFAULT_HISTORY_LIMIT,
            stats: Mutex::new(RecoveryStats::default()),
        };
        super::handlers::register_defaults(&orchestrator);
        orchestrator
    }

    /// Override how many executions the history retains.
    #[must_use]
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    /// Register (or replace) the handler for an action type. Callers add
    /// handlers for new action types without modifying the orchestrator.
    pub fn register_handler<S: Into<String>>(&self, action_type: S, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(action_type.into(), handler);
    }

    /// The plan registered for `mode`, if any.
    #[must_use]
    pub fn plan(&self, mode: &str) -> Option<&RecoveryPlan> {
        self.plans.get(mode)
    }

    /// Most recent executions, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<RecoveryExecution> {
        lock(&self.history).iter().cloned().collect()
    }

    #[must_use]
    pub fn stats(&self) -> RecoveryStats {
        *lock(&self.stats)
    }

    /// Whether an execution is currently running.
    #[must_use]
    pub fn is_executing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Execute the recovery plan for `mode`.
    ///
    /// Actions run strictly in declared order. Once a required action fails,
    /// the remaining actions are marked skipped without executing. Each
    /// handler is raced against its action's deadline; the plan as a whole is
    /// bounded by the plan's total deadline. The in-flight slot is released
    /// on every path, including cancellation.
    pub async fn execute_recovery(&self, mode: &str) -> RecoveryExecution {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(mode, "recovery already in flight, skipping request");
            return RecoveryExecution::skipped(mode);
        }
        let _guard = InFlightGuard {
            flag: &self.in_flight,
        };

        let started_at = Utc::now();
        let started = Instant::now();

        let Some(plan) = self.plans.get(mode) else {
            tracing::warn!(mode, "no recovery plan registered for mode");
            let execution = RecoveryExecution::failed(
                mode,
                started_at,
                format!("no recovery plan registered for mode `{mode}`"),
            );
            self.record(&execution);
            self.services.emitter.recovery_completed(&execution);
            return execution;
        };

        tracing::info!(mode, actions = plan.actions.len(), "executing recovery plan");
        self.services
            .emitter
            .recovery_started(mode, plan.start_message.as_deref());

        if !plan.initial_delay.is_zero() {
            sleep(plan.initial_delay).await;
        }

        let (outcomes, plan_timed_out) = self.run_actions(plan, started).await;
        let outcome = aggregate(&outcomes, plan_timed_out);

        let execution = RecoveryExecution {
            id: Uuid::new_v4(),
            mode: mode.to_owned(),
            started_at,
            elapsed: started.elapsed(),
            actions: outcomes,
            outcome,
            reason: None,
        };

        if outcome == RecoveryOutcome::Failed {
            self.apply_fallback(mode, &plan.fallback).await;
        }

        self.record(&execution);
        self.services.emitter.recovery_completed(&execution);
        tracing::info!(mode, %outcome, elapsed = ?execution.elapsed, "recovery plan finished");
        execution
    }

    async fn run_actions(
        &self,
        plan: &RecoveryPlan,
        started: Instant,
    ) -> (Vec<ActionOutcome>, bool) {
        let mut outcomes = Vec::with_capacity(plan.actions.len());
        let mut required_failure = false;
        let mut plan_timed_out = false;

        for (index, action) in plan.actions.iter().enumerate() {
            if plan_timed_out || started.elapsed() >= plan.total_timeout {
                plan_timed_out = true;
                outcomes.push(ActionOutcome::skipped(
                    action,
                    "recovery plan deadline exceeded",
                ));
                continue;
            }

            if required_failure {
                outcomes.push(ActionOutcome::skipped(
                    action,
                    "an earlier required action failed",
                ));
            } else {
                let outcome = self.run_action(plan, action).await;
                if outcome.status != ActionStatus::Success && action.required {
                    required_failure = true;
                }
                outcomes.push(outcome);
            }

            // The settling delay applies between actions regardless of outcome.
            if index + 1 < plan.actions.len() && !plan.inter_action_delay.is_zero() {
                sleep(plan.inter_action_delay).await;
            }
        }

        (outcomes, plan_timed_out)
    }

    async fn run_action(&self, plan: &RecoveryPlan, action: &RecoveryAction) -> ActionOutcome {
        let Some(handler) = self
            .handlers
            .get(&action.action_type)
            .map(|entry| Arc::clone(entry.value()))
        else {
            tracing::warn!(action = %action.action_type, "no handler registered for recovery action");
            return ActionOutcome::failed(action, "no handler registered", Duration::ZERO);
        };

        let mut attempt = 0_u32;
        loop {
            attempt += 1;
            let attempt_started = Instant::now();

            // Race the handler against the action deadline. The losing future
            // is dropped, not cancelled: its underlying work may keep running
            // but its result is no longer awaited.
            let outcome = match timeout(
                action.timeout,
                handler.execute(&action.params, &self.services),
            )
            .await
            {
                Ok(Ok(report)) if report.success => {
                    ActionOutcome::success(action, report.detail, attempt_started.elapsed())
                }
                Ok(Ok(report)) => ActionOutcome::failed(
                    action,
                    report
                        .detail
                        .unwrap_or_else(|| "handler reported failure".to_owned()),
                    attempt_started.elapsed(),
                ),
                Ok(Err(e)) => ActionOutcome::failed(action, e.to_string(), attempt_started.elapsed()),
                Err(_elapsed) => ActionOutcome::timed_out(action, attempt_started.elapsed()),
            };

            if outcome.status == ActionStatus::Success || attempt > plan.retry_count {
                return outcome;
            }

            tracing::debug!(
                action = %action.action_type,
                attempt,
                status = %outcome.status,
                "recovery action did not succeed, retrying"
            );
            if !plan.retry_delay.is_zero() {
                sleep(plan.retry_delay).await;
            }
        }
    }

    async fn apply_fallback(&self, mode: &str, policy: &FallbackPolicy) {
        let FallbackAction::Action(action_type) = &policy.action else {
            return;
        };

        if policy.prompt_required {
            self.services
                .emitter
                .fallback_prompt(mode, policy.prompt_message.as_deref(), action_type);
            return;
        }

        let Some(handler) = self
            .handlers
            .get(action_type)
            .map(|entry| Arc::clone(entry.value()))
        else {
            tracing::warn!(action = %action_type, "fallback action has no registered handler");
            return;
        };

        tracing::info!(mode, action = %action_type, "executing fallback action");
        match handler.execute(&Value::Null, &self.services).await {
            Ok(report) if report.success => {}
            Ok(report) => {
                tracing::warn!(action = %action_type, detail = ?report.detail, "fallback action reported failure");
            }
            Err(e) => {
                tracing::warn!(action = %action_type, error = %e, "fallback action failed");
            }
        }
    }

    fn record(&self, execution: &RecoveryExecution) {
        let mut history = lock(&self.history);
        if history.len() == self.history_limit {
            history.pop_front();
        }
        history.push_back(execution.clone());
        drop(history);

        let mut stats = lock(&self.stats);
        stats.total += 1;
        match execution.outcome {
            RecoveryOutcome::Success => stats.success += 1,
            RecoveryOutcome::Partial => stats.partial += 1,
            RecoveryOutcome::Failed | RecoveryOutcome::Timeout => stats.failed += 1,
            RecoveryOutcome::Skipped => {}
        }
    }
}

fn aggregate(outcomes: &[ActionOutcome], plan_timed_out: bool) -> RecoveryOutcome {
    if plan_timed_out {
        return RecoveryOutcome::Timeout;
    }

    let mut all_success = true;
    for outcome in outcomes {
        match outcome.status {
            ActionStatus::Success => {}
            ActionStatus::Failed | ActionStatus::TimedOut => {
                if outcome.required {
                    return RecoveryOutcome::Failed;
                }
                all_success = false;
            }
            ActionStatus::Skipped => all_success = false,
        }
    }

    if all_success {
        RecoveryOutcome::Success
    } else {
        RecoveryOutcome::Partial
    }
}

/// Releases the in-flight slot on every exit path, including panics and
/// cancellation.
struct InFlightGuard<'flag> {
    flag: &'flag AtomicBool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Recover from a poisoned lock; the guarded collections have no inconsistent
/// intermediate state.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
