//! Built-in recovery action handlers.
//!
//! Each handler acts through the injected [`ServiceHandles`] only, so plans
//! stay meaningful in any composition. Callers register additional handlers
//! for custom action types via
//! [`RecoveryOrchestrator::register_handler`](super::RecoveryOrchestrator::register_handler).

use std::str::FromStr as _;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::sleep;

use super::orchestrator::{ActionHandler, ActionReport, RecoveryOrchestrator, ServiceHandles};
use crate::Result;
use crate::error::Error;
use crate::notify::Severity;
use crate::services::{BaselineLoader as _, ConnectionControl as _, LifecycleControl as _};

const DEFAULT_THRESHOLD_HOURS: u64 = 24;

pub(crate) fn register_defaults(orchestrator: &RecoveryOrchestrator) {
    orchestrator.register_handler("reconnect", Arc::new(ReconnectHandler));
    orchestrator.register_handler("resubscribe", Arc::new(ResubscribeHandler));
    orchestrator.register_handler("reload_baseline", Arc::new(ReloadBaselineHandler));
    orchestrator.register_handler("purge_stale", Arc::new(PurgeStaleHandler));
    orchestrator.register_handler("notify", Arc::new(NotifyHandler));
    orchestrator.register_handler("wait", Arc::new(WaitHandler));
    orchestrator.register_handler("restart_service", Arc::new(RestartServiceHandler));
}

fn param_u64(params: &Value, key: &str, fallback: u64) -> u64 {
    params.get(key).and_then(Value::as_u64).unwrap_or(fallback)
}

fn param_bool(params: &Value, key: &str, fallback: bool) -> bool {
    params.get(key).and_then(Value::as_bool).unwrap_or(fallback)
}

/// `reconnect`: open the connection; with `{"fresh": true}` the existing one
/// is torn down first.
pub struct ReconnectHandler;

#[async_trait]
impl ActionHandler for ReconnectHandler {
    async fn execute(&self, params: &Value, services: &ServiceHandles) -> Result<ActionReport> {
        if param_bool(params, "fresh", false) {
            services.connection.shutdown().await;
        }

        match services.connection.ensure_connected().await {
            Ok(_) if services.connection.is_online() => {
                Ok(ActionReport::succeeded_with("connection open"))
            }
            Ok(_) => Ok(ActionReport::failed("connection not established")),
            Err(e) => Ok(ActionReport::failed(e.to_string())),
        }
    }
}

/// `resubscribe`: replay the full subscription set on the wire.
pub struct ResubscribeHandler;

#[async_trait]
impl ActionHandler for ResubscribeHandler {
    async fn execute(&self, _params: &Value, services: &ServiceHandles) -> Result<ActionReport> {
        match services.connection.replay_subscriptions() {
            Ok(count) => Ok(ActionReport::succeeded_with(format!(
                "replayed {count} subscriptions"
            ))),
            Err(e) => Ok(ActionReport::failed(e.to_string())),
        }
    }
}

/// `reload_baseline`: re-run the baseline load and refresh the status cache.
/// Params: `{"threshold_hours": u64}`.
pub struct ReloadBaselineHandler;

#[async_trait]
impl ActionHandler for ReloadBaselineHandler {
    async fn execute(&self, params: &Value, services: &ServiceHandles) -> Result<ActionReport> {
        let threshold_hours = param_u64(params, "threshold_hours", DEFAULT_THRESHOLD_HOURS);
        let threshold = u32::try_from(threshold_hours).unwrap_or(u32::MAX);

        match services.loader.load(threshold).await {
            Ok(snapshot) => {
                for record in &snapshot.entities {
                    services.cache.apply_baseline(record);
                }
                Ok(ActionReport::succeeded_with(format!(
                    "reloaded {} baseline entities",
                    snapshot.entities.len()
                )))
            }
            Err(e) => Ok(ActionReport::failed(e.to_string())),
        }
    }
}

/// `purge_stale`: drop cache entries with no update inside the threshold
/// window. Params: `{"threshold_hours": u64}`.
pub struct PurgeStaleHandler;

#[async_trait]
impl ActionHandler for PurgeStaleHandler {
    async fn execute(&self, params: &Value, services: &ServiceHandles) -> Result<ActionReport> {
        let threshold_hours = param_u64(params, "threshold_hours", DEFAULT_THRESHOLD_HOURS);
        let purged = services
            .cache
            .purge_stale(Duration::from_secs(threshold_hours.saturating_mul(3600)));
        Ok(ActionReport::succeeded_with(format!(
            "purged {purged} stale entries"
        )))
    }
}

/// `notify`: surface a plan-defined message to the user.
/// Params: `{"message": string, "severity": "info"|"success"|"warning"|"error"}`.
pub struct NotifyHandler;

#[async_trait]
impl ActionHandler for NotifyHandler {
    async fn execute(&self, params: &Value, services: &ServiceHandles) -> Result<ActionReport> {
        let Some(message) = params.get("message").and_then(Value::as_str) else {
            // Treated by the orchestrator exactly like an unsuccessful report.
            return Err(Error::recovery("notify action requires a message"));
        };
        let severity = params
            .get("severity")
            .and_then(Value::as_str)
            .and_then(|raw| Severity::from_str(raw).ok())
            .unwrap_or(Severity::Info);

        services.emitter.toast(message, severity);
        Ok(ActionReport::succeeded())
    }
}

/// `wait`: settling delay expressed as a plan step.
/// Params: `{"duration_ms": u64}`.
pub struct WaitHandler;

#[async_trait]
impl ActionHandler for WaitHandler {
    async fn execute(&self, params: &Value, _services: &ServiceHandles) -> Result<ActionReport> {
        let duration = Duration::from_millis(param_u64(params, "duration_ms", 0));
        if !duration.is_zero() {
            sleep(duration).await;
        }
        Ok(ActionReport::succeeded())
    }
}

/// `restart_service`: full or connection-layer-only lifecycle restart.
/// Params: `{"full": bool}` (defaults to full).
pub struct RestartServiceHandler;

#[async_trait]
impl ActionHandler for RestartServiceHandler {
    async fn execute(&self, params: &Value, services: &ServiceHandles) -> Result<ActionReport> {
        let full = param_bool(params, "full", true);
        if services.lifecycle.restart_service(full).await {
            Ok(ActionReport::succeeded())
        } else {
            Ok(ActionReport::failed("service not running after restart"))
        }
    }
}
