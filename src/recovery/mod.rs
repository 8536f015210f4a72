//! Recovery orchestration: one ordered, timeout-bounded, partially-tolerant
//! action plan per operating mode, with a fallback policy on total failure.

pub mod execution;
pub mod handlers;
pub mod orchestrator;
pub mod plan;

pub use execution::{ActionOutcome, ActionStatus, RecoveryExecution, RecoveryOutcome, RecoveryStats};
pub use orchestrator::{ActionHandler, ActionReport, RecoveryOrchestrator, ServiceHandles};
pub use plan::{FallbackAction, FallbackPolicy, RecoveryAction, RecoveryPlan, default_plans};
