//! Planning module for change operations.
//!
//! This module compares the desired graph with the last applied snapshot,
//! orders the resulting operations and applies them against a provider.

mod diff;
mod executor;
mod plan;

pub use diff::{DiffDetail, DiffEngine, DiffResult, DiffType, ResourceDiff};
pub use executor::{ActionResult, ActionStatus, DEFAULT_PARALLELISM, ExecutionResult, PlanExecutor};
pub use plan::{ActionType, ChangePlan, PlannedAction};
