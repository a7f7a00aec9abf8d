//! Planning module for stack changes.
//!
//! This module handles the comparison between the desired graph and the
//! state snapshot, ordering the resulting operations into a plan, and
//! applying that plan against a provider.

mod applier;
mod diff;
mod order;
mod plan;

pub use applier::{ApplyReport, PlanApplier, StepOutcome, StepStatus};
pub use diff::{
    DiffEngine, DiffResult, Operation, OperationKind, PropertyChange, PropertyDelta,
    ReplaceStrategy, ReplacementDowntimeWarning,
};
pub use order::ExecutionPlanner;
pub use plan::{Plan, PlanStep, PlanSummary, StepAction};
