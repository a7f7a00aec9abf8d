//! Execution plan types.
//!
//! A [`Plan`] is the ordered, immutable list of steps the applier runs. A
//! replacement is split into a `CreateReplacement` and a `DeleteReplaced`
//! step so that each provider call commits on its own.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::graph::{ResourceNode, ResourceType};

use super::diff::{OperationKind, PropertyDelta, ReplacementDowntimeWarning};

/// A complete execution plan.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Hash of the description this plan converges to.
    pub description_hash: String,
    /// Steps in execution order.
    pub steps: Vec<PlanStep>,
    /// Downtime warnings that need acknowledgement.
    pub warnings: Vec<ReplacementDowntimeWarning>,
}

/// A single planned provider call.
#[derive(Debug, Clone, Serialize)]
pub struct PlanStep {
    /// Position in the plan.
    pub index: usize,
    /// What the step does.
    pub action: StepAction,
    /// Operation this step belongs to.
    pub operation: OperationKind,
    /// Logical name.
    pub name: String,
    /// Resource type.
    pub resource_type: ResourceType,
    /// Declaration to provision (create and update steps).
    #[serde(skip)]
    pub desired: Option<ResourceNode>,
    /// Property delta (update steps).
    pub delta: PropertyDelta,
    /// Instance to delete or update, as known at plan time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub physical_id: Option<String>,
    /// Indices of steps that must commit first.
    pub after: Vec<usize>,
    /// Why this step exists.
    pub reason: String,
    /// Whether the step belongs to a delete-before-create replacement.
    pub downtime: bool,
}

/// Types of plan steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    /// Create a new resource.
    Create,
    /// Change a resource in place.
    Update,
    /// Delete a resource that is no longer declared.
    Delete,
    /// Create the new instance of a replaced resource.
    CreateReplacement,
    /// Delete an old instance of a replaced resource.
    DeleteReplaced,
}

impl StepAction {
    /// Returns true for steps that bring declared resources into being.
    #[must_use]
    pub const fn is_provisioning(self) -> bool {
        matches!(self, Self::Create | Self::Update | Self::CreateReplacement)
    }
}

/// Counts of planned changes per operation kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    /// Resources to create.
    pub create: usize,
    /// Resources to update in place.
    pub update: usize,
    /// Resources to replace.
    pub replace: usize,
    /// Resources or instances to delete.
    pub delete: usize,
}

impl Plan {
    /// Creates an empty plan (no changes needed).
    #[must_use]
    pub fn empty(description_hash: &str) -> Self {
        Self {
            created_at: Utc::now(),
            description_hash: description_hash.to_string(),
            steps: vec![],
            warnings: vec![],
        }
    }

    /// Returns true if the plan is empty (no changes).
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Returns the number of steps.
    #[must_use]
    pub const fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if any replacement has downtime.
    #[must_use]
    pub fn has_downtime(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Returns the position of the first step for a logical name and action.
    #[must_use]
    pub fn position(&self, name: &str, action: StepAction) -> Option<usize> {
        self.steps
            .iter()
            .position(|s| s.name == name && s.action == action)
    }

    /// Summarises the plan per operation kind.
    #[must_use]
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for step in &self.steps {
            match (step.operation, step.action) {
                (OperationKind::Create, _) => summary.create += 1,
                (OperationKind::Update, _) => summary.update += 1,
                (OperationKind::Replace, StepAction::CreateReplacement) => summary.replace += 1,
                (OperationKind::Replace, _) => {}
                (OperationKind::Delete, _) => summary.delete += 1,
            }
        }
        summary
    }
}

impl PlanStep {
    /// Returns a human-readable description of the step.
    #[must_use]
    pub fn description(&self) -> String {
        match self.action {
            StepAction::Create => format!("Create {} '{}'", self.resource_type, self.name),
            StepAction::Update => format!("Update {} '{}'", self.resource_type, self.name),
            StepAction::Delete => format!("Delete {} '{}'", self.resource_type, self.name),
            StepAction::CreateReplacement => {
                format!("Create replacement {} '{}'", self.resource_type, self.name)
            }
            StepAction::DeleteReplaced => format!(
                "Delete replaced {} '{}' ({})",
                self.resource_type,
                self.name,
                self.physical_id.as_deref().unwrap_or("unknown")
            ),
        }
    }
}

impl fmt::Display for StepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::CreateReplacement => "create-replacement",
            Self::DeleteReplaced => "delete-replaced",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for PlanStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.action, self.name)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.steps.is_empty() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Execution Plan ({} steps):", self.steps.len())?;
        for step in &self.steps {
            writeln!(f, "  {}. {step}", step.index)?;
        }

        if !self.warnings.is_empty() {
            writeln!(f, "\nDowntime:")?;
            for warning in &self.warnings {
                writeln!(f, "  - {}: {}", warning.resource, warning.reason)?;
            }
        }

        Ok(())
    }
}
