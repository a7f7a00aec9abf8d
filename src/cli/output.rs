//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! plans, run reports and state to the user in text or JSON.

use colored::Colorize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{StackConfig, ValidationResult};
use crate::orchestrator::{Preview, RunOutcome};
use crate::planner::{Plan, PlanStep, StepAction, StepOutcome, StepStatus};
use crate::state::{LockInfo, RunKind, StateSnapshot};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan step row for table display.
#[derive(Tabled)]
struct PlanStepRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Step outcome row for table display.
#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Detail")]
    detail: String,
}

/// Recorded resource row for table display.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "Physical ID")]
    physical_id: String,
    #[tabled(rename = "Deposed")]
    deposed: usize,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns true when output is JSON.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Formats a dry-run preview.
    #[must_use]
    pub fn format_preview(&self, preview: &Preview, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(preview).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = Self::format_plan_text(&preview.plan, detailed);
                if preview.unchanged > 0 {
                    let _ = writeln!(output, "{} resource(s) unchanged.", preview.unchanged);
                }
                output
            }
        }
    }

    /// Formats a plan for display before confirmation.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(plan).unwrap_or_default(),
            OutputFormat::Text => Self::format_plan_text(plan, false),
        }
    }

    /// Formats a plan as text.
    fn format_plan_text(plan: &Plan, detailed: bool) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes required - stack is up to date.\n",
                "✓".green()
            );
        }

        let mut output = String::new();

        let _ = writeln!(output, "\nExecution Plan");
        let _ = writeln!(
            output,
            "   Description hash: {}\n",
            Self::short(&plan.description_hash)
        );

        let rows: Vec<PlanStepRow> = plan
            .steps
            .iter()
            .map(|s| PlanStepRow {
                index: s.index,
                action: Self::format_action(s.action),
                resource: s.name.clone(),
                resource_type: s.resource_type.to_string(),
                reason: Self::truncate(&s.reason, 48),
            })
            .collect();

        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            output.push_str("\nDetailed changes:\n");
            for step in &plan.steps {
                Self::write_step_detail(&mut output, step);
            }
        }

        let summary = plan.summary();
        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to delete\n",
            summary.create.to_string().green(),
            summary.update.to_string().yellow(),
            summary.replace.to_string().magenta(),
            summary.delete.to_string().red()
        );

        if plan.has_downtime() {
            let _ = write!(
                output,
                "\n{} Replacements with downtime (delete before create):\n",
                "⚠".yellow()
            );
            for warning in &plan.warnings {
                let _ = writeln!(
                    output,
                    "   - {} ({}): {}",
                    warning.resource, warning.resource_type, warning.reason
                );
            }
        }

        output
    }

    fn write_step_detail(output: &mut String, step: &PlanStep) {
        let _ = writeln!(output, "  {}. {}", step.index, step.description());
        for change in &step.delta.changes {
            let old = change
                .old
                .as_ref()
                .map_or_else(|| "(none)".to_string(), ToString::to_string);
            let new = change
                .new
                .as_ref()
                .map_or_else(|| "(removed)".to_string(), ToString::to_string);
            let _ = writeln!(output, "       {}: {old} -> {new}", change.key);
        }
        if step.delta.grants_changed {
            let _ = writeln!(output, "       grants changed");
        }
        for target in &step.delta.rebind {
            let _ = writeln!(output, "       re-point reference to '{target}'");
        }
        if !step.after.is_empty() {
            let after: Vec<String> = step.after.iter().map(ToString::to_string).collect();
            let _ = writeln!(output, "       after: {}", after.join(", "));
        }
    }

    /// Formats the outcome of an apply or destroy run.
    #[must_use]
    pub fn format_outcome(&self, outcome: &RunOutcome) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(outcome).unwrap_or_default(),
            OutputFormat::Text => {
                let Some(report) = &outcome.report else {
                    return format!("{} Nothing to do.\n", "✓".green());
                };

                let verb = match outcome.kind {
                    RunKind::Apply => "Apply",
                    RunKind::Destroy => "Destroy",
                };
                let status = if report.is_success() {
                    format!("{} {verb} complete", "✓".green())
                } else {
                    format!("{} {verb} halted", "✗".red())
                };

                let mut output = format!("\n{status}\n\n");
                let rows: Vec<OutcomeRow> = report.outcomes.iter().map(Self::outcome_row).collect();
                output.push_str(&Table::new(rows).to_string());
                output.push('\n');

                let _ = write!(
                    output,
                    "\n{} committed, {} failed, {} skipped\n",
                    report.committed().to_string().green(),
                    report.failed().to_string().red(),
                    report.skipped().to_string().yellow()
                );

                output
            }
        }
    }

    fn outcome_row(outcome: &StepOutcome) -> OutcomeRow {
        let (status, detail) = match &outcome.status {
            StepStatus::Committed { physical_id } => (
                "committed".green().to_string(),
                physical_id.clone().unwrap_or_default(),
            ),
            StepStatus::Failed { error } => {
                ("failed".red().to_string(), Self::truncate(error, 60))
            }
            StepStatus::TimedOut => (
                "timed out".red().to_string(),
                "outcome unknown".to_string(),
            ),
            StepStatus::Skipped { reason } => ("skipped".dimmed().to_string(), reason.clone()),
        };

        OutcomeRow {
            index: outcome.index,
            action: Self::format_action(outcome.action),
            resource: outcome.name.clone(),
            status,
            detail,
        }
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(
        &self,
        config: &StackConfig,
        result: &ValidationResult,
        show_warnings: bool,
    ) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "valid": result.is_valid(),
                    "project": config.project.name,
                    "environment": config.project.environment,
                    "resources": config.resources.len(),
                    "warnings": result.warnings,
                });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = format!("{} Configuration is valid!\n", "✓".green());

                if show_warnings && !result.warnings.is_empty() {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                } else if result.warning_count() > 0 {
                    let _ = writeln!(
                        output,
                        "{} warning(s); use --warnings to show them.",
                        result.warning_count()
                    );
                }

                let _ = writeln!(output, "\nConfiguration summary:");
                let _ = writeln!(output, "   Project: {}", config.project.name);
                let _ = writeln!(output, "   Environment: {}", config.project.environment);
                let _ = writeln!(output, "   Resources: {}", config.resources.len());
                output
            }
        }
    }

    /// Formats a state summary.
    #[must_use]
    pub fn format_state(&self, state: &StateSnapshot) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(state).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = write!(
                    output,
                    "\nState: {}/{}\n\n",
                    state.project, state.environment
                );

                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Serial: {}", state.serial);
                let _ = writeln!(
                    output,
                    "   Description hash: {}",
                    Self::short(&state.description_hash)
                );
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Resources: {}", state.resources.len());

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓" } else { "✗" };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ({} committed, {} failed, {} skipped)",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.kind,
                            entry.committed,
                            entry.failed,
                            entry.skipped
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats the recorded resources as a table.
    #[must_use]
    pub fn format_resources(&self, state: &StateSnapshot) -> String {
        match self.format {
            OutputFormat::Json => {
                serde_json::to_string_pretty(&state.resources).unwrap_or_default()
            }
            OutputFormat::Text => {
                if state.resources.is_empty() {
                    return "No resources recorded.\n".to_string();
                }
                let rows: Vec<ResourceRow> = state
                    .resources
                    .values()
                    .map(|r| ResourceRow {
                        name: r.name.clone(),
                        resource_type: r.resource_type.to_string(),
                        physical_id: r.physical_id.clone(),
                        deposed: r.deposed.len(),
                        updated: r.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                    })
                    .collect();
                let mut output = Table::new(rows).to_string();
                output.push('\n');
                output
            }
        }
    }

    /// Formats lease information.
    #[must_use]
    pub fn format_lock(&self, lock: &LockInfo) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(lock).unwrap_or_default(),
            OutputFormat::Text => format!(
                "State locked: {} (holder {}, expires in {}s)\n",
                lock.lock_id,
                lock.holder,
                lock.remaining_secs()
            ),
        }
    }

    /// Formats a step action with color.
    fn format_action(action: StepAction) -> String {
        match action {
            StepAction::Create => "+create".green().to_string(),
            StepAction::Update => "~update".yellow().to_string(),
            StepAction::Delete => "-delete".red().to_string(),
            StepAction::CreateReplacement => "+create-replacement".magenta().to_string(),
            StepAction::DeleteReplaced => "-delete-replaced".magenta().to_string(),
        }
    }

    fn short(hash: &str) -> &str {
        if hash.is_empty() {
            "(none)"
        } else {
            &hash[..12.min(hash.len())]
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{head}...")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::graph::GraphBuilder;
    use crate::planner::{DiffEngine, ExecutionPlanner};

    const STACK: &str = r"
project: { name: shop }
resources:
  orders:
    type: key-value-table
    properties: { name: orders, partition_key: OrderID, partition_key_type: string }
  checkout:
    type: compute-function
    properties: { name: checkout, runtime: go1.x, handler: main, env.TABLE: { ref: orders } }
    grants: [ { resource: orders, access: read-write } ]
";

    fn fresh_plan() -> Plan {
        let config = ConfigParser::new().parse_yaml(STACK, None).unwrap();
        let graph = GraphBuilder::new().build_config(&config).unwrap();
        let snapshot = StateSnapshot::new("shop", "dev");
        let diff = DiffEngine::new().compute(&graph, &snapshot).unwrap();
        ExecutionPlanner::new()
            .plan(&diff, &graph, &snapshot, "0123456789abcdef")
            .unwrap()
    }

    #[test]
    fn test_empty_plan_text() {
        let formatter = OutputFormatter::new(OutputFormat::Text);
        let output = formatter.format_plan(&Plan::empty("abc"));
        assert!(output.contains("No changes required"));
    }

    #[test]
    fn test_plan_text_lists_steps() {
        let formatter = OutputFormatter::new(OutputFormat::Text);
        let preview = Preview {
            plan: fresh_plan(),
            unchanged: 0,
        };
        let output = formatter.format_preview(&preview, true);

        assert!(output.contains("0123456789ab"));
        assert!(output.contains("orders"));
        assert!(output.contains("checkout"));
        assert!(output.contains("Detailed changes"));
        assert!(output.contains("to create"));
    }

    #[test]
    fn test_plan_json_is_machine_readable() {
        let formatter = OutputFormatter::new(OutputFormat::Json);
        let output = formatter.format_plan(&fresh_plan());
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();

        let steps = value["steps"].as_array().unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0]["name"], "orders");
        assert_eq!(steps[0]["action"], "create");
        assert_eq!(steps[1]["after"], serde_json::json!([0]));
    }

    #[test]
    fn test_resources_empty() {
        let formatter = OutputFormatter::new(OutputFormat::Text);
        let output = formatter.format_resources(&StateSnapshot::new("shop", "dev"));
        assert!(output.contains("No resources recorded"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("abcdefghijkl", 8), "abcde...");
    }
}
