//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{ConfigHasher, ValidationResult};
use crate::planner::{ActionType, ChangePlan, PlannedAction};
use crate::reconciler::ReconciliationResult;
use crate::state::{LockInfo, StateSnapshot};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan action row for table display.
#[derive(Tabled)]
struct PlanActionRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Wave")]
    wave: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Type")]
    type_tag: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Resource row for state display.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Resource")]
    id: String,
    #[tabled(rename = "Type")]
    type_tag: String,
    #[tabled(rename = "Provider ID")]
    provider_id: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats a change plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &ChangePlan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(plan).unwrap_or_default(),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    /// Formats a plan as text.
    fn format_plan_text(plan: &ChangePlan, detailed: bool) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes required - infrastructure is up to date.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let title = if plan.destroy { "Destroy Plan" } else { "Change Plan" };
        let _ = writeln!(output, "\n{}", title.bold());
        let _ = writeln!(
            output,
            "   Config hash: {} (serial {})\n",
            ConfigHasher::new().short_hash(&plan.config_hash),
            plan.serial
        );

        let rows: Vec<PlanActionRow> = plan
            .actions
            .iter()
            .enumerate()
            .map(|(i, a)| PlanActionRow {
                index: i,
                wave: a.wave,
                action: Self::format_action(a),
                resource: a.node_id.clone(),
                type_tag: a.type_tag.clone(),
                reason: Self::truncate(&a.reason, 50),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            for action in plan.actions.iter().filter(|a| !a.details.is_empty()) {
                let _ = writeln!(output, "\n   {} {}:", action.symbol(), action.node_id);
                for detail in &action.details {
                    let old = detail
                        .old_value
                        .as_ref()
                        .map_or_else(|| String::from("(none)"), ToString::to_string);
                    let new = if detail.known_after_apply {
                        String::from("(known after apply)")
                    } else {
                        detail
                            .new_value
                            .as_ref()
                            .map_or_else(|| String::from("(removed)"), ToString::to_string)
                    };
                    let marker = if detail.forces_replacement {
                        " # forces replacement".red().to_string()
                    } else {
                        String::new()
                    };
                    let _ = writeln!(output, "       {}: {old} -> {new}{marker}", detail.field);
                }
            }
        }

        let replaced = plan.replace_count();
        let _ = writeln!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to destroy",
            plan.count(ActionType::Create).saturating_sub(replaced).to_string().green(),
            plan.count(ActionType::Update).to_string().yellow(),
            replaced.to_string().magenta(),
            plan.count(ActionType::Delete).saturating_sub(replaced).to_string().red()
        );

        if !plan.passes_guardrails {
            let _ = write!(output, "\n{} Guardrail violations:\n", "⚠".yellow());
            for violation in &plan.guardrail_violations {
                let _ = writeln!(output, "   - {violation}");
            }
        }

        output
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(
        &self,
        result: &ValidationResult,
        resources: usize,
        show_warnings: bool,
    ) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "valid": result.is_valid(),
                    "resources": resources,
                    "errors": result.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
                    "warnings": result.warnings,
                });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = String::new();
                if result.is_valid() {
                    let _ = writeln!(
                        output,
                        "{} Stack definition is valid ({resources} resources)",
                        "✓".green()
                    );
                } else {
                    let _ = writeln!(
                        output,
                        "{} Stack definition has {} errors:",
                        "✗".red(),
                        result.error_count()
                    );
                    for error in &result.errors {
                        let _ = writeln!(output, "   - {error}");
                    }
                }

                if show_warnings && result.warning_count() > 0 {
                    let _ = writeln!(output, "\n{} Warnings:", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }
                output
            }
        }
    }

    /// Formats a reconciliation result.
    #[must_use]
    pub fn format_reconciliation(&self, result: &ReconciliationResult) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(result).unwrap_or_default(),
            OutputFormat::Text => {
                let status = if result.success {
                    format!("{} Apply complete", "✓".green())
                } else if result.cancelled {
                    format!("{} Apply cancelled", "⚠".yellow())
                } else {
                    format!("{} Apply failed", "✗".red())
                };

                let mut output = format!("{status} (serial {})\n\n", result.serial);
                let _ = writeln!(output, "   Created: {}", result.created);
                let _ = writeln!(output, "   Updated: {}", result.updated);
                let _ = writeln!(output, "   Replaced: {}", result.replaced);
                let _ = writeln!(output, "   Deleted: {}", result.deleted);
                let _ = writeln!(output, "   Unchanged: {}", result.unchanged);

                if !result.errors.is_empty() {
                    let _ = write!(output, "\n{} Errors:\n", "⚠".yellow());
                    for error in &result.errors {
                        let _ = writeln!(output, "   - {error}");
                    }
                }
                for op in &result.report.skipped {
                    let _ = writeln!(output, "   {} {op} (dependency failed)", "skipped".dimmed());
                }
                for op in &result.report.not_started {
                    let _ = writeln!(output, "   {} {op}", "not started".dimmed());
                }

                output
            }
        }
    }

    /// Formats the snapshot.
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
                    "   Config hash: {}",
                    ConfigHasher::new().short_hash(&state.config_hash)
                );
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Resources: {}\n", state.resources.len());

                if !state.resources.is_empty() {
                    let rows: Vec<ResourceRow> = state
                        .resources
                        .values()
                        .map(|r| ResourceRow {
                            id: r.id.clone(),
                            type_tag: r.type_tag.clone(),
                            provider_id: Self::truncate(&r.provider_id, 32),
                            updated: r.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                        })
                        .collect();
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                if !state.deposed.is_empty() {
                    let _ = writeln!(output, "\n   Deposed instances awaiting deletion:");
                    for deposed in &state.deposed {
                        let _ = writeln!(output, "     - {} ({})", deposed.id, deposed.provider_id);
                    }
                }

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓" } else { "✗" };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} #{} ({})",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.serial,
                            entry.resources.join(", ")
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats lock information.
    #[must_use]
    pub fn format_lock(&self, lock: &LockInfo) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(lock).unwrap_or_default(),
            OutputFormat::Text => format!(
                "{} State locked by {} (lock {}, expires in {}s)\n",
                "✓".green(),
                lock.holder,
                lock.lock_id,
                lock.remaining_secs()
            ),
        }
    }

    /// Formats an action with color.
    fn format_action(action: &PlannedAction) -> String {
        let label = format!("{}{}", action.symbol(), action.action_type);
        let label = match action.replace {
            Some(strategy) => format!("{label} ({strategy})"),
            None => label,
        };
        match action.action_type {
            ActionType::Create => label.green().to_string(),
            ActionType::Update => label.yellow().to_string(),
            ActionType::Delete => label.red().to_string(),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }

    /// Formats a success message.
    #[must_use]
    pub fn success(&self, message: &str) -> String {
        self.message("success", &format!("{} {message}", "✓".green()), message)
    }

    /// Formats an error message.
    #[must_use]
    pub fn error(&self, message: &str) -> String {
        self.message("error", &format!("{} {message}", "✗".red()), message)
    }

    /// Formats a warning message.
    #[must_use]
    pub fn warning(&self, message: &str) -> String {
        self.message("warning", &format!("{} {message}", "⚠".yellow()), message)
    }

    fn message(&self, status: &str, text: &str, message: &str) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({ "status": status, "message": message });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => text.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ReferenceResolver, ResourceNode};
    use crate::planner::DiffEngine;
    use serde_json::json;

    fn sample_plan() -> ChangePlan {
        let nodes = vec![
            ResourceNode::new("vpc", "aws:ec2:Vpc", json!({"max_azs": 2}).as_object().unwrap()).unwrap(),
            ResourceNode::new(
                "sg",
                "aws:ec2:SecurityGroup",
                json!({"vpc_id": "${vpc.id}"}).as_object().unwrap(),
            )
            .unwrap(),
        ];
        let graph = ReferenceResolver::new().resolve(nodes).unwrap();
        let snapshot = StateSnapshot::new("demo", "dev");
        let diff = DiffEngine::new().compute_diff(&graph, &snapshot).unwrap();
        ChangePlan::from_diff(&diff, &graph, &snapshot, None, "0123456789abcdef").unwrap()
    }

    #[test]
    fn test_plan_text() {
        colored::control::set_override(false);
        let text = OutputFormatter::new(OutputFormat::Text).format_plan(&sample_plan(), true);

        assert!(text.contains("Change Plan"));
        assert!(text.contains("01234567"));
        assert!(text.contains("vpc_id: (none) -> (known after apply)"));
        assert!(text.contains("Plan: 2 to create, 0 to update, 0 to replace, 0 to destroy"));
    }

    #[test]
    fn test_plan_json_round_trips() {
        let json = OutputFormatter::new(OutputFormat::Json).format_plan(&sample_plan(), false);
        let parsed: ChangePlan = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.actions.len(), 2);
        assert_eq!(parsed.actions[1].dependencies, vec![0]);
    }

    #[test]
    fn test_empty_plan_text() {
        let text = OutputFormatter::new(OutputFormat::Text).format_plan(&ChangePlan::empty("h", 0), false);
        assert!(text.contains("No changes required"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("a-rather-long-reason", 10), "a-rathe...");
    }

    #[test]
    fn test_json_message() {
        let out = OutputFormatter::new(OutputFormat::Json).error("boom");
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["message"], "boom");
    }
}
