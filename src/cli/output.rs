//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use std::collections::BTreeMap;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{InfraConfig, ValidationResult};
use crate::planner::{ActionType, ApplyOutcome, ApplyReport, ChangeAction, DiffDetail, DiffEngine, Plan};
use crate::reconciler::{DriftReport, RefreshReport};
use crate::state::{ApplyHistoryEntry, LockInfo, ObservedResource};

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
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Changes")]
    changes: String,
}

/// Apply result row for table display.
#[derive(Tabled)]
struct ResultRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Outcome")]
    outcome: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
}

/// Recorded resource row for table display.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Depends on")]
    depends_on: String,
    #[tabled(rename = "Applied")]
    applied: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns true for JSON output.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Formats a change plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&PlanJson::new(plan, detailed))
                .unwrap_or_default(),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    /// Formats a plan as text.
    fn format_plan_text(plan: &Plan, detailed: bool) -> String {
        if plan.is_converged() {
            return format!(
                "{} No changes required - infrastructure is up to date.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let _ = writeln!(output, "\nChange plan");
        let _ = write!(
            output,
            "   Model fingerprint: {}\n\n",
            short_hash(&plan.fingerprint)
        );

        let rows: Vec<PlanActionRow> = plan
            .changes()
            .into_iter()
            .enumerate()
            .map(|(i, a)| PlanActionRow {
                index: i + 1,
                action: Self::format_action_type(a.action.action_type()),
                kind: a.action.kind().to_string(),
                resource: a.action.name().to_string(),
                changes: Self::truncate(&a.action.changed_keys().join(", "), 40),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            output.push('\n');
            for planned in plan.changes() {
                let action = &planned.action;
                let _ = writeln!(
                    output,
                    "{} {} {}",
                    action.action_type().marker(),
                    action.kind(),
                    action.name()
                );
                for detail in action_details(action) {
                    let _ = writeln!(output, "     {}", format_detail(&detail));
                }
            }
        }

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to destroy, {} unchanged\n",
            plan.create_count().to_string().green(),
            plan.update_count().to_string().yellow(),
            plan.delete_count().to_string().red(),
            plan.noop_count()
        );

        output
    }

    /// Formats the result of an apply cycle.
    #[must_use]
    pub fn format_report(&self, report: &ApplyReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => {
                let status = if report.is_success() {
                    format!("{} Apply complete", "✓".green())
                } else {
                    format!("{} Apply finished with failures", "✗".red())
                };

                let rows: Vec<ResultRow> = report
                    .results
                    .iter()
                    .filter(|r| r.action != ActionType::NoOp)
                    .map(|r| ResultRow {
                        resource: r.name.clone(),
                        action: Self::format_action_type(r.action),
                        outcome: Self::format_outcome(&r.outcome),
                        attempts: r.attempts,
                    })
                    .collect();

                let mut output = format!("{status}\n\n");
                if !rows.is_empty() {
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }
                let _ = write!(
                    output,
                    "\n{} applied, {} deleted, {} unchanged, {} failed, {} skipped, {} cancelled\n",
                    report.applied,
                    report.deleted,
                    report.unchanged,
                    report.failed,
                    report.skipped,
                    report.cancelled
                );

                let unreconciled = report.unreconciled();
                if !unreconciled.is_empty() {
                    let _ = writeln!(
                        output,
                        "{} Unreconciled: {}",
                        "⚠".yellow(),
                        unreconciled.join(", ")
                    );
                }
                output
            }
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => {
                if report.is_converged() {
                    return format!("{} No drift detected - state is converged.\n", "✓".green());
                }

                let mut output = format!("{} Drift detected:\n\n", "⚠".yellow());
                for diff in &report.pending {
                    let _ = writeln!(output, "   {diff}");
                }
                for drift in &report.live {
                    if drift.missing {
                        let _ = writeln!(
                            output,
                            "   {} {} {}",
                            drift.kind,
                            drift.name,
                            "(deleted outside converge)".red()
                        );
                        continue;
                    }
                    let _ = writeln!(output, "   {} {} (changed outside converge)", drift.kind, drift.name);
                    for detail in &drift.details {
                        let _ = writeln!(output, "      {}", format_detail(detail));
                    }
                }
                let _ = write!(
                    output,
                    "\n{} pending, {} changed outside converge ({} declared, {} recorded)\n",
                    report.pending.len(),
                    report.live.len(),
                    report.total_resources,
                    report.observed_count
                );
                output
            }
        }
    }

    /// Formats the outcome of a refresh.
    #[must_use]
    pub fn format_refresh(&self, report: &RefreshReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = format!(
                    "Refreshed {} resources ({} updated, {} gone)\n",
                    report.observed.len() + report.dropped.len(),
                    report.updated.len(),
                    report.dropped.len()
                );
                for name in &report.dropped {
                    let _ = writeln!(output, "   {} {name}", "-".red());
                }
                output
            }
        }
    }

    /// Formats a validation result with a declaration summary.
    #[must_use]
    pub fn format_validation(
        &self,
        config: &InfraConfig,
        result: &ValidationResult,
        show_warnings: bool,
    ) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&serde_json::json!({
                "valid": result.is_valid(),
                "project": config.qualified_name(),
                "resources": config.resources.len(),
                "errors": result.errors,
                "warnings": result.warnings,
            }))
            .unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = if result.is_valid() {
                    format!("{} Declaration is valid\n", "✓".green())
                } else {
                    format!("{} Declaration has {} errors\n", "✗".red(), result.error_count())
                };
                for error in &result.errors {
                    let _ = writeln!(output, "   - {}: {}", error.field, error.message);
                }
                if show_warnings && !result.warnings.is_empty() {
                    let _ = writeln!(output, "\n{} Warnings:", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }

                let _ = writeln!(output, "\nSummary:");
                let _ = writeln!(output, "   Project: {}", config.project.name);
                let _ = writeln!(output, "   Environment: {}", config.project.environment);
                let _ = writeln!(output, "   Resources: {}", config.resources.len());
                let disabled = config.resources.iter().filter(|r| !r.enabled).count();
                if disabled > 0 {
                    let _ = writeln!(output, "   Disabled: {disabled}");
                }
                output
            }
        }
    }

    /// Formats the state summary and recent history.
    #[must_use]
    pub fn format_state(
        &self,
        backend: &str,
        resources: &BTreeMap<String, ObservedResource>,
        history: &[ApplyHistoryEntry],
        lock: Option<&LockInfo>,
    ) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&serde_json::json!({
                "backend": backend,
                "resources": resources,
                "history": history,
                "lock": lock,
            }))
            .unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = writeln!(output, "\nState ({backend})\n");
                let _ = writeln!(output, "   Resources: {}", resources.len());
                match lock {
                    Some(lock) => {
                        let _ = writeln!(
                            output,
                            "   Locked by {} ({}s left, id {})",
                            lock.holder,
                            lock.remaining_secs(),
                            lock.lock_id
                        );
                    }
                    None => {
                        let _ = writeln!(output, "   Unlocked");
                    }
                }

                if !history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", history.len());
                    for entry in history.iter().rev().take(5) {
                        let status = if entry.success { "✓".green() } else { "✗".red() };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} [{}] ({})",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            short_hash(&entry.fingerprint),
                            entry.resources.join(", ")
                        );
                    }
                }
                output
            }
        }
    }

    /// Formats recorded resources as a table.
    #[must_use]
    pub fn format_resources(&self, resources: &BTreeMap<String, ObservedResource>) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(resources).unwrap_or_default(),
            OutputFormat::Text => {
                if resources.is_empty() {
                    return String::from("No resources recorded.\n");
                }
                let rows: Vec<ResourceRow> = resources
                    .values()
                    .map(|r| ResourceRow {
                        name: r.name.clone(),
                        kind: r.kind.to_string(),
                        id: r.provider_id.clone(),
                        depends_on: Self::truncate(&r.depends_on.join(", "), 40),
                        applied: r.applied_at.format("%Y-%m-%d %H:%M").to_string(),
                    })
                    .collect();
                let mut output = Table::new(rows).to_string();
                output.push('\n');
                output
            }
        }
    }

    /// Formats an action type with color.
    fn format_action_type(action_type: ActionType) -> String {
        match action_type {
            ActionType::Create => "+create".green().to_string(),
            ActionType::Update => "~update".yellow().to_string(),
            ActionType::Delete => "-delete".red().to_string(),
            ActionType::NoOp => "noop".dimmed().to_string(),
        }
    }

    /// Formats an apply outcome with color.
    fn format_outcome(outcome: &ApplyOutcome) -> String {
        match outcome {
            ApplyOutcome::Applied(record) => format!("{} {}", "applied".green(), record.provider_id),
            ApplyOutcome::Deleted => "deleted".green().to_string(),
            ApplyOutcome::Unchanged => "unchanged".dimmed().to_string(),
            ApplyOutcome::Failed { error, consistent } => {
                let suffix = if *consistent { "" } else { " (state unknown)" };
                format!("{} {}{suffix}", "failed".red(), Self::truncate(error, 60))
            }
            ApplyOutcome::Skipped { blocked_by } => {
                format!("{} (blocked by {blocked_by})", "skipped".yellow())
            }
            ApplyOutcome::Cancelled => "cancelled".yellow().to_string(),
        }
    }

    /// Truncates a string to a maximum length.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }
}

/// First eight characters of a hash.
fn short_hash(hash: &str) -> &str {
    hash.get(..8).unwrap_or(hash)
}

/// Per-attribute details of a planned action.
fn action_details(action: &ChangeAction) -> Vec<DiffDetail> {
    let engine = DiffEngine::new();
    match action {
        ChangeAction::Create { spec } => engine.diff_resource(spec, None).details,
        ChangeAction::Update { spec, observed, .. } => {
            engine.diff_resource(spec, Some(observed)).details
        }
        ChangeAction::Delete { observed } => engine.diff_removed(observed).details,
        ChangeAction::NoOp { .. } => Vec::new(),
    }
}

/// Renders one attribute change.
fn format_detail(detail: &DiffDetail) -> String {
    let render = |v: &Option<serde_json::Value>| {
        v.as_ref().map_or_else(|| String::from("(none)"), ToString::to_string)
    };
    format!(
        "{}: {} -> {}",
        detail.field,
        render(&detail.old_value),
        render(&detail.new_value)
    )
}

// JSON serialization helpers

#[derive(serde::Serialize)]
struct PlanJson {
    fingerprint: String,
    created_at: String,
    converged: bool,
    creates: usize,
    updates: usize,
    deletes: usize,
    unchanged: usize,
    actions: Vec<ActionJson>,
}

#[derive(serde::Serialize)]
struct ActionJson {
    action: String,
    kind: String,
    resource: String,
    changed: Vec<String>,
    depends_on: Vec<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Vec<DiffDetail>>,
}

impl PlanJson {
    fn new(plan: &Plan, detailed: bool) -> Self {
        Self {
            fingerprint: plan.fingerprint.clone(),
            created_at: plan.created_at.to_rfc3339(),
            converged: plan.is_converged(),
            creates: plan.create_count(),
            updates: plan.update_count(),
            deletes: plan.delete_count(),
            unchanged: plan.noop_count(),
            actions: plan
                .actions
                .iter()
                .map(|a| ActionJson {
                    action: a.action.action_type().to_string(),
                    kind: a.action.kind().to_string(),
                    resource: a.action.name().to_string(),
                    changed: a
                        .action
                        .changed_keys()
                        .into_iter()
                        .map(String::from)
                        .collect(),
                    depends_on: a.dependencies.clone(),
                    details: detailed.then(|| action_details(&a.action)),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::model::ResourceModel;
    use crate::planner::Planner;

    fn plan() -> Plan {
        let config = ConfigParser::new()
            .parse_yaml(
                "project:\n  name: ref\nresources:\n  - { name: vpc1, kind: network, attributes: { cidr_block: 10.0.0.0/16 } }\n",
                None,
            )
            .unwrap();
        let model = ResourceModel::load(&config).unwrap();
        Planner::new().plan(&model, &BTreeMap::new()).unwrap()
    }

    #[test]
    fn test_plan_json_lists_actions() {
        let json = OutputFormatter::new(OutputFormat::Json).format_plan(&plan(), true);
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["creates"], 1);
        assert_eq!(value["actions"][0]["resource"], "vpc1");
        assert_eq!(value["actions"][0]["action"], "create");
        assert!(value["actions"][0]["details"].is_array());
    }

    #[test]
    fn test_plan_text_shows_summary() {
        colored::control::set_override(false);
        let text = OutputFormatter::new(OutputFormat::Text).format_plan(&plan(), true);
        assert!(text.contains("vpc1"));
        assert!(text.contains("cidr_block: (none) -> \"10.0.0.0/16\""));
        assert!(text.contains("1 to create"));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("ééééééééééé", 6), "ééé...");
    }
}
