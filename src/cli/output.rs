//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{DeployConfig, RuleTableHasher, RuleTargets, ValidationResult};
use crate::orchestrator::{DeploymentReport, Outcome, PlanPreview};
use crate::planner::{DeploymentPlan, ServiceOutcome};
use crate::runtime::{ServiceState, ServiceStatus};
use crate::state::{DeploymentState, LockInfo, OutcomeKind};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Path match row for table display.
#[derive(Tabled)]
struct MatchRow {
    #[tabled(rename = "Path")]
    path: String,
    #[tabled(rename = "Rule")]
    rule: String,
    #[tabled(rename = "Targets")]
    targets: String,
}

/// Service result row for table display.
#[derive(Tabled)]
struct ServiceRow {
    #[tabled(rename = "Service")]
    name: String,
    #[tabled(rename = "Result")]
    outcome: String,
    #[tabled(rename = "Image")]
    image: String,
    #[tabled(rename = "Time")]
    elapsed: String,
}

/// Runtime status row for table display.
#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "Service")]
    service: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Detail")]
    detail: String,
}

/// History row for table display.
#[derive(Tabled)]
struct HistoryRow {
    #[tabled(rename = "When")]
    timestamp: String,
    #[tabled(rename = "Range")]
    range: String,
    #[tabled(rename = "Plan")]
    plan: String,
    #[tabled(rename = "Outcome")]
    outcome: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats a dry-run plan.
    #[must_use]
    pub fn format_preview(&self, preview: &PlanPreview, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(preview),
            OutputFormat::Text => Self::format_preview_text(preview, detailed),
        }
    }

    fn format_preview_text(preview: &PlanPreview, detailed: bool) -> String {
        let mut output = String::new();

        let _ = writeln!(output, "\nDeployment plan for {}", preview.range);
        let _ = writeln!(
            output,
            "   Rules hash: {}",
            RuleTableHasher::new().short_hash(&preview.rules_hash)
        );

        if preview.overridden {
            let _ = writeln!(output, "   Operator override, diff not read");
        } else {
            let first = if preview.changes.is_first_deploy() {
                " (first deploy, every tracked file)"
            } else {
                ""
            };
            let _ = writeln!(
                output,
                "   Changed paths: {}{first}, unmatched: {}",
                preview.changes.len(),
                preview.resolution.unmatched()
            );
        }

        if detailed && !preview.resolution.matches.is_empty() {
            let rows: Vec<MatchRow> = preview
                .resolution
                .matches
                .iter()
                .map(|m| MatchRow {
                    path: truncate(&m.path, 60),
                    rule: m.rule.clone().unwrap_or_else(|| String::from("-")),
                    targets: m.targets.as_ref().map_or_else(
                        || String::from("-"),
                        |t| match t {
                            RuleTargets::All => String::from("all"),
                            RuleTargets::Services(names) if names.is_empty() => {
                                String::from("(none)")
                            }
                            RuleTargets::Services(names) => {
                                names.iter().cloned().collect::<Vec<_>>().join(", ")
                            }
                        },
                    ),
                })
                .collect();
            output.push('\n');
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');

            if preview.resolution.unexamined > 0 {
                let _ = writeln!(
                    output,
                    "   {} more paths not examined after an `all` rule matched",
                    preview.resolution.unexamined
                );
            }
        }

        let _ = write!(output, "\n{}\n", format_plan(&preview.resolution.plan));
        output
    }

    /// Formats a deployment report.
    #[must_use]
    pub fn format_report(&self, report: &DeploymentReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Text => Self::format_report_text(report),
        }
    }

    fn format_report_text(report: &DeploymentReport) -> String {
        let mut output = String::new();

        let _ = writeln!(output, "\nDeployment: {}", report.project);
        if let Some(range) = &report.range {
            let _ = writeln!(output, "   Range: {range}");
        }
        if report.trigger.force_all || report.trigger.services.is_some() {
            let _ = writeln!(output, "   Operator override");
        } else if report.range.is_some() {
            let first = if report.first_deploy { " (first deploy)" } else { "" };
            let _ = writeln!(output, "   Changed paths: {}{first}", report.changed_paths);
        }
        if let Some(plan) = &report.plan {
            let _ = writeln!(output, "   Plan: {plan}");
        }
        if !report.materialized.is_empty() {
            let _ = writeln!(output, "   Secrets written: {}", report.materialized.join(", "));
        }

        if let Some(result) = &report.result
            && !result.services.is_empty()
        {
            let rows: Vec<ServiceRow> = result
                .services
                .iter()
                .map(|s| ServiceRow {
                    name: s.name.clone(),
                    outcome: format_service_outcome(&s.outcome),
                    image: if s.image_pulled { "pulled" } else { "built" }.to_string(),
                    elapsed: format_millis(s.elapsed_ms),
                })
                .collect();
            output.push('\n');
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        for warning in &report.warnings {
            let _ = writeln!(output, "{} {warning}", "⚠".yellow());
        }

        let _ = write!(
            output,
            "\n{} ({})\n",
            format_outcome(&report.outcome),
            format_millis(report.elapsed_ms)
        );
        output
    }

    /// Formats runtime status.
    #[must_use]
    pub fn format_status(&self, config: &DeployConfig, statuses: &[ServiceStatus]) -> String {
        match self.format {
            OutputFormat::Json => to_json(&statuses),
            OutputFormat::Text => {
                let mut output = format!("\nProject: {}\n\n", config.qualified_name());

                if statuses.is_empty() {
                    output.push_str("   No services running.\n");
                    return output;
                }

                let rows: Vec<StatusRow> = statuses
                    .iter()
                    .map(|s| StatusRow {
                        service: s.service.clone(),
                        state: format_service_state(s.state),
                        detail: truncate(&s.detail, 40),
                    })
                    .collect();
                output.push_str(&Table::new(rows).to_string());
                output.push('\n');

                let running = statuses.iter().filter(|s| s.state.is_running()).count();
                let summary = if statuses.iter().all(|s| s.state.is_healthy()) {
                    "healthy".green().to_string()
                } else {
                    "degraded".yellow().to_string()
                };
                let _ = write!(
                    output,
                    "\nStatus: {summary} ({running}/{} running)\n",
                    statuses.len()
                );
                output
            }
        }
    }

    /// Formats recorded deployments, newest first.
    #[must_use]
    pub fn format_history(&self, state: Option<&DeploymentState>, limit: usize) -> String {
        let Some(state) = state else {
            return match self.format {
                OutputFormat::Json => String::from("[]"),
                OutputFormat::Text => String::from("No deployments recorded.\n"),
            };
        };

        match self.format {
            OutputFormat::Json => {
                let entries: Vec<_> = state.recent_history(limit).collect();
                to_json(&entries)
            }
            OutputFormat::Text => {
                let mut output = format!("\nState: {}/{}\n", state.project, state.environment);
                let _ = writeln!(
                    output,
                    "   Deployed revision: {}",
                    state.last_deployed_revision.as_deref().unwrap_or("none")
                );
                let _ = writeln!(output, "   Last updated: {}\n", state.last_updated);

                let rows: Vec<HistoryRow> = state
                    .recent_history(limit)
                    .map(|entry| HistoryRow {
                        timestamp: entry.timestamp.format("%Y-%m-%d %H:%M").to_string(),
                        range: format!(
                            "{}..{}",
                            short_revision(&entry.previous),
                            short_revision(&entry.current)
                        ),
                        plan: entry
                            .plan
                            .as_ref()
                            .map_or_else(|| String::from("-"), |p| truncate(&p.to_string(), 40)),
                        outcome: format_outcome_kind(entry.outcome),
                    })
                    .collect();

                if rows.is_empty() {
                    output.push_str("   No deployments recorded.\n");
                } else {
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }
                output
            }
        }
    }

    /// Formats the lock holder.
    #[must_use]
    pub fn format_lock(&self, lock: Option<&LockInfo>) -> String {
        match self.format {
            OutputFormat::Json => to_json(&lock),
            OutputFormat::Text => lock.map_or_else(
                || format!("{} Not locked.\n", "✓".green()),
                |lock| {
                    let expiry = if lock.is_expired() {
                        "expired".red().to_string()
                    } else {
                        format!("expires in {}s", lock.remaining_secs())
                    };
                    format!(
                        "{} Locked by {} since {} ({expiry})\n   Lock ID: {}\n",
                        "⚠".yellow(),
                        lock.holder,
                        lock.acquired_at.format("%Y-%m-%d %H:%M:%S"),
                        lock.lock_id
                    )
                },
            ),
        }
    }

    /// Formats a validation result with a configuration summary.
    #[must_use]
    pub fn format_validation(
        &self,
        config: &DeployConfig,
        result: &ValidationResult,
        show_warnings: bool,
    ) -> String {
        if self.format == OutputFormat::Json {
            return to_json(&ValidationJson {
                valid: result.is_valid(),
                errors: result.errors.iter().map(ToString::to_string).collect(),
                warnings: result.warnings.clone(),
                rules: config.rules.len(),
                services: config.declared_services(),
            });
        }

        let mut output = String::new();
        if result.is_valid() {
            let _ = writeln!(output, "{} Configuration is valid", "✓".green());
        } else {
            let _ = writeln!(output, "{} Configuration is invalid:", "✗".red());
            for error in &result.errors {
                let _ = writeln!(output, "   - {error}");
            }
        }

        if show_warnings && !result.warnings.is_empty() {
            let _ = writeln!(output, "\n{} Warnings:", "⚠".yellow());
            for warning in &result.warnings {
                let _ = writeln!(output, "   - {warning}");
            }
        }

        let _ = writeln!(output, "\nConfiguration summary:");
        let _ = writeln!(output, "   Project: {}", config.qualified_name());
        let _ = writeln!(output, "   Repository: {}", config.repository.path.display());
        let _ = writeln!(output, "   Rules: {}", config.rules.len());
        let _ = writeln!(
            output,
            "   Services with secrets: {}",
            config.services.iter().filter(|s| s.env_file.is_some()).count()
        );
        output
    }
}

#[derive(Serialize)]
struct ValidationJson<'a> {
    valid: bool,
    errors: Vec<String>,
    warnings: Vec<String>,
    rules: usize,
    services: Vec<&'a str>,
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

fn format_plan(plan: &DeploymentPlan) -> String {
    match plan {
        DeploymentPlan::NoOp => format!("{} Nothing to deploy", "✓".green()),
        DeploymentPlan::All => format!("{} {plan}", "!".yellow().bold()),
        DeploymentPlan::Subset(_) => format!("{} {plan}", "~".cyan()),
    }
}

fn format_outcome(outcome: &Outcome) -> String {
    match outcome {
        Outcome::NothingToDeploy | Outcome::Deployed => {
            format!("{} Deployment {outcome}", "✓".green())
        }
        Outcome::PartiallyFailed { .. } | Outcome::Cancelled => {
            format!("{} Deployment {outcome}", "⚠".yellow())
        }
        Outcome::Aborted { .. } | Outcome::StackFailure { .. } => {
            format!("{} Deployment {outcome}", "✗".red())
        }
    }
}

fn format_outcome_kind(kind: OutcomeKind) -> String {
    if kind.advances_revision() {
        kind.to_string().green().to_string()
    } else {
        kind.to_string().red().to_string()
    }
}

fn format_service_outcome(outcome: &ServiceOutcome) -> String {
    match outcome {
        ServiceOutcome::Succeeded => "succeeded".green().to_string(),
        ServiceOutcome::Failed(reason) => format!("{} {}", "failed".red(), truncate(reason, 50)),
        ServiceOutcome::Skipped(reason) => format!("{} {reason}", "skipped".dimmed()),
    }
}

fn format_service_state(state: ServiceState) -> String {
    if state.is_running() {
        state.to_string().green().to_string()
    } else if state.is_healthy() {
        state.to_string().dimmed().to_string()
    } else {
        state.to_string().red().to_string()
    }
}

fn format_millis(ms: u64) -> String {
    if ms < 1000 {
        format!("{ms}ms")
    } else {
        format!("{}.{}s", ms / 1000, (ms % 1000) / 100)
    }
}

fn short_revision(revision: &str) -> String {
    revision.chars().take(8).collect()
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
