//! Docker Compose runtime backend.
//!
//! This module drives `docker-compose` (or the `docker compose` plugin) as a
//! subprocess. Every invocation runs in the repository directory, with stdin
//! closed, and is bounded by the configured command timeout.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, trace};

use crate::config::RuntimeConfig;
use crate::error::{ConfigError, Result, RuntimeError, StackshiftError};

use super::backend::ContainerRuntime;
use super::types::{ServiceState, ServiceStatus, ServiceTarget};

/// Maximum number of stderr characters kept in an error.
const MAX_STDERR_CHARS: usize = 2000;

/// Compose-backed container runtime.
#[derive(Debug, Clone)]
pub struct ComposeRuntime {
    /// Program to execute (`docker-compose` or `docker`).
    program: String,
    /// Arguments placed before every subcommand (`compose`, `-f`, `-p`).
    base_args: Vec<String>,
    /// Working directory for every invocation.
    working_dir: PathBuf,
    /// Per-command timeout.
    timeout: Duration,
}

/// One line of `ps --format json` output.
#[derive(Debug, Deserialize)]
struct PsEntry {
    #[serde(rename = "Service")]
    service: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Status", default)]
    status: String,
    #[serde(rename = "ExitCode", default)]
    exit_code: Option<i64>,
}

impl ComposeRuntime {
    /// Creates a compose runtime from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the compose command is empty.
    pub fn from_config(runtime: &RuntimeConfig, repository: &Path) -> Result<Self> {
        let mut words = runtime.command.split_whitespace().map(str::to_string);
        let program = words.next().ok_or_else(|| {
            StackshiftError::Config(ConfigError::validation(
                "Compose command cannot be empty",
                "runtime.command",
            ))
        })?;

        let mut base_args: Vec<String> = words.collect();
        base_args.push(String::from("-f"));
        base_args.push(runtime.compose_file.display().to_string());
        if let Some(project) = &runtime.project_name {
            base_args.push(String::from("-p"));
            base_args.push(project.clone());
        }

        Ok(Self {
            program,
            base_args,
            working_dir: repository.to_path_buf(),
            timeout: Duration::from_secs(runtime.command_timeout_secs),
        })
    }

    /// Arguments for stopping the whole stack.
    fn stop_args(&self) -> Vec<String> {
        self.with_base(["down", "--remove-orphans"])
    }

    /// Arguments for pulling images.
    fn pull_args(&self, target: ServiceTarget<'_>) -> Vec<String> {
        let mut args = self.with_base(["pull"]);
        if let Some(service) = target.service() {
            args.push(service.to_string());
        }
        args
    }

    /// Arguments for building and starting services.
    fn up_args(&self, target: ServiceTarget<'_>, no_deps: bool) -> Vec<String> {
        let mut args = self.with_base(["up", "-d", "--build"]);
        if no_deps {
            args.push(String::from("--no-deps"));
        }
        if let Some(service) = target.service() {
            args.push(service.to_string());
        }
        args
    }

    /// Arguments for listing service status.
    fn ps_args(&self) -> Vec<String> {
        self.with_base(["ps", "--all", "--format", "json"])
    }

    /// Prepends the base arguments to a subcommand.
    fn with_base<const N: usize>(&self, subcommand: [&str; N]) -> Vec<String> {
        self.base_args
            .iter()
            .cloned()
            .chain(subcommand.iter().map(|s| (*s).to_string()))
            .collect()
    }

    /// Renders a command line for logs and errors.
    fn render(&self, args: &[String]) -> String {
        std::iter::once(self.program.as_str())
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Runs the compose program and returns its stdout.
    async fn run(&self, args: Vec<String>) -> std::result::Result<String, RuntimeError> {
        let rendered = self.render(&args);
        debug!("Running: {rendered}");

        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(RuntimeError::SpawnFailed {
                    command: rendered,
                    message: e.to_string(),
                });
            }
            Err(_) => {
                return Err(RuntimeError::Timeout {
                    command: rendered,
                    timeout_secs: self.timeout.as_secs(),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        trace!("stdout of '{rendered}': {stdout}");

        if output.status.success() {
            Ok(stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(RuntimeError::CommandFailed {
                command: rendered,
                status: output.status.to_string(),
                stderr: truncate(stderr.trim(), MAX_STDERR_CHARS),
            })
        }
    }
}

#[async_trait]
impl ContainerRuntime for ComposeRuntime {
    async fn stop_all(&self) -> std::result::Result<(), RuntimeError> {
        info!("Stopping all services");
        self.run(self.stop_args()).await.map(|_| ())
    }

    async fn pull_image(&self, target: ServiceTarget<'_>) -> std::result::Result<(), RuntimeError> {
        info!("Pulling images for {target}");
        self.run(self.pull_args(target)).await.map(|_| ())
    }

    async fn build_and_start(
        &self,
        target: ServiceTarget<'_>,
        no_deps: bool,
    ) -> std::result::Result<(), RuntimeError> {
        info!("Building and starting {target} (no_deps: {no_deps})");
        self.run(self.up_args(target, no_deps)).await.map(|_| ())
    }

    async fn list_status(&self) -> std::result::Result<Vec<ServiceStatus>, RuntimeError> {
        let stdout = self.run(self.ps_args()).await?;
        parse_ps_output(&stdout)
    }

    fn backend_type(&self) -> &'static str {
        "compose"
    }
}

/// Parses `ps --format json` output.
///
/// Older compose releases print a JSON array, newer ones print one object per
/// line. A service with several containers is reported by its least healthy
/// container.
fn parse_ps_output(stdout: &str) -> std::result::Result<Vec<ServiceStatus>, RuntimeError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let entries: Vec<PsEntry> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed).map_err(|e| RuntimeError::InvalidStatus {
            message: e.to_string(),
        })?
    } else {
        trimmed
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|e| RuntimeError::InvalidStatus {
                    message: format!("{e} in line: {line}"),
                })
            })
            .collect::<std::result::Result<_, _>>()?
    };

    let mut by_service: BTreeMap<String, ServiceStatus> = BTreeMap::new();
    for entry in entries {
        let status = ServiceStatus {
            state: ServiceState::with_exit_code(
                &entry.state,
                entry.exit_code.or_else(|| exit_code_from_status(&entry.status)),
            ),
            service: entry.service,
            detail: entry.status,
        };
        match by_service.get(&status.service) {
            Some(existing) if !existing.state.is_healthy() => {}
            _ => {
                by_service.insert(status.service.clone(), status);
            }
        }
    }

    Ok(by_service.into_values().collect())
}

/// Reads the exit code from a status such as `Exited (0) 5 seconds ago`.
fn exit_code_from_status(status: &str) -> Option<i64> {
    let rest = status.trim().strip_prefix("Exited (")?;
    let (code, _) = rest.split_once(')')?;
    code.trim().parse().ok()
}

/// Truncates a string to a maximum number of characters.
fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_chars).collect();
        format!("{kept}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime(command: &str, project: Option<&str>) -> ComposeRuntime {
        let config = RuntimeConfig {
            command: command.to_string(),
            project_name: project.map(str::to_string),
            ..RuntimeConfig::default()
        };
        ComposeRuntime::from_config(&config, Path::new("/srv/shop")).unwrap()
    }

    #[test]
    fn test_plugin_command_split() {
        let rt = runtime("docker compose", Some("shop"));
        assert_eq!(rt.program, "docker");
        assert_eq!(
            rt.stop_args(),
            vec!["compose", "-f", "docker-compose.yml", "-p", "shop", "down", "--remove-orphans"]
        );
    }

    #[test]
    fn test_subset_up_uses_no_deps() {
        let rt = runtime("docker-compose", None);
        assert_eq!(
            rt.up_args(ServiceTarget::Service("mailer"), true),
            vec!["-f", "docker-compose.yml", "up", "-d", "--build", "--no-deps", "mailer"]
        );
        assert_eq!(
            rt.up_args(ServiceTarget::All, false),
            vec!["-f", "docker-compose.yml", "up", "-d", "--build"]
        );
        assert_eq!(
            rt.pull_args(ServiceTarget::Service("mailer")),
            vec!["-f", "docker-compose.yml", "pull", "mailer"]
        );
    }

    #[test]
    fn test_empty_command_rejected() {
        let config = RuntimeConfig {
            command: String::from("   "),
            ..RuntimeConfig::default()
        };
        assert!(ComposeRuntime::from_config(&config, Path::new(".")).is_err());
    }

    #[test]
    fn test_parse_ps_ndjson() {
        let out = r#"{"Service":"api","State":"running","Status":"Up 3 minutes"}
{"Service":"mailer","State":"exited","Status":"Exited (1) 5 seconds ago"}
"#;
        let statuses = parse_ps_output(out).unwrap();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].service, "api");
        assert!(statuses[0].state.is_running());
        assert_eq!(statuses[1].state, ServiceState::Exited);
    }

    #[test]
    fn test_parse_ps_array_keeps_least_healthy_replica() {
        let out = r#"[
  {"Service":"worker","State":"running","Status":"Up"},
  {"Service":"worker","State":"restarting","Status":"Restarting"},
  {"Service":"worker","State":"running","Status":"Up"}
]"#;
        let statuses = parse_ps_output(out).unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].state, ServiceState::Restarting);
    }

    #[test]
    fn test_parse_ps_one_shot_job_completed() {
        let out = r#"{"Service":"migrate","State":"exited","Status":"Exited (0) 4 seconds ago","ExitCode":0}
{"Service":"seed","State":"exited","Status":"Exited (0) 2 seconds ago"}
{"Service":"worker","State":"exited","Status":"Exited (137) 1 second ago","ExitCode":137}
"#;
        let statuses = parse_ps_output(out).unwrap();
        assert_eq!(statuses[0].service, "migrate");
        assert_eq!(statuses[0].state, ServiceState::Completed);
        assert_eq!(statuses[1].state, ServiceState::Completed);
        assert_eq!(statuses[2].state, ServiceState::Exited);
        assert!(!statuses[2].state.is_healthy());
    }

    #[test]
    fn test_exit_code_from_status() {
        assert_eq!(exit_code_from_status("Exited (0) 5 seconds ago"), Some(0));
        assert_eq!(exit_code_from_status("Exited (1) 2 hours ago"), Some(1));
        assert_eq!(exit_code_from_status("Up 3 minutes"), None);
    }

    #[test]
    fn test_parse_ps_empty_and_invalid() {
        assert!(parse_ps_output("  \n").unwrap().is_empty());
        assert!(parse_ps_output("not json").is_err());
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_failure() {
        let rt = runtime("stackshift-no-such-compose-binary", None);
        let result = rt.stop_all().await;
        assert!(matches!(result, Err(RuntimeError::SpawnFailed { .. })));
    }
}
