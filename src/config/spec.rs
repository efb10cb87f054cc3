//! Configuration specification types for the deployment system.
//!
//! This module defines all the structs that map to the `stackshift.yaml` file.
//! The rule table, the secret-bearing services and the runtime settings are
//! loaded once at process start and never mutated afterwards.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// The root configuration structure for a stackshift deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeployConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// Tracked source repository.
    #[serde(default)]
    pub repository: RepositoryConfig,
    /// Container runtime configuration.
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Path prefix to service rules.
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    /// Services that declare a runtime-config file fed from secrets.
    #[serde(default)]
    pub services: Vec<ServiceSecrets>,
    /// Secret store configuration.
    #[serde(default)]
    pub secrets: SecretsConfig,
    /// State and lock configuration.
    #[serde(default)]
    pub state: StateConfig,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Tracked source repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepositoryConfig {
    /// Path to the git working tree, relative to the config file.
    #[serde(default = "default_repository_path")]
    pub path: PathBuf,
}

/// Container runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Compose file, relative to the repository.
    #[serde(default = "default_compose_file")]
    pub compose_file: PathBuf,
    /// Compose command line, e.g. `docker-compose` or `docker compose`.
    #[serde(default = "default_compose_command")]
    pub command: String,
    /// Optional compose project name (`-p`).
    #[serde(default)]
    pub project_name: Option<String>,
    /// Delay after starting each service of a subset, in seconds.
    #[serde(default = "default_settle_secs")]
    pub settle_secs: u64,
    /// Upper bound for any single runtime command, in seconds.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

/// A single path-prefix rule as written in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleConfig {
    /// Path prefix, relative to the repository root.
    pub prefix: String,
    /// Services to redeploy when the prefix matches.
    pub targets: RuleTargets,
}

/// Targets of a rule: every service or a (possibly empty) set of services.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "RawTargets", into = "RawTargets")]
pub enum RuleTargets {
    /// Redeploy the whole stack.
    All,
    /// Redeploy the named services only. Empty means "claim the path, deploy nothing".
    Services(BTreeSet<String>),
}

/// Wire form of [`RuleTargets`]: the keyword `all` or a list of names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTargets {
    /// A keyword.
    Keyword(String),
    /// A list of service names.
    List(Vec<String>),
}

/// A service whose runtime-config file is fed from the secret store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceSecrets {
    /// Compose service name.
    pub name: String,
    /// Runtime-config (`.env`) file, relative to the repository.
    #[serde(default)]
    pub env_file: Option<PathBuf>,
    /// Keys this service accepts from the secret store.
    #[serde(default)]
    pub secret_keys: BTreeSet<String>,
}

/// Secret store configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecretsConfig {
    /// Where secrets come from.
    #[serde(default)]
    pub source: SecretSource,
    /// Secrets file (for the file source).
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Prefix prepended to each key when reading the environment.
    #[serde(default)]
    pub prefix: Option<String>,
}

/// Secret store kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SecretSource {
    /// Process environment (CI secrets are usually injected this way).
    #[default]
    Env,
    /// A dotenv-format file kept outside version control.
    File,
}

/// State and lock configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Directory holding the state file and the host lock.
    #[serde(default = "default_state_path")]
    pub path: PathBuf,
    /// Number of runtime-config snapshots kept per file.
    #[serde(default = "default_backup_retention")]
    pub backup_retention: usize,
}

// Default value functions

fn default_environment() -> String {
    String::from("prod")
}

fn default_repository_path() -> PathBuf {
    PathBuf::from(".")
}

fn default_compose_file() -> PathBuf {
    PathBuf::from("docker-compose.yml")
}

fn default_compose_command() -> String {
    String::from("docker-compose")
}

const fn default_settle_secs() -> u64 {
    10
}

const fn default_command_timeout_secs() -> u64 {
    1800
}

fn default_state_path() -> PathBuf {
    PathBuf::from(".stackshift")
}

const fn default_backup_retention() -> usize {
    5
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            path: default_repository_path(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            compose_file: default_compose_file(),
            command: default_compose_command(),
            project_name: None,
            settle_secs: default_settle_secs(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            source: SecretSource::Env,
            path: None,
            prefix: None,
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: default_state_path(),
            backup_retention: default_backup_retention(),
        }
    }
}

// Rule target conversion

impl TryFrom<RawTargets> for RuleTargets {
    type Error = String;

    fn try_from(raw: RawTargets) -> Result<Self, Self::Error> {
        match raw {
            RawTargets::Keyword(word) if word.eq_ignore_ascii_case("all") => Ok(Self::All),
            RawTargets::Keyword(word) if word.eq_ignore_ascii_case("none") => {
                Ok(Self::Services(BTreeSet::new()))
            }
            RawTargets::Keyword(word) => Err(format!(
                "Invalid targets keyword: {word}. Expected 'all', 'none' or a list of services"
            )),
            RawTargets::List(names) => Ok(Self::Services(names.into_iter().collect())),
        }
    }
}

impl From<RuleTargets> for RawTargets {
    fn from(targets: RuleTargets) -> Self {
        match targets {
            RuleTargets::All => Self::Keyword(String::from("all")),
            RuleTargets::Services(names) => Self::List(names.into_iter().collect()),
        }
    }
}

impl RuleTargets {
    /// Returns true if this target redeploys the whole stack.
    #[must_use]
    pub const fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }
}

impl DeployConfig {
    /// Returns the fully qualified project name including environment.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }

    /// Returns the secret declaration for a service, if any.
    #[must_use]
    pub fn service_secrets(&self, name: &str) -> Option<&ServiceSecrets> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Returns the names of all services with a secret declaration.
    #[must_use]
    pub fn declared_services(&self) -> Vec<&str> {
        self.services.iter().map(|s| s.name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_targets_keyword_all() {
        let targets: RuleTargets = serde_yaml::from_str("all").unwrap();
        assert!(targets.is_all());

        let targets: RuleTargets = serde_yaml::from_str("ALL").unwrap();
        assert!(targets.is_all());
    }

    #[test]
    fn test_targets_list_and_none() {
        let targets: RuleTargets = serde_yaml::from_str("[b, a, a]").unwrap();
        let RuleTargets::Services(names) = targets else {
            panic!("expected services");
        };
        assert_eq!(names.into_iter().collect::<Vec<_>>(), vec!["a", "b"]);

        let targets: RuleTargets = serde_yaml::from_str("[]").unwrap();
        assert_eq!(targets, RuleTargets::Services(BTreeSet::new()));

        let targets: RuleTargets = serde_yaml::from_str("none").unwrap();
        assert_eq!(targets, RuleTargets::Services(BTreeSet::new()));
    }

    #[test]
    fn test_targets_invalid_keyword() {
        let result: Result<RuleTargets, _> = serde_yaml::from_str("everything");
        assert!(result.is_err());
    }

    #[test]
    fn test_runtime_defaults() {
        let runtime = RuntimeConfig::default();
        assert_eq!(runtime.command, "docker-compose");
        assert_eq!(runtime.settle_secs, 10);
        assert_eq!(runtime.compose_file, PathBuf::from("docker-compose.yml"));
    }
}
