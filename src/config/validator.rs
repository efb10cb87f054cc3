//! Configuration validation for deployment configs.
//!
//! This module checks the rule table and the secret declarations before any
//! deployment starts, so a malformed table is reported as a configuration
//! error and never reaches the running stack.

use crate::error::{ConfigError, Result, StackshiftError};
use std::collections::HashSet;
use tracing::debug;

use super::spec::{DeployConfig, ProjectConfig, RuleConfig, RuleTargets, SecretSource, ServiceSecrets};
use crate::planner::normalize_prefix;

/// Validator for deployment configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
    /// Set when the error is a duplicated rule prefix.
    pub duplicate_prefix: Option<String>,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a deployment configuration.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any were found. Duplicate rule
    /// prefixes are reported as [`ConfigError::DuplicateRulePrefix`].
    pub fn validate(&self, config: &DeployConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if result.errors.is_empty() {
            debug!(
                "Configuration validation passed with {} warning(s)",
                result.warnings.len()
            );
            return Ok(result);
        }

        let first_error = &result.errors[0];
        if let Some(prefix) = &first_error.duplicate_prefix {
            return Err(StackshiftError::Config(ConfigError::DuplicateRulePrefix {
                prefix: prefix.clone(),
            }));
        }

        Err(StackshiftError::Config(ConfigError::ValidationError {
            message: first_error.message.clone(),
            field: Some(first_error.field.clone()),
        }))
    }

    /// Runs every check and collects errors and warnings without failing.
    #[must_use]
    pub fn check(&self, config: &DeployConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(&config.project, &mut result);
        Self::validate_rules(&config.rules, &mut result);
        Self::validate_services(&config.services, &mut result);
        Self::validate_runtime(config, &mut result);
        Self::validate_secrets(config, &mut result);

        result
    }

    /// Validates project configuration.
    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.errors.push(ValidationError {
                field: String::from("project.name"),
                message: String::from("Project name cannot be empty"),
                duplicate_prefix: None,
            });
        } else if !is_valid_name(&project.name) {
            result.errors.push(ValidationError {
                field: String::from("project.name"),
                message: format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
                duplicate_prefix: None,
            });
        }

        if project.environment.is_empty() {
            result.errors.push(ValidationError {
                field: String::from("project.environment"),
                message: String::from("Environment cannot be empty"),
                duplicate_prefix: None,
            });
        }
    }

    /// Validates the rule table.
    fn validate_rules(rules: &[RuleConfig], result: &mut ValidationResult) {
        if rules.is_empty() {
            result
                .warnings
                .push(String::from("No rules defined: every push resolves to a no-op plan"));
            return;
        }

        let mut seen = HashSet::new();

        for (i, rule) in rules.iter().enumerate() {
            let prefix = format!("rules[{i}]");
            let normalized = normalize_prefix(&rule.prefix);

            if normalized.is_empty() {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.prefix"),
                    message: String::from("Rule prefix cannot be empty"),
                    duplicate_prefix: None,
                });
                continue;
            }

            if !seen.insert(normalized.clone()) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.prefix"),
                    message: format!("Duplicate rule prefix: {normalized}"),
                    duplicate_prefix: Some(normalized.clone()),
                });
            }

            if let RuleTargets::Services(names) = &rule.targets {
                for name in names {
                    if !is_valid_service_name(name) {
                        result.errors.push(ValidationError {
                            field: format!("{prefix}.targets"),
                            message: format!("Invalid service name '{name}'"),
                            duplicate_prefix: None,
                        });
                    }
                }
            }
        }

        // An `all` rule nested under a more specific rule only fires for paths
        // the specific rule does not claim, which is rarely what was meant.
        for rule in rules.iter().filter(|r| r.targets.is_all()) {
            let outer = normalize_prefix(&rule.prefix);
            for other in rules.iter().filter(|r| !r.targets.is_all()) {
                let inner = normalize_prefix(&other.prefix);
                if inner.len() > outer.len() && inner.starts_with(&format!("{outer}/")) {
                    result.warnings.push(format!(
                        "Rule '{inner}' narrows the 'all' rule '{outer}'; paths under it will not redeploy everything"
                    ));
                }
            }
        }
    }

    /// Validates service secret declarations.
    fn validate_services(services: &[ServiceSecrets], result: &mut ValidationResult) {
        let mut seen = HashSet::new();

        for (i, service) in services.iter().enumerate() {
            let prefix = format!("services[{i}]");

            if !seen.insert(service.name.as_str()) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.name"),
                    message: format!("Duplicate service name: {}", service.name),
                    duplicate_prefix: None,
                });
            }

            if !is_valid_service_name(&service.name) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.name"),
                    message: format!("Invalid service name '{}'", service.name),
                    duplicate_prefix: None,
                });
            }

            match &service.env_file {
                Some(path) if path.is_absolute() => {
                    result.errors.push(ValidationError {
                        field: format!("{prefix}.env_file"),
                        message: format!(
                            "Runtime-config file must be relative to the repository: {}",
                            path.display()
                        ),
                        duplicate_prefix: None,
                    });
                }
                Some(_) => {}
                None if !service.secret_keys.is_empty() => {
                    result.warnings.push(format!(
                        "{prefix}: service '{}' declares secret keys but no env_file; secrets will not be materialized",
                        service.name
                    ));
                }
                None => {}
            }

            for key in &service.secret_keys {
                if !is_valid_env_key(key) {
                    result.errors.push(ValidationError {
                        field: format!("{prefix}.secret_keys"),
                        message: format!("Invalid environment key '{key}'"),
                        duplicate_prefix: None,
                    });
                }
            }
        }
    }

    /// Validates runtime configuration.
    fn validate_runtime(config: &DeployConfig, result: &mut ValidationResult) {
        if config.runtime.command.split_whitespace().next().is_none() {
            result.errors.push(ValidationError {
                field: String::from("runtime.command"),
                message: String::from("Compose command cannot be empty"),
                duplicate_prefix: None,
            });
        }

        if config.runtime.command_timeout_secs == 0 {
            result.errors.push(ValidationError {
                field: String::from("runtime.command_timeout_secs"),
                message: String::from("Command timeout must be at least 1 second"),
                duplicate_prefix: None,
            });
        }

        if config.state.backup_retention == 0 {
            result.errors.push(ValidationError {
                field: String::from("state.backup_retention"),
                message: String::from("At least one runtime-config snapshot must be retained"),
                duplicate_prefix: None,
            });
        }
    }

    /// Validates secret store configuration.
    fn validate_secrets(config: &DeployConfig, result: &mut ValidationResult) {
        if config.secrets.source == SecretSource::File && config.secrets.path.is_none() {
            result.errors.push(ValidationError {
                field: String::from("secrets.path"),
                message: String::from("A secrets file path is required when source is 'file'"),
                duplicate_prefix: None,
            });
        }
    }
}

/// Validates that a name follows the project naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_lowercase() {
        return false;
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

/// Compose service names: alphanumerics, `-`, `_` and `.`, not starting with a separator.
fn is_valid_service_name(name: &str) -> bool {
    name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Environment keys: letters, digits and underscores, not starting with a digit.
fn is_valid_env_key(key: &str) -> bool {
    key.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
