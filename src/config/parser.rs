//! Configuration parser for loading deployment configuration.
//!
//! This module handles loading configuration from YAML files and environment
//! variables, with proper precedence and error handling.

use crate::error::{ConfigError, Result, StackshiftError};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::DeployConfig;

/// Configuration parser for loading deployment configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// Relative repository and state paths are resolved against the base path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<DeployConfig> {
        let mut config = self.read_file(path.as_ref())?;
        self.resolve_paths(&mut config);
        Ok(config)
    }

    /// Reads and parses a YAML file without touching its paths.
    fn read_file(&self, path: &Path) -> Result<DeployConfig> {
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(StackshiftError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            StackshiftError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<DeployConfig> {
        debug!("Parsing YAML configuration");

        let config: DeployConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            StackshiftError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            "Parsed configuration for project {} ({} rules)",
            config.project.name,
            config.rules.len()
        );
        Ok(config)
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// Environment variables are checked in the format
    /// `STACKSHIFT_<SECTION>_<KEY>` (e.g., `STACKSHIFT_PROJECT_NAME`).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if an
    /// override has an invalid value.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<DeployConfig> {
        let mut config = self.read_file(path.as_ref())?;

        Self::apply_env_overrides(&mut config)?;
        self.resolve_paths(&mut config);

        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(config: &mut DeployConfig) -> Result<()> {
        if let Ok(name) = std::env::var("STACKSHIFT_PROJECT_NAME") {
            debug!("Overriding project.name from environment");
            config.project.name = name;
        }

        if let Ok(env) = std::env::var("STACKSHIFT_PROJECT_ENVIRONMENT") {
            debug!("Overriding project.environment from environment");
            config.project.environment = env;
        }

        if let Ok(path) = std::env::var("STACKSHIFT_REPOSITORY_PATH") {
            debug!("Overriding repository.path from environment");
            config.repository.path = PathBuf::from(path);
        }

        if let Ok(command) = std::env::var("STACKSHIFT_COMPOSE_COMMAND") {
            debug!("Overriding runtime.command from environment");
            config.runtime.command = command;
        }

        if let Ok(settle) = std::env::var("STACKSHIFT_SETTLE_SECS") {
            debug!("Overriding runtime.settle_secs from environment");
            config.runtime.settle_secs = settle.parse().map_err(|_| {
                StackshiftError::Config(ConfigError::validation(
                    format!("STACKSHIFT_SETTLE_SECS must be a number of seconds, got '{settle}'"),
                    "runtime.settle_secs",
                ))
            })?;
        }

        Ok(())
    }

    /// Resolves relative paths against the base path.
    fn resolve_paths(&self, config: &mut DeployConfig) {
        let Some(base) = &self.base_path else {
            return;
        };

        if config.repository.path.is_relative() {
            config.repository.path = base.join(&config.repository.path);
        }
        if config.state.path.is_relative() {
            config.state.path = base.join(&config.state.path);
        }
        if let Some(secrets_path) = &config.secrets.path
            && secrets_path.is_relative()
        {
            config.secrets.path = Some(base.join(secrets_path));
        }
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                StackshiftError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["stackshift.yaml", "stackshift.yml", ".stackshift.yaml"];

/// Finds the configuration file in the current directory or parent directories.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(StackshiftError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}
