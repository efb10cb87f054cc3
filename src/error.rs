//! Error types for the stackshift deployment system.
//!
//! Errors are split by pipeline stage so the orchestrator can decide what is
//! fatal: configuration and revision-history problems abort before any side
//! effect, runtime failures are either recorded per service or abort an
//! `All` plan, and secret problems abort before the stack is touched.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the stackshift deployment system.
#[derive(Debug, Error)]
pub enum StackshiftError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Container runtime errors.
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// Secret store and materialization errors.
    #[error("Secret error: {0}")]
    Secret(#[from] SecretError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Deployment errors.
    #[error("Deployment error: {0}")]
    Deploy(#[from] DeployError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
///
/// All of these are fatal and are raised before the running stack is touched.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// Two rules share the same prefix.
    #[error("Duplicate rule prefix: '{prefix}'")]
    DuplicateRulePrefix {
        /// The duplicated prefix.
        prefix: String,
    },

    /// The tracked repository cannot be read.
    #[error("Repository unavailable at {path}: {message}")]
    RepositoryUnavailable {
        /// Repository path.
        path: PathBuf,
        /// Underlying failure.
        message: String,
    },

    /// A revision named by the trigger cannot be resolved.
    #[error("Revision '{revision}' cannot be resolved: {message}")]
    RevisionUnavailable {
        /// The unresolvable revision.
        revision: String,
        /// Underlying failure.
        message: String,
    },
}

/// Container runtime errors.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime command could not be spawned.
    #[error("Failed to run '{command}': {message}")]
    SpawnFailed {
        /// The command line.
        command: String,
        /// Description of the failure.
        message: String,
    },

    /// The runtime command exited unsuccessfully.
    #[error("'{command}' exited with {status}: {stderr}")]
    CommandFailed {
        /// The command line.
        command: String,
        /// Exit status description.
        status: String,
        /// Captured standard error (trimmed).
        stderr: String,
    },

    /// The runtime command did not finish in time.
    #[error("'{command}' timed out after {timeout_secs}s")]
    Timeout {
        /// The command line.
        command: String,
        /// Timeout that elapsed.
        timeout_secs: u64,
    },

    /// The runtime status output could not be parsed.
    #[error("Unexpected runtime status output: {message}")]
    InvalidStatus {
        /// Description of the parse failure.
        message: String,
    },

    /// A service did not reach the running state after being started.
    #[error("Service '{service}' is {state} after start")]
    NotRunning {
        /// Service name.
        service: String,
        /// Observed state.
        state: String,
    },
}

/// Secret store and materialization errors.
#[derive(Debug, Error)]
pub enum SecretError {
    /// The secret store could not be read.
    #[error("Secret store unavailable: {message}")]
    StoreUnavailable {
        /// Description of the failure.
        message: String,
    },

    /// A runtime-config file could not be snapshotted or written.
    #[error("Failed to materialize {path}: {message}")]
    MaterializationFailed {
        /// The runtime-config file.
        path: PathBuf,
        /// Description of the failure.
        message: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State could not be written.
    #[error("Failed to write state: {message}")]
    WriteFailed {
        /// Description of the failure.
        message: String,
    },

    /// Deployment lock acquisition failed.
    #[error("Failed to acquire deployment lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// Deployment lock is held by another process.
    #[error("Deployment is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },
}

/// Deployment errors that abort a whole attempt.
#[derive(Debug, Error)]
pub enum DeployError {
    /// Stopping the full stack failed.
    #[error("Failed to stop the stack: {reason}")]
    StackStopFailed {
        /// Reason for failure.
        reason: String,
    },

    /// Building and starting the full stack failed. The stack may be down.
    #[error("Failed to build and start the stack (stack may be left stopped): {reason}")]
    StackStartFailed {
        /// Reason for failure.
        reason: String,
    },

    /// An operator override was malformed.
    #[error("Invalid deployment trigger: {reason}")]
    InvalidTrigger {
        /// Reason for rejection.
        reason: String,
    },
}

/// Result type alias for stackshift operations.
pub type Result<T> = std::result::Result<T, StackshiftError>;

impl StackshiftError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error leaves the running stack possibly down.
    #[must_use]
    pub const fn stack_may_be_down(&self) -> bool {
        matches!(self, Self::Deploy(DeployError::StackStartFailed { .. }))
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl StateError {
    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

impl SecretError {
    /// Creates a materialization error for a file.
    #[must_use]
    pub fn materialization(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::MaterializationFailed {
            path: path.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_may_be_down() {
        let err = StackshiftError::from(DeployError::StackStartFailed {
            reason: String::from("boom"),
        });
        assert!(err.stack_may_be_down());

        let err = StackshiftError::from(DeployError::StackStopFailed {
            reason: String::from("boom"),
        });
        assert!(!err.stack_may_be_down());
    }

    #[test]
    fn test_error_messages_name_the_revision() {
        let err = StackshiftError::from(ConfigError::RevisionUnavailable {
            revision: String::from("abc123"),
            message: String::from("unknown revision"),
        });
        assert!(err.to_string().contains("abc123"));
    }
}
