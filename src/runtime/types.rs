//! Types shared by container runtime backends.

use serde::{Deserialize, Serialize};

/// What a runtime operation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceTarget<'a> {
    /// Every service of the stack.
    All,
    /// A single named service.
    Service(&'a str),
}

/// Observed state of a compose service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// Container is running.
    Running,
    /// Container is restarting.
    Restarting,
    /// Container was created but never started.
    Created,
    /// Container is paused.
    Paused,
    /// Container has exited with a failure, or its exit code is unknown.
    Exited,
    /// Container ran to completion with exit code 0 (one-shot jobs).
    Completed,
    /// Container is dead.
    Dead,
    /// State could not be determined.
    Unknown,
}

/// Status of one service as reported by the runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceStatus {
    /// Compose service name.
    pub service: String,
    /// Normalized state.
    pub state: ServiceState,
    /// Human-readable status from the runtime (e.g. "Up 2 minutes").
    pub detail: String,
}

impl ServiceTarget<'_> {
    /// Returns the service name, if the target is a single service.
    #[must_use]
    pub const fn service(&self) -> Option<&str> {
        match *self {
            Self::All => None,
            Self::Service(name) => Some(name),
        }
    }
}

impl ServiceState {
    /// Parses a runtime state string such as `running` or `exited`.
    #[must_use]
    pub fn parse(state: &str) -> Self {
        match state.trim().to_ascii_lowercase().as_str() {
            "running" | "up" => Self::Running,
            "restarting" => Self::Restarting,
            "created" => Self::Created,
            "paused" => Self::Paused,
            "exited" | "stopped" => Self::Exited,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }

    /// Parses a state together with the container exit code.
    ///
    /// An exited container whose exit code is 0 completed normally.
    #[must_use]
    pub fn with_exit_code(state: &str, exit_code: Option<i64>) -> Self {
        match (Self::parse(state), exit_code) {
            (Self::Exited, Some(0)) => Self::Completed,
            (parsed, _) => parsed,
        }
    }

    /// Returns true if the service is serving.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }

    /// Returns true if the service is serving or finished cleanly.
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Running | Self::Completed)
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self {
            Self::Running => "running",
            Self::Restarting => "restarting",
            Self::Created => "created",
            Self::Paused => "paused",
            Self::Exited => "exited",
            Self::Completed => "completed",
            Self::Dead => "dead",
            Self::Unknown => "unknown",
        };
        write!(f, "{state}")
    }
}

impl std::fmt::Display for ServiceTarget<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "all services"),
            Self::Service(name) => write!(f, "{name}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_parse() {
        assert_eq!(ServiceState::parse("running"), ServiceState::Running);
        assert_eq!(ServiceState::parse(" Exited "), ServiceState::Exited);
        assert_eq!(ServiceState::parse("removing"), ServiceState::Unknown);
        assert!(ServiceState::parse("RUNNING").is_running());
    }

    #[test]
    fn test_clean_exit_is_completed() {
        assert_eq!(ServiceState::with_exit_code("exited", Some(0)), ServiceState::Completed);
        assert_eq!(ServiceState::with_exit_code("exited", Some(1)), ServiceState::Exited);
        assert_eq!(ServiceState::with_exit_code("exited", None), ServiceState::Exited);
        assert_eq!(ServiceState::with_exit_code("running", Some(0)), ServiceState::Running);
        assert!(ServiceState::Completed.is_healthy());
        assert!(!ServiceState::Completed.is_running());
        assert!(!ServiceState::Exited.is_healthy());
    }

    #[test]
    fn test_target_service() {
        assert_eq!(ServiceTarget::Service("api").service(), Some("api"));
        assert_eq!(ServiceTarget::All.service(), None);
        assert_eq!(ServiceTarget::All.to_string(), "all services");
    }
}
