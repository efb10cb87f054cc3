//! State types for tracking deployments on this host.
//!
//! The state records which revision is currently deployed, so the next push
//! can be diffed against it, and keeps a bounded history of attempts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::planner::DeploymentPlan;

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Maximum number of history entries kept.
pub const MAX_HISTORY: usize = 100;

/// The complete deployment state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentState {
    /// State format version.
    pub version: String,
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Last revision whose deployment fully succeeded.
    #[serde(default)]
    pub last_deployed_revision: Option<String>,
    /// Fingerprint of the rule table used for the last attempt.
    #[serde(default)]
    pub rules_hash: String,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Deployment history (oldest first).
    #[serde(default)]
    pub history: Vec<DeploymentHistoryEntry>,
}

/// How a deployment attempt ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    /// The plan was a no-op.
    NothingToDeploy,
    /// Every planned service was deployed.
    Deployed,
    /// Some services failed.
    PartiallyFailed,
    /// The attempt was cancelled part way.
    Cancelled,
    /// The attempt stopped before the stack was touched.
    Aborted,
    /// A full-stack rebuild failed; the stack may be down.
    StackFailure,
}

/// A single entry in the deployment history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentHistoryEntry {
    /// When the attempt finished.
    pub timestamp: DateTime<Utc>,
    /// Previous revision of the range.
    pub previous: String,
    /// Current revision of the range.
    pub current: String,
    /// Resolved plan, if resolution was reached.
    #[serde(default)]
    pub plan: Option<DeploymentPlan>,
    /// Outcome.
    pub outcome: OutcomeKind,
    /// Services that were applied.
    #[serde(default)]
    pub services: Vec<String>,
    /// Services that failed.
    #[serde(default)]
    pub failed: Vec<String>,
    /// Rule table fingerprint.
    pub rules_hash: String,
    /// Error message, for aborted or failed attempts.
    #[serde(default)]
    pub error: Option<String>,
    /// The plan was an operator-chosen service subset, so changes to other
    /// services in the range are still pending.
    #[serde(default)]
    pub operator_subset: bool,
}

impl DeploymentState {
    /// Creates a new empty deployment state.
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            project: project.to_string(),
            environment: environment.to_string(),
            last_deployed_revision: None,
            rules_hash: String::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Records a finished attempt.
    ///
    /// The deployed revision only advances when the outcome leaves nothing to
    /// retry, so failed services are diffed again by the next push. A service
    /// subset chosen by the operator never advances it.
    pub fn record(&mut self, entry: DeploymentHistoryEntry) {
        if entry.outcome.advances_revision() && !entry.operator_subset {
            self.last_deployed_revision = Some(entry.current.clone());
        }
        self.rules_hash.clone_from(&entry.rules_hash);
        self.add_history(entry);
        self.last_updated = Utc::now();
    }

    /// Adds a history entry.
    pub fn add_history(&mut self, entry: DeploymentHistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            let excess = self.history.len() + 1 - MAX_HISTORY;
            self.history.drain(..excess);
        }
        self.history.push(entry);
    }

    /// Returns up to `limit` entries, newest first.
    pub fn recent_history(&self, limit: usize) -> impl Iterator<Item = &DeploymentHistoryEntry> {
        self.history.iter().rev().take(limit)
    }
}

impl OutcomeKind {
    /// Returns true if the deployed revision moves forward.
    #[must_use]
    pub const fn advances_revision(self) -> bool {
        matches!(self, Self::NothingToDeploy | Self::Deployed)
    }
}

impl std::fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let outcome = match self {
            Self::NothingToDeploy => "nothing to deploy",
            Self::Deployed => "deployed",
            Self::PartiallyFailed => "partially failed",
            Self::Cancelled => "cancelled",
            Self::Aborted => "aborted",
            Self::StackFailure => "stack failure",
        };
        write!(f, "{outcome}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(current: &str, outcome: OutcomeKind) -> DeploymentHistoryEntry {
        DeploymentHistoryEntry {
            timestamp: Utc::now(),
            previous: String::from("initial"),
            current: current.to_string(),
            plan: Some(DeploymentPlan::All),
            outcome,
            services: Vec::new(),
            failed: Vec::new(),
            rules_hash: String::from("abc"),
            error: None,
            operator_subset: false,
        }
    }

    #[test]
    fn test_revision_advances_only_on_success() {
        let mut state = DeploymentState::new("shop", "prod");
        state.record(entry("r1", OutcomeKind::Deployed));
        state.record(entry("r2", OutcomeKind::PartiallyFailed));
        state.record(entry("r3", OutcomeKind::Aborted));
        assert_eq!(state.last_deployed_revision.as_deref(), Some("r1"));

        state.record(entry("r4", OutcomeKind::NothingToDeploy));
        assert_eq!(state.last_deployed_revision.as_deref(), Some("r4"));
        assert_eq!(state.history.len(), 4);
    }

    #[test]
    fn test_operator_subset_keeps_revision() {
        let mut state = DeploymentState::new("shop", "prod");
        state.record(entry("r1", OutcomeKind::Deployed));
        state.record(DeploymentHistoryEntry {
            operator_subset: true,
            ..entry("r2", OutcomeKind::Deployed)
        });

        assert_eq!(state.last_deployed_revision.as_deref(), Some("r1"));
        assert_eq!(state.history.len(), 2);
        assert!(state.history[1].operator_subset);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut state = DeploymentState::new("shop", "prod");
        for i in 0..(MAX_HISTORY + 5) {
            state.add_history(entry(&format!("r{i}"), OutcomeKind::Deployed));
        }
        assert_eq!(state.history.len(), MAX_HISTORY);
        assert_eq!(state.history[0].current, "r5");

        let newest: Vec<&str> = state.recent_history(2).map(|e| e.current.as_str()).collect();
        assert_eq!(newest, vec![format!("r{}", MAX_HISTORY + 4), format!("r{}", MAX_HISTORY + 3)]);
    }
}
