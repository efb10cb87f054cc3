//! Orchestrator for change-driven deployments.
//!
//! One trigger runs the pipeline once: take the host lock, load state, work
//! out the revision range, read the changed paths, resolve a plan, write
//! secrets for the services in scope, apply the plan and record the attempt.
//! Anything that fails before the plan is applied aborts without touching the
//! stack. A report is produced on every path.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::config::{DeployConfig, RuleTableHasher};
use crate::diff::{ChangeSet, DiffSource, Revision, RevisionRange};
use crate::error::{DeployError, Result, StackshiftError};
use crate::planner::{
    CancellationFlag, ChangeResolver, DeploymentExecutor, DeploymentPlan, DeploymentResult,
    Resolution, RuleTable,
};
use crate::runtime::ContainerRuntime;
use crate::secrets::{EnvironmentMaterializer, SecretBundle, SecretStore};
use crate::state::{DeploymentHistoryEntry, DeploymentState, OutcomeKind, StateStore, generate_holder_id};

/// What started a deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeployTrigger {
    /// Revision currently deployed; defaults to the one recorded in state.
    pub previous: Option<String>,
    /// Revision to deploy.
    pub current: String,
    /// Redeploy everything regardless of the diff.
    pub force_all: bool,
    /// Redeploy exactly these services regardless of the diff.
    pub services: Option<Vec<String>>,
}

/// Pipeline stage an attempt was aborted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Acquiring the host lock.
    Lock,
    /// Loading state.
    State,
    /// Reading changed paths.
    Diff,
    /// Building the plan.
    Resolve,
    /// Fetching and writing secrets.
    Secrets,
}

/// How an attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    /// The plan was a no-op.
    NothingToDeploy,
    /// Every planned service was deployed.
    Deployed,
    /// Some services failed; the others were deployed.
    PartiallyFailed {
        /// Failed services.
        failed: Vec<String>,
    },
    /// Cancelled part way; already applied services stay applied.
    Cancelled,
    /// Stopped before the stack was touched.
    Aborted {
        /// Stage that failed.
        stage: Stage,
        /// Failure description.
        reason: String,
    },
    /// A full-stack rebuild failed; the stack may be down.
    StackFailure {
        /// Failure description.
        reason: String,
    },
}

/// Summary of one deployment attempt.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentReport {
    /// Qualified project name.
    pub project: String,
    /// The trigger.
    pub trigger: DeployTrigger,
    /// Revision range, once known.
    pub range: Option<RevisionRange>,
    /// Number of changed paths.
    pub changed_paths: usize,
    /// Whether the first-deploy fallback produced the change set.
    pub first_deploy: bool,
    /// Rule table fingerprint.
    pub rules_hash: String,
    /// Resolved plan, once known.
    pub plan: Option<DeploymentPlan>,
    /// Runtime-config files written.
    pub materialized: Vec<String>,
    /// Executor result, if the plan was applied.
    pub result: Option<DeploymentResult>,
    /// Outcome.
    pub outcome: Outcome,
    /// Problems that did not change the outcome.
    pub warnings: Vec<String>,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
    /// Total time, in milliseconds.
    pub elapsed_ms: u64,
}

/// Dry-run result.
#[derive(Debug, Clone, Serialize)]
pub struct PlanPreview {
    /// Revision range.
    pub range: RevisionRange,
    /// Changed paths (empty when an override bypassed the diff).
    pub changes: ChangeSet,
    /// Plan and match trace.
    pub resolution: Resolution,
    /// Whether an operator override decided the plan.
    pub overridden: bool,
    /// Rule table fingerprint.
    pub rules_hash: String,
}

/// Drives one deployment attempt through every component.
pub struct Orchestrator<'a> {
    config: &'a DeployConfig,
    rules: RuleTable,
    rules_hash: String,
    diff: &'a dyn DiffSource,
    secrets: &'a dyn SecretStore,
    runtime: &'a dyn ContainerRuntime,
    state: &'a dyn StateStore,
    cancel: CancellationFlag,
    holder: String,
}

impl DeployTrigger {
    /// Creates a trigger for `current`, diffed against the recorded revision.
    #[must_use]
    pub fn new(current: impl Into<String>) -> Self {
        Self {
            current: current.into(),
            ..Self::default()
        }
    }

    /// Sets the previous revision.
    #[must_use]
    pub fn with_previous(mut self, previous: impl Into<String>) -> Self {
        self.previous = Some(previous.into());
        self
    }

    /// Forces a full redeploy.
    #[must_use]
    pub const fn with_all(mut self) -> Self {
        self.force_all = true;
        self
    }

    /// Forces a redeploy of the named services.
    #[must_use]
    pub fn with_services(mut self, services: Vec<String>) -> Self {
        self.services = Some(services);
        self
    }

    /// Returns the plan an operator override imposes, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if both overrides are set or the service list is empty.
    pub fn override_plan(&self) -> Result<Option<DeploymentPlan>> {
        match (&self.services, self.force_all) {
            (Some(_), true) => Err(DeployError::InvalidTrigger {
                reason: String::from("--all and --services cannot be combined"),
            }
            .into()),
            (Some(services), false) => {
                let plan = DeploymentPlan::subset(
                    services.iter().map(|s| s.trim()).filter(|s| !s.is_empty()),
                );
                if plan.is_noop() {
                    return Err(DeployError::InvalidTrigger {
                        reason: String::from("--services needs at least one service name"),
                    }
                    .into());
                }
                Ok(Some(plan))
            }
            (None, true) => Ok(Some(DeploymentPlan::All)),
            (None, false) => Ok(None),
        }
    }
}

impl Outcome {
    /// Gets the outcome kind recorded in history.
    #[must_use]
    pub const fn kind(&self) -> OutcomeKind {
        match self {
            Self::NothingToDeploy => OutcomeKind::NothingToDeploy,
            Self::Deployed => OutcomeKind::Deployed,
            Self::PartiallyFailed { .. } => OutcomeKind::PartiallyFailed,
            Self::Cancelled => OutcomeKind::Cancelled,
            Self::Aborted { .. } => OutcomeKind::Aborted,
            Self::StackFailure { .. } => OutcomeKind::StackFailure,
        }
    }

    /// Process exit code for this outcome.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::NothingToDeploy | Self::Deployed => 0,
            Self::PartiallyFailed { .. } => 1,
            Self::Aborted { .. } => 2,
            Self::StackFailure { .. } => 3,
            Self::Cancelled => 130,
        }
    }

    fn aborted(stage: Stage, err: &StackshiftError) -> Self {
        error!("Deployment aborted during {stage}: {err}");
        Self::Aborted {
            stage,
            reason: err.to_string(),
        }
    }

    fn error_message(&self) -> Option<String> {
        match self {
            Self::Aborted { stage, reason } => Some(format!("{stage}: {reason}")),
            Self::StackFailure { reason } => Some(reason.clone()),
            Self::PartiallyFailed { failed } => Some(format!("failed: {}", failed.join(", "))),
            Self::NothingToDeploy | Self::Deployed | Self::Cancelled => None,
        }
    }
}

impl DeploymentReport {
    fn new(config: &DeployConfig, trigger: &DeployTrigger, rules_hash: &str) -> Self {
        Self {
            project: config.qualified_name(),
            trigger: trigger.clone(),
            range: None,
            changed_paths: 0,
            first_deploy: false,
            rules_hash: rules_hash.to_string(),
            plan: None,
            materialized: Vec::new(),
            result: None,
            outcome: Outcome::NothingToDeploy,
            warnings: Vec::new(),
            started_at: Utc::now(),
            elapsed_ms: 0,
        }
    }

    /// Process exit code.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }

    /// Returns true if the exit code is zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.exit_code() == 0
    }

    fn history_entry(&self) -> DeploymentHistoryEntry {
        let (previous, current) = self.range.as_ref().map_or_else(
            || {
                (
                    self.trigger.previous.clone().unwrap_or_default(),
                    self.trigger.current.clone(),
                )
            },
            |range| (range.previous.to_string(), range.current.clone()),
        );
        let (services, failed) = self.result.as_ref().map_or_else(
            || (Vec::new(), Vec::new()),
            |result| {
                (
                    result.services.iter().map(|s| s.name.clone()).collect(),
                    result.failed_services().into_iter().map(str::to_string).collect(),
                )
            },
        );

        DeploymentHistoryEntry {
            timestamp: Utc::now(),
            previous,
            current,
            plan: self.plan.clone(),
            outcome: self.outcome.kind(),
            services,
            failed,
            rules_hash: self.rules_hash.clone(),
            error: self.outcome.error_message(),
            operator_subset: self.trigger.services.is_some(),
        }
    }
}

impl<'a> Orchestrator<'a> {
    /// Creates an orchestrator.
    ///
    /// # Errors
    ///
    /// Returns an error if the rule table is ambiguous.
    pub fn new(
        config: &'a DeployConfig,
        diff: &'a dyn DiffSource,
        secrets: &'a dyn SecretStore,
        runtime: &'a dyn ContainerRuntime,
        state: &'a dyn StateStore,
    ) -> Result<Self> {
        let rules = RuleTable::from_config(&config.rules)?;
        let rules_hash = RuleTableHasher::new().hash_rules(&config.rules);

        Ok(Self {
            config,
            rules,
            rules_hash,
            diff,
            secrets,
            runtime,
            state,
            cancel: CancellationFlag::new(),
            holder: generate_holder_id(),
        })
    }

    /// Sets the cancellation flag.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Gets the rule table.
    #[must_use]
    pub const fn rules(&self) -> &RuleTable {
        &self.rules
    }

    /// Resolves a trigger without taking the lock or touching anything.
    ///
    /// # Errors
    ///
    /// Returns an error if the trigger is invalid, state is unreadable or the
    /// revisions cannot be diffed.
    pub async fn plan(&self, trigger: &DeployTrigger) -> Result<PlanPreview> {
        let override_plan = trigger.override_plan()?;
        let state = self.state.load().await?;
        let range = self.revision_range(trigger, state.as_ref()).await?;

        if let Some(plan) = override_plan {
            return Ok(PlanPreview {
                range,
                changes: ChangeSet::default(),
                resolution: Resolution {
                    plan,
                    matches: Vec::new(),
                    unexamined: 0,
                },
                overridden: true,
                rules_hash: self.rules_hash.clone(),
            });
        }

        let changes = self.diff.changed_paths(&range).await?;
        let resolution = ChangeResolver::new(&self.rules).resolve(&changes);

        Ok(PlanPreview {
            range,
            changes,
            resolution,
            overridden: false,
            rules_hash: self.rules_hash.clone(),
        })
    }

    /// Runs one deployment attempt.
    pub async fn run(&self, trigger: &DeployTrigger) -> DeploymentReport {
        let started = Instant::now();
        let mut report = DeploymentReport::new(self.config, trigger, &self.rules_hash);
        info!("Deployment of {} started ({})", report.project, trigger.current);

        let override_plan = match trigger.override_plan() {
            Ok(plan) => plan,
            Err(e) => {
                report.outcome = Outcome::aborted(Stage::Resolve, &e);
                return finish(report, started);
            }
        };

        let lock = match self.state.acquire_lock(&self.holder).await {
            Ok(lock) => lock,
            Err(e) => {
                report.outcome = Outcome::aborted(Stage::Lock, &e);
                return finish(report, started);
            }
        };

        self.run_locked(override_plan, &mut report).await;

        match self.state.release_lock(&lock.lock_id).await {
            Ok(true) => {}
            Ok(false) => report
                .warnings
                .push(String::from("Deployment lock was no longer held at release")),
            Err(e) => {
                warn!("Failed to release deployment lock: {e}");
                report.warnings.push(format!("Failed to release deployment lock: {e}"));
            }
        }

        finish(report, started)
    }

    /// Pipeline body, run while the lock is held.
    async fn run_locked(&self, override_plan: Option<DeploymentPlan>, report: &mut DeploymentReport) {
        let mut state = match self.state.load().await {
            Ok(state) => state.unwrap_or_else(|| {
                DeploymentState::new(&self.config.project.name, &self.config.project.environment)
            }),
            Err(e) => {
                // Corrupted state is left as it is for inspection.
                report.outcome = Outcome::aborted(Stage::State, &e);
                return;
            }
        };

        report.outcome = self.pipeline(override_plan, &state, report).await;

        state.record(report.history_entry());
        if let Err(e) = self.state.save(&state).await {
            error!("Failed to save state: {e}");
            report.warnings.push(format!("Failed to save state: {e}"));
        }
    }

    async fn pipeline(
        &self,
        override_plan: Option<DeploymentPlan>,
        state: &DeploymentState,
        report: &mut DeploymentReport,
    ) -> Outcome {
        let range = match self.revision_range(&report.trigger, Some(state)).await {
            Ok(range) => range,
            Err(e) => return Outcome::aborted(Stage::Diff, &e),
        };
        report.range = Some(range.clone());

        let plan = if let Some(plan) = override_plan {
            info!("Operator override: {plan}");
            if report.trigger.services.is_some() {
                report.warnings.push(format!(
                    "Service override: deployed revision stays at {}",
                    range.previous
                ));
            }
            plan
        } else {
            let changes = match self.diff.changed_paths(&range).await {
                Ok(changes) => changes,
                Err(e) => return Outcome::aborted(Stage::Diff, &e),
            };
            report.changed_paths = changes.len();
            report.first_deploy = changes.is_first_deploy();

            let resolution = ChangeResolver::new(&self.rules).resolve(&changes);
            info!(
                "{} changed paths, {} unmatched: {}",
                changes.len(),
                resolution.unmatched(),
                resolution.plan
            );
            resolution.plan
        };
        report.plan = Some(plan.clone());

        if plan.is_noop() {
            info!("Nothing to deploy");
            return Outcome::NothingToDeploy;
        }

        if self.cancel.is_cancelled() {
            warn!("Deployment cancelled before the stack was touched");
            return Outcome::Cancelled;
        }

        match self.materialize(&plan).await {
            Ok(files) => report.materialized = files,
            Err(e) => return Outcome::aborted(Stage::Secrets, &e),
        }

        let executor = DeploymentExecutor::new(self.runtime)
            .with_settle(Duration::from_secs(self.config.runtime.settle_secs))
            .with_cancellation(self.cancel.clone());

        match executor.apply(&plan).await {
            Ok(result) => {
                let outcome = if result.cancelled {
                    Outcome::Cancelled
                } else if result.failed() > 0 {
                    Outcome::PartiallyFailed {
                        failed: result.failed_services().into_iter().map(str::to_string).collect(),
                    }
                } else {
                    Outcome::Deployed
                };
                report.warnings.extend(result.warnings.iter().cloned());
                report.result = Some(result);
                outcome
            }
            Err(e) => {
                error!("Stack rebuild failed: {e}");
                Outcome::StackFailure {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Works out the revision range of a trigger.
    async fn revision_range(
        &self,
        trigger: &DeployTrigger,
        state: Option<&DeploymentState>,
    ) -> Result<RevisionRange> {
        let current = self.diff.resolve_revision(&trigger.current).await?;
        let previous = trigger
            .previous
            .as_deref()
            .or_else(|| state.and_then(|s| s.last_deployed_revision.as_deref()))
            .map_or(Revision::Initial, Revision::parse);

        Ok(RevisionRange::new(previous, current))
    }

    /// Writes secrets for the services the plan redeploys.
    async fn materialize(&self, plan: &DeploymentPlan) -> Result<Vec<String>> {
        let scoped = EnvironmentMaterializer::scope(self.config, plan);
        if scoped.is_empty() {
            return Ok(Vec::new());
        }

        let keys = EnvironmentMaterializer::required_keys(&scoped);
        let bundle = if keys.is_empty() {
            SecretBundle::new()
        } else {
            let bundle = self.secrets.fetch(&keys).await?;
            info!("Fetched {bundle} from the {} store", self.secrets.backend_type());
            bundle
        };

        let materializer = EnvironmentMaterializer::new(
            &self.config.repository.path,
            self.config.state.backup_retention,
        );
        let files = materializer.materialize_all(&bundle, &scoped).await?;
        drop(bundle);

        Ok(files.into_iter().map(|f| f.path.display().to_string()).collect())
    }
}

fn finish(mut report: DeploymentReport, started: Instant) -> DeploymentReport {
    report.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    match &report.outcome {
        Outcome::NothingToDeploy | Outcome::Deployed => {
            info!("Deployment finished: {}", report.outcome);
        }
        _ => error!("Deployment finished: {}", report.outcome),
    }
    report
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stage = match self {
            Self::Lock => "lock",
            Self::State => "state",
            Self::Diff => "diff",
            Self::Resolve => "resolve",
            Self::Secrets => "secrets",
        };
        write!(f, "{stage}")
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NothingToDeploy => write!(f, "nothing to deploy"),
            Self::Deployed => write!(f, "deployed"),
            Self::PartiallyFailed { failed } => {
                write!(f, "partially failed ({})", failed.join(", "))
            }
            Self::Cancelled => write!(f, "cancelled"),
            Self::Aborted { stage, reason } => write!(f, "aborted during {stage}: {reason}"),
            Self::StackFailure { reason } => {
                write!(f, "stack failure, services may be down: {reason}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::MockDiffSource;
    use crate::error::{ConfigError, SecretError};
    use crate::planner::RecordingRuntime;
    use crate::secrets::MockSecretStore;
    use crate::state::LocalStateStore;
    use std::collections::HashSet;
    use std::path::Path;
    use tempfile::TempDir;

    const CONFIG: &str = r"
project: { name: shop }
runtime: { settle_secs: 0 }
rules:
  - { prefix: docker-compose.yml, targets: all }
  - { prefix: notification-service, targets: [notification-service] }
  - { prefix: notification-service/docs, targets: [] }
  - { prefix: order-service, targets: [order-service] }
services:
  - name: notification-service
    env_file: notification-service/.env
    secret_keys: [SMTP_PASSWORD]
";

    fn config(dir: &Path) -> DeployConfig {
        std::fs::create_dir_all(dir.join("notification-service")).unwrap();
        let mut config: DeployConfig = serde_yaml::from_str(CONFIG).unwrap();
        config.repository.path = dir.to_path_buf();
        config
    }

    fn diff_returning(paths: &'static [&'static str]) -> MockDiffSource {
        let mut diff = MockDiffSource::new();
        diff.expect_resolve_revision()
            .returning(|_| Ok(String::from("sha-new")));
        diff.expect_changed_paths().returning(move |range| {
            if range.previous.is_initial() {
                Ok(ChangeSet::first_deploy(paths.iter().copied()))
            } else {
                Ok(ChangeSet::new(paths.iter().copied()))
            }
        });
        diff
    }

    fn secrets_returning_password() -> MockSecretStore {
        let mut secrets = MockSecretStore::new();
        secrets
            .expect_fetch()
            .returning(|_| Ok([("SMTP_PASSWORD", "hunter2")].into_iter().collect()));
        secrets.expect_backend_type().return_const("mock");
        secrets
    }

    fn state_store(dir: &Path) -> LocalStateStore {
        LocalStateStore::with_base_dir(dir.join(".stackshift"))
    }

    async fn seed_revision(store: &LocalStateStore, revision: &str) {
        let mut state = DeploymentState::new("shop", "prod");
        state.last_deployed_revision = Some(revision.to_string());
        store.save(&state).await.unwrap();
    }

    #[tokio::test]
    async fn test_first_deploy_redeploys_everything() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        let mut diff = MockDiffSource::new();
        diff.expect_resolve_revision()
            .returning(|_| Ok(String::from("sha-new")));
        diff.expect_changed_paths()
            .withf(|range| range.previous.is_initial() && range.current == "sha-new")
            .times(1)
            .returning(|_| {
                Ok(ChangeSet::first_deploy([
                    "README.md",
                    "docker-compose.yml",
                    "order-service/main.go",
                ]))
            });
        let secrets = secrets_returning_password();
        let runtime = RecordingRuntime::default();
        let store = state_store(dir.path());

        let orchestrator = Orchestrator::new(&config, &diff, &secrets, &runtime, &store).unwrap();
        let report = orchestrator.run(&DeployTrigger::new("HEAD")).await;

        assert_eq!(report.outcome, Outcome::Deployed);
        assert!(report.first_deploy);
        assert_eq!(report.plan, Some(DeploymentPlan::All));
        assert_eq!(runtime.calls()[0], "stop *");

        let state = store.load().await.unwrap().unwrap();
        assert_eq!(state.last_deployed_revision.as_deref(), Some("sha-new"));
        assert!(store.get_lock_info().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_subset_writes_secrets_and_advances_revision() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        std::fs::write(
            dir.path().join("notification-service/.env"),
            "SMTP_HOST=smtp.example.com\nSMTP_PASSWORD=old\n",
        )
        .unwrap();

        let diff = diff_returning(&["notification-service/app.py", "README.md"]);
        let secrets = secrets_returning_password();
        let runtime = RecordingRuntime::default();
        let store = state_store(dir.path());
        seed_revision(&store, "sha-old").await;

        let orchestrator = Orchestrator::new(&config, &diff, &secrets, &runtime, &store).unwrap();
        let report = orchestrator.run(&DeployTrigger::new("HEAD")).await;

        assert_eq!(report.outcome, Outcome::Deployed);
        assert_eq!(report.plan, Some(DeploymentPlan::subset(["notification-service"])));
        assert_eq!(report.materialized.len(), 1);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("notification-service/.env")).unwrap(),
            "SMTP_HOST=smtp.example.com\nSMTP_PASSWORD=hunter2\n"
        );
        assert_eq!(
            report.range.as_ref().map(|r| r.previous.clone()),
            Some(Revision::Commit(String::from("sha-old")))
        );
        assert_eq!(
            store.load().await.unwrap().unwrap().last_deployed_revision.as_deref(),
            Some("sha-new")
        );
    }

    #[tokio::test]
    async fn test_docs_only_change_is_nothing_to_deploy() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        let diff = diff_returning(&["notification-service/docs/api.md"]);
        let mut secrets = MockSecretStore::new();
        secrets.expect_fetch().never();
        let runtime = RecordingRuntime::default();
        let store = state_store(dir.path());
        seed_revision(&store, "sha-old").await;

        let orchestrator = Orchestrator::new(&config, &diff, &secrets, &runtime, &store).unwrap();
        let report = orchestrator.run(&DeployTrigger::new("HEAD")).await;

        assert_eq!(report.outcome, Outcome::NothingToDeploy);
        assert_eq!(report.exit_code(), 0);
        assert!(runtime.calls().is_empty());
        assert_eq!(
            store.load().await.unwrap().unwrap().last_deployed_revision.as_deref(),
            Some("sha-new")
        );
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_previous_revision() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        let diff = diff_returning(&["order-service/main.go", "notification-service/app.py"]);
        let secrets = secrets_returning_password();
        let runtime = RecordingRuntime {
            fail_start: HashSet::from([String::from("notification-service")]),
            ..RecordingRuntime::default()
        };
        let store = state_store(dir.path());
        seed_revision(&store, "sha-old").await;

        let orchestrator = Orchestrator::new(&config, &diff, &secrets, &runtime, &store).unwrap();
        let report = orchestrator.run(&DeployTrigger::new("HEAD")).await;

        assert_eq!(
            report.outcome,
            Outcome::PartiallyFailed {
                failed: vec![String::from("notification-service")]
            }
        );
        assert_ne!(report.exit_code(), 0);
        assert!(runtime.calls().contains(&String::from("up order-service no_deps=true")));

        let state = store.load().await.unwrap().unwrap();
        assert_eq!(state.last_deployed_revision.as_deref(), Some("sha-old"));
        assert_eq!(state.history.last().map(|h| h.outcome), Some(OutcomeKind::PartiallyFailed));
    }

    #[tokio::test]
    async fn test_unresolvable_revision_aborts_before_touching_stack() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        let mut diff = MockDiffSource::new();
        diff.expect_resolve_revision()
            .returning(|_| Ok(String::from("sha-new")));
        diff.expect_changed_paths().returning(|range| {
            Err(ConfigError::RevisionUnavailable {
                revision: range.previous.to_string(),
                message: String::from("shallow clone"),
            }
            .into())
        });
        let secrets = MockSecretStore::new();
        let runtime = RecordingRuntime::default();
        let store = state_store(dir.path());

        let orchestrator = Orchestrator::new(&config, &diff, &secrets, &runtime, &store).unwrap();
        let trigger = DeployTrigger::new("HEAD").with_previous("abc123");
        let report = orchestrator.run(&trigger).await;

        assert!(matches!(report.outcome, Outcome::Aborted { stage: Stage::Diff, .. }));
        assert!(runtime.calls().is_empty());
        assert!(store.get_lock_info().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_secret_store_failure_aborts() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        let diff = diff_returning(&["notification-service/app.py"]);
        let mut secrets = MockSecretStore::new();
        secrets.expect_fetch().returning(|_| {
            Err(SecretError::StoreUnavailable {
                message: String::from("vault sealed"),
            }
            .into())
        });
        let runtime = RecordingRuntime::default();
        let store = state_store(dir.path());

        let orchestrator = Orchestrator::new(&config, &diff, &secrets, &runtime, &store).unwrap();
        let report = orchestrator.run(&DeployTrigger::new("HEAD")).await;

        assert!(matches!(report.outcome, Outcome::Aborted { stage: Stage::Secrets, .. }));
        assert!(runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn test_held_lock_aborts() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        let diff = MockDiffSource::new();
        let secrets = MockSecretStore::new();
        let runtime = RecordingRuntime::default();
        let store = state_store(dir.path());
        let held = store.acquire_lock("other-runner").await.unwrap();

        let orchestrator = Orchestrator::new(&config, &diff, &secrets, &runtime, &store).unwrap();
        let report = orchestrator.run(&DeployTrigger::new("HEAD")).await;

        assert!(matches!(report.outcome, Outcome::Aborted { stage: Stage::Lock, .. }));
        assert_eq!(store.get_lock_info().await.unwrap(), Some(held));
    }

    #[tokio::test]
    async fn test_services_override_skips_diff() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        let mut diff = MockDiffSource::new();
        diff.expect_resolve_revision()
            .returning(|_| Ok(String::from("sha-new")));
        diff.expect_changed_paths().never();
        let secrets = MockSecretStore::new();
        let runtime = RecordingRuntime::default();
        let store = state_store(dir.path());

        let orchestrator = Orchestrator::new(&config, &diff, &secrets, &runtime, &store).unwrap();
        let trigger = DeployTrigger::new("HEAD").with_services(vec![String::from("order-service")]);
        let report = orchestrator.run(&trigger).await;

        assert_eq!(report.outcome, Outcome::Deployed);
        assert_eq!(
            runtime.calls(),
            vec!["pull order-service", "up order-service no_deps=true", "ps"]
        );
    }

    #[tokio::test]
    async fn test_services_override_leaves_other_changes_pending() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        let diff = diff_returning(&["order-service/main.go", "notification-service/app.py"]);
        let secrets = secrets_returning_password();
        let runtime = RecordingRuntime::default();
        let store = state_store(dir.path());
        seed_revision(&store, "sha-old").await;

        let orchestrator = Orchestrator::new(&config, &diff, &secrets, &runtime, &store).unwrap();
        let trigger = DeployTrigger::new("HEAD").with_services(vec![String::from("order-service")]);
        let report = orchestrator.run(&trigger).await;

        assert_eq!(report.outcome, Outcome::Deployed);
        assert_eq!(report.warnings.len(), 1);
        let state = store.load().await.unwrap().unwrap();
        assert_eq!(state.last_deployed_revision.as_deref(), Some("sha-old"));
        assert_eq!(state.history.last().map(|h| h.outcome), Some(OutcomeKind::Deployed));

        // The next push still diffs from the old revision.
        let report = orchestrator.run(&DeployTrigger::new("HEAD")).await;
        assert_eq!(report.outcome, Outcome::Deployed);
        assert_eq!(
            report.plan,
            Some(DeploymentPlan::subset(["notification-service", "order-service"]))
        );
        assert_eq!(
            store.load().await.unwrap().unwrap().last_deployed_revision.as_deref(),
            Some("sha-new")
        );
    }

    #[tokio::test]
    async fn test_all_override_advances_revision() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        let mut diff = MockDiffSource::new();
        diff.expect_resolve_revision()
            .returning(|_| Ok(String::from("sha-new")));
        diff.expect_changed_paths().never();
        let secrets = secrets_returning_password();
        let runtime = RecordingRuntime::default();
        let store = state_store(dir.path());
        seed_revision(&store, "sha-old").await;

        let orchestrator = Orchestrator::new(&config, &diff, &secrets, &runtime, &store).unwrap();
        let report = orchestrator.run(&DeployTrigger::new("HEAD").with_all()).await;

        assert_eq!(report.outcome, Outcome::Deployed);
        assert!(report.warnings.is_empty());
        assert_eq!(
            store.load().await.unwrap().unwrap().last_deployed_revision.as_deref(),
            Some("sha-new")
        );
    }

    #[tokio::test]
    async fn test_unreadable_status_is_reported() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        let diff = diff_returning(&["order-service/main.go"]);
        let secrets = MockSecretStore::new();
        let runtime = RecordingRuntime {
            fail_status: true,
            ..RecordingRuntime::default()
        };
        let store = state_store(dir.path());
        seed_revision(&store, "sha-old").await;

        let orchestrator = Orchestrator::new(&config, &diff, &secrets, &runtime, &store).unwrap();
        let report = orchestrator.run(&DeployTrigger::new("HEAD")).await;

        assert_eq!(report.outcome, Outcome::Deployed);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("order-service"));
    }

    #[tokio::test]
    async fn test_invalid_override_is_rejected() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        let diff = MockDiffSource::new();
        let secrets = MockSecretStore::new();
        let runtime = RecordingRuntime::default();
        let store = state_store(dir.path());

        let orchestrator = Orchestrator::new(&config, &diff, &secrets, &runtime, &store).unwrap();
        let report = orchestrator
            .run(&DeployTrigger::new("HEAD").with_services(vec![String::from(" ")]))
            .await;
        assert!(matches!(report.outcome, Outcome::Aborted { stage: Stage::Resolve, .. }));

        let both = DeployTrigger::new("HEAD")
            .with_all()
            .with_services(vec![String::from("api")]);
        assert!(both.override_plan().is_err());
    }

    #[tokio::test]
    async fn test_stack_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        let diff = diff_returning(&["docker-compose.yml"]);
        let secrets = secrets_returning_password();
        let runtime = RecordingRuntime {
            fail_start: HashSet::from([String::from("*")]),
            ..RecordingRuntime::default()
        };
        let store = state_store(dir.path());

        let orchestrator = Orchestrator::new(&config, &diff, &secrets, &runtime, &store).unwrap();
        let report = orchestrator.run(&DeployTrigger::new("HEAD")).await;

        assert!(matches!(report.outcome, Outcome::StackFailure { .. }));
        assert_eq!(report.exit_code(), 3);
    }

    #[tokio::test]
    async fn test_plan_preview_does_not_lock_or_deploy() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        let diff = diff_returning(&["notification-service/docs/a.md", "order-service/x"]);
        let secrets = MockSecretStore::new();
        let runtime = RecordingRuntime::default();
        let store = state_store(dir.path());
        seed_revision(&store, "sha-old").await;

        let orchestrator = Orchestrator::new(&config, &diff, &secrets, &runtime, &store).unwrap();
        let preview = orchestrator.plan(&DeployTrigger::new("HEAD")).await.unwrap();

        assert_eq!(preview.resolution.plan, DeploymentPlan::subset(["order-service"]));
        assert_eq!(preview.resolution.matches.len(), 2);
        assert!(!preview.overridden);
        assert!(runtime.calls().is_empty());
        assert!(store.get_lock_info().await.unwrap().is_none());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(Outcome::Deployed.exit_code(), 0);
        assert_eq!(Outcome::NothingToDeploy.exit_code(), 0);
        assert_ne!(Outcome::Cancelled.exit_code(), 0);
        assert_ne!(
            Outcome::Aborted {
                stage: Stage::Lock,
                reason: String::new()
            }
            .exit_code(),
            0
        );
    }
}
