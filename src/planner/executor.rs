//! Plan executor for applying deployment plans to the running stack.
//!
//! This module is the only place that calls runtime-mutating operations. An
//! `All` plan is a stop-the-world rebuild whose stop and start steps are
//! fatal. A `Subset` plan is applied service by service in name order, and a
//! failing service never prevents the others from being attempted.

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::error::{DeployError, Result, RuntimeError};
use crate::runtime::{ContainerRuntime, ServiceTarget};

use super::plan::DeploymentPlan;

/// Shared flag requesting that a running deployment stop between services.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    /// Creates a flag that is not set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum ServiceOutcome {
    /// The service was rebuilt and is running.
    Succeeded,
    /// The service could not be rebuilt or did not come up.
    Failed(String),
    /// The service was not attempted.
    Skipped(String),
}

/// Result for one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceResult {
    /// Service name.
    pub name: String,
    /// Outcome.
    pub outcome: ServiceOutcome,
    /// Whether a prebuilt image was pulled instead of building locally.
    pub image_pulled: bool,
    /// Whether the runtime confirmed the outcome.
    pub verified: bool,
    /// Time spent on this service, in milliseconds.
    pub elapsed_ms: u64,
}

/// Result of applying a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeploymentResult {
    /// The plan that was applied.
    pub plan: DeploymentPlan,
    /// Per-service results.
    pub services: Vec<ServiceResult>,
    /// Whether cancellation stopped the apply early.
    pub cancelled: bool,
    /// Problems that left the result unconfirmed.
    pub warnings: Vec<String>,
    /// Total time, in milliseconds.
    pub elapsed_ms: u64,
}

/// What applying a plan produced, before timing.
#[derive(Debug, Default)]
struct Applied {
    services: Vec<ServiceResult>,
    cancelled: bool,
    warnings: Vec<String>,
}

/// Applies deployment plans through a container runtime.
pub struct DeploymentExecutor<'a> {
    runtime: &'a dyn ContainerRuntime,
    settle: Duration,
    cancel: CancellationFlag,
}

impl<'a> DeploymentExecutor<'a> {
    /// Creates a new executor.
    #[must_use]
    pub fn new(runtime: &'a dyn ContainerRuntime) -> Self {
        Self {
            runtime,
            settle: Duration::from_secs(10),
            cancel: CancellationFlag::new(),
        }
    }

    /// Sets the delay between starting a service and checking its status.
    #[must_use]
    pub const fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Sets the cancellation flag.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Applies a plan.
    ///
    /// # Errors
    ///
    /// Returns an error only for an `All` plan whose stop or start step failed.
    /// Per-service failures of a `Subset` plan are reported in the result.
    pub async fn apply(&self, plan: &DeploymentPlan) -> Result<DeploymentResult> {
        let started = Instant::now();
        info!("Applying plan: {plan}");

        let applied = match plan {
            DeploymentPlan::NoOp => Applied::default(),
            DeploymentPlan::All => self.apply_all(started).await?,
            DeploymentPlan::Subset(names) => self.apply_subset(names).await,
        };

        let result = DeploymentResult {
            plan: plan.clone(),
            services: applied.services,
            cancelled: applied.cancelled,
            warnings: applied.warnings,
            elapsed_ms: millis(started.elapsed()),
        };
        info!("{result}");
        Ok(result)
    }

    /// Stop-the-world rebuild of the whole stack.
    async fn apply_all(&self, started: Instant) -> Result<Applied> {
        if self.cancel.is_cancelled() {
            warn!("Deployment cancelled before the stack was touched");
            return Ok(Applied {
                cancelled: true,
                ..Applied::default()
            });
        }

        self.runtime.stop_all().await.map_err(|e| {
            error!("Failed to stop the stack: {e}");
            DeployError::StackStopFailed {
                reason: e.to_string(),
            }
        })?;

        let image_pulled = self.pull(ServiceTarget::All).await;

        self.runtime
            .build_and_start(ServiceTarget::All, false)
            .await
            .map_err(|e| {
                error!("Failed to start the stack, services may be down: {e}");
                DeployError::StackStartFailed {
                    reason: e.to_string(),
                }
            })?;

        self.settle().await;

        let mut applied = Applied::default();
        match self.runtime.list_status().await {
            Ok(statuses) => applied.services = statuses
                .into_iter()
                .map(|status| ServiceResult {
                    outcome: if status.state.is_healthy() {
                        ServiceOutcome::Succeeded
                    } else {
                        ServiceOutcome::Failed(
                            RuntimeError::NotRunning {
                                service: status.service.clone(),
                                state: status.state.to_string(),
                            }
                            .to_string(),
                        )
                    },
                    name: status.service,
                    image_pulled,
                    verified: true,
                    elapsed_ms: millis(started.elapsed()),
                })
                .collect(),
            Err(e) => {
                warn!("Stack started but its status could not be read: {e}");
                applied
                    .warnings
                    .push(format!("Stack started but its status could not be read: {e}"));
            }
        }

        Ok(applied)
    }

    /// Sequential per-service redeploy.
    async fn apply_subset(
        &self,
        names: &std::collections::BTreeSet<String>,
    ) -> Applied {
        let mut applied = Applied {
            services: Vec::with_capacity(names.len()),
            ..Applied::default()
        };

        for name in names {
            if applied.cancelled || self.cancel.is_cancelled() {
                applied.cancelled = true;
                applied.services.push(ServiceResult {
                    name: name.clone(),
                    outcome: ServiceOutcome::Skipped(String::from("deployment cancelled")),
                    image_pulled: false,
                    verified: false,
                    elapsed_ms: 0,
                });
                continue;
            }

            let result = self.apply_service(name).await;
            if !result.verified {
                applied
                    .warnings
                    .push(format!("Service {name} started but its status could not be read"));
            }
            applied.services.push(result);
        }

        if applied.cancelled {
            warn!("Deployment cancelled; services already applied are left in place");
        }
        applied
    }

    /// Redeploys one service without touching the services it depends on.
    async fn apply_service(&self, name: &str) -> ServiceResult {
        let started = Instant::now();
        let target = ServiceTarget::Service(name);
        info!("Deploying service {name}");

        let image_pulled = self.pull(target).await;

        let (outcome, verified) = match self.runtime.build_and_start(target, true).await {
            Ok(()) => {
                self.settle().await;
                self.verify(name)
                    .await
                    .map_or((ServiceOutcome::Succeeded, false), |outcome| (outcome, true))
            }
            Err(e) => {
                error!("Failed to deploy {name}: {e}");
                (ServiceOutcome::Failed(e.to_string()), true)
            }
        };

        ServiceResult {
            name: name.to_string(),
            outcome,
            image_pulled,
            verified,
            elapsed_ms: millis(started.elapsed()),
        }
    }

    /// Pulls prebuilt images, falling back to a local build on failure.
    async fn pull(&self, target: ServiceTarget<'_>) -> bool {
        match self.runtime.pull_image(target).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Could not pull images for {target}, building locally: {e}");
                false
            }
        }
    }

    /// Checks that a started service is running.
    ///
    /// Returns `None` when the runtime status cannot be read.
    async fn verify(&self, name: &str) -> Option<ServiceOutcome> {
        let outcome = match self.runtime.list_status().await {
            Ok(statuses) => match statuses.iter().find(|s| s.service == name) {
                Some(status) if status.state.is_healthy() => {
                    info!("Service {name} is {}", status.state);
                    ServiceOutcome::Succeeded
                }
                Some(status) => {
                    let err = RuntimeError::NotRunning {
                        service: name.to_string(),
                        state: status.state.to_string(),
                    };
                    error!("{err}");
                    ServiceOutcome::Failed(err.to_string())
                }
                None => {
                    error!("Service {name} is not reported by the runtime after start");
                    ServiceOutcome::Failed(String::from("service not reported by the runtime"))
                }
            },
            Err(e) => {
                warn!("Could not verify {name}, assuming started: {e}");
                return None;
            }
        };
        Some(outcome)
    }

    async fn settle(&self) {
        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl ServiceOutcome {
    /// Returns true for [`ServiceOutcome::Succeeded`].
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

impl std::fmt::Display for ServiceOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            Self::Skipped(reason) => write!(f, "skipped: {reason}"),
        }
    }
}

impl DeploymentResult {
    /// Creates an empty result for a plan that was not applied.
    #[must_use]
    pub const fn empty(plan: DeploymentPlan) -> Self {
        Self {
            plan,
            services: Vec::new(),
            cancelled: false,
            warnings: Vec::new(),
            elapsed_ms: 0,
        }
    }

    /// Number of services that succeeded.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.services.iter().filter(|s| s.outcome.is_success()).count()
    }

    /// Number of services that failed.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.services
            .iter()
            .filter(|s| matches!(s.outcome, ServiceOutcome::Failed(_)))
            .count()
    }

    /// Number of services that were skipped.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.services
            .iter()
            .filter(|s| matches!(s.outcome, ServiceOutcome::Skipped(_)))
            .count()
    }

    /// Names of the services that failed.
    #[must_use]
    pub fn failed_services(&self) -> Vec<&str> {
        self.services
            .iter()
            .filter(|s| matches!(s.outcome, ServiceOutcome::Failed(_)))
            .map(|s| s.name.as_str())
            .collect()
    }

    /// Returns true if every attempted service succeeded and nothing was skipped.
    #[must_use]
    pub fn all_successful(&self) -> bool {
        !self.cancelled && self.failed() == 0 && self.skipped() == 0
    }
}

impl std::fmt::Display for DeploymentResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Applied {} services: {} successful, {} failed, {} skipped",
            self.services.len(),
            self.succeeded(),
            self.failed(),
            self.skipped()
        )
    }
}
