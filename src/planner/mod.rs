//! Planning module for deployment operations.
//!
//! This module turns changed paths into a deployment decision and applies it:
//! the rule table, the change resolver, the plan type and the executor.

mod rules;
mod resolver;
mod plan;
mod executor;

pub use rules::{RuleTable, ServiceRule, normalize_path, normalize_prefix};
pub use resolver::{ChangeResolver, PathMatch, Resolution, resolve};
pub use plan::DeploymentPlan;
pub use executor::{
    CancellationFlag, DeploymentExecutor, DeploymentResult, ServiceOutcome, ServiceResult,
};

#[cfg(test)]
pub(crate) use executor::tests::RecordingRuntime;
