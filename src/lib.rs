// ============================================================================
// Linting - Dangerous or non-idiomatic practices are rejected
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![warn(missing_docs)]                // Public items should be documented
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![cfg_attr(not(test), warn(clippy::unwrap_used))]  // unwrap() warning
#![cfg_attr(not(test), warn(clippy::expect_used))]  // expect() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Stackshift
//!
//! Change-driven selective redeployment of a Docker Compose stack.
//!
//! ## Overview
//!
//! On every push, stackshift works out which services the new commits touch
//! and redeploys only those:
//!
//! - Changed paths are read from git between the deployed and the new revision
//! - A path-prefix rule table maps every path to the services it affects
//! - Secrets for the affected services are written into their `.env` files
//! - Affected services are rebuilt one by one without restarting dependents,
//!   or the whole stack is rebuilt when a shared file changed
//!
//! ## Architecture
//!
//! 1. **Diff**: [`diff::GitDiffReader`] lists the changed paths
//! 2. **Resolve**: [`planner::ChangeResolver`] applies longest-prefix-wins rules
//! 3. **Materialize**: [`secrets::EnvironmentMaterializer`] rewrites `.env` files
//! 4. **Execute**: [`planner::DeploymentExecutor`] drives the [`runtime`]
//! 5. **Record**: [`state`] keeps the deployed revision and a bounded history
//!
//! [`orchestrator::Orchestrator`] runs the pipeline under a host-level lock.
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: shop
//!
//! rules:
//!   - { prefix: docker-compose.yml, targets: all }
//!   - { prefix: order-service, targets: [order-service] }
//!   - { prefix: order-service/docs, targets: [] }
//!
//! services:
//!   - name: order-service
//!     env_file: order-service/.env
//!     secret_keys: [DATABASE_PASSWORD]
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod diff;
pub mod error;
pub mod orchestrator;
pub mod planner;
pub mod runtime;
pub mod secrets;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigParser, ConfigValidator, DeployConfig, RuleTableHasher};
pub use diff::{ChangeSet, DiffSource, GitDiffReader, Revision, RevisionRange};
pub use error::{Result, StackshiftError};
pub use orchestrator::{DeployTrigger, DeploymentReport, Orchestrator, Outcome, PlanPreview, Stage};
pub use planner::{
    CancellationFlag, ChangeResolver, DeploymentExecutor, DeploymentPlan, DeploymentResult,
    RuleTable, resolve,
};
pub use runtime::{ComposeRuntime, ContainerRuntime};
pub use secrets::{EnvironmentMaterializer, SecretBundle, SecretStore};
pub use state::{DeploymentState, LocalStateStore, StateStore};
