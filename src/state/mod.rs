//! State management module for the stackshift deployment system.
//!
//! This module provides persistent state on the deployment host: the last
//! deployed revision, the deployment history and the host-level lock that
//! serialises deployments.

mod store;
mod local;
mod lock;
mod types;

pub use store::StateStore;
pub use local::LocalStateStore;
pub use lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
pub use types::{DeploymentHistoryEntry, DeploymentState, MAX_HISTORY, OutcomeKind, STATE_VERSION};
