//! Container runtime module.
//!
//! This module provides the interface to the container orchestration layer
//! and its Docker Compose implementation.

mod backend;
mod compose;
mod types;

pub use backend::ContainerRuntime;
pub use compose::ComposeRuntime;
pub use types::{ServiceState, ServiceStatus, ServiceTarget};
