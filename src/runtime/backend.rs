//! Container runtime trait definition.
//!
//! This module defines the interface the deployment executor drives. It is
//! the only seam through which the running stack is mutated.

use async_trait::async_trait;

use crate::error::RuntimeError;

use super::types::{ServiceStatus, ServiceTarget};

/// Trait for container orchestration backends.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Stops every managed service.
    async fn stop_all(&self) -> Result<(), RuntimeError>;

    /// Fetches prebuilt images for the target.
    ///
    /// Failure is expected to be recoverable: callers fall back to a local build.
    async fn pull_image(&self, target: ServiceTarget<'_>) -> Result<(), RuntimeError>;

    /// Builds and starts the target.
    ///
    /// With `no_deps`, services the target depends on are left untouched.
    async fn build_and_start(&self, target: ServiceTarget<'_>, no_deps: bool) -> Result<(), RuntimeError>;

    /// Lists the state of every service known to the runtime.
    async fn list_status(&self) -> Result<Vec<ServiceStatus>, RuntimeError>;

    /// Gets the backend name.
    fn backend_type(&self) -> &'static str;
}
