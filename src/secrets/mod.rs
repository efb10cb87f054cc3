//! Secrets module.
//!
//! This module fetches secret values for a deployment attempt and writes them
//! into the runtime-config files of the services being redeployed.

mod bundle;
mod materializer;
mod store;

pub use bundle::SecretBundle;
pub use materializer::{EnvFileSession, EnvironmentMaterializer, MaterializedFile, Opened, Snapshotted};
pub use store::{EnvSecretStore, FileSecretStore, SecretStore, from_config};

#[cfg(test)]
pub use store::MockSecretStore;
