//! Secret store trait and implementations.
//!
//! Stores are read-only. A key the store does not hold is simply absent from
//! the returned bundle; deciding whether that matters is up to the caller.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::env::VarError;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::{SecretSource, SecretsConfig};
use crate::error::{Result, SecretError, StackshiftError};

use super::bundle::SecretBundle;

/// Read-only source of secret values.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetches the requested keys.
    async fn fetch(&self, keys: &BTreeSet<String>) -> Result<SecretBundle>;

    /// Gets the store type name.
    fn backend_type(&self) -> &'static str;
}

/// Creates the store described by the configuration.
///
/// # Errors
///
/// Returns an error if the file source has no path.
pub fn from_config(config: &SecretsConfig) -> Result<Box<dyn SecretStore>> {
    match config.source {
        SecretSource::Env => Ok(Box::new(EnvSecretStore::new(config.prefix.clone()))),
        SecretSource::File => {
            let path = config.path.clone().ok_or_else(|| {
                StackshiftError::Secret(SecretError::StoreUnavailable {
                    message: String::from("secrets.path is required for the file source"),
                })
            })?;
            Ok(Box::new(FileSecretStore::new(path)))
        }
    }
}

/// Secret store backed by the process environment.
#[derive(Debug, Clone, Default)]
pub struct EnvSecretStore {
    prefix: Option<String>,
}

impl EnvSecretStore {
    /// Creates a store; each key is looked up as `<prefix><key>`.
    #[must_use]
    pub const fn new(prefix: Option<String>) -> Self {
        Self { prefix }
    }

    fn variable(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}{key}"),
            None => key.to_string(),
        }
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn fetch(&self, keys: &BTreeSet<String>) -> Result<SecretBundle> {
        let mut bundle = SecretBundle::new();

        for key in keys {
            let variable = self.variable(key);
            match std::env::var(&variable) {
                Ok(value) => bundle.insert(key.as_str(), value),
                Err(VarError::NotPresent) => debug!("Secret {variable} not set"),
                Err(VarError::NotUnicode(_)) => {
                    return Err(SecretError::StoreUnavailable {
                        message: format!("Environment variable {variable} is not valid UTF-8"),
                    }
                    .into());
                }
            }
        }

        Ok(bundle)
    }

    fn backend_type(&self) -> &'static str {
        "env"
    }
}

/// Secret store backed by a dotenv-format file kept outside version control.
#[derive(Debug, Clone)]
pub struct FileSecretStore {
    path: PathBuf,
}

impl FileSecretStore {
    /// Creates a store reading `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Gets the secrets file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn fetch(&self, keys: &BTreeSet<String>) -> Result<SecretBundle> {
        let unavailable = |e: dotenvy::Error| SecretError::StoreUnavailable {
            message: format!("Failed to read {}: {e}", self.path.display()),
        };

        let mut bundle = SecretBundle::new();
        for item in dotenvy::from_path_iter(&self.path).map_err(unavailable)? {
            let (key, value) = item.map_err(unavailable)?;
            if keys.contains(&key) {
                bundle.insert(key, value);
            }
        }

        debug!("Read {} of {} secrets from {}", bundle.len(), keys.len(), self.path.display());
        Ok(bundle)
    }

    fn backend_type(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn keys(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[tokio::test]
    async fn test_file_store_returns_requested_keys_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("secrets.env");
        std::fs::write(
            &path,
            "# production secrets\nSMTP_USER=mailer\nSMTP_PASSWORD=\"s3cr3t value\"\nDB_PASSWORD=other\n",
        )
        .unwrap();

        let store = FileSecretStore::new(&path);
        let bundle = store
            .fetch(&keys(&["SMTP_USER", "SMTP_PASSWORD", "MISSING"]))
            .await
            .unwrap();

        assert_eq!(bundle.len(), 2);
        assert_eq!(bundle.get("SMTP_PASSWORD"), Some("s3cr3t value"));
        assert!(!bundle.contains_key("DB_PASSWORD"));
        assert!(!bundle.contains_key("MISSING"));
    }

    #[tokio::test]
    async fn test_missing_file_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let store = FileSecretStore::new(dir.path().join("absent.env"));
        let result = store.fetch(&keys(&["A"])).await;
        assert!(matches!(
            result,
            Err(StackshiftError::Secret(SecretError::StoreUnavailable { .. }))
        ));
    }

    #[tokio::test]
    async fn test_env_store_reads_process_environment() {
        // Cargo sets CARGO_PKG_NAME for test binaries.
        let store = EnvSecretStore::new(Some(String::from("CARGO_PKG_")));
        let bundle = store.fetch(&keys(&["NAME", "STACKSHIFT_SURELY_UNSET"])).await.unwrap();
        assert_eq!(bundle.get("NAME"), Some("stackshift"));
        assert_eq!(bundle.len(), 1);
    }

    #[test]
    fn test_file_source_requires_path() {
        let config = SecretsConfig {
            source: SecretSource::File,
            path: None,
            prefix: None,
        };
        assert!(from_config(&config).is_err());
        assert_eq!(
            from_config(&SecretsConfig::default()).unwrap().backend_type(),
            "env"
        );
    }
}
