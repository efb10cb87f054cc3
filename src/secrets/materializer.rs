//! Runtime-config materialization.
//!
//! Secret values are written into each service's `.env` file. Only the lines
//! of keys the service declares and the bundle holds are rewritten; every
//! other byte of the file is kept. Before the file is replaced, its current
//! content is copied to a timestamped snapshot and flushed to disk.

use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::{DeployConfig, ServiceSecrets};
use crate::error::{Result, SecretError};
use crate::planner::DeploymentPlan;

use super::bundle::SecretBundle;

/// Marker between a file name and its snapshot timestamp.
const SNAPSHOT_MARKER: &str = ".bak.";

/// Writes secrets into per-service runtime-config files.
#[derive(Debug, Clone)]
pub struct EnvironmentMaterializer {
    repository: PathBuf,
    backup_retention: usize,
}

/// Result of materializing one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializedFile {
    /// Service the file belongs to.
    pub service: String,
    /// The runtime-config file.
    pub path: PathBuf,
    /// Snapshot of the previous content, if the file existed.
    pub snapshot: Option<PathBuf>,
    /// Keys written.
    pub keys: Vec<String>,
}

impl EnvironmentMaterializer {
    /// Creates a materializer; relative env files resolve against `repository`.
    #[must_use]
    pub fn new(repository: impl Into<PathBuf>, backup_retention: usize) -> Self {
        Self {
            repository: repository.into(),
            backup_retention: backup_retention.max(1),
        }
    }

    /// Returns the secret declarations of the services the plan redeploys.
    #[must_use]
    pub fn scope<'c>(config: &'c DeployConfig, plan: &DeploymentPlan) -> Vec<&'c ServiceSecrets> {
        config
            .services
            .iter()
            .filter(|s| plan.includes(&s.name))
            .collect()
    }

    /// Returns every key the given services accept.
    #[must_use]
    pub fn required_keys(services: &[&ServiceSecrets]) -> BTreeSet<String> {
        services
            .iter()
            .filter(|s| s.env_file.is_some())
            .flat_map(|s| s.secret_keys.iter().cloned())
            .collect()
    }

    /// Materializes the bundle for every service in scope.
    ///
    /// # Errors
    ///
    /// Returns the first snapshot or write failure. Files already written stay
    /// written; each has its snapshot.
    pub async fn materialize_all(
        &self,
        bundle: &SecretBundle,
        services: &[&ServiceSecrets],
    ) -> Result<Vec<MaterializedFile>> {
        let mut written = Vec::new();
        for service in services {
            if let Some(file) = self.materialize(bundle, service).await? {
                written.push(file);
            }
        }
        Ok(written)
    }

    /// Materializes the bundle into one service's runtime-config file.
    ///
    /// Returns `None` when the service declares no file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, snapshotted or replaced.
    pub async fn materialize(
        &self,
        bundle: &SecretBundle,
        service: &ServiceSecrets,
    ) -> Result<Option<MaterializedFile>> {
        let Some(env_file) = &service.env_file else {
            warn!("Service {} declares no env_file; nothing materialized", service.name);
            return Ok(None);
        };

        let updates: BTreeMap<&str, &str> = service
            .secret_keys
            .iter()
            .filter_map(|key| bundle.get(key).map(|value| (key.as_str(), value)))
            .collect();

        for missing in service.secret_keys.iter().filter(|k| !bundle.contains_key(k)) {
            warn!("Secret {missing} for {} not found in store; keeping current value", service.name);
        }

        let path = self.repository.join(env_file);
        if updates.is_empty() {
            debug!("No secrets to write for {}", service.name);
            return Ok(None);
        }

        let session = EnvFileSession::open(&path).await?;
        let content = render(session.original(), &updates);
        let session = session.snapshot().await?;
        let snapshot = session.write(&content).await?;

        info!(
            "Materialized {} secrets for {} into {}",
            updates.len(),
            service.name,
            path.display()
        );

        if snapshot.is_some() {
            self.prune_snapshots(&path).await;
        }

        Ok(Some(MaterializedFile {
            service: service.name.clone(),
            path,
            snapshot,
            keys: updates.keys().map(|k| (*k).to_string()).collect(),
        }))
    }

    /// Deletes all but the newest snapshots of `path`.
    async fn prune_snapshots(&self, path: &Path) {
        let snapshots = match list_snapshots(path).await {
            Ok(snapshots) => snapshots,
            Err(e) => {
                warn!("Could not list snapshots of {}: {e}", path.display());
                return;
            }
        };

        let excess = snapshots.len().saturating_sub(self.backup_retention);
        for old in snapshots.into_iter().take(excess) {
            debug!("Removing old snapshot {}", old.display());
            if let Err(e) = fs::remove_file(&old).await {
                warn!("Could not remove snapshot {}: {e}", old.display());
            }
        }
    }
}

/// File opened for materialization.
pub struct Opened;

/// File whose current content is safely on disk elsewhere.
pub struct Snapshotted {
    snapshot: Option<PathBuf>,
}

/// Scoped access to one runtime-config file.
///
/// Only a [`Snapshotted`] session can write, so the new content can never
/// reach disk before the old content was preserved.
pub struct EnvFileSession<S> {
    path: PathBuf,
    original: String,
    permissions: Option<std::fs::Permissions>,
    state: S,
}

impl EnvFileSession<Opened> {
    /// Reads the current file. A missing file reads as empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    pub async fn open(path: &Path) -> Result<Self> {
        let (original, permissions) = match fs::read_to_string(path).await {
            Ok(original) => {
                let permissions = fs::metadata(path).await.ok().map(|m| m.permissions());
                (original, permissions)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => (String::new(), None),
            Err(e) => return Err(SecretError::materialization(path, e.to_string()).into()),
        };

        Ok(Self {
            path: path.to_path_buf(),
            original,
            permissions,
            state: Opened,
        })
    }

    /// Gets the content read from disk.
    #[must_use]
    pub fn original(&self) -> &str {
        &self.original
    }

    /// Copies the current content to `<file>.bak.<timestamp>` and syncs it.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be created or synced.
    pub async fn snapshot(self) -> Result<EnvFileSession<Snapshotted>> {
        let snapshot = if self.permissions.is_some() {
            Some(self.write_snapshot().await?)
        } else {
            None
        };

        Ok(EnvFileSession {
            path: self.path,
            original: self.original,
            permissions: self.permissions,
            state: Snapshotted { snapshot },
        })
    }

    async fn write_snapshot(&self) -> Result<PathBuf> {
        let fail = |e: std::io::Error| SecretError::materialization(&self.path, format!("snapshot: {e}"));
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%6fZ").to_string();

        for attempt in 0..10 {
            let candidate = if attempt == 0 {
                snapshot_path(&self.path, &stamp)
            } else {
                snapshot_path(&self.path, &format!("{stamp}-{attempt}"))
            };

            let mut file = match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&candidate)
                .await
            {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(fail(e).into()),
            };

            file.write_all(self.original.as_bytes()).await.map_err(fail)?;
            file.sync_all().await.map_err(fail)?;
            if let Some(permissions) = &self.permissions {
                fs::set_permissions(&candidate, permissions.clone())
                    .await
                    .map_err(fail)?;
            }

            debug!("Snapshot written to {}", candidate.display());
            return Ok(candidate);
        }

        Err(SecretError::materialization(&self.path, "could not pick a free snapshot name").into())
    }
}

impl EnvFileSession<Snapshotted> {
    /// Replaces the file with `content` through a synced temporary file.
    ///
    /// Returns the snapshot taken before the write.
    ///
    /// # Errors
    ///
    /// Returns an error if the temporary file cannot be written or renamed.
    pub async fn write(self, content: &str) -> Result<Option<PathBuf>> {
        let fail = |e: std::io::Error| SecretError::materialization(&self.path, e.to_string());
        let temp_path = temp_path(&self.path);

        let mut file = fs::File::create(&temp_path).await.map_err(fail)?;
        if let Some(permissions) = &self.permissions {
            fs::set_permissions(&temp_path, permissions.clone())
                .await
                .map_err(fail)?;
        }
        file.write_all(content.as_bytes()).await.map_err(fail)?;
        file.sync_all().await.map_err(fail)?;
        drop(file);

        fs::rename(&temp_path, &self.path).await.map_err(fail)?;
        Ok(self.state.snapshot)
    }
}

fn snapshot_path(path: &Path, stamp: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(SNAPSHOT_MARKER);
    name.push(stamp);
    path.with_file_name(name)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".stackshift-tmp");
    path.with_file_name(name)
}

/// Lists snapshots of `path`, oldest first.
async fn list_snapshots(path: &Path) -> std::io::Result<Vec<PathBuf>> {
    let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return Ok(Vec::new());
    };
    let prefix = format!("{file_name}{SNAPSHOT_MARKER}");
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));

    let mut snapshots = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            snapshots.push(entry.path());
        }
    }
    snapshots.sort();
    Ok(snapshots)
}

/// Rewrites the lines of `updates` keys in dotenv content.
///
/// Comments, blank lines, unknown keys and line endings are kept as they are.
/// Keys absent from the content are appended at the end.
fn render(original: &str, updates: &BTreeMap<&str, &str>) -> String {
    let mut out = String::with_capacity(original.len() + 64);
    let mut written = BTreeSet::new();

    for line in original.split_inclusive('\n') {
        let (body, ending) = split_line_ending(line);
        match assignment_key(body) {
            Some((lead, key)) if updates.contains_key(key) => {
                out.push_str(lead);
                out.push_str(key);
                out.push('=');
                out.push_str(&quote(updates[key]));
                out.push_str(ending);
                written.insert(key);
            }
            _ => out.push_str(line),
        }
    }

    let mut missing = updates.iter().filter(|(k, _)| !written.contains(*k)).peekable();
    if missing.peek().is_some() && !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    for (key, value) in missing {
        out.push_str(key);
        out.push('=');
        out.push_str(&quote(value));
        out.push('\n');
    }

    out
}

fn split_line_ending(line: &str) -> (&str, &str) {
    if let Some(body) = line.strip_suffix("\r\n") {
        (body, "\r\n")
    } else if let Some(body) = line.strip_suffix('\n') {
        (body, "\n")
    } else {
        (line, "")
    }
}

/// Splits `  export KEY=value` into (`  export `, `KEY`).
fn assignment_key(body: &str) -> Option<(&str, &str)> {
    let trimmed = body.trim_start();
    if trimmed.starts_with('#') {
        return None;
    }
    let indent = body.len() - trimmed.len();
    let rest = trimmed.strip_prefix("export ").unwrap_or(trimmed);
    let lead_len = indent + (trimmed.len() - rest.len());

    let eq = rest.find('=')?;
    let key = rest[..eq].trim_end();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }
    Some((&body[..lead_len], key))
}

/// Quotes a value so dotenv parsers and Compose read it back unchanged.
///
/// Single quotes are literal in both. Values that cannot be single-quoted
/// are double-quoted with `$` escaped so no interpolation happens.
fn quote(value: &str) -> String {
    let plain = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:@+,%".contains(c));
    if plain {
        return value.to_string();
    }
    if !value.contains(['\'', '\n', '\r']) {
        return format!("'{value}'");
    }
    let escaped = value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('$', "\\$")
        .replace('\n', "\\n");
    format!("\"{escaped}\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn service(env_file: Option<&str>, keys: &[&str]) -> ServiceSecrets {
        ServiceSecrets {
            name: String::from("notification-service"),
            env_file: env_file.map(PathBuf::from),
            secret_keys: keys.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    fn bundle(pairs: &[(&str, &str)]) -> SecretBundle {
        pairs.iter().copied().collect()
    }

    #[tokio::test]
    async fn test_rewrites_only_recognised_keys() {
        let dir = TempDir::new().unwrap();
        let original = "# mail relay\nKEY_A=old\nKEY_B=old\n\nLOG_LEVEL=info\n";
        std::fs::write(dir.path().join(".env"), original).unwrap();

        let materializer = EnvironmentMaterializer::new(dir.path(), 5);
        let written = materializer
            .materialize(
                &bundle(&[("KEY_A", "new"), ("UNRELATED", "x")]),
                &service(Some(".env"), &["KEY_A", "KEY_B"]),
            )
            .await
            .unwrap()
            .unwrap();

        let content = std::fs::read_to_string(dir.path().join(".env")).unwrap();
        assert_eq!(content, "# mail relay\nKEY_A=new\nKEY_B=old\n\nLOG_LEVEL=info\n");
        assert_eq!(written.keys, vec!["KEY_A"]);

        let snapshot = written.snapshot.unwrap();
        assert_eq!(std::fs::read_to_string(snapshot).unwrap(), original);
    }

    #[tokio::test]
    async fn test_appends_missing_keys_and_creates_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".env"), "export KEY_A=old").unwrap();

        let materializer = EnvironmentMaterializer::new(dir.path(), 5);
        materializer
            .materialize(
                &bundle(&[("KEY_A", "new value"), ("KEY_B", "b")]),
                &service(Some(".env"), &["KEY_A", "KEY_B"]),
            )
            .await
            .unwrap();
        let content = std::fs::read_to_string(dir.path().join(".env")).unwrap();
        assert_eq!(content, "export KEY_A='new value'\nKEY_B=b\n");

        let fresh = materializer
            .materialize(
                &bundle(&[("KEY_A", "a")]),
                &service(Some("fresh.env"), &["KEY_A"]),
            )
            .await
            .unwrap()
            .unwrap();
        assert!(fresh.snapshot.is_none());
        assert_eq!(std::fs::read_to_string(dir.path().join("fresh.env")).unwrap(), "KEY_A=a\n");
    }

    #[tokio::test]
    async fn test_no_env_file_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let materializer = EnvironmentMaterializer::new(dir.path(), 5);
        let result = materializer
            .materialize(&bundle(&[("KEY_A", "a")]), &service(None, &["KEY_A"]))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_nothing_in_bundle_leaves_file_untouched() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".env"), "KEY_A=old\n").unwrap();

        let materializer = EnvironmentMaterializer::new(dir.path(), 5);
        let result = materializer
            .materialize(&SecretBundle::new(), &service(Some(".env"), &["KEY_A"]))
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(std::fs::read_to_string(dir.path().join(".env")).unwrap(), "KEY_A=old\n");
        assert!(list_snapshots(&dir.path().join(".env")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_retention() {
        let dir = TempDir::new().unwrap();
        let env = dir.path().join(".env");
        std::fs::write(&env, "KEY_A=0\n").unwrap();

        let materializer = EnvironmentMaterializer::new(dir.path(), 2);
        for i in 1..=4 {
            let value = i.to_string();
            materializer
                .materialize(&bundle(&[("KEY_A", value.as_str())]), &service(Some(".env"), &["KEY_A"]))
                .await
                .unwrap();
        }

        let snapshots = list_snapshots(&env).await.unwrap();
        assert_eq!(snapshots.len(), 2);
        let newest = std::fs::read_to_string(snapshots.last().unwrap()).unwrap();
        assert_eq!(newest, "KEY_A=3\n");
    }

    #[test]
    fn test_scope_follows_plan() {
        let config: DeployConfig = serde_yaml::from_str(
            "project: { name: shop }\nservices:\n  - { name: a, env_file: a/.env, secret_keys: [K1] }\n  - { name: b, env_file: b/.env, secret_keys: [K2] }\n  - { name: c, secret_keys: [K3] }\n",
        )
        .unwrap();

        let names = |plan: &DeploymentPlan| {
            EnvironmentMaterializer::scope(&config, plan)
                .iter()
                .map(|s| s.name.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(names(&DeploymentPlan::All), vec!["a", "b", "c"]);
        assert_eq!(names(&DeploymentPlan::subset(["b", "z"])), vec!["b"]);
        assert!(names(&DeploymentPlan::NoOp).is_empty());

        let scoped = EnvironmentMaterializer::scope(&config, &DeploymentPlan::All);
        let keys: Vec<String> = EnvironmentMaterializer::required_keys(&scoped).into_iter().collect();
        assert_eq!(keys, vec!["K1", "K2"]);
    }

    #[test]
    fn test_render_keeps_crlf_and_duplicates() {
        let updates = BTreeMap::from([("A", "1")]);
        assert_eq!(render("A=0\r\nB=2\r\nA=9\r\n", &updates), "A=1\r\nB=2\r\nA=1\r\n");
        assert_eq!(render("", &updates), "A=1\n");
        assert_eq!(render("#A=0\n", &updates), "#A=0\nA=1\n");
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote("plain-value_1"), "plain-value_1");
        assert_eq!(quote("has space"), "'has space'");
        assert_eq!(quote("pa$word!"), "'pa$word!'");
        assert_eq!(quote("it's $5"), "\"it's \\$5\"");
        assert_eq!(quote("a\"b'c"), "\"a\\\"b'c\"");
    }

    #[tokio::test]
    async fn test_written_values_read_back_verbatim() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".env"), "SMTP_PASSWORD=old\n").unwrap();

        let values = [
            ("SMTP_PASSWORD", "pa$word!"),
            ("API_TOKEN", "it's ${HOME} and $PATH"),
            ("DSN", "postgres://u:p w@db/app?x=\"1\""),
            ("BACKSLASH", "C:\\tmp\\$x'"),
        ];
        let keys: Vec<&str> = values.iter().map(|(k, _)| *k).collect();

        let materializer = EnvironmentMaterializer::new(dir.path(), 5);
        materializer
            .materialize(&bundle(&values), &service(Some(".env"), &keys))
            .await
            .unwrap()
            .unwrap();

        let parsed: BTreeMap<String, String> = dotenvy::from_path_iter(dir.path().join(".env"))
            .unwrap()
            .map(std::result::Result::unwrap)
            .collect();
        for (key, value) in values {
            assert_eq!(parsed.get(key).map(String::as_str), Some(value), "{key}");
        }
    }
}
