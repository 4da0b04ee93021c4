//! Backup reconciliation between the local config tree and the durable store
//!
//! Last write wins by sync marker. `restore` runs once at boot before the
//! scheduled `push` is armed; both take the same lock so they never overlap.

use crate::config::{BackupSettings, GatewaySettings};
use crate::storage::{validate_key, SharedStore, StorageError};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Epoch values above this are read as milliseconds
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// Point in time of the last successful sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SyncMarker(DateTime<Utc>);

impl SyncMarker {
    fn from_millis(ms: i64) -> Option<Self> {
        Utc.timestamp_millis_opt(ms).single().map(SyncMarker)
    }

    pub fn now() -> Self {
        let now = Utc::now();
        Self::from_millis(now.timestamp_millis()).unwrap_or(SyncMarker(now))
    }

    /// RFC 3339, or epoch seconds or milliseconds
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Self::from_millis(parsed.with_timezone(&Utc).timestamp_millis());
        }
        let epoch: i64 = raw.parse().ok()?;
        if epoch > EPOCH_MILLIS_THRESHOLD {
            Self::from_millis(epoch)
        } else {
            Utc.timestamp_opt(epoch, 0).single().map(SyncMarker)
        }
    }

    /// Current time, but always strictly after `previous`
    pub fn advance_from(previous: Option<SyncMarker>) -> Self {
        let now = Self::now();
        match previous {
            Some(prev) if now <= prev => SyncMarker(prev.0 + chrono::Duration::milliseconds(1)),
            _ => now,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.0
    }
}

impl fmt::Display for SyncMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_rfc3339_opts(SecondsFormat::Millis, true))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RestoreReason {
    LocalMissing,
    LocalMarkerMissing,
    RemoteNewer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum KeepReason {
    RemoteMarkerMissing,
    LocalUpToDate,
}

/// Result of the boot-time restore; never an error
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum RestoreOutcome {
    /// No gateway config under the remote root
    Skipped,
    KeptLocal { reason: KeepReason },
    Restored {
        reason: RestoreReason,
        files: usize,
        skills: usize,
    },
    Failed { error: String },
}

/// Result of a push, reported structurally
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushOutcome {
    pub success: bool,
    #[serde(rename = "lastSync", skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl PushOutcome {
    fn succeeded(marker: SyncMarker) -> Self {
        Self {
            success: true,
            last_sync: Some(marker.to_string()),
            error: None,
            details: None,
        }
    }

    fn failed(err: &SyncError) -> Self {
        let error = match err {
            SyncError::SourceMissing(_) => "Sync aborted: source missing",
            _ => "Sync failed",
        };
        Self {
            success: false,
            last_sync: None,
            error: Some(error.to_string()),
            details: Some(err.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("local I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("local config '{0}' does not exist")]
    SourceMissing(PathBuf),

    #[error("remote sync marker did not read back as {0}")]
    MarkerNotPersisted(String),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> SyncError + '_ {
    move |source| SyncError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Contents of `path`, or `None` when it vanished after being listed
async fn read_if_present(path: &Path) -> Result<Option<Vec<u8>>, SyncError> {
    match tokio::fs::read(path).await {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_err(path)(e)),
    }
}

/// Storage state as reported by the admin surface
#[derive(Debug, Clone, Serialize)]
pub struct BackupStatus {
    pub configured: bool,
    pub location: String,
    #[serde(rename = "remoteSync")]
    pub remote_sync: Option<String>,
    #[serde(rename = "localSync")]
    pub local_sync: Option<String>,
}

/// Prefix of in-progress atomic writes
const TEMP_FILE_PREFIX: &str = ".tmp";

/// `*.ext` suffix patterns or exact file names; atomic-write temp files always
fn is_excluded(name: &str, patterns: &[String]) -> bool {
    if name.starts_with(TEMP_FILE_PREFIX) {
        return true;
    }
    patterns.iter().any(|pattern| match pattern.strip_prefix('*') {
        Some(suffix) => name.ends_with(suffix),
        None => name == pattern,
    })
}

/// Compares and copies the local config tree against the remote store
pub struct BackupReconciler {
    store: SharedStore,
    settings: BackupSettings,
    config_dir: PathBuf,
    config_file: String,
    lock: Mutex<()>,
}

impl BackupReconciler {
    pub fn new(store: SharedStore, settings: BackupSettings, gateway: &GatewaySettings) -> Self {
        Self {
            store,
            settings,
            config_dir: gateway.config_dir.clone(),
            config_file: gateway.config_file.clone(),
            lock: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &BackupSettings {
        &self.settings
    }

    fn config_prefix(&self) -> &str {
        self.settings.config_prefix.trim_matches('/')
    }

    fn skills_prefix(&self) -> &str {
        self.settings.skills_prefix.trim_matches('/')
    }

    fn local_config(&self) -> PathBuf {
        self.config_dir.join(&self.config_file)
    }

    fn local_marker_path(&self) -> PathBuf {
        self.config_dir.join(&self.settings.marker)
    }

    async fn remote_marker(&self) -> Result<Option<SyncMarker>, SyncError> {
        let raw = self.store.get(&self.settings.marker).await?;
        Ok(raw.and_then(|bytes| SyncMarker::parse(&String::from_utf8_lossy(&bytes))))
    }

    async fn local_marker(&self) -> Option<SyncMarker> {
        let raw = tokio::fs::read_to_string(self.local_marker_path()).await.ok()?;
        SyncMarker::parse(&raw)
    }

    async fn write_local_marker(&self, marker: SyncMarker) -> Result<(), SyncError> {
        let path = self.local_marker_path();
        tokio::fs::create_dir_all(&self.config_dir)
            .await
            .map_err(io_err(&self.config_dir))?;
        tokio::fs::write(&path, marker.to_string())
            .await
            .map_err(io_err(&path))
    }

    /// Pull remote state down if it should win; failures keep local state
    pub async fn restore(&self) -> RestoreOutcome {
        let _guard = self.lock.lock().await;
        match self.try_restore().await {
            Ok(outcome) => {
                info!(?outcome, "Backup restore finished");
                outcome
            }
            Err(e) => {
                error!(error = %e, "Backup restore failed, keeping local state");
                RestoreOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    async fn try_restore(&self) -> Result<RestoreOutcome, SyncError> {
        let remote_config = format!("{}/{}", self.config_prefix(), self.config_file);
        if self.store.get(&remote_config).await?.is_none() {
            debug!(key = %remote_config, "No remote backup");
            return Ok(RestoreOutcome::Skipped);
        }

        let remote_marker = self.remote_marker().await?;
        let reason = if !self.local_config().exists() {
            RestoreReason::LocalMissing
        } else {
            match (remote_marker, self.local_marker().await) {
                (None, _) => {
                    return Ok(RestoreOutcome::KeptLocal {
                        reason: KeepReason::RemoteMarkerMissing,
                    })
                }
                (Some(_), None) => RestoreReason::LocalMarkerMissing,
                (Some(remote), Some(local)) if remote > local => RestoreReason::RemoteNewer,
                (Some(_), Some(_)) => {
                    return Ok(RestoreOutcome::KeptLocal {
                        reason: KeepReason::LocalUpToDate,
                    })
                }
            }
        };

        info!(?reason, "Restoring gateway state from backup");
        let files = self.pull_tree(self.config_prefix(), &self.config_dir).await?;
        let skills = self
            .pull_tree(self.skills_prefix(), &self.settings.skills_dir)
            .await?;
        if let Some(marker) = remote_marker {
            self.write_local_marker(marker).await?;
        }

        Ok(RestoreOutcome::Restored {
            reason,
            files,
            skills,
        })
    }

    /// Copy every remote key under `prefix` into `dest`; extras in `dest` stay
    async fn pull_tree(&self, prefix: &str, dest: &Path) -> Result<usize, SyncError> {
        if prefix.is_empty() {
            return Ok(0);
        }
        let keys = self.store.list(prefix).await?;
        let mut copied = 0;
        for key in keys {
            let Some(relative) = key.strip_prefix(prefix).and_then(|k| k.strip_prefix('/')) else {
                continue;
            };
            validate_key(relative)?;
            let Some(data) = self.store.get(&key).await? else {
                continue;
            };
            let target = dest.join(relative);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(io_err(parent))?;
            }
            tokio::fs::write(&target, data).await.map_err(io_err(&target))?;
            copied += 1;
        }
        debug!(prefix, copied, dest = %dest.display(), "Pulled backup tree");
        Ok(copied)
    }

    /// Copy local state up and advance the remote marker
    pub async fn push(&self) -> PushOutcome {
        let _guard = self.lock.lock().await;
        match self.try_push().await {
            Ok(marker) => PushOutcome::succeeded(marker),
            Err(e) => PushOutcome::failed(&e),
        }
    }

    async fn try_push(&self) -> Result<SyncMarker, SyncError> {
        let local_config = self.local_config();
        if !local_config.exists() {
            return Err(SyncError::SourceMissing(local_config));
        }

        let previous = self.remote_marker().await?;
        self.push_tree(&self.config_dir, self.config_prefix()).await?;
        self.push_tree(&self.settings.skills_dir, self.skills_prefix())
            .await?;

        let marker = SyncMarker::advance_from(previous);
        self.store
            .put(&self.settings.marker, marker.to_string().as_bytes())
            .await?;
        if self.remote_marker().await? != Some(marker) {
            return Err(SyncError::MarkerNotPersisted(marker.to_string()));
        }

        if let Err(e) = self.write_local_marker(marker).await {
            warn!(error = %e, "Remote marker advanced but local marker could not be written");
        }
        Ok(marker)
    }

    async fn local_files(&self, root: &Path) -> Result<Vec<String>, SyncError> {
        let mut files = Vec::new();
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await.map_err(io_err(&dir))?;
            while let Some(entry) = entries.next_entry().await.map_err(io_err(&dir))? {
                let path = entry.path();
                let file_type = entry.file_type().await.map_err(io_err(&path))?;
                let name = entry.file_name().to_string_lossy().to_string();
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                if !file_type.is_file() || is_excluded(&name, &self.settings.exclude) {
                    continue;
                }
                if dir == root && name == self.settings.marker {
                    continue;
                }
                if let Ok(relative) = path.strip_prefix(root) {
                    let key = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    files.push(key);
                }
            }
        }
        files.sort();
        Ok(files)
    }

    /// Mirror `root` under `prefix`, deleting remote keys absent locally
    async fn push_tree(&self, root: &Path, prefix: &str) -> Result<usize, SyncError> {
        if prefix.is_empty() || !root.is_dir() {
            debug!(root = %root.display(), "Nothing to push");
            return Ok(0);
        }

        let files = self.local_files(root).await?;
        let mut pushed = HashSet::with_capacity(files.len());
        for relative in &files {
            let path = root.join(relative);
            let Some(data) = read_if_present(&path).await? else {
                debug!(path = %path.display(), "File removed during push, skipping");
                continue;
            };
            let key = format!("{}/{}", prefix, relative);
            self.store.put(&key, &data).await?;
            pushed.insert(key);
        }

        let mut deleted = 0;
        for key in self.store.list(prefix).await? {
            if !pushed.contains(&key) {
                self.store.delete(&key).await?;
                deleted += 1;
            }
        }

        debug!(prefix, pushed = pushed.len(), deleted, "Pushed backup tree");
        Ok(pushed.len())
    }

    pub async fn status(&self) -> BackupStatus {
        let remote_sync = match self.remote_marker().await {
            Ok(marker) => marker.map(|m| m.to_string()),
            Err(e) => {
                warn!(error = %e, "Failed to read remote sync marker");
                None
            }
        };
        BackupStatus {
            configured: self.settings.enabled,
            location: self.store.describe(),
            remote_sync,
            local_sync: self.local_marker().await.map(|m| m.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{DirStore, ObjectStore};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        _local: TempDir,
        remote: TempDir,
        config_dir: PathBuf,
        skills_dir: PathBuf,
        store: Arc<DirStore>,
        reconciler: BackupReconciler,
    }

    fn fixture() -> Fixture {
        let local = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        let config_dir = local.path().join("config");
        let skills_dir = local.path().join("skills");

        let mut gateway = GatewaySettings::default();
        gateway.config_dir = config_dir.clone();
        let mut settings = BackupSettings::default();
        settings.enabled = true;
        settings.root = remote.path().to_path_buf();
        settings.skills_dir = skills_dir.clone();

        let store = Arc::new(DirStore::new(remote.path()));
        let reconciler = BackupReconciler::new(store.clone(), settings, &gateway);
        Fixture {
            _local: local,
            remote,
            config_dir,
            skills_dir,
            store,
            reconciler,
        }
    }

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn read(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap()
    }

    fn marker(secs: i64) -> String {
        SyncMarker(Utc.timestamp_opt(secs, 0).unwrap()).to_string()
    }

    impl Fixture {
        fn remote_file(&self, key: &str, content: &str) {
            write(&self.remote.path().join(key), content);
        }

        fn local_config(&self, content: &str) {
            write(&self.config_dir.join("agent.json"), content);
        }

        fn local_marker(&self, content: &str) {
            write(&self.config_dir.join(".last-sync"), content);
        }
    }

    #[test]
    fn test_marker_parse_formats() {
        let rfc = SyncMarker::parse("2026-03-01T12:00:00.250Z").unwrap();
        assert_eq!(rfc.timestamp().timestamp_millis(), 1_772_366_400_250);
        assert_eq!(SyncMarker::parse("1772366400").unwrap().timestamp().timestamp(), 1_772_366_400);
        assert_eq!(
            SyncMarker::parse("1772366400250\n").unwrap(),
            rfc
        );
        assert!(SyncMarker::parse("").is_none());
        assert!(SyncMarker::parse("yesterday").is_none());
        assert_eq!(SyncMarker::parse(&rfc.to_string()), Some(rfc));
    }

    #[test]
    fn test_marker_advances_strictly() {
        let future = SyncMarker(Utc::now() + chrono::Duration::hours(1));
        let next = SyncMarker::advance_from(Some(future));
        assert!(next > future);
        assert_eq!((next.timestamp() - future.timestamp()).num_milliseconds(), 1);

        let past = SyncMarker(Utc.timestamp_opt(0, 0).unwrap());
        assert!(SyncMarker::advance_from(Some(past)) > past);
    }

    #[test]
    fn test_exclude_patterns() {
        let patterns = vec!["*.lock".to_string(), "*.log".to_string(), "state.tmp".to_string()];
        assert!(is_excluded("gateway.lock", &patterns));
        assert!(is_excluded("debug.log", &patterns));
        assert!(is_excluded("state.tmp", &patterns));
        assert!(!is_excluded("agent.json", &patterns));
        assert!(!is_excluded("other.tmp", &patterns));
        assert!(is_excluded(".tmpX3kQ9a", &patterns));
        assert!(is_excluded(".tmpX3kQ9a", &[]));
    }

    #[tokio::test]
    async fn test_restore_skips_without_remote_config() {
        let f = fixture();
        f.local_config("local");
        f.remote_file(".last-sync", &marker(2_000_000_000));
        assert_eq!(f.reconciler.restore().await, RestoreOutcome::Skipped);
        assert_eq!(read(&f.config_dir.join("agent.json")), "local");

        let f = fixture();
        assert_eq!(f.reconciler.restore().await, RestoreOutcome::Skipped);
        assert!(!f.config_dir.exists());
    }

    #[tokio::test]
    async fn test_restore_when_local_missing_ignores_markers() {
        let f = fixture();
        f.remote_file("config/agent.json", "remote");
        f.remote_file("config/sessions/main.json", "session");

        let outcome = f.reconciler.restore().await;
        assert_eq!(
            outcome,
            RestoreOutcome::Restored {
                reason: RestoreReason::LocalMissing,
                files: 2,
                skills: 0
            }
        );
        assert_eq!(read(&f.config_dir.join("agent.json")), "remote");
        assert_eq!(read(&f.config_dir.join("sessions/main.json")), "session");
    }

    #[tokio::test]
    async fn test_restore_when_remote_newer() {
        let f = fixture();
        f.remote_file("config/agent.json", "remote");
        f.remote_file(".last-sync", &marker(2_000));
        f.local_config("local");
        f.local_marker(&marker(1_000));

        assert!(matches!(
            f.reconciler.restore().await,
            RestoreOutcome::Restored { reason: RestoreReason::RemoteNewer, .. }
        ));
        assert_eq!(read(&f.config_dir.join("agent.json")), "remote");
        assert_eq!(
            SyncMarker::parse(&read(&f.config_dir.join(".last-sync"))),
            SyncMarker::parse(&marker(2_000))
        );
    }

    #[tokio::test]
    async fn test_restore_keeps_local_when_not_older() {
        for local in [2_000, 3_000] {
            let f = fixture();
            f.remote_file("config/agent.json", "remote");
            f.remote_file(".last-sync", &marker(2_000));
            f.local_config("local");
            f.local_marker(&marker(local));

            assert_eq!(
                f.reconciler.restore().await,
                RestoreOutcome::KeptLocal {
                    reason: KeepReason::LocalUpToDate
                }
            );
            assert_eq!(read(&f.config_dir.join("agent.json")), "local");
        }
    }

    #[tokio::test]
    async fn test_restore_marker_edge_cases() {
        // Local marker missing: remote wins
        let f = fixture();
        f.remote_file("config/agent.json", "remote");
        f.remote_file(".last-sync", "1000");
        f.local_config("local");
        assert!(matches!(
            f.reconciler.restore().await,
            RestoreOutcome::Restored { reason: RestoreReason::LocalMarkerMissing, .. }
        ));

        // Remote marker missing: local wins
        let f = fixture();
        f.remote_file("config/agent.json", "remote");
        f.local_config("local");
        f.local_marker(&marker(1_000));
        assert_eq!(
            f.reconciler.restore().await,
            RestoreOutcome::KeptLocal {
                reason: KeepReason::RemoteMarkerMissing
            }
        );
        assert_eq!(read(&f.config_dir.join("agent.json")), "local");
    }

    #[tokio::test]
    async fn test_restore_keeps_local_extras_and_skills() {
        let f = fixture();
        f.remote_file("config/agent.json", "remote");
        f.local_config("local");
        write(&f.config_dir.join("notes.md"), "mine");
        write(&f.skills_dir.join("web/SKILL.md"), "local skill");
        f.remote_file(".last-sync", &marker(2_000));

        let outcome = f.reconciler.restore().await;
        assert!(matches!(outcome, RestoreOutcome::Restored { skills: 0, .. }));
        assert_eq!(read(&f.config_dir.join("notes.md")), "mine");
        assert_eq!(read(&f.skills_dir.join("web/SKILL.md")), "local skill");

        f.remote_file("skills/web/SKILL.md", "remote skill");
        f.remote_file(".last-sync", &marker(3_000));
        let outcome = f.reconciler.restore().await;
        assert!(matches!(outcome, RestoreOutcome::Restored { skills: 1, .. }));
        assert_eq!(read(&f.skills_dir.join("web/SKILL.md")), "remote skill");
    }

    #[tokio::test]
    async fn test_push_mirrors_and_advances_marker() {
        let f = fixture();
        f.local_config("local");
        write(&f.config_dir.join("gateway.lock"), "lock");
        write(&f.config_dir.join("logs/run.log"), "log");
        write(&f.skills_dir.join("web/SKILL.md"), "skill");
        f.remote_file("config/stale.json", "old");

        let first = f.reconciler.push().await;
        assert!(first.success, "{:?}", first);
        let keys = f.store.list("").await.unwrap();
        assert!(keys.contains(&"config/agent.json".to_string()));
        assert!(keys.contains(&"skills/web/SKILL.md".to_string()));
        assert!(!keys.contains(&"config/stale.json".to_string()));
        assert!(!keys.iter().any(|k| k.ends_with(".lock") || k.ends_with(".log")));
        assert!(!keys.contains(&"config/.last-sync".to_string()));

        let first_marker = SyncMarker::parse(first.last_sync.as_deref().unwrap()).unwrap();
        let local = SyncMarker::parse(&read(&f.config_dir.join(".last-sync"))).unwrap();
        assert_eq!(local, first_marker);

        let second = f.reconciler.push().await;
        let second_marker = SyncMarker::parse(second.last_sync.as_deref().unwrap()).unwrap();
        assert!(second_marker > first_marker);
    }

    #[tokio::test]
    async fn test_push_skips_atomic_write_leftovers() {
        let f = fixture();
        f.local_config("local");
        write(&f.config_dir.join(".tmpAb12Cd"), "partial");

        let outcome = f.reconciler.push().await;
        assert!(outcome.success, "{:?}", outcome);
        let keys = f.store.list("config").await.unwrap();
        assert_eq!(keys, vec!["config/agent.json".to_string()]);
    }

    #[tokio::test]
    async fn test_read_if_present_treats_vanished_file_as_absent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone.json");
        assert!(read_if_present(&path).await.unwrap().is_none());

        std::fs::write(&path, "x").unwrap();
        assert_eq!(read_if_present(&path).await.unwrap(), Some(b"x".to_vec()));
    }

    #[tokio::test]
    async fn test_push_without_local_config_fails_without_marker() {
        let f = fixture();
        f.remote_file("config/agent.json", "remote");
        f.remote_file(".last-sync", &marker(1_000));

        let outcome = f.reconciler.push().await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("Sync aborted: source missing"));
        assert!(outcome.last_sync.is_none());
        assert_eq!(read(&f.remote.path().join(".last-sync")), marker(1_000));
        assert_eq!(read(&f.remote.path().join("config/agent.json")), "remote");
    }

    #[tokio::test]
    async fn test_push_then_restore_keeps_local() {
        let f = fixture();
        f.local_config("local");
        assert!(f.reconciler.push().await.success);
        assert_eq!(
            f.reconciler.restore().await,
            RestoreOutcome::KeptLocal {
                reason: KeepReason::LocalUpToDate
            }
        );
    }

    #[tokio::test]
    async fn test_push_outcome_json_shape() {
        let f = fixture();
        let json = serde_json::to_value(f.reconciler.push().await).unwrap();
        assert_eq!(json["success"], false);
        assert!(json.get("lastSync").is_none());
        assert!(json["details"].as_str().unwrap().contains("does not exist"));

        f.local_config("local");
        let json = serde_json::to_value(f.reconciler.push().await).unwrap();
        assert_eq!(json["success"], true);
        assert!(json["lastSync"].is_string());
        assert!(json.get("error").is_none());
    }

    #[tokio::test]
    async fn test_status_reports_markers() {
        let f = fixture();
        let status = f.reconciler.status().await;
        assert!(status.configured);
        assert!(status.remote_sync.is_none());

        f.local_config("local");
        f.reconciler.push().await;
        let status = f.reconciler.status().await;
        assert_eq!(status.remote_sync, status.local_sync);
        assert!(status.remote_sync.is_some());
    }
}
