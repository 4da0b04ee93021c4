//! Durable object store used for backups
//!
//! Keys are `/`-separated relative paths. [`DirStore`] maps them onto a
//! directory, which is how a mounted bucket appears inside the container.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid storage key '{0}'")]
    InvalidKey(String),

    #[error("storage I/O error on '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

/// Key-addressed put/get/list over byte blobs
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, data: &[u8]) -> Result<(), StorageError>;

    /// `None` when the key does not exist
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Every key under `prefix`, recursively, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Deleting a missing key is not an error
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Human-readable location, for status output
    fn describe(&self) -> String;
}

pub type SharedStore = Arc<dyn ObjectStore>;

/// Reject keys that could escape the store root
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    let invalid = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..");
    if invalid {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Object store over a directory tree
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

fn io_error(key: &str) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        key: key.to_string(),
        source,
    }
}

#[async_trait]
impl ObjectStore for DirStore {
    async fn put(&self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_error(key))?;
        }
        tokio::fs::write(&path, data).await.map_err(io_error(key))?;
        debug!(key, bytes = data.len(), "Stored object");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            // A directory at the key is not an object
            Err(_) if path.is_dir() => Ok(None),
            Err(e) => Err(io_error(key)(e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let prefix = prefix.trim_matches('/');
        let start = if prefix.is_empty() {
            self.root.clone()
        } else {
            self.path_for(prefix)?
        };

        let mut keys = Vec::new();
        let mut pending = vec![start];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error(prefix)(e)),
            };
            while let Some(entry) = entries.next_entry().await.map_err(io_error(prefix))? {
                let file_type = entry.file_type().await.map_err(io_error(prefix))?;
                let path = entry.path();
                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file() {
                    if let Ok(relative) = path.strip_prefix(&self.root) {
                        let key = relative
                            .components()
                            .map(|c| c.as_os_str().to_string_lossy())
                            .collect::<Vec<_>>()
                            .join("/");
                        keys.push(key);
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(key)(e)),
        }
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("config/agent.json").is_ok());
        assert!(validate_key(".last-sync").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("/etc/passwd").is_err());
        assert!(validate_key("config/../../etc").is_err());
        assert!(validate_key("config//agent.json").is_err());
        assert!(validate_key("./agent.json").is_err());
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let store = DirStore::new(dir.path());

        assert!(store.get("config/agent.json").await.unwrap().is_none());
        store.put("config/agent.json", b"{}").await.unwrap();
        assert_eq!(store.get("config/agent.json").await.unwrap().unwrap(), b"{}");
        assert!(dir.path().join("config/agent.json").exists());

        store.delete("config/agent.json").await.unwrap();
        store.delete("config/agent.json").await.unwrap();
        assert!(store.get("config/agent.json").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_is_recursive_and_scoped() {
        let dir = TempDir::new().unwrap();
        let store = DirStore::new(dir.path());
        store.put("config/agent.json", b"1").await.unwrap();
        store.put("config/sessions/a.json", b"2").await.unwrap();
        store.put("skills/web/SKILL.md", b"3").await.unwrap();
        store.put(".last-sync", b"4").await.unwrap();

        assert_eq!(
            store.list("config").await.unwrap(),
            vec!["config/agent.json", "config/sessions/a.json"]
        );
        assert_eq!(store.list("skills/").await.unwrap(), vec!["skills/web/SKILL.md"]);
        assert_eq!(store.list("").await.unwrap().len(), 4);
        assert!(store.list("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_on_directory_is_none() {
        let dir = TempDir::new().unwrap();
        let store = DirStore::new(dir.path());
        store.put("config/agent.json", b"1").await.unwrap();
        assert!(store.get("config").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let dir = TempDir::new().unwrap();
        let store = DirStore::new(dir.path().join("bucket"));
        let err = store.put("../outside", b"x").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey(_)));
    }
}
