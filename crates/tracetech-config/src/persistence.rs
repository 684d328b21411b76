//! Durable local key/value storage for small JSON blobs.
//!
//! Two keys are used by the engine: [`SESSION_KEY`] holds the signed-in actor
//! and [`SNAPSHOT_KEY`] holds the cached records/actors/vocabulary used for
//! restart continuity.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Key of the persisted session actor blob.
pub const SESSION_KEY: &str = "trace_user";

/// Key of the persisted application snapshot.
pub const SNAPSHOT_KEY: &str = "trace_state";

/// Minimal string key/value store.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn put(&self, key: &str, value: &str) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;
}

/// Read and decode a JSON value stored under `key`.
pub fn load_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>> {
    match store.get(key)? {
        Some(raw) => {
            let value = serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse stored value for key '{}'", key))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Encode `value` as JSON and store it under `key`.
pub fn save_json<T: Serialize>(store: &dyn KeyValueStore, key: &str, value: &T) -> Result<()> {
    let raw = serde_json::to_string(value)
        .with_context(|| format!("Failed to serialize value for key '{}'", key))?;
    store.put(key, &raw)
}

/// One JSON file per key inside a directory. Writes go through a temp file
/// and a rename so a crash never leaves a half-written blob behind.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create storage dir: {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.root.join(format!("{}.json", safe))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("Failed to read {}", path.display()))
            }
        }
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key);
        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)
            .with_context(|| format!("Failed to create temp file in {}", self.root.display()))?;
        tmp.write_all(value.as_bytes())
            .context("Failed to write temp file")?;
        tmp.persist(&path)
            .with_context(|| format!("Failed to persist {}", path.display()))?;
        tracing::debug!(key, path = %path.display(), "stored local blob");
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("Failed to remove {}", path.display()))
            }
        }
    }
}

/// Process-local store, used by tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Blob {
        name: String,
        count: u32,
    }

    #[test]
    fn file_store_round_trips_and_removes() {
        let dir = tempdir().expect("tempdir");
        let store = FileStore::open(dir.path().join("state")).expect("open");

        assert!(store.get(SESSION_KEY).unwrap().is_none());

        let blob = Blob {
            name: "admin".to_string(),
            count: 3,
        };
        save_json(&store, SESSION_KEY, &blob).unwrap();
        let loaded: Option<Blob> = load_json(&store, SESSION_KEY).unwrap();
        assert_eq!(loaded, Some(blob));

        store.remove(SESSION_KEY).unwrap();
        assert!(store.get(SESSION_KEY).unwrap().is_none());
        // Removing twice is fine
        store.remove(SESSION_KEY).unwrap();
    }

    #[test]
    fn file_store_sanitizes_keys() {
        let dir = tempdir().expect("tempdir");
        let store = FileStore::open(dir.path()).expect("open");
        store.put("../escape", "x").unwrap();
        assert!(dir.path().join("___escape.json").exists());
    }

    #[test]
    fn load_json_reports_corrupt_blob() {
        let store = MemoryStore::new();
        store.put(SNAPSHOT_KEY, "{not json").unwrap();
        let result: Result<Option<Blob>> = load_json(&store, SNAPSHOT_KEY);
        assert!(result.is_err());
    }
}
