//! Durable key-value storage the SDK persists its state through.
//!
//! The pending-request queue, the event buffer, the anonymous device id, the
//! identity override, the install referrer and the first-view flag are kept here, so whatever
//! backs this trait must survive a process restart.

use parking_lot::Mutex;
use pulse_core::{PulseError, PulseResult};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Keys the SDK owns inside a [`KeyValueStore`].
pub mod keys {
    pub const PENDING_REQUESTS: &str = "pulse.pending_requests";
    pub const EVENTS: &str = "pulse.events";
    pub const IDENTITY_OVERRIDE: &str = "pulse.device_id.strategy";
    pub const ANONYMOUS_ID: &str = "pulse.device_id.anonymous";
    pub const INSTALL_REFERRER: &str = "pulse.referrer";
    pub const FIRST_VIEW_RECORDED: &str = "pulse.views.first_recorded";
}

/// Storage collaborator. A successful `put` or `remove` must be durable
/// before it returns.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> PulseResult<Option<String>>;
    fn put(&self, key: &str, value: &str) -> PulseResult<()>;
    fn remove(&self, key: &str) -> PulseResult<()>;
}

/// Process-local store. Durable only for the lifetime of the process.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> PulseResult<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> PulseResult<()> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> PulseResult<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// Single-file JSON store. Every mutation rewrites the document to a
/// sibling temp file, syncs it, renames it over the original and syncs the
/// directory.
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl FileStore {
    pub fn open(path: impl AsRef<Path>) -> PulseResult<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = match fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => HashMap::new(),
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), keys = entries.len(), "file store opened");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &HashMap<String, String>) -> PulseResult<()> {
        let tmp = self.path.with_extension("tmp");
        let body = serde_json::to_vec(entries)?;
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| {
            PulseError::storage(format!(
                "failed to replace {}: {e}",
                self.path.display()
            ))
        })?;
        sync_parent_dir(&self.path)
    }
}

/// Makes a rename inside the directory holding `path` durable.
#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> PulseResult<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> PulseResult<()> {
    Ok(())
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> PulseResult<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> PulseResult<()> {
        let mut entries = self.entries.lock();
        let previous = entries.insert(key.to_string(), value.to_string());
        if let Err(e) = self.persist(&entries) {
            // Keep memory and disk in agreement.
            match previous {
                Some(old) => entries.insert(key.to_string(), old),
                None => entries.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> PulseResult<()> {
        let mut entries = self.entries.lock();
        let Some(previous) = entries.remove(key) else {
            return Ok(());
        };
        if let Err(e) = self.persist(&entries) {
            entries.insert(key.to_string(), previous);
            return Err(e);
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        assert_eq!(store.get("a").unwrap(), None);
        store.put("a", "1").unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));
        store.remove("a").unwrap();
        assert_eq!(store.get("a").unwrap(), None);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pulse.json");

        {
            let store = FileStore::open(&path).unwrap();
            store.put(keys::EVENTS, "[]").unwrap();
            store.put(keys::ANONYMOUS_ID, "abc").unwrap();
            store.remove(keys::EVENTS).unwrap();
        }

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(reopened.get(keys::ANONYMOUS_ID).unwrap().as_deref(), Some("abc"));
        assert_eq!(reopened.get(keys::EVENTS).unwrap(), None);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_parent_dir_sync() {
        let dir = tempfile::tempdir().unwrap();
        sync_parent_dir(&dir.path().join("pulse.json")).unwrap();
        // A bare file name lives in the working directory.
        sync_parent_dir(Path::new("pulse.json")).unwrap();

        let nested = dir.path().join("state");
        fs::create_dir(&nested).unwrap();
        let store = FileStore::open(nested.join("pulse.json")).unwrap();
        store.put(keys::ANONYMOUS_ID, "abc").unwrap();
        assert!(nested.join("pulse.json").exists());
    }

    #[test]
    fn test_file_store_rejects_corrupt_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pulse.json");
        fs::write(&path, "{broken").unwrap();
        assert!(matches!(
            FileStore::open(&path),
            Err(PulseError::Serialization(_))
        ));
    }
}
