//! Persistent key-value capability backing the session controller.
//!
//! Values are strings, like browser local storage. The controller is the
//! only writer; consumers read session data through the controller.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::Error;

/// Durable string key-value store.
///
/// # Example
///
/// ```rust
/// use proxy_session::{KeyValueStore, MemoryStore};
///
/// let store = MemoryStore::new();
/// store.set("access_token", "abc").unwrap();
/// assert_eq!(store.get("access_token").unwrap().as_deref(), Some("abc"));
/// ```
pub trait KeyValueStore: Send + Sync + 'static {
    /// Read a value. Missing keys are `Ok(None)`.
    fn get(&self, key: &str) -> Result<Option<String>, Error>;

    /// Write a value, replacing any previous one.
    fn set(&self, key: &str, value: &str) -> Result<(), Error>;

    /// Delete a value. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), Error>;
}

impl<T: KeyValueStore> KeyValueStore for Arc<T> {
    fn get(&self, key: &str) -> Result<Option<String>, Error> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), Error> {
        (**self).remove(key)
    }
}

/// In-process store. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, Error> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        self.entries.write().insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), Error> {
        self.entries.write().remove(key);
        Ok(())
    }
}

/// Store persisted as a single JSON object on disk.
///
/// The whole map is rewritten on every change through a temporary file
/// and a rename, so a crash never leaves a half-written file behind.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl FileStore {
    /// Open the store at `path`. A missing file is an empty store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the file cannot be read, or
    /// [`Error::Serialization`] if it is not a JSON object of strings.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => HashMap::new(),
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(Error::Storage(format!("{}: {e}", path.display())));
            }
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &HashMap<String, String>) -> Result<(), Error> {
        let raw = serde_json::to_string_pretty(entries)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, raw)
            .and_then(|()| std::fs::rename(&tmp, &self.path))
            .map_err(|e| Error::Storage(format!("{}: {e}", self.path.display())))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, Error> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        let mut entries = self.entries.lock();
        let previous = entries.insert(key.to_owned(), value.to_owned());
        if let Err(e) = self.persist(&entries) {
            // Keep memory and disk in agreement.
            match previous {
                Some(v) => entries.insert(key.to_owned(), v),
                None => entries.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), Error> {
        let mut entries = self.entries.lock();
        let Some(previous) = entries.remove(key) else {
            return Ok(());
        };
        if let Err(e) = self.persist(&entries) {
            entries.insert(key.to_owned(), previous);
            return Err(e);
        }
        Ok(())
    }
}

/// Copy `keys` from a legacy store into `to` where `to` has no value yet.
///
/// Run once at startup, before constructing the controller. Returns the
/// number of keys copied. Per-key failures are logged and skipped.
pub fn migrate_keys<F, T>(from: &F, to: &T, keys: &[&str]) -> usize
where
    F: KeyValueStore + ?Sized,
    T: KeyValueStore + ?Sized,
{
    let mut copied = 0;
    for key in keys {
        let result = (|| -> Result<bool, Error> {
            if to.get(key)?.is_some() {
                return Ok(false);
            }
            match from.get(key)? {
                Some(value) => {
                    to.set(key, &value)?;
                    Ok(true)
                }
                None => Ok(false),
            }
        })();

        match result {
            Ok(true) => copied += 1,
            Ok(false) => {}
            Err(e) => tracing::warn!(key = %key, error = %e, "Storage key migration failed"),
        }
    }

    if copied > 0 {
        tracing::info!(copied, "Migrated legacy storage keys");
    }
    copied
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_basic_ops() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k").unwrap(), None);

        store.set("k", "v1").unwrap();
        store.set("k", "v2").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v2"));

        store.remove("k").unwrap();
        store.remove("k").unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn memory_store_clones_share_entries() {
        let tab_a = MemoryStore::new();
        let tab_b = tab_a.clone();
        tab_a.set("session_envelope", "{}").unwrap();
        assert_eq!(tab_b.get("session_envelope").unwrap().as_deref(), Some("{}"));
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let store = FileStore::open(&path).unwrap();
        store.set("access_token", "abc").unwrap();
        store.set("username", "alice").unwrap();
        store.remove("username").unwrap();
        drop(store);

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(reopened.get("access_token").unwrap().as_deref(), Some("abc"));
        assert_eq!(reopened.get("username").unwrap(), None);
    }

    #[test]
    fn file_store_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("absent.json")).unwrap();
        assert_eq!(store.get("anything").unwrap(), None);
    }

    #[test]
    fn file_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(FileStore::open(&path), Err(Error::Serialization(_))));
    }

    #[test]
    fn file_store_write_failure_leaves_memory_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        // A directory at the target path makes the rename fail.
        let path = dir.path().join("occupied");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("keep"), "x").unwrap();

        let store = FileStore {
            path: path.clone(),
            entries: Mutex::new(HashMap::new()),
        };
        assert!(matches!(store.set("k", "v"), Err(Error::Storage(_))));
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn migrate_copies_only_missing_keys() {
        let legacy = MemoryStore::new();
        legacy.set("access_token", "old-token").unwrap();
        legacy.set("username", "alice").unwrap();
        legacy.set("unrelated", "x").unwrap();

        let primary = MemoryStore::new();
        primary.set("username", "bob").unwrap();

        let copied = migrate_keys(&legacy, &primary, &["access_token", "username", "api_key"]);

        assert_eq!(copied, 1);
        assert_eq!(primary.get("access_token").unwrap().as_deref(), Some("old-token"));
        assert_eq!(primary.get("username").unwrap().as_deref(), Some("bob"));
        assert_eq!(primary.get("unrelated").unwrap(), None);
    }
}
