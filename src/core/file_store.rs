//! File-backed persistent store.
//!
//! Each namespace is one JSON document in the storage directory. Writes
//! replace the document through a temporary file and rename, under an
//! exclusive lock file so several processes sharing the directory cannot
//! interleave.
//!
//! # Example
//!
//! ```no_run
//! use flagkit_sync::core::{FileStore, FileStoreConfig, PersistentStoreWrapper};
//! use std::sync::Arc;
//!
//! let store = FileStore::new(FileStoreConfig::new("/var/lib/myapp/flags")).unwrap();
//! let wrapper = PersistentStoreWrapper::new(Arc::new(store));
//! let environment = wrapper.per_environment("mob-xxx");
//! ```

use fs2::FileExt;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::persistence::PersistentStore;
use crate::error::{ErrorCode, Result, SyncError};

const LOCK_FILE_NAME: &str = "flagkit-store.lock";

/// Configuration for the file-backed store.
#[derive(Debug, Clone)]
pub struct FileStoreConfig {
    /// Directory holding one file per namespace.
    pub storage_path: PathBuf,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            storage_path: std::env::temp_dir().join("flagkit-store"),
        }
    }
}

impl FileStoreConfig {
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: storage_path.into(),
        }
    }
}

pub struct FileStore {
    config: FileStoreConfig,
    lock_file_path: PathBuf,
}

impl FileStore {
    /// Open a store rooted at the configured directory, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage directory cannot be created.
    pub fn new(config: FileStoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.storage_path).map_err(|e| {
            SyncError::with_source(
                ErrorCode::StoreWriteError,
                format!(
                    "Failed to create storage directory: {}",
                    config.storage_path.display()
                ),
                e,
            )
        })?;

        let lock_file_path = config.storage_path.join(LOCK_FILE_NAME);
        Ok(Self {
            config,
            lock_file_path,
        })
    }

    pub fn storage_path(&self) -> &Path {
        &self.config.storage_path
    }

    fn namespace_path(&self, namespace: &str) -> PathBuf {
        let file_name: String = namespace
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || "-_=".contains(c) { c } else { '_' })
            .collect();
        self.config.storage_path.join(format!("{}.json", file_name))
    }

    fn acquire_lock(&self) -> Result<File> {
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_file_path)
            .map_err(|e| {
                SyncError::with_source(ErrorCode::StoreWriteError, "Failed to open lock file", e)
            })?;

        lock_file.lock_exclusive().map_err(|e| {
            SyncError::with_source(ErrorCode::StoreWriteError, "Failed to acquire file lock", e)
        })?;

        Ok(lock_file)
    }

    fn read_namespace(&self, namespace: &str) -> Result<HashMap<String, String>> {
        let path = self.namespace_path(namespace);
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => {
                return Err(SyncError::with_source(
                    ErrorCode::StoreReadError,
                    format!("Failed to read namespace file: {}", path.display()),
                    e,
                ));
            }
        };
        Ok(serde_json::from_str(&contents)?)
    }

    fn write_namespace(&self, namespace: &str, values: &HashMap<String, String>) -> Result<()> {
        let path = self.namespace_path(namespace);
        if values.is_empty() {
            return match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(SyncError::with_source(
                    ErrorCode::StoreWriteError,
                    format!("Failed to remove namespace file: {}", path.display()),
                    e,
                )),
            };
        }

        let json = serde_json::to_vec(values)?;
        let tmp_path = path.with_extension("json.tmp");
        let write_err = |e: std::io::Error| {
            SyncError::with_source(
                ErrorCode::StoreWriteError,
                format!("Failed to write namespace file: {}", path.display()),
                e,
            )
        };

        let mut file = File::create(&tmp_path).map_err(write_err)?;
        file.write_all(&json).map_err(write_err)?;
        file.sync_all().map_err(write_err)?;
        fs::rename(&tmp_path, &path).map_err(write_err)?;

        tracing::debug!("Wrote {} keys to {}", values.len(), path.display());
        Ok(())
    }

    fn update<F>(&self, namespace: &str, apply: F) -> Result<()>
    where
        F: FnOnce(&mut HashMap<String, String>),
    {
        let lock = self.acquire_lock()?;
        let mut values = self.read_namespace(namespace)?;
        apply(&mut values);
        let result = self.write_namespace(namespace, &values);
        let _ = lock.unlock();
        result
    }
}

impl PersistentStore for FileStore {
    fn get_value(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        let lock = self.acquire_lock()?;
        let result = self
            .read_namespace(namespace)
            .map(|mut values| values.remove(key));
        let _ = lock.unlock();
        result
    }

    fn set_value(&self, namespace: &str, key: &str, value: Option<&str>) -> Result<()> {
        self.update(namespace, |values| match value {
            Some(v) => {
                values.insert(key.to_string(), v.to_string());
            }
            None => {
                values.remove(key);
            }
        })
    }

    fn set_values(
        &self,
        namespace: &str,
        updates: &HashMap<String, Option<String>>,
    ) -> Result<()> {
        self.update(namespace, |values| {
            for (key, value) in updates {
                match value {
                    Some(v) => {
                        values.insert(key.clone(), v.clone());
                    }
                    None => {
                        values.remove(key);
                    }
                }
            }
        })
    }

    fn clear(&self, namespace: &str) -> Result<()> {
        self.update(namespace, |values| values.clear())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (FileStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(FileStoreConfig::new(temp_dir.path())).unwrap();
        (store, temp_dir)
    }

    #[test]
    fn test_set_and_get() {
        let (store, _dir) = create_test_store();
        assert_eq!(store.get_value("ns", "k").unwrap(), None);

        store.set_value("ns", "k", Some("v")).unwrap();
        assert_eq!(store.get_value("ns", "k").unwrap(), Some("v".to_string()));

        store.set_value("ns", "k", None).unwrap();
        assert_eq!(store.get_value("ns", "k").unwrap(), None);
    }

    #[test]
    fn test_set_values_and_clear() {
        let (store, _dir) = create_test_store();
        let mut updates = HashMap::new();
        updates.insert("a".to_string(), Some("1".to_string()));
        updates.insert("b".to_string(), Some("2".to_string()));
        store.set_values("ns", &updates).unwrap();

        assert_eq!(store.get_value("ns", "a").unwrap(), Some("1".to_string()));
        assert_eq!(store.get_value("ns", "b").unwrap(), Some("2".to_string()));
        assert_eq!(store.get_value("other", "a").unwrap(), None);

        store.clear("ns").unwrap();
        assert_eq!(store.get_value("ns", "a").unwrap(), None);
    }

    #[test]
    fn test_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = FileStore::new(FileStoreConfig::new(temp_dir.path())).unwrap();
            store.set_value("FlagKit_abc=", "index", Some("[]")).unwrap();
        }
        let store = FileStore::new(FileStoreConfig::new(temp_dir.path())).unwrap();
        assert_eq!(
            store.get_value("FlagKit_abc=", "index").unwrap(),
            Some("[]".to_string())
        );
    }

    #[test]
    fn test_corrupt_file_reports_error() {
        let (store, dir) = create_test_store();
        fs::write(dir.path().join("ns.json"), "not json").unwrap();
        let err = store.get_value("ns", "k").unwrap_err();
        assert_eq!(err.code, ErrorCode::StoreInvalidData);
    }
}
