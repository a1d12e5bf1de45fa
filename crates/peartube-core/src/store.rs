//! JSON-file key-value store for the node's persistent state.
//!
//! Each key maps to one pretty-printed JSON document under the store
//! directory. The handful of node documents (identity, subscriptions, seeding
//! state) are small and written whole, so plain files beat a database here.

use std::fs;
use std::path::PathBuf;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{CoreError, Result};

/// Key for the node's identity keypair document.
pub const KEY_IDENTITY: &str = "identity";
/// Key for the subscribed-channel set.
pub const KEY_SUBSCRIPTIONS: &str = "subscriptions";
/// Key for the seeding configuration.
pub const KEY_SEEDING_CONFIG: &str = "seeding-config";
/// Key for the pinned-channel set.
pub const KEY_PINNED_CHANNELS: &str = "pinned-channels";
/// Key for the active seed records.
pub const KEY_ACTIVE_SEEDS: &str = "active-seeds";
/// Key for the permanently hidden channel set.
pub const KEY_HIDDEN_CHANNELS: &str = "hidden-channels";

/// File-backed JSON store, one document per key.
#[derive(Debug, Clone)]
pub struct NodeStore {
    base_dir: PathBuf,
}

impl NodeStore {
    /// Construct a store rooted at the provided directory.
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Ensure the underlying directory exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn ensure_initialized(&self) -> Result<()> {
        if !self.base_dir.exists() {
            fs::create_dir_all(&self.base_dir)
                .map_err(|source| CoreError::storage("store.init", source))?;
        }
        Ok(())
    }

    /// Load and decode the document stored under `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or the JSON fails to
    /// decode.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let path = self.document_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let data =
            fs::read_to_string(&path).map_err(|source| CoreError::storage("store.read", source))?;
        let value = serde_json::from_str(&data)
            .map_err(|source| CoreError::encoding("store.decode", source))?;
        Ok(Some(value))
    }

    /// Encode and persist `value` under `key`, replacing any previous document.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the write fails.
    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.ensure_initialized()?;
        let json = serde_json::to_string_pretty(value)
            .map_err(|source| CoreError::encoding("store.encode", source))?;
        fs::write(self.document_path(key), json)
            .map_err(|source| CoreError::storage("store.write", source))?;
        Ok(())
    }

    /// Remove the document stored under `key`. Missing documents are fine.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be deleted.
    pub fn remove(&self, key: &str) -> Result<()> {
        let path = self.document_path(key);
        if path.exists() {
            fs::remove_file(&path).map_err(|source| CoreError::storage("store.remove", source))?;
        }
        Ok(())
    }

    fn document_path(&self, key: &str) -> PathBuf {
        self.base_dir.join(format!("{key}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        name: String,
        count: u32,
    }

    #[test]
    fn round_trips_documents() -> Result<()> {
        let dir = TempDir::new().expect("tempdir");
        let store = NodeStore::new(dir.path());

        assert!(store.get::<Doc>(KEY_IDENTITY)?.is_none());

        let doc = Doc {
            name: "node".to_string(),
            count: 3,
        };
        store.put(KEY_IDENTITY, &doc)?;
        assert_eq!(store.get::<Doc>(KEY_IDENTITY)?, Some(doc));

        store.remove(KEY_IDENTITY)?;
        assert!(store.get::<Doc>(KEY_IDENTITY)?.is_none());
        store.remove(KEY_IDENTITY)?;
        Ok(())
    }

    #[test]
    fn creates_directory_on_first_write() -> Result<()> {
        let dir = TempDir::new().expect("tempdir");
        let nested = dir.path().join("state");
        let store = NodeStore::new(&nested);
        store.put(KEY_SEEDING_CONFIG, &42_u32)?;
        assert!(nested.exists());
        Ok(())
    }
}
