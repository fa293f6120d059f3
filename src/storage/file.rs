//! JSON file configuration store.
//!
//! The configuration is written to a sibling temporary file and renamed into
//! place, so a crash mid-save leaves the previous file intact.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::association::{RegistryConfiguration, CONFIG_FORMAT_VERSION};
use crate::storage::traits::{ConfigStore, PersistenceError};

/// Stores the registry configuration as pretty-printed JSON.
#[derive(Debug, Clone)]
pub struct JsonFileConfigStore {
    path: PathBuf,
}

impl JsonFileConfigStore {
    /// Creates a store backed by `path`. The file need not exist yet.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the configuration file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl ConfigStore for JsonFileConfigStore {
    fn load(&self) -> Result<Option<RegistryConfiguration>, PersistenceError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let config: RegistryConfiguration =
            serde_json::from_str(&text).map_err(|e| PersistenceError::Serialization(e.to_string()))?;
        if config.metadata.version != CONFIG_FORMAT_VERSION {
            return Err(PersistenceError::UnsupportedVersion {
                found: config.metadata.version,
                expected: CONFIG_FORMAT_VERSION,
            });
        }
        Ok(Some(config))
    }

    fn save(&self, config: &RegistryConfiguration) -> Result<(), PersistenceError> {
        let json =
            serde_json::to_vec_pretty(config).map_err(|e| PersistenceError::Serialization(e.to_string()))?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.temp_path();
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[test]
    fn test_missing_file_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileConfigStore::new(dir.path().join("registry.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileConfigStore::new(dir.path().join("nested").join("registry.json"));
        let config = RegistryConfiguration::empty(Utc::now());
        store.save(&config).unwrap();
        assert_eq!(store.load().unwrap(), Some(config));
        assert!(!store.temp_path().exists());
    }

    #[test]
    fn test_rejects_unknown_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileConfigStore::new(dir.path().join("registry.json"));
        let mut config = RegistryConfiguration::empty(Utc::now());
        config.metadata.version = CONFIG_FORMAT_VERSION + 1;
        store.save(&config).unwrap();
        assert!(matches!(
            store.load().unwrap_err(),
            PersistenceError::UnsupportedVersion { .. }
        ));
    }

    #[test]
    fn test_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        fs::write(&path, b"{ not json").unwrap();
        let store = JsonFileConfigStore::new(path);
        assert!(matches!(store.load().unwrap_err(), PersistenceError::Serialization(_)));
    }
}
