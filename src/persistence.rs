//! Keyed record storage for detection state
//!
//! One JSON file per key under the app config dir. Versionless: a record that
//! is missing or fails to parse reads back as `None`.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::DetectionConfig;
use crate::constants::storage;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to serialize '{key}': {source}")]
    Serialize {
        key: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Persistence provider consumed by the config store and permission gate
pub trait Persistence: Send {
    fn read_config(&self) -> Option<DetectionConfig>;
    fn write_config(&mut self, config: &DetectionConfig) -> Result<(), StorageError>;
    fn read_permission_flag(&self) -> bool;
    fn write_permission_flag(&mut self, granted: bool) -> Result<(), StorageError>;
}

/// File-backed store under `dirs::config_dir()/blur-overlay`
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Store in the platform config dir (falls back to the working dir)
    pub fn in_config_dir() -> Self {
        let mut dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        dir.push(crate::constants::config::APP_DIR);
        Self::new(dir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.{}", storage::FILE_EXTENSION))
    }

    fn read<T: DeserializeOwned>(&self, key: &'static str) -> Option<T> {
        let path = self.path_for(key);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(key = key, path = %path.display(), "No stored record");
                return None;
            }
            Err(e) => {
                error!(key = key, path = %path.display(), error = %e, "Failed to read stored record");
                return None;
            }
        };

        match serde_json::from_str(&contents) {
            Ok(value) => Some(value),
            Err(e) => {
                error!(key = key, path = %path.display(), error = %e, "Stored record is corrupt, ignoring");
                None
            }
        }
    }

    fn write<T: Serialize>(&self, key: &'static str, value: &T) -> Result<(), StorageError> {
        let json = serde_json::to_string_pretty(value)
            .map_err(|source| StorageError::Serialize { key, source })?;

        fs::create_dir_all(&self.dir)
            .map_err(|source| StorageError::Write { path: self.dir.clone(), source })?;

        // Write to a sibling then rename so readers never see a torn record
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|source| StorageError::Write { path: tmp.clone(), source })?;
        fs::rename(&tmp, &path).map_err(|source| StorageError::Write { path: path.clone(), source })?;

        debug!(key = key, path = %path.display(), "Stored record");
        Ok(())
    }
}

impl Persistence for FileStore {
    fn read_config(&self) -> Option<DetectionConfig> {
        self.read::<DetectionConfig>(storage::DETECTION_CONFIG_KEY)
            .map(DetectionConfig::normalized)
    }

    fn write_config(&mut self, config: &DetectionConfig) -> Result<(), StorageError> {
        self.write(storage::DETECTION_CONFIG_KEY, config)
    }

    fn read_permission_flag(&self) -> bool {
        self.read::<bool>(storage::PERMISSION_GRANTED_KEY).unwrap_or(false)
    }

    fn write_permission_flag(&mut self, granted: bool) -> Result<(), StorageError> {
        self.write(storage::PERMISSION_GRANTED_KEY, &granted)?;
        info!(granted = granted, "Saved permission flag");
        Ok(())
    }
}

/// In-memory store for tests, with switchable write failures
#[cfg(test)]
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: std::sync::Arc<std::sync::Mutex<MemoryInner>>,
}

#[cfg(test)]
#[derive(Default)]
struct MemoryInner {
    config: Option<DetectionConfig>,
    permission_flag: bool,
    fail_writes: bool,
    config_writes: usize,
}

#[cfg(test)]
impl MemoryStore {
    pub fn with_config(config: DetectionConfig) -> Self {
        let store = Self::default();
        store.inner.lock().unwrap().config = Some(config);
        store
    }

    pub fn fail_writes(&self, fail: bool) {
        self.inner.lock().unwrap().fail_writes = fail;
    }

    pub fn stored(&self) -> Option<DetectionConfig> {
        self.inner.lock().unwrap().config.clone()
    }

    pub fn stored_flag(&self) -> bool {
        self.inner.lock().unwrap().permission_flag
    }

    pub fn config_writes(&self) -> usize {
        self.inner.lock().unwrap().config_writes
    }

    fn failure() -> StorageError {
        StorageError::Write {
            path: PathBuf::from("memory"),
            source: io::Error::other("simulated write failure"),
        }
    }
}

#[cfg(test)]
impl Persistence for MemoryStore {
    fn read_config(&self) -> Option<DetectionConfig> {
        self.stored()
    }

    fn write_config(&mut self, config: &DetectionConfig) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_writes {
            return Err(Self::failure());
        }
        inner.config = Some(config.clone());
        inner.config_writes += 1;
        Ok(())
    }

    fn read_permission_flag(&self) -> bool {
        self.stored_flag()
    }

    fn write_permission_flag(&mut self, granted: bool) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_writes {
            return Err(Self::failure());
        }
        inner.permission_flag = granted;
        Ok(())
    }
}
