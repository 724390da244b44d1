//! Config store: the live detection config plus its persistence adapter
//!
//! Holds the only mutable copy. Everything else sees snapshots, either by
//! value from `current()` or through the watch channel from `subscribe()`.

use tokio::sync::watch;
use tracing::info;

use crate::config::DetectionConfig;
use crate::persistence::{Persistence, StorageError};

pub struct ConfigStore {
    persistence: Box<dyn Persistence>,
    live: watch::Sender<DetectionConfig>,
}

impl ConfigStore {
    pub fn new(persistence: Box<dyn Persistence>) -> Self {
        let (live, _) = watch::channel(DetectionConfig::default());
        Self { persistence, live }
    }

    /// Load the persisted record into memory
    /// Returns `None` (and keeps the current value) when nothing usable is stored
    pub fn load(&mut self) -> Option<DetectionConfig> {
        let loaded = self.persistence.read_config()?;
        info!(config = ?loaded, "Loaded detection config");
        self.live.send_replace(loaded.clone());
        Some(loaded)
    }

    /// Replace the live value, then persist it
    /// The in-memory value stays updated even if the write fails
    pub fn save(&mut self, config: DetectionConfig) -> Result<(), StorageError> {
        self.live.send_replace(config.clone());
        self.persistence.write_config(&config)
    }

    pub fn current(&self) -> DetectionConfig {
        self.live.borrow().clone()
    }

    /// Read-only view that always holds the latest saved value
    pub fn subscribe(&self) -> watch::Receiver<DetectionConfig> {
        self.live.subscribe()
    }

    pub fn persistence_mut(&mut self) -> &mut dyn Persistence {
        self.persistence.as_mut()
    }
}
