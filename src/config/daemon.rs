//! Daemon settings (log level, provider selection, socket overrides)
//!
//! Separate from the detection record: these are operator choices, not user
//! state, and are never written back by the lifecycle manager.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::detection::DetectorKind;
use crate::permission::PermissionState;

/// Whether the settings file was read or written fresh with defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsOrigin {
    Created,
    Loaded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonSettings {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Answer given by the static permission provider
    #[serde(default = "default_permission")]
    pub permission: PermissionState,

    #[serde(default)]
    pub detector: DetectorKind,

    /// Overlay renderer socket; `None` uses the runtime-dir default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge_socket: Option<PathBuf>,

    /// Control socket; `None` uses the runtime-dir default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_socket: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_permission() -> PermissionState {
    PermissionState::Granted
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            permission: default_permission(),
            detector: DetectorKind::default(),
            bridge_socket: None,
            control_socket: None,
        }
    }
}

impl DaemonSettings {
    pub fn path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(crate::constants::config::APP_DIR);
        path.push(crate::constants::config::SETTINGS_FILENAME);
        path
    }

    /// Load settings, creating the file with defaults if absent
    /// Runs before logging is set up, so the caller reports the origin
    pub fn load_from(path: &Path) -> Result<(Self, SettingsOrigin)> {
        if !path.exists() {
            let settings = Self::default();
            settings.save_to(path)?;
            return Ok((settings, SettingsOrigin::Created));
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {:?}", path))?;
        let settings: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse settings JSON from {:?}", path))?;

        Ok((settings, SettingsOrigin::Loaded))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {:?}", parent))?;
        }

        let json = serde_json::to_string_pretty(self).context("Failed to serialize settings to JSON")?;
        fs::write(path, json).with_context(|| format!("Failed to write settings to {:?}", path))?;
        Ok(())
    }
}
