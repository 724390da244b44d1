//! Configuration management for blur-overlay
//!
//! This module provides two config systems:
//! - **detection**: the user's detection record, owned by the config store
//! - **daemon**: operator settings read once at startup

pub mod daemon;
pub mod detection;
pub mod store;

// Re-export commonly used types
pub use daemon::{DaemonSettings, SettingsOrigin};
pub use detection::{DetectionConfig, OverlayPatch, Sensitivity, SettingChange, ValidationError};
pub use store::ConfigStore;
