//! Application-wide constants
//!
//! This module contains all magic numbers and string literals used throughout
//! the application, providing a single source of truth for constant values.

/// Config directory and file names
pub mod config {
    /// Directory under the platform config dir holding all state files
    pub const APP_DIR: &str = "blur-overlay";

    /// Daemon settings file (log level, providers, socket overrides)
    pub const SETTINGS_FILENAME: &str = "settings.json";
}

/// Keys used by the persistence provider (one file per key)
pub mod storage {
    /// Detection configuration record
    pub const DETECTION_CONFIG_KEY: &str = "detection_config";

    /// Boolean "permission was granted" flag
    pub const PERMISSION_GRANTED_KEY: &str = "permission_granted";

    /// Extension appended to each key
    pub const FILE_EXTENSION: &str = "json";
}

/// Detection loop timing
pub mod detection {
    /// Poll interval with battery optimization off
    pub const INTERVAL_MS: u64 = 500;

    /// Poll interval with battery optimization on
    pub const BATTERY_SAVER_INTERVAL_MS: u64 = 1000;
}

/// Blur effect bounds and defaults
pub mod blur {
    /// Minimum effect strength
    pub const MIN_INTENSITY: u8 = 5;

    /// Maximum effect strength
    pub const MAX_INTENSITY: u8 = 25;

    /// Effect strength for a fresh install
    pub const DEFAULT_INTENSITY: u8 = 15;
}

/// Local socket names and framing
pub mod ipc {
    /// Runtime sub-directory holding both sockets
    pub const RUNTIME_DIR: &str = "blur-overlay";

    /// Control socket (UI / ctl client → daemon)
    pub const CONTROL_SOCKET: &str = "control.sock";

    /// Overlay renderer socket (daemon → overlay surface)
    pub const OVERLAY_SOCKET: &str = "overlay.sock";

    /// Maximum message size (10 MB) to prevent DoS via memory exhaustion
    pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;
}
