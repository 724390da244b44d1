//! Detection/overlay lifecycle
//!
//! `LifecycleManager` owns the config store, the permission gate, the
//! detection loop and the overlay client, and keeps the loop and the overlay
//! surface started and stopped together. `LifecycleHandle` puts a FIFO
//! single-flight queue in front of it for concurrent callers.

mod handle;
mod manager;

pub use handle::LifecycleHandle;
pub use manager::LifecycleManager;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::config::{DetectionConfig, ValidationError};
use crate::overlay::BridgeError;
use crate::permission::PermissionState;
use crate::persistence::StorageError;

/// Derived, never persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Stopped,
    /// Overlay start call in flight
    Starting,
    /// Loop and overlay both confirmed active
    Running,
    /// Teardown in flight
    Stopping,
    /// Overlay start failed; only an explicit deactivate leaves this state
    Faulted,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Data-free projection of every failure the core can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Validation,
    PermissionDenied,
    PermissionBlocked,
    Faulted,
    BridgeUnavailable,
    BridgeCallFailed,
    BridgeNotRunning,
    Storage,
    ShutDown,
}

impl From<&BridgeError> for ErrorKind {
    fn from(err: &BridgeError) -> Self {
        match err {
            BridgeError::Unavailable => Self::BridgeUnavailable,
            BridgeError::CallFailed(_) => Self::BridgeCallFailed,
            BridgeError::NotRunning => Self::BridgeNotRunning,
        }
    }
}

/// Operation refused or aborted. Nothing the user asked for was applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Carries the non-granted state (denied, unavailable or limited)
    #[error("permission not granted ({0})")]
    PermissionDenied(PermissionState),

    /// Terminal for this session; the user has to change it in system settings
    #[error("permission blocked; enable it in system settings")]
    PermissionBlocked,

    #[error("overlay is faulted; deactivate before activating again")]
    Faulted,

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("lifecycle worker has shut down")]
    ShutDown,
}

impl LifecycleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::PermissionBlocked => ErrorKind::PermissionBlocked,
            Self::Faulted => ErrorKind::Faulted,
            Self::Bridge(e) => e.into(),
            Self::ShutDown => ErrorKind::ShutDown,
        }
    }
}

/// A failure that did not stop the local change from being applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<BridgeError> for Warning {
    fn from(err: BridgeError) -> Self {
        Self { kind: (&err).into(), message: err.to_string() }
    }
}

impl From<StorageError> for Warning {
    fn from(err: StorageError) -> Self {
        Self { kind: ErrorKind::Storage, message: err.to_string() }
    }
}

/// What subscribers see after every transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub run_state: RunState,
    pub config: DetectionConfig,
    pub permission: Option<PermissionState>,
    pub last_error: Option<ErrorKind>,
}

/// Result of an applied operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub snapshot: StateSnapshot,
    pub warnings: Vec<Warning>,
}

impl Transition {
    pub fn clean(snapshot: StateSnapshot) -> Self {
        Self { snapshot, warnings: Vec::new() }
    }
}
