//! IPC message types
//!
//! Two conversations share the same framing:
//! - control: UI / ctl client ↔ daemon
//! - bridge: daemon ↔ overlay renderer

use serde::{Deserialize, Serialize};

use crate::config::{DetectionConfig, OverlayPatch};
use crate::detection::DetectionEvent;
use crate::lifecycle::{ErrorKind, StateSnapshot, Transition};

/// Requests sent from a UI to the daemon
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ControlRequest {
    /// Current state snapshot
    GetState,

    /// Activate or deactivate detection + overlay
    SetActive(bool),

    /// Edit one setting; values are raw strings validated by the daemon
    ChangeSetting { field: String, value: String },

    /// Re-query the host permission service
    RecheckPermission,

    /// Turn this connection into a stream of snapshots and detection events
    Subscribe,

    /// Health check
    Ping,

    /// Request graceful shutdown
    Shutdown,
}

/// Responses sent from the daemon to a UI
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ControlResponse {
    /// Snapshot (reply to GetState, or pushed to subscribers)
    State(StateSnapshot),

    /// Operation applied, possibly with non-blocking warnings
    Applied(Transition),

    /// Operation refused or failed
    Rejected { kind: ErrorKind, message: String },

    /// Latest detection result (subscribers only)
    Detection(DetectionEvent),

    /// Health check response
    Pong,

    /// Acknowledgment that request was processed
    Ready,
}

/// Requests sent from the daemon to the overlay renderer
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum BridgeRequest {
    StartOverlay(DetectionConfig),
    StopOverlay,
    UpdateOverlayConfig(OverlayPatch),
}

/// Renderer's answer to a bridge request
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum BridgeResponse {
    Ok,
    Error(String),
}
