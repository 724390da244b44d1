//! Detection capability and the periodic loop that polls it

mod driver;
mod simulated;

pub use driver::{DetectionLoop, EventSink, LoopHandle};
pub use simulated::SimulatedDetector;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;

use crate::config::DetectionConfig;

/// Result of one poll. Ephemeral: only the latest one matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub matched: bool,
    pub timestamp: SystemTime,
}

impl DetectionEvent {
    pub fn now(matched: bool) -> Self {
        Self { matched, timestamp: SystemTime::now() }
    }
}

#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("detector failed: {0}")]
    Failed(String),
}

/// Boolean "match present" predicate, called once per tick
///
/// `config` is the snapshot taken at the start of the tick.
pub trait Detector: Send + Sync {
    fn poll(&self, config: &DetectionConfig) -> Result<bool, DetectionError>;
}

/// Never matches
pub struct NullDetector;

impl Detector for NullDetector {
    fn poll(&self, _config: &DetectionConfig) -> Result<bool, DetectionError> {
        Ok(false)
    }
}

/// Which detector the daemon wires in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DetectorKind {
    #[default]
    Simulated,
    None,
}

pub fn build_detector(kind: DetectorKind) -> Arc<dyn Detector> {
    match kind {
        DetectorKind::Simulated => Arc::new(SimulatedDetector),
        DetectorKind::None => Arc::new(NullDetector),
    }
}
