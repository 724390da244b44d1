//! Client for the external overlay surface
//!
//! The bridge itself is not idempotent, so the client keeps its own view of
//! whether the surface is started and refuses updates while it is not.

mod socket;

pub use socket::SocketBridge;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{DetectionConfig, OverlayPatch};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// No overlay surface on this platform / no renderer listening
    #[error("overlay bridge unavailable")]
    Unavailable,

    #[error("overlay bridge call failed: {0}")]
    CallFailed(String),

    /// Update issued while the surface is believed stopped
    #[error("overlay is not running")]
    NotRunning,
}

/// Asynchronous calls into the overlay surface
#[async_trait]
pub trait OverlayBridge: Send + Sync {
    async fn start_overlay(&self, config: &DetectionConfig) -> Result<(), BridgeError>;
    async fn stop_overlay(&self) -> Result<(), BridgeError>;
    async fn update_overlay_config(&self, patch: &OverlayPatch) -> Result<(), BridgeError>;
}

/// Bridge for platforms without an overlay surface
pub struct UnavailableBridge;

#[async_trait]
impl OverlayBridge for UnavailableBridge {
    async fn start_overlay(&self, _config: &DetectionConfig) -> Result<(), BridgeError> {
        Err(BridgeError::Unavailable)
    }

    async fn stop_overlay(&self) -> Result<(), BridgeError> {
        Err(BridgeError::Unavailable)
    }

    async fn update_overlay_config(&self, _patch: &OverlayPatch) -> Result<(), BridgeError> {
        Err(BridgeError::Unavailable)
    }
}

pub struct OverlayClient {
    bridge: Box<dyn OverlayBridge>,
    started: bool,
}

impl OverlayClient {
    pub fn new(bridge: Box<dyn OverlayBridge>) -> Self {
        Self { bridge, started: false }
    }

    #[cfg(test)]
    pub fn is_started(&self) -> bool {
        self.started
    }

    pub async fn start_overlay(&mut self, config: &DetectionConfig) -> Result<(), BridgeError> {
        if self.started {
            debug!("Overlay already started, not forwarding start");
            return Ok(());
        }
        self.bridge.start_overlay(config).await?;
        self.started = true;
        info!(blur_type = %config.blur_type, blur_intensity = config.blur_intensity, "Overlay started");
        Ok(())
    }

    /// Always forwarded, even when the surface is believed stopped, so a
    /// half-started surface can be torn down. Afterwards the surface is
    /// considered stopped whatever the bridge answered.
    pub async fn stop_overlay(&mut self) -> Result<(), BridgeError> {
        let result = self.bridge.stop_overlay().await;
        self.started = false;
        match &result {
            Ok(()) => info!("Overlay stopped"),
            Err(e) => warn!(error = %e, "Overlay stop failed"),
        }
        result
    }

    pub async fn update_overlay_config(&mut self, patch: &OverlayPatch) -> Result<(), BridgeError> {
        if !self.started {
            return Err(BridgeError::NotRunning);
        }
        self.bridge.update_overlay_config(patch).await?;
        debug!(patch = ?patch, "Overlay config updated");
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum BridgeCall {
        Start(DetectionConfig),
        Stop,
        Update(OverlayPatch),
    }

    #[derive(Default)]
    struct Failures {
        start: Option<BridgeError>,
        stop: Option<BridgeError>,
        update: Option<BridgeError>,
    }

    /// Records every call, fails on demand, and tracks overlapping calls
    #[derive(Clone, Default)]
    pub struct RecordingBridge {
        calls: Arc<Mutex<Vec<BridgeCall>>>,
        failures: Arc<Mutex<Failures>>,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
        delay: Arc<Mutex<Option<Duration>>>,
    }

    impl RecordingBridge {
        pub fn calls(&self) -> Vec<BridgeCall> {
            self.calls.lock().unwrap().clone()
        }

        pub fn fail_start(&self, err: Option<BridgeError>) {
            self.failures.lock().unwrap().start = err;
        }

        pub fn fail_stop(&self, err: Option<BridgeError>) {
            self.failures.lock().unwrap().stop = err;
        }

        pub fn fail_update(&self, err: Option<BridgeError>) {
            self.failures.lock().unwrap().update = err;
        }

        /// Make every call take this long, so overlapping callers would show
        pub fn set_delay(&self, delay: Duration) {
            *self.delay.lock().unwrap() = Some(delay);
        }

        pub fn max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }

        async fn call(&self, call: BridgeCall, failure: Option<BridgeError>) -> Result<(), BridgeError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.calls.lock().unwrap().push(call);

            let delay = *self.delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            match failure {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl OverlayBridge for RecordingBridge {
        async fn start_overlay(&self, config: &DetectionConfig) -> Result<(), BridgeError> {
            let failure = self.failures.lock().unwrap().start.clone();
            self.call(BridgeCall::Start(config.clone()), failure).await
        }

        async fn stop_overlay(&self) -> Result<(), BridgeError> {
            let failure = self.failures.lock().unwrap().stop.clone();
            self.call(BridgeCall::Stop, failure).await
        }

        async fn update_overlay_config(&self, patch: &OverlayPatch) -> Result<(), BridgeError> {
            let failure = self.failures.lock().unwrap().update.clone();
            self.call(BridgeCall::Update(patch.clone()), failure).await
        }
    }
}
