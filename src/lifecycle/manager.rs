//! The lifecycle state machine
//!
//! Every method takes `&mut self`, so a single owner is serialized by
//! construction. Local state is the source of truth: whenever a remote
//! (bridge) or storage step fails after the user's intent has been applied
//! locally, the failure is returned as a `Warning` and the local change
//! stands.

use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use super::{ErrorKind, LifecycleError, RunState, StateSnapshot, Transition, Warning};
use crate::config::{ConfigStore, DetectionConfig, SettingChange};
use crate::detection::{DetectionEvent, DetectionLoop, Detector, EventSink, LoopHandle};
use crate::overlay::{OverlayBridge, OverlayClient};
use crate::permission::{PermissionGate, PermissionProvider, PermissionState};
use crate::persistence::Persistence;

/// Buffered snapshots per subscriber before the oldest are dropped
const TRANSITION_BUFFER: usize = 64;

pub struct LifecycleManager {
    store: ConfigStore,
    permission: PermissionGate,
    detection: DetectionLoop,
    overlay: OverlayClient,
    run_state: RunState,
    last_error: Option<ErrorKind>,
    loop_handle: Option<LoopHandle>,
    latest: watch::Sender<StateSnapshot>,
    transitions: broadcast::Sender<StateSnapshot>,
    events: Arc<watch::Sender<Option<DetectionEvent>>>,
}

impl LifecycleManager {
    pub fn new(
        persistence: Box<dyn Persistence>,
        permission: Box<dyn PermissionProvider>,
        detector: Arc<dyn Detector>,
        bridge: Box<dyn OverlayBridge>,
    ) -> Self {
        let store = ConfigStore::new(persistence);
        let detection = DetectionLoop::new(detector, store.subscribe());
        let initial = StateSnapshot {
            run_state: RunState::Stopped,
            config: store.current(),
            permission: None,
            last_error: None,
        };
        let (latest, _) = watch::channel(initial);
        let (transitions, _) = broadcast::channel(TRANSITION_BUFFER);
        let (events, _) = watch::channel(None);

        Self {
            store,
            permission: PermissionGate::new(permission),
            detection,
            overlay: OverlayClient::new(bridge),
            run_state: RunState::Stopped,
            last_error: None,
            loop_handle: None,
            latest,
            transitions,
            events: Arc::new(events),
        }
    }

    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    #[cfg(test)]
    pub fn config(&self) -> DetectionConfig {
        self.store.current()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            run_state: self.run_state,
            config: self.store.current(),
            permission: self.permission.state(),
            last_error: self.last_error,
        }
    }

    /// Latest snapshot, readable without queueing behind an operation
    pub fn watch_state(&self) -> watch::Receiver<StateSnapshot> {
        self.latest.subscribe()
    }

    /// Every snapshot emitted from now on
    #[cfg(test)]
    pub fn subscribe(&self) -> broadcast::Receiver<StateSnapshot> {
        self.transitions.subscribe()
    }

    pub(crate) fn transitions_sender(&self) -> broadcast::Sender<StateSnapshot> {
        self.transitions.clone()
    }

    /// Latest detection result; overruns are dropped
    pub fn detection_events(&self) -> watch::Receiver<Option<DetectionEvent>> {
        self.events.subscribe()
    }

    /// Interval the detection loop is currently armed with
    #[cfg(test)]
    pub fn detection_interval(&self) -> Option<std::time::Duration> {
        self.detection.interval()
    }

    /// Bring back the previous session's state. Never prompts for permission.
    pub async fn restore(&mut self) -> Transition {
        if self.store.load().is_none() {
            info!("No stored detection config, using defaults");
        }
        let permission = self.permission.check(self.store.persistence_mut()).await;

        if !self.store.current().active {
            self.publish();
            return Transition::clean(self.snapshot());
        }

        if !permission.is_granted() {
            warn!(permission = %permission, "Detection was active last session but permission is not granted, lowering");
            let warnings = self.lower_active(Vec::new());
            return self.finish(RunState::Stopped, warnings);
        }

        info!("Resuming detection from previous session");
        match self.start_surface().await {
            Ok(transition) => transition,
            Err(e) => {
                // Faulted for this session, inactive for the next one
                let warnings = self.lower_active(vec![Warning { kind: e.kind(), message: e.to_string() }]);
                self.finish(RunState::Faulted, warnings)
            }
        }
    }

    pub async fn set_active(&mut self, active: bool) -> Result<Transition, LifecycleError> {
        if active {
            self.activate().await
        } else {
            Ok(self.deactivate().await)
        }
    }

    /// Validate a raw (field, value) edit, then apply it
    pub async fn change_setting(&mut self, field: &str, value: &str) -> Result<Transition, LifecycleError> {
        let change = SettingChange::parse(field, value).inspect_err(|e| {
            debug!(field = field, value = value, error = %e, "Rejected setting change");
        })?;
        Ok(self.apply_setting(change).await)
    }

    /// Apply an already-typed edit; intensity is clamped here
    pub async fn apply_setting(&mut self, change: SettingChange) -> Transition {
        let mut config = self.store.current();
        let patch = config.apply(change);
        info!(field = change.field_name(), patch = ?patch, "Setting changed");

        let mut warnings = Vec::new();
        if let Err(e) = self.store.save(config.clone()) {
            warn!(error = %e, "Failed to persist setting change, keeping in-memory value");
            warnings.push(e.into());
        }

        if self.run_state == RunState::Running {
            if let (Some(_), Some(handle)) = (patch.battery_optimization, self.loop_handle) {
                self.detection.set_interval(handle, config.interval());
            }

            // best-effort: the stored value is what the next activation uses
            if let Err(e) = self.overlay.update_overlay_config(&patch).await {
                warn!(error = %e, "Live overlay did not pick up setting change");
                warnings.push(e.into());
            }
        }

        let run_state = self.run_state;
        self.finish(run_state, warnings)
    }

    /// Re-query the permission service; deactivate if it was revoked while active
    pub async fn recheck_permission(&mut self) -> Transition {
        let permission = self.permission.check(self.store.persistence_mut()).await;

        if !permission.is_granted() && matches!(self.run_state, RunState::Running | RunState::Faulted) {
            warn!(permission = %permission, "Permission revoked while active, deactivating");
            return self.deactivate().await;
        }

        self.publish();
        Transition::clean(self.snapshot())
    }

    /// Release the loop and the surface without recording `active=false`,
    /// so the next launch resumes
    pub async fn shutdown(&mut self) {
        if self.run_state == RunState::Stopped {
            return;
        }
        info!(from = %self.run_state, "Shutting down lifecycle");
        if self.run_state != RunState::Faulted {
            self.set_run_state(RunState::Stopping);
        }
        let warnings = self.release_surface().await;
        self.finish(RunState::Stopped, warnings);
    }

    async fn activate(&mut self) -> Result<Transition, LifecycleError> {
        match self.run_state {
            RunState::Running => {
                debug!("Already running, nothing to do");
                return Ok(Transition::clean(self.snapshot()));
            }
            RunState::Faulted => {
                warn!("Activation refused while faulted");
                return Err(LifecycleError::Faulted);
            }
            _ => {}
        }

        let permission = self.permission.ensure_granted(self.store.persistence_mut()).await;
        let refusal = match permission {
            PermissionState::Granted => None,
            PermissionState::Blocked => Some(LifecycleError::PermissionBlocked),
            other => Some(LifecycleError::PermissionDenied(other)),
        };
        if let Some(err) = refusal {
            info!(permission = %permission, "Activation refused");
            self.last_error = Some(err.kind());
            self.publish();
            return Err(err);
        }

        self.start_surface().await
    }

    /// Overlay first, then the loop, then persist `active=true`
    async fn start_surface(&mut self) -> Result<Transition, LifecycleError> {
        self.last_error = None;
        self.set_run_state(RunState::Starting);

        let config = DetectionConfig { active: true, ..self.store.current() };
        if let Err(e) = self.overlay.start_overlay(&config).await {
            error!(error = %e, "Overlay failed to start");
            self.last_error = Some((&e).into());
            self.set_run_state(RunState::Faulted);
            return Err(e.into());
        }

        let handle = self.detection.start(self.event_sink(), config.interval());
        self.loop_handle = Some(handle);

        let mut warnings = Vec::new();
        if let Err(e) = self.store.save(config) {
            warn!(error = %e, "Failed to persist activation, keeping in-memory value");
            warnings.push(e.into());
        }
        Ok(self.finish(RunState::Running, warnings))
    }

    async fn deactivate(&mut self) -> Transition {
        if self.run_state == RunState::Stopped {
            if !self.store.current().active {
                debug!("Already stopped, nothing to do");
                return Transition::clean(self.snapshot());
            }
            let warnings = self.lower_active(Vec::new());
            return self.finish(RunState::Stopped, warnings);
        }

        // Faulted goes straight back to Stopped
        if self.run_state != RunState::Faulted {
            self.set_run_state(RunState::Stopping);
        }
        let warnings = self.release_surface().await;
        let warnings = self.lower_active(warnings);
        self.finish(RunState::Stopped, warnings)
    }

    /// Loop first (local, immediate), then the overlay
    async fn release_surface(&mut self) -> Vec<Warning> {
        if let Some(handle) = self.loop_handle.take() {
            self.detection.stop(handle);
        }

        // best-effort: local resources are released whatever the bridge says
        match self.overlay.stop_overlay().await {
            Ok(()) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "Overlay stop failed, continuing to stopped");
                vec![e.into()]
            }
        }
    }

    fn lower_active(&mut self, mut warnings: Vec<Warning>) -> Vec<Warning> {
        let config = DetectionConfig { active: false, ..self.store.current() };
        if let Err(e) = self.store.save(config) {
            warn!(error = %e, "Failed to persist deactivation, keeping in-memory value");
            warnings.push(e.into());
        }
        warnings
    }

    fn event_sink(&self) -> EventSink {
        let events = self.events.clone();
        Arc::new(move |event| {
            events.send_replace(Some(event));
        })
    }

    fn finish(&mut self, to: RunState, warnings: Vec<Warning>) -> Transition {
        if let Some(warning) = warnings.last() {
            self.last_error = Some(warning.kind);
        } else if to != RunState::Faulted {
            self.last_error = None;
        }
        self.set_run_state(to);
        Transition { snapshot: self.snapshot(), warnings }
    }

    fn set_run_state(&mut self, to: RunState) {
        if self.run_state != to {
            info!(from = %self.run_state, to = %to, "Lifecycle transition");
        }
        self.run_state = to;
        self.publish();
    }

    fn publish(&self) {
        let snapshot = self.snapshot();
        self.latest.send_replace(snapshot.clone());
        // No subscribers is fine
        let _ = self.transitions.send(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverlayPatch;
    use crate::config::detection::BlurType;
    use crate::detection::testing::ScriptedDetector;
    use crate::overlay::BridgeError;
    use crate::overlay::testing::{BridgeCall, RecordingBridge};
    use crate::permission::testing::ScriptedPermissions;
    use crate::persistence::MemoryStore;
    use std::time::Duration;

    struct Rig {
        manager: LifecycleManager,
        bridge: RecordingBridge,
        store: MemoryStore,
        permissions: ScriptedPermissions,
        detector: Arc<ScriptedDetector>,
    }

    fn rig_with(store: MemoryStore, permissions: ScriptedPermissions) -> Rig {
        let bridge = RecordingBridge::default();
        let detector = Arc::new(ScriptedDetector::default());
        let manager = LifecycleManager::new(
            Box::new(store.clone()),
            Box::new(permissions.clone()),
            detector.clone(),
            Box::new(bridge.clone()),
        );
        Rig { manager, bridge, store, permissions, detector }
    }

    fn rig() -> Rig {
        rig_with(MemoryStore::default(), ScriptedPermissions::granted())
    }

    fn drain(rx: &mut broadcast::Receiver<StateSnapshot>) -> Vec<RunState> {
        let mut states = Vec::new();
        while let Ok(snapshot) = rx.try_recv() {
            states.push(snapshot.run_state);
        }
        states
    }

    #[tokio::test(start_paused = true)]
    async fn test_activate_runs_overlay_then_loop() {
        let mut rig = rig();
        let mut rx = rig.manager.subscribe();

        let transition = rig.manager.set_active(true).await.unwrap();

        assert_eq!(transition.snapshot.run_state, RunState::Running);
        assert!(transition.warnings.is_empty());
        assert_eq!(drain(&mut rx), vec![RunState::Starting, RunState::Running]);
        assert_eq!(rig.manager.detection_interval(), Some(Duration::from_millis(500)));
        assert!(rig.store.stored().unwrap().active);

        match &rig.bridge.calls()[..] {
            [BridgeCall::Start(config)] => assert!(config.active),
            other => panic!("unexpected bridge calls: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_permission_changes_nothing() {
        let mut rig = rig_with(
            MemoryStore::default(),
            ScriptedPermissions::new(&[PermissionState::Denied], &[PermissionState::Denied]),
        );

        let err = rig.manager.set_active(true).await.unwrap_err();

        assert_eq!(err, LifecycleError::PermissionDenied(PermissionState::Denied));
        assert_eq!(rig.manager.run_state(), RunState::Stopped);
        assert!(!rig.manager.config().active);
        assert_eq!(rig.store.stored(), None);
        assert!(rig.bridge.calls().is_empty());
        assert_eq!(rig.manager.snapshot().last_error, Some(ErrorKind::PermissionDenied));
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_then_granted_on_request() {
        let mut rig = rig_with(
            MemoryStore::default(),
            ScriptedPermissions::new(&[PermissionState::Denied], &[PermissionState::Granted]),
        );

        rig.manager.set_active(true).await.unwrap();

        assert_eq!(rig.manager.run_state(), RunState::Running);
        assert_eq!(rig.permissions.requests(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_permission_is_distinguished_and_not_retried() {
        let mut rig = rig_with(
            MemoryStore::default(),
            ScriptedPermissions::new(&[PermissionState::Denied], &[PermissionState::Blocked]),
        );

        assert_eq!(rig.manager.set_active(true).await.unwrap_err(), LifecycleError::PermissionBlocked);
        assert_eq!(rig.manager.set_active(true).await.unwrap_err(), LifecycleError::PermissionBlocked);

        assert_eq!(rig.permissions.requests(), 1);
        assert_eq!(rig.manager.run_state(), RunState::Stopped);
        assert!(!rig.manager.config().active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_activate_is_a_noop() {
        let mut rig = rig();
        rig.manager.set_active(true).await.unwrap();

        let again = rig.manager.set_active(true).await.unwrap();

        assert_eq!(again.snapshot.run_state, RunState::Running);
        assert_eq!(rig.bridge.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_failure_faults_without_persisting() {
        let mut rig = rig();
        rig.bridge.fail_start(Some(BridgeError::CallFailed("SERVICE_START_FAILED".into())));

        let err = rig.manager.set_active(true).await.unwrap_err();

        assert!(matches!(err, LifecycleError::Bridge(BridgeError::CallFailed(_))));
        assert_eq!(rig.manager.run_state(), RunState::Faulted);
        assert_eq!(rig.manager.snapshot().last_error, Some(ErrorKind::BridgeCallFailed));
        assert_eq!(rig.manager.detection_interval(), None);
        assert_eq!(rig.store.stored(), None);

        // Only an explicit deactivate leaves Faulted, and it goes straight to Stopped
        assert_eq!(rig.manager.set_active(true).await.unwrap_err(), LifecycleError::Faulted);
        let mut rx = rig.manager.subscribe();
        let transition = rig.manager.set_active(false).await.unwrap();
        assert_eq!(transition.snapshot.run_state, RunState::Stopped);
        assert_eq!(drain(&mut rx), vec![RunState::Stopped]);
        assert_eq!(rig.bridge.calls().last(), Some(&BridgeCall::Stop));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deactivate_reaches_stopped_when_stop_fails() {
        let mut rig = rig();
        rig.manager.set_active(true).await.unwrap();
        rig.bridge.fail_stop(Some(BridgeError::CallFailed("SERVICE_STOP_FAILED".into())));
        let mut rx = rig.manager.subscribe();

        let transition = rig.manager.set_active(false).await.unwrap();

        assert_eq!(transition.snapshot.run_state, RunState::Stopped);
        assert_eq!(transition.warnings.len(), 1);
        assert_eq!(transition.warnings[0].kind, ErrorKind::BridgeCallFailed);
        assert_eq!(drain(&mut rx), vec![RunState::Stopping, RunState::Stopped]);
        assert!(!rig.store.stored().unwrap().active);
        assert_eq!(rig.manager.detection_interval(), None);

        // Loop really stopped
        let polls = rig.detector.poll_count();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(rig.detector.poll_count(), polls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_intensity_clamped_before_storage_and_bridge() {
        let mut rig = rig();
        rig.manager.set_active(true).await.unwrap();

        rig.manager.change_setting("blurIntensity", "40").await.unwrap();
        assert_eq!(rig.store.stored().unwrap().blur_intensity, 25);

        rig.manager.change_setting("blurIntensity", "0").await.unwrap();
        assert_eq!(rig.store.stored().unwrap().blur_intensity, 5);

        let updates: Vec<_> = rig
            .bridge
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                BridgeCall::Update(patch) => patch.blur_intensity,
                _ => None,
            })
            .collect();
        assert_eq!(updates, vec![25, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_setting_rejected_without_mutation() {
        let mut rig = rig();

        let err = rig.manager.change_setting("blurType", "swirl").await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(rig.store.config_writes(), 0);
        assert_eq!(rig.manager.config(), DetectionConfig::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_while_stopped_persists_without_bridge() {
        let mut rig = rig();

        let transition = rig.manager.apply_setting(SettingChange::BlurType(BlurType::Pixelate)).await;

        assert!(transition.warnings.is_empty());
        assert_eq!(rig.store.stored().unwrap().blur_type, BlurType::Pixelate);
        assert!(rig.bridge.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_battery_toggle_rearms_without_restart() {
        let mut rig = rig();
        rig.manager.set_active(true).await.unwrap();
        assert_eq!(rig.manager.detection_interval(), Some(Duration::from_millis(500)));
        let mut rx = rig.manager.subscribe();

        rig.manager.apply_setting(SettingChange::BatteryOptimization(true)).await;

        assert_eq!(rig.manager.detection_interval(), Some(Duration::from_millis(1000)));
        assert_eq!(drain(&mut rx), vec![RunState::Running]);
        let calls = rig.bridge.calls();
        assert_eq!(calls.len(), 2);
        assert!(matches!(calls[0], BridgeCall::Start(_)));
        assert_eq!(
            calls[1],
            BridgeCall::Update(OverlayPatch { battery_optimization: Some(true), ..OverlayPatch::default() })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_failure_keeps_local_value_and_state() {
        let mut rig = rig();
        rig.manager.set_active(true).await.unwrap();
        rig.bridge.fail_update(Some(BridgeError::CallFailed("CONFIG_UPDATE_FAILED".into())));

        let transition = rig.manager.change_setting("sensitivity", "high").await.unwrap();

        assert_eq!(transition.snapshot.run_state, RunState::Running);
        assert_eq!(transition.warnings[0].kind, ErrorKind::BridgeCallFailed);
        assert_eq!(transition.snapshot.last_error, Some(ErrorKind::BridgeCallFailed));
        assert_eq!(rig.store.stored().unwrap().sensitivity, crate::config::Sensitivity::High);
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_failure_does_not_roll_back() {
        let mut rig = rig();
        rig.store.fail_writes(true);

        let transition = rig.manager.set_active(true).await.unwrap();

        assert_eq!(transition.snapshot.run_state, RunState::Running);
        assert!(transition.snapshot.config.active);
        assert_eq!(transition.warnings[0].kind, ErrorKind::Storage);
        assert!(rig.manager.config().active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detection_events_published() {
        let mut rig = rig();
        let events = rig.manager.detection_events();

        rig.manager.set_active(true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(750)).await;

        let latest = *events.borrow();
        assert_eq!(latest.map(|e| e.matched), Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_resumes_active_session() {
        let stored = DetectionConfig { active: true, battery_optimization: true, ..DetectionConfig::default() };
        let mut rig = rig_with(MemoryStore::with_config(stored), ScriptedPermissions::granted());

        let transition = rig.manager.restore().await;

        assert_eq!(transition.snapshot.run_state, RunState::Running);
        assert_eq!(rig.manager.detection_interval(), Some(Duration::from_millis(1000)));
        assert_eq!(rig.permissions.requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_lowers_active_without_permission() {
        let stored = DetectionConfig { active: true, ..DetectionConfig::default() };
        let mut rig = rig_with(
            MemoryStore::with_config(stored),
            ScriptedPermissions::new(&[PermissionState::Denied], &[PermissionState::Granted]),
        );

        let transition = rig.manager.restore().await;

        assert_eq!(transition.snapshot.run_state, RunState::Stopped);
        assert!(!rig.store.stored().unwrap().active);
        assert!(rig.bridge.calls().is_empty());
        assert_eq!(rig.permissions.requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_with_failing_bridge_faults_and_lowers() {
        let stored = DetectionConfig { active: true, ..DetectionConfig::default() };
        let mut rig = rig_with(MemoryStore::with_config(stored), ScriptedPermissions::granted());
        rig.bridge.fail_start(Some(BridgeError::Unavailable));

        let transition = rig.manager.restore().await;

        assert_eq!(transition.snapshot.run_state, RunState::Faulted);
        assert_eq!(transition.snapshot.last_error, Some(ErrorKind::BridgeUnavailable));
        assert!(!rig.store.stored().unwrap().active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_without_stored_state_uses_defaults() {
        let mut rig = rig();

        let transition = rig.manager.restore().await;

        assert_eq!(transition.snapshot.run_state, RunState::Stopped);
        assert_eq!(transition.snapshot.config, DetectionConfig::default());
        assert_eq!(transition.snapshot.permission, Some(PermissionState::Granted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_revoked_permission_deactivates() {
        let mut rig = rig_with(
            MemoryStore::default(),
            ScriptedPermissions::new(
                &[PermissionState::Granted, PermissionState::Denied],
                &[PermissionState::Granted],
            ),
        );
        rig.manager.set_active(true).await.unwrap();

        let transition = rig.manager.recheck_permission().await;

        assert_eq!(transition.snapshot.run_state, RunState::Stopped);
        assert_eq!(transition.snapshot.permission, Some(PermissionState::Denied));
        assert!(!rig.store.stored().unwrap().active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_keeps_active_for_next_launch() {
        let mut rig = rig();
        rig.manager.set_active(true).await.unwrap();

        rig.manager.shutdown().await;

        assert_eq!(rig.manager.run_state(), RunState::Stopped);
        assert_eq!(rig.bridge.calls().last(), Some(&BridgeCall::Stop));
        assert!(rig.store.stored().unwrap().active);
    }
}
