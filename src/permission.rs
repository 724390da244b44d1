//! Permission gate over the host's permission service

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

use crate::persistence::Persistence;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PermissionState {
    Granted,
    Denied,
    Blocked,
    Unavailable,
    Limited,
}

impl PermissionState {
    pub fn is_granted(self) -> bool {
        self == Self::Granted
    }
}

impl fmt::Display for PermissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Granted => "granted",
            Self::Denied => "denied",
            Self::Blocked => "blocked",
            Self::Unavailable => "unavailable",
            Self::Limited => "limited",
        })
    }
}

/// Host permission service
#[async_trait]
pub trait PermissionProvider: Send + Sync {
    /// Non-mutating query
    async fn check(&self) -> PermissionState;

    /// May prompt the user
    async fn request(&self) -> PermissionState;
}

/// Fixed answer, for hosts without a permission service
pub struct StaticPermissionProvider {
    state: PermissionState,
}

impl StaticPermissionProvider {
    pub fn new(state: PermissionState) -> Self {
        Self { state }
    }
}

#[async_trait]
impl PermissionProvider for StaticPermissionProvider {
    async fn check(&self) -> PermissionState {
        self.state
    }

    async fn request(&self) -> PermissionState {
        self.state
    }
}

/// Tracks the last resolved permission state
///
/// `None` means stale (never queried). A `Blocked` result sticks for the rest
/// of the session: `ensure_granted` will not prompt again until an explicit
/// `check` reports something else.
pub struct PermissionGate {
    provider: Box<dyn PermissionProvider>,
    state: Option<PermissionState>,
}

impl PermissionGate {
    pub fn new(provider: Box<dyn PermissionProvider>) -> Self {
        Self { provider, state: None }
    }

    pub fn state(&self) -> Option<PermissionState> {
        self.state
    }

    pub async fn check(&mut self, persistence: &mut dyn Persistence) -> PermissionState {
        let state = self.provider.check().await;
        self.record(state, persistence);
        state
    }

    /// Prompt unless already granted
    pub async fn request(&mut self, persistence: &mut dyn Persistence) -> PermissionState {
        if self.state == Some(PermissionState::Granted) {
            return PermissionState::Granted;
        }
        let state = self.provider.request().await;
        self.record(state, persistence);
        state
    }

    /// Resolve permission for a user's activation intent
    /// Queries if stale, prompts only if not granted and not blocked
    pub async fn ensure_granted(&mut self, persistence: &mut dyn Persistence) -> PermissionState {
        let current = match self.state {
            Some(state) => state,
            None => self.check(persistence).await,
        };
        match current {
            PermissionState::Granted | PermissionState::Blocked => current,
            _ => self.request(persistence).await,
        }
    }

    fn record(&mut self, state: PermissionState, persistence: &mut dyn Persistence) {
        if self.state != Some(state) {
            info!(from = ?self.state, to = %state, "Permission state changed");
        }
        if self.state.is_none() && persistence.read_permission_flag() && !state.is_granted() {
            warn!(state = %state, "Permission was granted in a previous session but is now revoked");
        }
        self.state = Some(state);
        if let Err(e) = persistence.write_permission_flag(state.is_granted()) {
            // best-effort: the in-memory state is authoritative for this session
            warn!(error = %e, "Failed to persist permission flag");
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Scripted provider: answers are popped per call, the last one repeats
    #[derive(Clone)]
    pub struct ScriptedPermissions {
        checks: Arc<Mutex<VecDeque<PermissionState>>>,
        requests: Arc<Mutex<VecDeque<PermissionState>>>,
        pub request_count: Arc<Mutex<usize>>,
        pub check_count: Arc<Mutex<usize>>,
    }

    impl ScriptedPermissions {
        pub fn new(checks: &[PermissionState], requests: &[PermissionState]) -> Self {
            Self {
                checks: Arc::new(Mutex::new(checks.iter().copied().collect())),
                requests: Arc::new(Mutex::new(requests.iter().copied().collect())),
                request_count: Arc::new(Mutex::new(0)),
                check_count: Arc::new(Mutex::new(0)),
            }
        }

        pub fn granted() -> Self {
            Self::new(&[PermissionState::Granted], &[PermissionState::Granted])
        }

        pub fn requests(&self) -> usize {
            *self.request_count.lock().unwrap()
        }

        fn next(queue: &Mutex<VecDeque<PermissionState>>) -> PermissionState {
            let mut queue = queue.lock().unwrap();
            if queue.len() > 1 {
                queue.pop_front().unwrap()
            } else {
                queue.front().copied().unwrap_or(PermissionState::Unavailable)
            }
        }
    }

    #[async_trait]
    impl PermissionProvider for ScriptedPermissions {
        async fn check(&self) -> PermissionState {
            *self.check_count.lock().unwrap() += 1;
            Self::next(&self.checks)
        }

        async fn request(&self) -> PermissionState {
            *self.request_count.lock().unwrap() += 1;
            Self::next(&self.requests)
        }
    }
}
