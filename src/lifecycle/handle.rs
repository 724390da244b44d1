//! Single-flight command queue in front of `LifecycleManager`
//!
//! Callers on any task or thread send commands through an unbounded channel;
//! one worker task owns the manager and runs them to completion in arrival
//! order. State reads go through watch/broadcast channels and never queue.

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{LifecycleError, LifecycleManager, StateSnapshot, Transition};
use crate::detection::DetectionEvent;

enum Command {
    SetActive(bool, oneshot::Sender<Result<Transition, LifecycleError>>),
    ChangeSetting {
        field: String,
        value: String,
        reply: oneshot::Sender<Result<Transition, LifecycleError>>,
    },
    RecheckPermission(oneshot::Sender<Transition>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct LifecycleHandle {
    commands: mpsc::UnboundedSender<Command>,
    latest: watch::Receiver<StateSnapshot>,
    transitions: broadcast::Sender<StateSnapshot>,
    events: watch::Receiver<Option<DetectionEvent>>,
}

impl LifecycleHandle {
    /// Move the manager onto its worker task
    pub fn spawn(manager: LifecycleManager) -> (Self, JoinHandle<()>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let handle = Self {
            commands,
            latest: manager.watch_state(),
            transitions: manager.transitions_sender(),
            events: manager.detection_events(),
        };
        let worker = tokio::spawn(run_worker(manager, rx));
        (handle, worker)
    }

    pub async fn set_active(&self, active: bool) -> Result<Transition, LifecycleError> {
        self.call(|reply| Command::SetActive(active, reply)).await?
    }

    pub async fn change_setting(&self, field: &str, value: &str) -> Result<Transition, LifecycleError> {
        let (field, value) = (field.to_owned(), value.to_owned());
        self.call(|reply| Command::ChangeSetting { field, value, reply }).await?
    }

    pub async fn recheck_permission(&self) -> Result<Transition, LifecycleError> {
        self.call(Command::RecheckPermission).await
    }

    /// Release everything and stop the worker. Later calls fail with `ShutDown`.
    pub async fn shutdown(&self) -> Result<(), LifecycleError> {
        self.call(Command::Shutdown).await
    }

    pub fn state(&self) -> StateSnapshot {
        self.latest.borrow().clone()
    }

    #[cfg(test)]
    pub fn watch_state(&self) -> watch::Receiver<StateSnapshot> {
        self.latest.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateSnapshot> {
        self.transitions.subscribe()
    }

    pub fn detection_events(&self) -> watch::Receiver<Option<DetectionEvent>> {
        self.events.clone()
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, LifecycleError> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(make(reply)).map_err(|_| LifecycleError::ShutDown)?;
        rx.await.map_err(|_| LifecycleError::ShutDown)
    }
}

async fn run_worker(mut manager: LifecycleManager, mut rx: mpsc::UnboundedReceiver<Command>) {
    debug!("Lifecycle worker started");

    while let Some(command) = rx.recv().await {
        // Caller may have gone away; the operation still ran
        match command {
            Command::SetActive(active, reply) => {
                let _ = reply.send(manager.set_active(active).await);
            }
            Command::ChangeSetting { field, value, reply } => {
                let _ = reply.send(manager.change_setting(&field, &value).await);
            }
            Command::RecheckPermission(reply) => {
                let _ = reply.send(manager.recheck_permission().await);
            }
            Command::Shutdown(reply) => {
                manager.shutdown().await;
                let _ = reply.send(());
                break;
            }
        }
    }

    // All handles dropped without an explicit shutdown
    if manager.run_state() != super::RunState::Stopped {
        manager.shutdown().await;
    }
    info!("Lifecycle worker stopped");
}
