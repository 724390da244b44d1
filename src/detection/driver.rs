//! Cancellable periodic poll of the detection capability

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info};

use super::{DetectionEvent, Detector};
use crate::config::DetectionConfig;

/// Receives every tick's result. Runs on the loop task while the loop's
/// liveness lock is held, so it must not call back into the loop.
pub type EventSink = Arc<dyn Fn(DetectionEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopHandle(u64);

struct RunningLoop {
    handle: LoopHandle,
    interval: watch::Sender<Duration>,
    /// `true` while ticks may fire; cleared under the lock by `stop`
    live: Arc<Mutex<bool>>,
    task: JoinHandle<()>,
}

/// One timer at a time. Owned by the lifecycle manager.
pub struct DetectionLoop {
    detector: Arc<dyn Detector>,
    config: watch::Receiver<DetectionConfig>,
    next_id: u64,
    running: Option<RunningLoop>,
}

impl DetectionLoop {
    pub fn new(detector: Arc<dyn Detector>, config: watch::Receiver<DetectionConfig>) -> Self {
        Self { detector, config, next_id: 0, running: None }
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Interval the running timer is armed with
    #[cfg(test)]
    pub fn interval(&self) -> Option<Duration> {
        self.running.as_ref().map(|r| *r.interval.borrow())
    }

    pub fn handle(&self) -> Option<LoopHandle> {
        self.running.as_ref().map(|r| r.handle)
    }

    /// Start polling. A second start while running returns the existing handle.
    pub fn start(&mut self, on_event: EventSink, interval: Duration) -> LoopHandle {
        if let Some(running) = &self.running {
            debug!(handle = ?running.handle, "Detection loop already running");
            return running.handle;
        }

        self.next_id += 1;
        let handle = LoopHandle(self.next_id);
        let (interval_tx, interval_rx) = watch::channel(interval);
        let live = Arc::new(Mutex::new(true));

        let task = tokio::spawn(run_loop(
            self.detector.clone(),
            self.config.clone(),
            on_event,
            interval_rx,
            live.clone(),
        ));

        info!(handle = ?handle, interval_ms = interval.as_millis() as u64, "Detection loop started");
        self.running = Some(RunningLoop { handle, interval: interval_tx, live, task });
        handle
    }

    /// Stop polling. No tick fires after this returns.
    pub fn stop(&mut self, handle: LoopHandle) -> bool {
        match &self.running {
            Some(running) if running.handle == handle => {}
            _ => {
                debug!(handle = ?handle, "Ignoring stop for a loop that is not running");
                return false;
            }
        }

        if let Some(running) = self.running.take() {
            // Waits out a tick that is mid-flight on another worker
            *running.live.lock().unwrap_or_else(PoisonError::into_inner) = false;
            running.task.abort();
            info!(handle = ?handle, "Detection loop stopped");
        }
        true
    }

    /// Re-arm the running timer without stopping it
    pub fn set_interval(&mut self, handle: LoopHandle, interval: Duration) -> bool {
        let Some(running) = self.running.as_ref().filter(|r| r.handle == handle) else {
            debug!(handle = ?handle, "Ignoring interval change for a loop that is not running");
            return false;
        };

        let changed = running.interval.send_if_modified(|current| {
            if *current == interval {
                false
            } else {
                *current = interval;
                true
            }
        });
        if changed {
            info!(handle = ?handle, interval_ms = interval.as_millis() as u64, "Detection loop re-armed");
        }
        true
    }
}

impl Drop for DetectionLoop {
    fn drop(&mut self) {
        if let Some(handle) = self.handle() {
            self.stop(handle);
        }
    }
}

fn arm_ticker(period: Duration) -> Interval {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    // Overruns are dropped, not replayed
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

async fn run_loop(
    detector: Arc<dyn Detector>,
    config: watch::Receiver<DetectionConfig>,
    on_event: EventSink,
    mut interval_rx: watch::Receiver<Duration>,
    live: Arc<Mutex<bool>>,
) {
    let mut ticker = arm_ticker(*interval_rx.borrow_and_update());

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !fire(detector.as_ref(), &config, &on_event, &live) {
                    break;
                }
            }
            changed = interval_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                ticker = arm_ticker(*interval_rx.borrow_and_update());
            }
        }
    }
}

/// Run one tick. Returns `false` once the loop has been stopped.
fn fire(
    detector: &dyn Detector,
    config: &watch::Receiver<DetectionConfig>,
    on_event: &EventSink,
    live: &Mutex<bool>,
) -> bool {
    let live = live.lock().unwrap_or_else(PoisonError::into_inner);
    if !*live {
        return false;
    }

    let snapshot = config.borrow().clone();
    let matched = match detector.poll(&snapshot) {
        Ok(matched) => matched,
        Err(e) => {
            // Counts as no match; the loop keeps running
            debug!(error = %e, "Detection poll failed, treating as no match");
            false
        }
    };
    on_event(DetectionEvent::now(matched));
    true
}
