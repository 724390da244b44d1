//! Control socket handler
//!
//! Each UI / `ctl` connection gets its own thread. Requests are forwarded to
//! the lifecycle worker through `LifecycleHandle`, so several clients can be
//! connected at once and still see their operations serialized.

use anyhow::{Context, Result};
use std::io::Read;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::ipc::{read_message, write_message, ControlRequest, ControlResponse, ControlServer};
use crate::lifecycle::{LifecycleError, LifecycleHandle, Transition};

/// Spawn the accept loop; `shutdown_tx` fires when a client asks the daemon to exit
pub fn spawn_control_listener(
    server: ControlServer,
    lifecycle: LifecycleHandle,
    runtime: Handle,
    shutdown_tx: mpsc::UnboundedSender<()>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        if let Err(e) = run_accept_loop(&server, &lifecycle, &runtime, &shutdown_tx) {
            error!(error = ?e, "Control listener thread crashed");
        }
    })
}

fn run_accept_loop(
    server: &ControlServer,
    lifecycle: &LifecycleHandle,
    runtime: &Handle,
    shutdown_tx: &mpsc::UnboundedSender<()>,
) -> Result<()> {
    info!(socket = ?server.path(), "Control listener started");

    loop {
        let stream = server.accept()?;
        let lifecycle = lifecycle.clone();
        let runtime = runtime.clone();
        let shutdown_tx = shutdown_tx.clone();

        std::thread::spawn(move || {
            debug!("Control client connected");
            if let Err(e) = serve_client(stream, &lifecycle, &runtime, &shutdown_tx) {
                warn!(error = ?e, "Control connection closed or error");
            }
            debug!("Control client disconnected");
        });
    }
}

fn serve_client(
    mut stream: UnixStream,
    lifecycle: &LifecycleHandle,
    runtime: &Handle,
    shutdown_tx: &mpsc::UnboundedSender<()>,
) -> Result<()> {
    loop {
        let request: ControlRequest = read_message(&mut stream)?;
        debug!(request = ?request, "Control request");

        match request {
            ControlRequest::Subscribe => {
                return runtime.block_on(stream_updates(lifecycle, stream));
            }
            ControlRequest::Shutdown => {
                info!("Received shutdown request via control socket");
                write_message(&mut stream, &ControlResponse::Ready)?;
                shutdown_tx.send(()).ok();
                return Ok(());
            }
            request => {
                let response = runtime.block_on(respond(lifecycle, request));
                write_message(&mut stream, &response)?;
            }
        }
    }
}

/// Answer a single request/response style command
pub(crate) async fn respond(lifecycle: &LifecycleHandle, request: ControlRequest) -> ControlResponse {
    match request {
        ControlRequest::GetState => ControlResponse::State(lifecycle.state()),
        ControlRequest::SetActive(active) => applied(lifecycle.set_active(active).await),
        ControlRequest::ChangeSetting { field, value } => {
            applied(lifecycle.change_setting(&field, &value).await)
        }
        ControlRequest::RecheckPermission => applied(lifecycle.recheck_permission().await),
        ControlRequest::Ping => ControlResponse::Pong,
        ControlRequest::Subscribe | ControlRequest::Shutdown => ControlResponse::Ready,
    }
}

fn applied(result: Result<Transition, LifecycleError>) -> ControlResponse {
    match result {
        Ok(transition) => ControlResponse::Applied(transition),
        Err(e) => ControlResponse::Rejected { kind: e.kind(), message: e.to_string() },
    }
}

/// Push the current snapshot, then every transition and detection result
/// until the client goes away or the lifecycle shuts down
async fn stream_updates(lifecycle: &LifecycleHandle, mut stream: UnixStream) -> Result<()> {
    let hangup = watch_hangup(&stream)?;
    let result = forward_updates(lifecycle, &mut stream, hangup).await;
    // Unblocks the hangup reader if we stopped for another reason
    let _ = stream.shutdown(Shutdown::Both);
    result
}

async fn forward_updates(
    lifecycle: &LifecycleHandle,
    stream: &mut UnixStream,
    mut hangup: oneshot::Receiver<()>,
) -> Result<()> {
    let mut transitions = lifecycle.subscribe();
    let mut events = lifecycle.detection_events();
    events.borrow_and_update();

    write_message(stream, &ControlResponse::State(lifecycle.state()))
        .context("Failed to send initial snapshot")?;

    loop {
        tokio::select! {
            _ = &mut hangup => {
                debug!("Subscriber hung up");
                return Ok(());
            }
            snapshot = transitions.recv() => match snapshot {
                Ok(snapshot) => write_message(stream, &ControlResponse::State(snapshot))?,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped = skipped, "Subscriber lagging, dropped snapshots");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
            changed = events.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let latest = *events.borrow_and_update();
                if let Some(event) = latest {
                    write_message(stream, &ControlResponse::Detection(event))?;
                }
            }
        }
    }
}

/// Fires once the subscriber closes its end. Subscribers send nothing after
/// `Subscribe`, so EOF or a read error both mean the client is gone.
fn watch_hangup(stream: &UnixStream) -> Result<oneshot::Receiver<()>> {
    let mut reader = stream.try_clone().context("Failed to clone subscriber stream")?;
    let (tx, rx) = oneshot::channel();
    std::thread::spawn(move || {
        let mut buf = [0u8; 64];
        while let Ok(n) = reader.read(&mut buf) {
            if n == 0 {
                break;
            }
        }
        let _ = tx.send(());
    });
    Ok(rx)
}
