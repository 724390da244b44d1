//! Overlay bridge over the renderer's Unix socket
//!
//! One connection per call: the renderer is a separate process that may
//! restart between calls. Socket IO is blocking and runs on the blocking pool.

use async_trait::async_trait;
use std::io;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use tracing::debug;

use super::{BridgeError, OverlayBridge};
use crate::config::{DetectionConfig, OverlayPatch};
use crate::ipc::{read_message, write_message, BridgeRequest, BridgeResponse};

pub struct SocketBridge {
    path: PathBuf,
}

impl SocketBridge {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    async fn call(&self, request: BridgeRequest) -> Result<(), BridgeError> {
        let path = self.path.clone();
        let response = tokio::task::spawn_blocking(move || exchange(path, request))
            .await
            .map_err(|e| BridgeError::CallFailed(format!("bridge worker failed: {e}")))??;

        match response {
            BridgeResponse::Ok => Ok(()),
            BridgeResponse::Error(message) => Err(BridgeError::CallFailed(message)),
        }
    }
}

fn exchange(path: PathBuf, request: BridgeRequest) -> Result<BridgeResponse, BridgeError> {
    let mut stream = UnixStream::connect(&path).map_err(|e| match e.kind() {
        // Nobody listening: no overlay surface on this host
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => {
            debug!(path = %path.display(), error = %e, "Overlay renderer not reachable");
            BridgeError::Unavailable
        }
        _ => BridgeError::CallFailed(format!("connect to {}: {e}", path.display())),
    })?;

    write_message(&mut stream, &request).map_err(|e| BridgeError::CallFailed(format!("{e:#}")))?;
    read_message(&mut stream).map_err(|e| BridgeError::CallFailed(format!("{e:#}")))
}

#[async_trait]
impl OverlayBridge for SocketBridge {
    async fn start_overlay(&self, config: &DetectionConfig) -> Result<(), BridgeError> {
        self.call(BridgeRequest::StartOverlay(config.clone())).await
    }

    async fn stop_overlay(&self) -> Result<(), BridgeError> {
        self.call(BridgeRequest::StopOverlay).await
    }

    async fn update_overlay_config(&self, patch: &OverlayPatch) -> Result<(), BridgeError> {
        self.call(BridgeRequest::UpdateOverlayConfig(patch.clone())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use std::thread;
    use tempfile::TempDir;

    /// Fake renderer: answers `count` requests with `reply`, returns what it saw
    fn fake_renderer(
        listener: UnixListener,
        count: usize,
        reply: BridgeResponse,
    ) -> thread::JoinHandle<Vec<BridgeRequest>> {
        thread::spawn(move || {
            let mut seen = Vec::new();
            for _ in 0..count {
                let (mut stream, _) = listener.accept().unwrap();
                seen.push(read_message(&mut stream).unwrap());
                write_message(&mut stream, &reply).unwrap();
            }
            seen
        })
    }

    #[tokio::test]
    async fn test_calls_reach_renderer() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("overlay.sock");
        let renderer = fake_renderer(UnixListener::bind(&path).unwrap(), 3, BridgeResponse::Ok);
        let bridge = SocketBridge::new(path);

        let config = DetectionConfig::default();
        let patch = OverlayPatch { blur_intensity: Some(20), ..OverlayPatch::default() };
        bridge.start_overlay(&config).await.unwrap();
        bridge.update_overlay_config(&patch).await.unwrap();
        bridge.stop_overlay().await.unwrap();

        assert_eq!(
            renderer.join().unwrap(),
            vec![
                BridgeRequest::StartOverlay(config),
                BridgeRequest::UpdateOverlayConfig(patch),
                BridgeRequest::StopOverlay,
            ]
        );
    }

    #[tokio::test]
    async fn test_renderer_error_is_call_failed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("overlay.sock");
        let renderer = fake_renderer(
            UnixListener::bind(&path).unwrap(),
            1,
            BridgeResponse::Error("OVERLAY_PERMISSION_DENIED".into()),
        );
        let bridge = SocketBridge::new(path);

        let result = bridge.start_overlay(&DetectionConfig::default()).await;
        assert_eq!(result, Err(BridgeError::CallFailed("OVERLAY_PERMISSION_DENIED".into())));
        renderer.join().unwrap();
    }

    #[tokio::test]
    async fn test_missing_socket_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let bridge = SocketBridge::new(dir.path().join("nobody-home.sock"));

        assert_eq!(bridge.stop_overlay().await, Err(BridgeError::Unavailable));
    }
}
