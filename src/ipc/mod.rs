//! Local socket plumbing
//!
//! The control socket (UIs and `ctl` talking to the daemon) and the renderer
//! socket (daemon talking to the overlay surface) share one frame format: a
//! u32 little-endian byte count followed by that many bytes of JSON.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

mod messages;
pub use messages::{BridgeRequest, BridgeResponse, ControlRequest, ControlResponse};

use crate::constants::ipc::{CONTROL_SOCKET, MAX_MESSAGE_SIZE, OVERLAY_SOCKET, RUNTIME_DIR};

/// `$XDG_RUNTIME_DIR/blur-overlay`, or the cache dir on hosts without one
fn runtime_dir() -> Result<PathBuf> {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return Ok(PathBuf::from(runtime_dir).join(RUNTIME_DIR));
    }

    let cache = dirs::cache_dir()
        .context("Failed to determine cache directory (no XDG_RUNTIME_DIR or HOME)")?;
    Ok(cache.join(RUNTIME_DIR))
}

/// Where `run` listens and `ctl` connects unless told otherwise
pub fn default_control_socket() -> Result<PathBuf> {
    Ok(runtime_dir()?.join(CONTROL_SOCKET))
}

/// Where the overlay renderer is expected to listen
pub fn default_overlay_socket() -> Result<PathBuf> {
    Ok(runtime_dir()?.join(OVERLAY_SOCKET))
}

/// One `ctl` session; requests are answered in order on the same stream
pub struct ControlClient {
    pub(crate) stream: UnixStream,
}

impl ControlClient {
    pub fn connect_to(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .context(format!("Failed to connect to daemon at {}", path.display()))?;
        Ok(Self { stream })
    }

    pub fn send_request(&mut self, req: &ControlRequest) -> Result<()> {
        write_message(&mut self.stream, req)
    }

    /// Blocks; also used to read a `Subscribe` stream
    pub fn recv_response(&mut self) -> Result<ControlResponse> {
        read_message(&mut self.stream)
    }

    pub fn request(&mut self, req: ControlRequest) -> Result<ControlResponse> {
        self.send_request(&req)?;
        self.recv_response()
    }
}

/// Owner-only listening socket, unlinked on drop
pub struct ControlServer {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl ControlServer {
    /// Replaces a socket left behind by a previous run, but refuses to take
    /// over one that still has a listener
    pub fn bind_to(socket_path: PathBuf) -> Result<Self> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)
                .context(format!("Failed to create socket directory: {}", parent.display()))?;
        }

        if socket_path.exists() {
            if UnixStream::connect(&socket_path).is_ok() {
                bail!("Another daemon is already listening on {}", socket_path.display());
            }
            std::fs::remove_file(&socket_path)
                .context(format!("Failed to remove stale socket: {}", socket_path.display()))?;
        }

        let listener = UnixListener::bind(&socket_path)
            .context(format!("Failed to bind socket at {}", socket_path.display()))?;

        // Owner only
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o700))
                .context("Failed to set socket permissions")?;
        }

        Ok(Self {
            listener,
            socket_path,
        })
    }

    pub fn accept(&self) -> Result<UnixStream> {
        let (stream, _addr) = self.listener.accept()
            .context("Failed to accept IPC connection")?;
        Ok(stream)
    }

    pub fn path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

/// Frame and send one message
pub(crate) fn write_message<T: Serialize>(stream: &mut impl Write, msg: &T) -> Result<()> {
    let json = serde_json::to_vec(msg).context("Failed to serialize message to JSON")?;

    if json.len() > MAX_MESSAGE_SIZE {
        return Err(anyhow!("Message too large: {} bytes (max: {})", json.len(), MAX_MESSAGE_SIZE));
    }

    let mut frame = Vec::with_capacity(4 + json.len());
    frame.extend_from_slice(&(json.len() as u32).to_le_bytes());
    frame.extend_from_slice(&json);

    stream.write_all(&frame).context("Failed to write message frame")?;
    stream.flush().context("Failed to flush stream")
}

/// Receive one framed message; oversized frames are refused before allocating
pub(crate) fn read_message<T: for<'de> Deserialize<'de>>(stream: &mut impl Read) -> Result<T> {
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .context("Failed to read message length")?;
    let len = u32::from_le_bytes(len_buf) as usize;

    if len > MAX_MESSAGE_SIZE {
        return Err(anyhow!("Message too large: {} bytes (max: {})", len, MAX_MESSAGE_SIZE));
    }

    let mut json_buf = vec![0u8; len];
    stream
        .read_exact(&mut json_buf)
        .context("Failed to read message payload")?;

    serde_json::from_slice(&json_buf).context("Failed to deserialize message from JSON")
}
