// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! C10: an optional external driver speaks to the orchestrator over two
//! named pipes instead of the interactive CLI (§4.10). Framing is a 4-byte
//! little-endian length prefix followed by a UTF-8 JSON body, capped at
//! 10 MiB, on each direction independently.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use swarm_core::SwarmError;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};

/// §8 boundary behavior: "External-IPC frame with len == 0 or len > 10 MiB
/// terminates the listener cleanly."
pub const MAX_FRAME_BYTES: u32 = 10 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct IpcRequest {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename = "response")]
struct IpcResponse {
    id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl IpcResponse {
    fn ok(id: String, result: Value) -> Self {
        Self { id, result: Some(result), error: None }
    }
    fn err(id: String, message: String) -> Self {
        Self { id, result: None, error: Some(message) }
    }
}

/// Create `path` as a POSIX FIFO if it doesn't already exist.
fn ensure_fifo(path: &Path) -> Result<(), SwarmError> {
    if path.exists() {
        return Ok(());
    }
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| SwarmError::Collaborator(format!("invalid pipe path {}: {e}", path.display())))?;
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    if rc != 0 {
        return Err(SwarmError::Collaborator(format!(
            "mkfifo {} failed: {}",
            path.display(),
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

async fn read_frame(file: &mut File) -> Result<Option<Vec<u8>>, SwarmError> {
    let mut len_buf = [0u8; 4];
    match file.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(SwarmError::ExternalDriverClosed(e.to_string())),
    }
    let len = u32::from_le_bytes(len_buf);
    if len == 0 || len > MAX_FRAME_BYTES {
        return Err(SwarmError::ExternalDriverClosed(format!("invalid frame length {len}")));
    }

    let mut body = vec![0u8; len as usize];
    file.read_exact(&mut body).await.map_err(|e| SwarmError::ExternalDriverClosed(e.to_string()))?;
    Ok(Some(body))
}

async fn write_frame(file: &mut File, body: &[u8]) -> Result<(), SwarmError> {
    let len = u32::try_from(body.len()).map_err(|_| SwarmError::ExternalDriverClosed("response frame too large".into()))?;
    file.write_all(&len.to_le_bytes()).await.map_err(|e| SwarmError::ExternalDriverClosed(e.to_string()))?;
    file.write_all(body).await.map_err(|e| SwarmError::ExternalDriverClosed(e.to_string()))?;
    file.flush().await.map_err(|e| SwarmError::ExternalDriverClosed(e.to_string()))?;
    Ok(())
}

/// The orchestrator's half of C10: two FIFOs under `session_dir`, opened in
/// the order §4.10 specifies ("the driver opens the request pipe for write
/// first; the orchestrator opens it for read; then the driver opens the
/// response pipe for read and the orchestrator for write").
pub struct IpcBridge {
    request_pipe: PathBuf,
    response_pipe: PathBuf,
}

impl IpcBridge {
    pub fn new(session_dir: impl Into<PathBuf>) -> Self {
        let dir = session_dir.into();
        Self { request_pipe: dir.join("request.pipe"), response_pipe: dir.join("response.pipe") }
    }

    /// Accept one driver session: open both pipes (blocking until the
    /// driver-side end is also open, which is how named pipes rendezvous),
    /// then process frames until EOF, a `shutdown` call, or a frame-size
    /// violation. `handle` implements `start_task`/`process_input`; the
    /// bridge implements `shutdown` itself (§4.10 "on shutdown the
    /// orchestrator sends the response, then saves and closes the program
    /// database before exiting").
    pub async fn run<F, Fut>(&self, mut handle: F) -> Result<(), SwarmError>
    where
        F: FnMut(IpcRequest) -> Fut,
        Fut: std::future::Future<Output = Result<Value, SwarmError>>,
    {
        ensure_fifo(&self.request_pipe)?;
        ensure_fifo(&self.response_pipe)?;

        info!(request = %self.request_pipe.display(), response = %self.response_pipe.display(), "IPC bridge waiting for driver");
        let mut request_file = File::open(&self.request_pipe).await.map_err(|e| SwarmError::ExternalDriverClosed(e.to_string()))?;
        let mut response_file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&self.response_pipe)
            .await
            .map_err(|e| SwarmError::ExternalDriverClosed(e.to_string()))?;

        loop {
            let body = match read_frame(&mut request_file).await {
                Ok(Some(body)) => body,
                Ok(None) => {
                    info!("IPC request pipe closed (EOF), terminating listener");
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %e, "IPC frame error, terminating listener");
                    return Ok(());
                }
            };

            let request: IpcRequest = match serde_json::from_slice(&body) {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "malformed IPC request body, ignoring frame");
                    continue;
                }
            };

            if request.method == "shutdown" {
                let response = IpcResponse::ok(request.id.clone(), serde_json::json!({"status": "shutting_down"}));
                let encoded = serde_json::to_vec(&response).unwrap_or_default();
                let _ = write_frame(&mut response_file, &encoded).await;
                info!("shutdown requested over IPC, closing bridge");
                return Ok(());
            }

            let response = match handle(request.clone()).await {
                Ok(result) => IpcResponse::ok(request.id, result),
                Err(e) => IpcResponse::err(request.id, e.to_string()),
            };
            let encoded = serde_json::to_vec(&response).unwrap_or_default();
            if let Err(e) = write_frame(&mut response_file, &encoded).await {
                warn!(error = %e, "failed to write IPC response, terminating listener");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_fifo_creates_a_fifo_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("request.pipe");
        ensure_fifo(&path).unwrap();

        let meta = std::fs::metadata(&path).unwrap();
        use std::os::unix::fs::FileTypeExt;
        assert!(meta.file_type().is_fifo());
    }

    #[tokio::test]
    async fn ensure_fifo_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("request.pipe");
        ensure_fifo(&path).unwrap();
        ensure_fifo(&path).unwrap();
    }

    #[tokio::test]
    async fn read_frame_rejects_an_oversized_length_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("frame_test");
        tokio::fs::write(&path, (MAX_FRAME_BYTES + 1).to_le_bytes()).await.unwrap();

        let mut file = File::open(&path).await.unwrap();
        let result = read_frame(&mut file).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn read_frame_rejects_a_zero_length_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("frame_test_zero");
        tokio::fs::write(&path, 0u32.to_le_bytes()).await.unwrap();

        let mut file = File::open(&path).await.unwrap();
        let result = read_frame(&mut file).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn read_frame_returns_none_on_clean_eof() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("frame_test_eof");
        tokio::fs::write(&path, []).await.unwrap();

        let mut file = File::open(&path).await.unwrap();
        let result = read_frame(&mut file).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn write_then_read_frame_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("frame_rw");

        let mut writer = tokio::fs::OpenOptions::new().create(true).write(true).open(&path).await.unwrap();
        write_frame(&mut writer, b"{\"hello\":true}").await.unwrap();
        drop(writer);

        let mut reader = File::open(&path).await.unwrap();
        let body = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(body, b"{\"hello\":true}");
    }
}
