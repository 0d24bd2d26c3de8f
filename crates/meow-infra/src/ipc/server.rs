//! IPC server over a local stream socket.
//!
//! Agents find the socket through the `MEOW_ORCH_SOCK` environment
//! variable injected into their sessions. Frames are newline-delimited
//! JSON: one [`AgentMessage`](meow_types::ipc::AgentMessage) per inbound
//! line, one [`IpcReply`](meow_types::ipc::IpcReply) per outbound line.
//! Each connection runs on its own task.

use std::path::PathBuf;
use std::sync::Arc;

use meow_core::engine::events::EventHandler;
use meow_core::session::SessionDriver;
use meow_core::store::WorkflowStore;
use meow_types::error::IpcError;
use meow_types::ipc::{AgentMessage, IpcReply};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

/// Accepts agent connections and feeds messages to the event handler.
pub struct IpcServer {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl IpcServer {
    /// Bind the socket, replacing any stale file left by a previous
    /// process.
    pub async fn bind(socket_path: PathBuf) -> Result<Self, IpcError> {
        if socket_path.exists() {
            tokio::fs::remove_file(&socket_path).await?;
        }
        if let Some(parent) = socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let listener = UnixListener::bind(&socket_path)?;
        tracing::info!(socket = %socket_path.display(), "IPC server listening");
        Ok(Self {
            listener,
            socket_path,
        })
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    /// Accept loop; runs until cancellation and removes the socket file
    /// on the way out.
    pub async fn run<S: WorkflowStore, D: SessionDriver>(
        self,
        handler: Arc<EventHandler<S, D>>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let handler = Arc::clone(&handler);
                        let cancel = cancel.child_token();
                        tokio::spawn(async move {
                            if let Err(err) = handle_connection(stream, handler, cancel).await {
                                tracing::debug!(error = %err, "IPC connection closed with error");
                            }
                        });
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to accept IPC connection");
                    }
                },
            }
        }
        let _ = tokio::fs::remove_file(&self.socket_path).await;
        tracing::info!("IPC server stopped");
    }
}

async fn handle_connection<S: WorkflowStore, D: SessionDriver>(
    stream: UnixStream,
    handler: Arc<EventHandler<S, D>>,
    cancel: CancellationToken,
) -> Result<(), IpcError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break; // peer hung up
        };
        if line.trim().is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<AgentMessage>(&line) {
            Ok(message) => handler.handle(message).await,
            Err(err) => {
                tracing::debug!(error = %err, "malformed IPC frame");
                IpcReply::err(format!("malformed message: {err}"))
            }
        };

        let mut payload = serde_json::to_vec(&reply)
            .map_err(|e| IpcError::Malformed(e.to_string()))?;
        payload.push(b'\n');
        writer.write_all(&payload).await?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
