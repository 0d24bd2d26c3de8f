//! Orchestrator state directory: resume state, heartbeat, and the
//! process-wide lock.
//!
//! Layout under `<project_root>/.meow/state/`:
//!
//! ```text
//! orchestrator.json   # resume state (pid, template, tick count)
//! orchestrator.lock   # process-wide exclusive lock (startup)
//! heartbeat.json      # liveness, touched at a bounded frequency
//! orchestrator.sock   # IPC socket
//! ```

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use fs2::FileExt;
use meow_types::error::StoreError;
use meow_types::state::{Heartbeat, OrchestratorState};
use tokio_util::sync::CancellationToken;

/// Handle to the `.meow/state/` directory.
#[derive(Debug, Clone)]
pub struct StateDir {
    dir: PathBuf,
}

/// Held for the process lifetime; guarantees a single orchestrator per
/// project.
#[derive(Debug)]
pub struct ProcessLock {
    // Keeps the exclusive flock alive; released on drop.
    #[allow(dead_code)]
    file: File,
    path: PathBuf,
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl StateDir {
    /// Create the handle and the directory itself.
    pub async fn open(project_root: &Path) -> Result<Self, StoreError> {
        let dir = project_root.join(".meow").join("state");
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn socket_path(&self) -> PathBuf {
        self.dir.join("orchestrator.sock")
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join("orchestrator.json")
    }

    fn heartbeat_path(&self) -> PathBuf {
        self.dir.join("heartbeat.json")
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join("orchestrator.lock")
    }

    /// Take the process-wide lock. Fails when another orchestrator
    /// already drives this project.
    pub fn acquire_process_lock(&self) -> Result<ProcessLock, StoreError> {
        let path = self.lock_path();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;
        file.try_lock_exclusive().map_err(|err| {
            if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
                StoreError::LockConflict("orchestrator".to_string())
            } else {
                StoreError::Io(err)
            }
        })?;
        Ok(ProcessLock { file, path })
    }

    // -----------------------------------------------------------------------
    // Resume state
    // -----------------------------------------------------------------------

    /// Load the resume state; `None` means a fresh start.
    pub async fn load(&self) -> Result<Option<OrchestratorState>, StoreError> {
        match tokio::fs::read_to_string(self.state_path()).await {
            Ok(content) => serde_json::from_str(&content)
                .map(Some)
                .map_err(|e| StoreError::Serialize(e.to_string())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn save(&self, state: &OrchestratorState) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| StoreError::Serialize(e.to_string()))?;
        tokio::fs::write(self.state_path(), json).await?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.state_path()).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    // -----------------------------------------------------------------------
    // Heartbeat
    // -----------------------------------------------------------------------

    pub async fn touch_heartbeat(&self, pid: u32) -> Result<(), StoreError> {
        let heartbeat = Heartbeat {
            pid,
            updated_at: Utc::now(),
        };
        let json = serde_json::to_string(&heartbeat)
            .map_err(|e| StoreError::Serialize(e.to_string()))?;
        tokio::fs::write(self.heartbeat_path(), json).await?;
        Ok(())
    }

    pub async fn read_heartbeat(&self) -> Result<Option<Heartbeat>, StoreError> {
        match tokio::fs::read_to_string(self.heartbeat_path()).await {
            Ok(content) => serde_json::from_str(&content)
                .map(Some)
                .map_err(|e| StoreError::Serialize(e.to_string())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Startup diagnostic: a stale sibling heartbeat means a previous
    /// orchestrator crashed without cleaning up.
    pub async fn probe_sibling(&self, stale_after_ms: u64) {
        match self.read_heartbeat().await {
            Ok(Some(heartbeat)) if heartbeat.pid != std::process::id() => {
                if heartbeat.is_stale(Utc::now(), stale_after_ms) {
                    tracing::warn!(
                        sibling_pid = heartbeat.pid,
                        last_seen = %heartbeat.updated_at,
                        "stale heartbeat found: a previous orchestrator likely crashed"
                    );
                } else {
                    tracing::warn!(
                        sibling_pid = heartbeat.pid,
                        "fresh heartbeat from another process"
                    );
                }
            }
            Ok(_) => {}
            Err(err) => tracing::debug!(error = %err, "failed to read heartbeat"),
        }
    }
}

/// Spawn the background task that touches the heartbeat until
/// cancellation.
pub fn spawn_heartbeat_task(
    state: StateDir,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let pid = std::process::id();
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = state.touch_heartbeat(pid).await {
                        tracing::debug!(error = %err, "failed to touch heartbeat");
                    }
                }
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn state_roundtrip_and_clear() {
        let dir = tempfile::TempDir::new().unwrap();
        let state = StateDir::open(dir.path()).await.unwrap();

        assert!(state.load().await.unwrap().is_none(), "fresh start");

        state
            .save(&OrchestratorState {
                pid: 1234,
                template: Some("lib/build".to_string()),
                tick_count: 9,
            })
            .await
            .unwrap();

        let loaded = state.load().await.unwrap().unwrap();
        assert_eq!(loaded.pid, 1234);
        assert_eq!(loaded.tick_count, 9);

        state.clear().await.unwrap();
        assert!(state.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn heartbeat_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let state = StateDir::open(dir.path()).await.unwrap();

        assert!(state.read_heartbeat().await.unwrap().is_none());
        state.touch_heartbeat(42).await.unwrap();
        let heartbeat = state.read_heartbeat().await.unwrap().unwrap();
        assert_eq!(heartbeat.pid, 42);
        assert!(!heartbeat.is_stale(Utc::now(), 30_000));
    }

    #[tokio::test]
    async fn process_lock_is_exclusive() {
        let dir = tempfile::TempDir::new().unwrap();
        let state = StateDir::open(dir.path()).await.unwrap();

        let held = state.acquire_process_lock().unwrap();
        let err = state.acquire_process_lock().unwrap_err();
        assert!(err.is_lock_conflict());
        drop(held);
        assert!(state.acquire_process_lock().is_ok());
    }

    #[tokio::test]
    async fn heartbeat_task_touches_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let state = StateDir::open(dir.path()).await.unwrap();

        let cancel = CancellationToken::new();
        let handle = spawn_heartbeat_task(state.clone(), Duration::from_millis(10), cancel.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(state.read_heartbeat().await.unwrap().is_some());
    }
}
