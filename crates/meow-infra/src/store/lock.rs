//! Per-workflow advisory file lock.
//!
//! A caller takes the lock by opening `<id>.yaml.lock` and acquiring an
//! exclusive non-blocking flock on it. Dropping the guard unlocks and
//! removes the lock file best-effort. Per-workflow locking lets two
//! workflows be driven in parallel while serialising all access to any
//! single one, including across processes.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;

use fs2::FileExt;
use meow_types::error::StoreError;

/// Guard for one workflow's advisory lock. Held for the duration of a
/// scheduler tick or an IPC mutation.
#[derive(Debug)]
pub struct WorkflowLock {
    file: Option<File>,
    path: PathBuf,
    workflow_id: String,
}

impl WorkflowLock {
    /// Take the lock without blocking.
    pub fn acquire(path: PathBuf, workflow_id: &str) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        file.try_lock_exclusive().map_err(|err| {
            if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
                StoreError::LockConflict(workflow_id.to_string())
            } else {
                StoreError::Io(err)
            }
        })?;

        Ok(Self {
            file: Some(file),
            path,
            workflow_id: workflow_id.to_string(),
        })
    }
}

impl Drop for WorkflowLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(err) = fs2::FileExt::unlock(&file) {
                tracing::warn!(
                    workflow = self.workflow_id.as_str(),
                    error = %err,
                    "failed to release workflow lock"
                );
            }
        }
        // Removal is best-effort: a concurrent acquirer may have the
        // file open, which is fine for advisory locks.
        let _ = std::fs::remove_file(&self.path);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
