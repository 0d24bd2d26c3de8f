//! YAML workflow store.
//!
//! One workflow per `<id>.yaml` under the workflows directory. Writes
//! are atomic: serialize to `<id>.yaml.tmp`, then rename over the final
//! name. Startup recovers orphan temp files left by a crash mid-write.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use meow_core::store::WorkflowStore;
use meow_types::error::StoreError;
use meow_types::workflow::{Workflow, WorkflowStatus};

use super::lock::WorkflowLock;

/// File-backed workflow store rooted at `.meow/workflows/`.
#[derive(Debug, Clone)]
pub struct YamlWorkflowStore {
    dir: PathBuf,
}

impl YamlWorkflowStore {
    /// Open the store, creating the directory and recovering any orphan
    /// temp files from a previous crash.
    pub async fn open(dir: PathBuf) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(&dir).await?;
        let store = Self { dir };
        store.recover_orphans().await?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        validate_id(id)?;
        Ok(self.dir.join(format!("{id}.yaml")))
    }

    fn tmp_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        validate_id(id)?;
        Ok(self.dir.join(format!("{id}.yaml.tmp")))
    }

    fn lock_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        validate_id(id)?;
        Ok(self.dir.join(format!("{id}.yaml.lock")))
    }

    /// Recover `.yaml.tmp` orphans: discard when the final file exists
    /// (the rename never happened, the old content is intact), promote
    /// otherwise (the final file was the one being replaced and is
    /// gone).
    async fn recover_orphans(&self) -> Result<(), StoreError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(stem) = name.strip_suffix(".yaml.tmp") else {
                continue;
            };
            let final_path = self.dir.join(format!("{stem}.yaml"));
            if final_path.exists() {
                tracing::warn!(workflow = stem, "discarding orphan temp file");
                tokio::fs::remove_file(&path).await?;
            } else {
                tracing::warn!(workflow = stem, "promoting orphan temp file");
                tokio::fs::rename(&path, &final_path).await?;
            }
        }
        Ok(())
    }

    async fn write_atomic(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let yaml = serde_yaml_ng::to_string(workflow)
            .map_err(|e| StoreError::Serialize(e.to_string()))?;
        let tmp = self.tmp_path(&workflow.id)?;
        let path = self.file_path(&workflow.id)?;
        tokio::fs::write(&tmp, yaml).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn read(&self, path: &Path) -> Result<Workflow, StoreError> {
        let content = tokio::fs::read_to_string(path).await?;
        serde_yaml_ng::from_str(&content).map_err(|e| StoreError::Serialize(e.to_string()))
    }
}

/// Identifiers become file names; keep them to a safe alphabet.
fn validate_id(id: &str) -> Result<(), StoreError> {
    let ok = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(StoreError::Serialize(format!(
            "invalid workflow id '{id}': only alphanumerics, '-' and '_' are allowed"
        )))
    }
}

impl WorkflowStore for YamlWorkflowStore {
    type Lock = WorkflowLock;

    async fn create(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let path = self.file_path(&workflow.id)?;
        if path.exists() {
            return Err(StoreError::Conflict(workflow.id.clone()));
        }
        self.write_atomic(workflow).await
    }

    async fn get(&self, id: &str) -> Result<Workflow, StoreError> {
        let path = self.file_path(id)?;
        match self.read(&path).await {
            Err(StoreError::Io(err)) if err.kind() == ErrorKind::NotFound => {
                Err(StoreError::NotFound(id.to_string()))
            }
            other => other,
        }
    }

    async fn save(&self, workflow: &Workflow) -> Result<(), StoreError> {
        self.write_atomic(workflow).await
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let path = self.file_path(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.to_string()));
            }
            Err(err) => return Err(err.into()),
        }
        let _ = tokio::fs::remove_file(self.lock_path(id)?).await;
        Ok(())
    }

    async fn list(&self, filter: Option<WorkflowStatus>) -> Result<Vec<Workflow>, StoreError> {
        let mut workflows = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(".yaml") {
                continue;
            }
            match self.read(&path).await {
                Ok(workflow) => {
                    if filter.is_none_or(|status| workflow.status == status) {
                        workflows.push(workflow);
                    }
                }
                Err(err) => {
                    tracing::warn!(file = name, error = %err, "skipping unreadable workflow file");
                }
            }
        }
        workflows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(workflows)
    }

    async fn get_by_agent(&self, agent_id: &str) -> Result<Vec<Workflow>, StoreError> {
        let all = self.list(None).await?;
        Ok(all
            .into_iter()
            .filter(|wf| wf.agents.contains_key(agent_id))
            .collect())
    }

    fn try_lock(&self, id: &str) -> Result<Self::Lock, StoreError> {
        WorkflowLock::acquire(self.lock_path(id)?, id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
