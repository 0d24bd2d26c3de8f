//! Workflow store trait definition.
//!
//! Defines the persistence interface for workflow documents. The
//! infrastructure layer (meow-infra) implements this with one YAML file
//! per workflow, atomic writes, and per-workflow advisory file locks.
//!
//! Uses native async fn in traits (RPITIT, Rust 2024 edition).

use meow_types::error::StoreError;
use meow_types::workflow::{Workflow, WorkflowStatus};

/// Persistence interface for workflow documents.
///
/// Locking is per workflow, not store-wide: two workflows can be driven
/// in parallel as long as no two tasks target the same one. A holder of
/// [`WorkflowStore::try_lock`]'s guard owns the document until the guard
/// drops.
pub trait WorkflowStore: Send + Sync + 'static {
    /// Guard type returned by [`WorkflowStore::try_lock`]. Dropping it
    /// releases the lock.
    type Lock: Send + 'static;

    /// Persist a new workflow. Fails if the identifier already exists.
    fn create(
        &self,
        workflow: &Workflow,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Read a workflow by identifier.
    fn get(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<Workflow, StoreError>> + Send;

    /// Persist an existing workflow (atomic replace).
    fn save(
        &self,
        workflow: &Workflow,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Remove a workflow document.
    fn delete(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// List workflows, optionally filtered by status.
    fn list(
        &self,
        filter: Option<WorkflowStatus>,
    ) -> impl std::future::Future<Output = Result<Vec<Workflow>, StoreError>> + Send;

    /// List workflows that have the given agent registered.
    fn get_by_agent(
        &self,
        agent_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<Workflow>, StoreError>> + Send;

    /// Take the per-workflow lock without blocking.
    ///
    /// Returns [`StoreError::LockConflict`] when another holder has it;
    /// the caller skips the workflow for this tick and retries later.
    fn try_lock(&self, id: &str) -> Result<Self::Lock, StoreError>;
}
