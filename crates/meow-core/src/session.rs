//! Agent-session driver trait definition.
//!
//! The driver owns external terminal-multiplexer sessions hosting agents
//! and is the only component that touches the multiplexer. The tmux
//! implementation lives in meow-infra.

use std::collections::BTreeMap;
use std::path::PathBuf;

use meow_types::error::SessionError;

/// Request to start an agent session.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub workflow_id: String,
    pub agent_id: String,
    /// Working directory for the session.
    pub workdir: PathBuf,
    /// The agent program's command line, injected after the shell starts.
    pub command: String,
    /// User-supplied environment. Reserved variables (`MEOW_AGENT`,
    /// `MEOW_WORKFLOW`, `MEOW_ORCH_SOCK`) always override these.
    pub env: BTreeMap<String, String>,
}

/// Driver for external agent sessions.
///
/// Implementations keep an `agent_id -> session` registry behind their
/// own lock; within a single agent, prompt injections are serialized,
/// across agents they are independent.
pub trait SessionDriver: Send + Sync + 'static {
    /// Start (or attach to) the session for an agent and register it.
    /// Returns the session name.
    fn spawn(
        &self,
        request: &SpawnRequest,
    ) -> impl std::future::Future<Output = Result<String, SessionError>> + Send;

    /// Re-register a previously-spawned agent without touching the
    /// multiplexer (used on resume, when the session may still be live).
    fn register(
        &self,
        workflow_id: &str,
        agent_id: &str,
        session: &str,
        workdir: &std::path::Path,
    ) -> impl std::future::Future<Output = ()> + Send;

    /// Remove an agent from the registry.
    fn deregister(&self, agent_id: &str) -> impl std::future::Future<Output = ()> + Send;

    /// Inject a prompt into the agent's session and submit it.
    fn inject_prompt(
        &self,
        agent_id: &str,
        prompt: &str,
    ) -> impl std::future::Future<Output = Result<(), SessionError>> + Send;

    /// Stop an agent. Graceful sends an interrupt, waits the configured
    /// grace period, then kills; non-graceful kills immediately. Stopping
    /// an already-dead agent succeeds.
    fn stop(
        &self,
        agent_id: &str,
        graceful: bool,
    ) -> impl std::future::Future<Output = Result<(), SessionError>> + Send;

    /// Send an interrupt key to the agent's session (used on step
    /// timeout).
    fn interrupt(
        &self,
        agent_id: &str,
    ) -> impl std::future::Future<Output = Result<(), SessionError>> + Send;

    /// Whether the agent's session is currently alive.
    fn is_running(&self, agent_id: &str) -> impl std::future::Future<Output = bool> + Send;

    /// Record the step currently dispatched to an agent (or clear it).
    fn set_current_step(
        &self,
        agent_id: &str,
        step_id: Option<String>,
    ) -> impl std::future::Future<Output = ()> + Send;

    /// The step currently dispatched to an agent, if any.
    fn current_step(
        &self,
        agent_id: &str,
    ) -> impl std::future::Future<Output = Option<String>> + Send;
}
