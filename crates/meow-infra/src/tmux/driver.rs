//! tmux session driver.
//!
//! The only component that touches the multiplexer. Owns the
//! `agent_id -> session` registry behind a reader/writer lock; a
//! per-agent mutex serialises prompt injections within one agent while
//! leaving agents independent of each other.
//!
//! Session names follow `meow-<workflow_id>-<agent_id>`, stable across
//! restarts so attach-on-restart works.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use meow_core::session::{SessionDriver, SpawnRequest};
use meow_types::config::OrchestratorConfig;
use meow_types::error::SessionError;
use meow_types::ipc::{MEOW_AGENT, MEOW_ORCH_SOCK, MEOW_WORKFLOW};
use meow_types::workflow::session_name;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::{Mutex, RwLock};

/// Minimum geometry for agent programs that probe the terminal size.
const SESSION_WIDTH: &str = "200";
const SESSION_HEIGHT: &str = "50";

/// Named paste buffer used for multi-line prompt injection.
const PROMPT_BUFFER: &str = "meow-prompt";

#[derive(Debug)]
struct AgentSession {
    session: String,
    #[allow(dead_code)]
    workflow_id: String,
    workdir: PathBuf,
    current_step: Option<String>,
    /// Serialises prompt injections for this agent.
    inject_lock: Arc<Mutex<()>>,
}

/// Drives external agents hosted in tmux sessions.
pub struct TmuxDriver {
    agents: RwLock<HashMap<String, AgentSession>>,
    socket_path: PathBuf,
    config: OrchestratorConfig,
}

impl TmuxDriver {
    /// Create a driver. `socket_path` is exported into every spawned
    /// session as `MEOW_ORCH_SOCK`.
    pub fn new(socket_path: PathBuf, config: OrchestratorConfig) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            socket_path,
            config,
        }
    }

    async fn run_tmux(&self, args: &[&str]) -> Result<(), SessionError> {
        let output = Command::new("tmux")
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(SessionError::Multiplexer(format!(
                "tmux {} failed: {}",
                args.first().unwrap_or(&""),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    async fn session_exists(&self, session: &str) -> bool {
        // '=' pins an exact-name match instead of tmux's prefix match.
        Command::new("tmux")
            .args(["has-session", "-t", &format!("={session}")])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }

    async fn lookup(&self, agent_id: &str) -> Result<(String, Arc<Mutex<()>>), SessionError> {
        let agents = self.agents.read().await;
        agents
            .get(agent_id)
            .map(|a| (a.session.clone(), Arc::clone(&a.inject_lock)))
            .ok_or_else(|| SessionError::AgentNotFound(agent_id.to_string()))
    }

    /// Working directory an agent was registered with.
    pub async fn workdir(&self, agent_id: &str) -> Option<PathBuf> {
        let agents = self.agents.read().await;
        agents.get(agent_id).map(|a| a.workdir.clone())
    }

    /// Send the submit key, retrying on transient multiplexer errors.
    async fn submit(&self, session: &str) -> Result<(), SessionError> {
        let mut last_err = None;
        for attempt in 0..self.config.submit_retries.max(1) {
            match self.run_tmux(&["send-keys", "-t", session, "Enter"]).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::debug!(session, attempt, error = %err, "submit key failed");
                    last_err = Some(err);
                    tokio::time::sleep(Duration::from_millis(self.config.submit_retry_delay_ms))
                        .await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| SessionError::Multiplexer("submit failed".to_string())))
    }

    /// Environment exported into a new session: user values with the
    /// reserved variables forced on top.
    fn merged_env(&self, request: &SpawnRequest) -> BTreeMap<String, String> {
        let mut env = request.env.clone();
        env.insert(MEOW_AGENT.to_string(), request.agent_id.clone());
        env.insert(MEOW_WORKFLOW.to_string(), request.workflow_id.clone());
        env.insert(
            MEOW_ORCH_SOCK.to_string(),
            self.socket_path.display().to_string(),
        );
        env
    }
}

impl SessionDriver for TmuxDriver {
    async fn spawn(&self, request: &SpawnRequest) -> Result<String, SessionError> {
        let session = session_name(&request.workflow_id, &request.agent_id);

        if self.session_exists(&session).await {
            tracing::info!(session = session.as_str(), "attaching to existing session");
        } else {
            let env = self.merged_env(request);
            let workdir = request.workdir.display().to_string();
            let mut args: Vec<String> = vec![
                "new-session".into(),
                "-d".into(),
                "-s".into(),
                session.clone(),
                "-c".into(),
                workdir,
                "-x".into(),
                SESSION_WIDTH.into(),
                "-y".into(),
                SESSION_HEIGHT.into(),
            ];
            for (key, value) in &env {
                args.push("-e".into());
                args.push(format!("{key}={value}"));
            }
            let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
            self.run_tmux(&arg_refs).await?;

            // Start the agent program inside the fresh shell.
            self.run_tmux(&["send-keys", "-t", &session, "-l", "--", &request.command])
                .await?;
            self.submit(&session).await?;

            tracing::info!(
                session = session.as_str(),
                workdir = %request.workdir.display(),
                "spawned agent session"
            );
        }

        tokio::time::sleep(Duration::from_millis(self.config.startup_delay_ms)).await;

        self.register(
            &request.workflow_id,
            &request.agent_id,
            &session,
            &request.workdir,
        )
        .await;
        Ok(session)
    }

    async fn register(&self, workflow_id: &str, agent_id: &str, session: &str, workdir: &Path) {
        let mut agents = self.agents.write().await;
        agents.insert(
            agent_id.to_string(),
            AgentSession {
                session: session.to_string(),
                workflow_id: workflow_id.to_string(),
                workdir: workdir.to_path_buf(),
                current_step: None,
                inject_lock: Arc::new(Mutex::new(())),
            },
        );
    }

    async fn deregister(&self, agent_id: &str) {
        self.agents.write().await.remove(agent_id);
    }

    async fn inject_prompt(&self, agent_id: &str, prompt: &str) -> Result<(), SessionError> {
        let (session, inject_lock) = self.lookup(agent_id).await?;
        let _guard = inject_lock.lock().await;

        // Leave any scroll/copy mode before typing.
        let _ = self.run_tmux(&["send-keys", "-t", &session, "Escape"]).await;
        tokio::time::sleep(Duration::from_millis(self.config.inject_pre_delay_ms)).await;

        if prompt.contains('\n') {
            // Multi-line payloads go through a named paste buffer;
            // send-keys would submit on every newline.
            let mut child = Command::new("tmux")
                .args(["load-buffer", "-b", PROMPT_BUFFER, "-"])
                .stdin(Stdio::piped())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()?;
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(prompt.as_bytes()).await?;
            }
            let status = child.wait().await?;
            if !status.success() {
                return Err(SessionError::Multiplexer(
                    "tmux load-buffer failed".to_string(),
                ));
            }
            self.run_tmux(&["paste-buffer", "-t", &session, "-b", PROMPT_BUFFER, "-d"])
                .await?;
        } else {
            // Literal mode: the payload is pasted text, not key names.
            self.run_tmux(&["send-keys", "-t", &session, "-l", "--", prompt])
                .await?;
        }

        tokio::time::sleep(Duration::from_millis(self.config.inject_post_delay_ms)).await;
        self.submit(&session).await?;

        tracing::debug!(
            agent = agent_id,
            session = session.as_str(),
            bytes = prompt.len(),
            "prompt injected"
        );
        Ok(())
    }

    async fn stop(&self, agent_id: &str, graceful: bool) -> Result<(), SessionError> {
        // Stopping an unknown or already-dead agent reports success.
        let Ok((session, _)) = self.lookup(agent_id).await else {
            return Ok(());
        };
        if !self.session_exists(&session).await {
            return Ok(());
        }

        if graceful {
            if let Err(err) = self.run_tmux(&["send-keys", "-t", &session, "C-c"]).await {
                tracing::debug!(session = session.as_str(), error = %err, "interrupt before kill failed");
            }
            tokio::time::sleep(Duration::from_millis(self.config.stop_grace_ms)).await;
        }

        if let Err(err) = self.run_tmux(&["kill-session", "-t", &session]).await {
            // Non-fatal: the session may have exited on its own.
            tracing::warn!(session = session.as_str(), error = %err, "kill-session failed");
        }
        tracing::info!(agent = agent_id, session = session.as_str(), "agent stopped");
        Ok(())
    }

    async fn interrupt(&self, agent_id: &str) -> Result<(), SessionError> {
        let (session, _) = self.lookup(agent_id).await?;
        self.run_tmux(&["send-keys", "-t", &session, "C-c"]).await
    }

    async fn is_running(&self, agent_id: &str) -> bool {
        let Ok((session, _)) = self.lookup(agent_id).await else {
            return false;
        };
        self.session_exists(&session).await
    }

    async fn set_current_step(&self, agent_id: &str, step_id: Option<String>) {
        let mut agents = self.agents.write().await;
        if let Some(agent) = agents.get_mut(agent_id) {
            agent.current_step = step_id;
        }
    }

    async fn current_step(&self, agent_id: &str) -> Option<String> {
        let agents = self.agents.read().await;
        agents.get(agent_id).and_then(|a| a.current_step.clone())
    }
}

impl std::fmt::Debug for TmuxDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TmuxDriver")
            .field("socket_path", &self.socket_path)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
//
// Registry behavior only; exercising tmux itself needs a live server.
