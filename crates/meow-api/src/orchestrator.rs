//! Orchestrator wiring: builds the store, session driver, expander,
//! scheduler, IPC server, and heartbeat around one project root, and
//! implements the start-or-resume protocol.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use meow_core::engine::events::EventHandler;
use meow_core::engine::recovery::reset_orphaned_steps;
use meow_core::engine::{Expander, Scheduler};
use meow_core::event::EventRouter;
use meow_core::session::SessionDriver;
use meow_core::store::WorkflowStore;
use meow_core::template::TomlTemplateLoader;
use meow_infra::config::{load_config, user_lib_dir};
use meow_infra::ipc::IpcServer;
use meow_infra::state::{ProcessLock, StateDir, spawn_heartbeat_task};
use meow_infra::store::YamlWorkflowStore;
use meow_infra::tmux::TmuxDriver;
use meow_types::config::OrchestratorConfig;
use meow_types::state::OrchestratorState;
use meow_types::workflow::{Workflow, WorkflowStatus};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One orchestrator instance rooted at a project directory.
pub struct Orchestrator {
    config: OrchestratorConfig,
    state: StateDir,
    store: Arc<YamlWorkflowStore>,
    driver: Arc<TmuxDriver>,
    router: Arc<EventRouter>,
    expander: Arc<Expander>,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Build all components for a project root.
    pub async fn init(project_root: &Path) -> anyhow::Result<Self> {
        let config = load_config(project_root).await;
        let state = StateDir::open(project_root)
            .await
            .context("failed to open state directory")?;
        let store = Arc::new(
            YamlWorkflowStore::open(project_root.join(".meow").join("workflows"))
                .await
                .context("failed to open workflow store")?,
        );
        let driver = Arc::new(TmuxDriver::new(state.socket_path(), config.clone()));
        let router = Arc::new(EventRouter::new(
            Duration::from_millis(config.agent_stopped_grace_ms),
            1024,
        ));
        let expander = Arc::new(Expander::new(
            Arc::new(TomlTemplateLoader),
            project_root.to_path_buf(),
            user_lib_dir(),
            config.max_expand_depth,
            config.max_total_steps,
        ));

        Ok(Self {
            config,
            state,
            store,
            driver,
            router,
            expander,
            cancel: CancellationToken::new(),
        })
    }

    /// Read-only access to the store (for list/status commands).
    pub async fn open_store(project_root: &Path) -> anyhow::Result<Arc<YamlWorkflowStore>> {
        Ok(Arc::new(
            YamlWorkflowStore::open(project_root.join(".meow").join("workflows")).await?,
        ))
    }

    pub fn store(&self) -> &Arc<YamlWorkflowStore> {
        &self.store
    }

    /// Take the process-wide lock; exactly one orchestrator drives a
    /// project at a time.
    pub fn lock_process(&self) -> anyhow::Result<ProcessLock> {
        self.state
            .acquire_process_lock()
            .context("another orchestrator is already running for this project")
    }

    // -----------------------------------------------------------------------
    // Start or resume
    // -----------------------------------------------------------------------

    /// Fresh start: expand the top-level template into a new workflow.
    /// Resume: walk the store, re-register live agents, and reset
    /// orphaned running steps — no template is re-expanded.
    ///
    /// Returns the created workflow id on a fresh start with a
    /// template.
    pub async fn start_or_resume(
        &self,
        template: Option<&str>,
        vars: BTreeMap<String, Value>,
    ) -> anyhow::Result<Option<String>> {
        match self.state.load().await? {
            Some(previous) => {
                self.state.probe_sibling(self.config.heartbeat_stale_ms).await;
                tracing::info!(
                    previous_pid = previous.pid,
                    ticks = previous.tick_count,
                    "resuming orchestration"
                );
                self.recover_workflows().await?;
                self.state
                    .save(&OrchestratorState {
                        pid: std::process::id(),
                        template: previous.template,
                        tick_count: previous.tick_count,
                    })
                    .await?;
                Ok(None)
            }
            None => {
                let created = match template {
                    Some(reference) => Some(self.create_workflow(reference, vars).await?),
                    None => None,
                };
                self.state
                    .save(&OrchestratorState {
                        pid: std::process::id(),
                        template: template.map(String::from),
                        tick_count: 0,
                    })
                    .await?;
                Ok(created)
            }
        }
    }

    async fn create_workflow(
        &self,
        reference: &str,
        vars: BTreeMap<String, Value>,
    ) -> anyhow::Result<String> {
        let steps = self
            .expander
            .expand_top_level(reference, &vars)
            .with_context(|| format!("failed to expand template '{reference}'"))?;

        let id = format!("wf-{}", Uuid::now_v7().simple());
        let mut workflow = Workflow::new(&id, Utc::now());
        workflow.template = Some(reference.to_string());
        workflow.vars = vars;
        for step in steps {
            workflow.steps.insert(step.id.clone(), step);
        }
        self.store.create(&workflow).await?;
        tracing::info!(
            workflow = id.as_str(),
            template = reference,
            steps = workflow.steps.len(),
            "workflow created"
        );
        Ok(id)
    }

    async fn recover_workflows(&self) -> anyhow::Result<()> {
        for summary in self.store.list(None).await? {
            if summary.is_terminal() {
                continue;
            }
            let _lock = match self.store.try_lock(&summary.id) {
                Ok(lock) => lock,
                Err(err) if err.is_lock_conflict() => {
                    tracing::warn!(
                        workflow = summary.id.as_str(),
                        "workflow locked elsewhere; skipping recovery"
                    );
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            let mut workflow = self.store.get(&summary.id).await?;

            // Re-register persisted agents so liveness checks resolve
            // their session names.
            for (agent_id, registration) in &workflow.agents {
                if registration.alive {
                    self.driver
                        .register(
                            &workflow.id,
                            agent_id,
                            &registration.session,
                            &registration.workdir,
                        )
                        .await;
                }
            }

            let report = reset_orphaned_steps(&mut workflow, self.driver.as_ref(), Utc::now()).await;
            if report.reset_steps > 0 || report.dead_agents > 0 {
                tracing::info!(
                    workflow = workflow.id.as_str(),
                    reset = report.reset_steps,
                    dead_agents = report.dead_agents,
                    "recovered workflow"
                );
                self.store.save(&workflow).await?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Run
    // -----------------------------------------------------------------------

    /// Drive workflows until done (single-workflow mode) or until
    /// interrupted. Returns true when every known workflow ended done.
    pub async fn run(&self, single_workflow: Option<String>) -> anyhow::Result<bool> {
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&self.store),
            Arc::clone(&self.driver),
            Arc::clone(&self.expander),
            Arc::clone(&self.router),
            self.config.clone(),
            self.cancel.clone(),
            single_workflow,
        ));

        let handler = Arc::new(EventHandler::new(
            Arc::clone(&self.store),
            Arc::clone(&self.driver),
            Arc::clone(&self.router),
            scheduler.wake_handle(),
        ));
        let ipc = IpcServer::bind(self.state.socket_path()).await?;
        let ipc_task = tokio::spawn(ipc.run(handler, self.cancel.child_token()));

        let heartbeat = spawn_heartbeat_task(
            self.state.clone(),
            Duration::from_millis(self.config.heartbeat_interval_ms),
            self.cancel.child_token(),
        );

        let cancel_on_signal = self.cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received; shutting down");
                cancel_on_signal.cancel();
            }
        });

        let run_result = scheduler.run().await;

        // Persist progress before tearing down.
        if let Ok(Some(mut state)) = self.state.load().await {
            state.pid = std::process::id();
            state.tick_count += scheduler.ticks();
            let _ = self.state.save(&state).await;
        }

        self.cancel.cancel();
        let _ = heartbeat.await;
        let _ = ipc_task.await;
        run_result?;

        let workflows = self.store.list(None).await?;
        Ok(!workflows.is_empty()
            && workflows
                .iter()
                .all(|wf| wf.status == WorkflowStatus::Done))
    }
}

/// Expand `~`-free project root into an absolute path for display and
/// session naming stability.
pub fn canonical_project_root(root: &Path) -> PathBuf {
    root.canonicalize().unwrap_or_else(|_| root.to_path_buf())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use meow_types::workflow::{
        AgentRegistration, Step, StepConfig, StepStatus, session_name,
    };

    const MAIN_MODULE: &str = r#"
[workflow.main]
default = true

[[workflow.main.steps]]
id = "first"
executor = "shell"

[workflow.main.steps.config]
type = "shell"
command = "echo first"

[[workflow.main.steps]]
id = "second"
executor = "shell"
depends_on = ["first"]

[workflow.main.steps.config]
type = "shell"
command = "echo second"
"#;

    fn project_with_template() -> tempfile::TempDir {
        let dir = tempfile::TempDir::new().unwrap();
        let lib = dir.path().join(".meow").join("lib");
        std::fs::create_dir_all(&lib).unwrap();
        std::fs::write(lib.join("main.meow.toml"), MAIN_MODULE).unwrap();
        dir
    }

    #[tokio::test]
    async fn fresh_start_expands_top_level_template() {
        let project = project_with_template();
        let orchestrator = Orchestrator::init(project.path()).await.unwrap();

        let created = orchestrator
            .start_or_resume(Some("lib/main"), BTreeMap::new())
            .await
            .unwrap();

        let id = created.expect("fresh start creates a workflow");
        let workflow = orchestrator.store().get(&id).await.unwrap();
        assert_eq!(workflow.steps.len(), 2);
        assert_eq!(workflow.steps["second"].depends_on, vec!["first"]);
        assert_eq!(workflow.template.as_deref(), Some("lib/main"));
    }

    #[tokio::test]
    async fn second_start_resumes_without_reexpanding() {
        let project = project_with_template();

        let orchestrator = Orchestrator::init(project.path()).await.unwrap();
        let first = orchestrator
            .start_or_resume(Some("lib/main"), BTreeMap::new())
            .await
            .unwrap();
        assert!(first.is_some());

        // Simulate a restart: a fresh orchestrator over the same root.
        let restarted = Orchestrator::init(project.path()).await.unwrap();
        let second = restarted
            .start_or_resume(Some("lib/main"), BTreeMap::new())
            .await
            .unwrap();

        assert!(second.is_none(), "resume must not create a new workflow");
        let workflows = restarted.store().list(None).await.unwrap();
        assert_eq!(workflows.len(), 1, "no template re-expansion");
    }

    #[tokio::test]
    async fn resume_resets_steps_of_dead_agents() {
        let project = project_with_template();

        let orchestrator = Orchestrator::init(project.path()).await.unwrap();
        orchestrator
            .start_or_resume(Some("lib/main"), BTreeMap::new())
            .await
            .unwrap();

        // Craft a workflow with a running step owned by an agent whose
        // session no longer exists.
        let mut workflow = Workflow::new("wf-crashed", Utc::now());
        workflow.status = WorkflowStatus::Running;
        let mut step = Step::new(
            "s1",
            StepConfig::Agent {
                agent: "dead-agent".to_string(),
                prompt: "go".to_string(),
                outputs: BTreeMap::new(),
            },
        );
        step.status = StepStatus::Running;
        step.started_at = Some(Utc::now());
        workflow.steps.insert(step.id.clone(), step);
        workflow.agents.insert(
            "dead-agent".to_string(),
            AgentRegistration {
                session: session_name("wf-crashed", "dead-agent"),
                workdir: project.path().to_path_buf(),
                current_step: Some("s1".to_string()),
                alive: true,
            },
        );
        orchestrator.store().create(&workflow).await.unwrap();

        let restarted = Orchestrator::init(project.path()).await.unwrap();
        restarted
            .start_or_resume(None, BTreeMap::new())
            .await
            .unwrap();

        let recovered = restarted.store().get("wf-crashed").await.unwrap();
        assert_eq!(recovered.steps["s1"].status, StepStatus::Pending);
        assert!(!recovered.agents["dead-agent"].alive);
    }
}
