//! The scheduler: the orchestrator's top-level loop.
//!
//! One tick per poll interval (plus immediate wake-ups on inbound IPC):
//! enumerate non-terminal workflows, and for each one take its lock,
//! re-read the document, enforce agent-step timeouts, cascade skips,
//! compute the ready set, dispatch every ready step in deterministic
//! order (orchestrator-local executors first, lexicographic within each
//! group), finalize terminal status, and persist.
//!
//! Agent steps are not awaited in the dispatch path; dispatch only
//! injects the prompt, and completion arrives over IPC in a later tick.
//! Branch conditions run on bounded background tasks that re-acquire the
//! workflow lock to install their results.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use meow_types::config::OrchestratorConfig;
use meow_types::error::{ErrorKind, SessionError, StoreError};
use meow_types::event::OrchestratorEvent;
use meow_types::workflow::{
    AgentRegistration, OutputValue, Step, StepConfig, StepStatus, Workflow, WorkflowStatus,
};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use crate::event::EventRouter;
use crate::session::{SessionDriver, SpawnRequest};
use crate::store::WorkflowStore;
use crate::template::vars;

use super::branch::{evaluate_condition, select_target};
use super::expander::{Expander, install_expansion};
use super::lifecycle;
use super::shell::{ShellError, ShellRunner, ShellSpec};

/// Retry interval while a branch task waits for the workflow lock.
const BRANCH_LOCK_RETRY: Duration = Duration::from_millis(50);

/// Errors that end a scheduler run (per-step failures are recorded on
/// the step and do not surface here).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("scheduler is already running")]
    AlreadyRunning,
}

/// The orchestrator scheduler, generic over store and session driver.
pub struct Scheduler<S: WorkflowStore, D: SessionDriver> {
    store: Arc<S>,
    driver: Arc<D>,
    expander: Arc<Expander>,
    router: Arc<EventRouter>,
    shell: ShellRunner,
    config: OrchestratorConfig,
    cancel: CancellationToken,
    branch_permits: Arc<Semaphore>,
    /// Restrict the loop to one workflow; the scheduler exits once all
    /// known workflows are terminal.
    single_workflow: Option<String>,
    ticks: AtomicU64,
    wake_tx: mpsc::UnboundedSender<()>,
    wake_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<()>>>,
}

impl<S: WorkflowStore, D: SessionDriver> Scheduler<S, D> {
    pub fn new(
        store: Arc<S>,
        driver: Arc<D>,
        expander: Arc<Expander>,
        router: Arc<EventRouter>,
        config: OrchestratorConfig,
        cancel: CancellationToken,
        single_workflow: Option<String>,
    ) -> Self {
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let shell = ShellRunner::new(Duration::from_millis(config.shell_retry_backoff_ms));
        let branch_permits = Arc::new(Semaphore::new(config.branch_parallelism));
        Self {
            store,
            driver,
            expander,
            router,
            shell,
            config,
            cancel,
            branch_permits,
            single_workflow,
            ticks: AtomicU64::new(0),
            wake_tx,
            wake_rx: std::sync::Mutex::new(Some(wake_rx)),
        }
    }

    /// Handle the IPC server uses to trigger an immediate tick.
    pub fn wake_handle(&self) -> mpsc::UnboundedSender<()> {
        self.wake_tx.clone()
    }

    /// Completed tick count.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Run the timer loop until cancellation, or until every known
    /// workflow is terminal in single-workflow mode.
    pub async fn run(&self) -> Result<(), EngineError> {
        let mut wake_rx = self
            .wake_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or(EngineError::AlreadyRunning)?;

        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {}
                _ = wake_rx.recv() => {}
            }

            if let Err(err) = self.tick().await {
                tracing::warn!(error = %err, "tick failed; continuing");
            }

            if self.single_workflow.is_some() && self.all_known_terminal().await {
                tracing::info!("all workflows terminal; scheduler exiting");
                break;
            }
        }
        Ok(())
    }

    async fn all_known_terminal(&self) -> bool {
        match self.store.list(None).await {
            Ok(workflows) => !workflows.is_empty() && workflows.iter().all(Workflow::is_terminal),
            Err(_) => false,
        }
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    /// Advance every non-terminal workflow by one tick.
    pub async fn tick(&self) -> Result<(), EngineError> {
        self.ticks.fetch_add(1, Ordering::Relaxed);

        let workflows = self.store.list(None).await?;
        for workflow in workflows {
            if workflow.is_terminal() {
                continue;
            }
            if let Some(only) = &self.single_workflow {
                if workflow.id != *only {
                    continue;
                }
            }
            if self.cancel.is_cancelled() {
                break;
            }
            if let Err(err) = self.drive_workflow(&workflow.id).await {
                if err.is_lock_conflict() {
                    tracing::debug!(
                        workflow = workflow.id.as_str(),
                        "lock held elsewhere; skipping this tick"
                    );
                } else {
                    tracing::warn!(
                        workflow = workflow.id.as_str(),
                        error = %err,
                        "failed to drive workflow"
                    );
                }
            }
        }
        Ok(())
    }

    /// One locked pass over a single workflow.
    async fn drive_workflow(&self, id: &str) -> Result<(), StoreError> {
        let _lock = self.store.try_lock(id)?;
        let mut workflow = self.store.get(id).await?;
        if workflow.is_terminal() {
            return Ok(());
        }

        let now = Utc::now();
        let mut dirty = false;

        if workflow.status == WorkflowStatus::Pending {
            workflow.status = WorkflowStatus::Running;
            dirty = true;
            self.router.publish(OrchestratorEvent::WorkflowStarted {
                workflow: workflow.id.clone(),
            });
        }

        dirty |= self.enforce_timeouts(&mut workflow).await;
        dirty |= lifecycle::apply_skip_cascade(&mut workflow, now) > 0;

        for step_id in lifecycle::ready_steps(&workflow) {
            if self.cancel.is_cancelled() {
                break;
            }
            dirty |= self.dispatch(&mut workflow, &step_id).await;
        }

        dirty |= lifecycle::apply_skip_cascade(&mut workflow, Utc::now()) > 0;

        if lifecycle::finalize_status(&mut workflow, Utc::now()) {
            dirty = true;
            self.stop_remaining_agents(&mut workflow).await;
            tracing::info!(
                workflow = workflow.id.as_str(),
                status = %workflow.status,
                "workflow finished"
            );
            self.router.publish(OrchestratorEvent::WorkflowFinished {
                workflow: workflow.id.clone(),
                status: workflow.status,
            });
        }

        if dirty {
            workflow.updated_at = Utc::now();
            self.store.save(&workflow).await?;
        }
        Ok(())
    }

    /// Agents survive until a kill step or workflow termination; this is
    /// the termination half.
    async fn stop_remaining_agents(&self, workflow: &mut Workflow) {
        for (agent_id, registration) in workflow.agents.iter_mut() {
            if !registration.alive {
                continue;
            }
            if let Err(err) = self.driver.stop(agent_id, true).await {
                tracing::warn!(agent = agent_id.as_str(), error = %err, "failed to stop agent");
            }
            self.driver.deregister(agent_id).await;
            registration.alive = false;
            registration.current_step = None;
            self.router.publish(OrchestratorEvent::AgentStopped {
                agent: agent_id.clone(),
            });
        }
    }

    // -----------------------------------------------------------------------
    // Timeout enforcement
    // -----------------------------------------------------------------------

    /// Fail running agent steps whose timeout elapsed and interrupt the
    /// session.
    async fn enforce_timeouts(&self, workflow: &mut Workflow) -> bool {
        let now = Utc::now();
        let expired: Vec<String> = workflow
            .steps
            .values()
            .filter(|step| step.status == StepStatus::Running)
            .filter(|step| step.config.agent_id().is_some())
            .filter(|step| {
                match (step.timeout_ms, step.started_at) {
                    (Some(timeout_ms), Some(started_at)) => {
                        let elapsed = now.signed_duration_since(started_at);
                        elapsed.num_milliseconds() > timeout_ms as i64
                    }
                    _ => false,
                }
            })
            .map(|step| step.id.clone())
            .collect();

        let mut dirty = false;
        for step_id in expired {
            let agent = workflow.steps[&step_id]
                .config
                .agent_id()
                .map(String::from);
            if let Some(agent) = &agent {
                if let Err(err) = self.driver.interrupt(agent).await {
                    tracing::warn!(agent = agent.as_str(), error = %err, "failed to interrupt agent");
                }
                self.driver.set_current_step(agent, None).await;
                if let Some(registration) = workflow.agents.get_mut(agent) {
                    registration.current_step = None;
                }
            }
            let step = workflow.steps.get_mut(&step_id).unwrap();
            let timeout_ms = step.timeout_ms.unwrap_or_default();
            tracing::warn!(
                workflow = workflow.id.as_str(),
                step = step_id.as_str(),
                timeout_ms,
                "agent step timed out"
            );
            step.fail(
                ErrorKind::Timeout,
                format!("agent step exceeded {timeout_ms}ms timeout"),
                now,
            );
            self.router.publish(OrchestratorEvent::StepFailed {
                workflow: workflow.id.clone(),
                step: step_id,
                error: "timeout".to_string(),
            });
            dirty = true;
        }
        dirty
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Dispatch one ready step. Returns true if the workflow changed.
    async fn dispatch(&self, workflow: &mut Workflow, step_id: &str) -> bool {
        let config = workflow.steps[step_id].config.clone();
        match config {
            StepConfig::Shell { .. } => self.dispatch_shell(workflow, step_id).await,
            StepConfig::Spawn { .. } => self.dispatch_spawn(workflow, step_id).await,
            StepConfig::Kill { .. } => self.dispatch_kill(workflow, step_id).await,
            StepConfig::Expand { .. } => self.dispatch_expand(workflow, step_id),
            StepConfig::Branch { .. } => self.dispatch_branch(workflow, step_id),
            StepConfig::Agent { .. } => self.dispatch_agent(workflow, step_id).await,
        }
    }

    fn mark_running(&self, workflow: &mut Workflow, step_id: &str) {
        let workflow_id = workflow.id.clone();
        let step = workflow.steps.get_mut(step_id).unwrap();
        step.status = StepStatus::Running;
        step.started_at = Some(Utc::now());
        self.router.publish(OrchestratorEvent::StepStarted {
            workflow: workflow_id,
            step: step_id.to_string(),
        });
    }

    fn complete_step(
        &self,
        workflow: &mut Workflow,
        step_id: &str,
        outputs: std::collections::BTreeMap<String, OutputValue>,
    ) {
        let workflow_id = workflow.id.clone();
        let step = workflow.steps.get_mut(step_id).unwrap();
        step.status = StepStatus::Done;
        step.outputs.extend(outputs);
        step.ended_at = Some(Utc::now());
        self.router.publish(OrchestratorEvent::StepCompleted {
            workflow: workflow_id,
            step: step_id.to_string(),
        });
    }

    fn fail_step(&self, workflow: &mut Workflow, step_id: &str, kind: ErrorKind, message: String) {
        tracing::warn!(
            workflow = workflow.id.as_str(),
            step = step_id,
            kind = %kind,
            error = message.as_str(),
            "step failed"
        );
        let workflow_id = workflow.id.clone();
        let step = workflow.steps.get_mut(step_id).unwrap();
        step.fail(kind, message.clone(), Utc::now());
        self.router.publish(OrchestratorEvent::StepFailed {
            workflow: workflow_id,
            step: step_id.to_string(),
            error: message,
        });
    }

    // -- Shell --

    async fn dispatch_shell(&self, workflow: &mut Workflow, step_id: &str) -> bool {
        let StepConfig::Shell {
            command,
            workdir,
            env,
            on_error,
            max_retries,
            outputs,
        } = workflow.steps[step_id].config.clone()
        else {
            return false;
        };

        self.mark_running(workflow, step_id);

        // Dispatch-time resolution of {{step.outputs.key}} references.
        let resolved = (|| -> Result<ShellSpec, crate::template::ExpandError> {
            let command = vars::resolve_output_refs(&command, workflow)?;
            let env = env
                .into_iter()
                .map(|(k, v)| Ok::<_, crate::template::ExpandError>((k, vars::resolve_output_refs(&v, workflow)?)))
                .collect::<Result<_, _>>()?;
            let outputs = outputs
                .into_iter()
                .map(|(k, v)| Ok::<_, crate::template::ExpandError>((k, vars::resolve_output_refs(&v, workflow)?)))
                .collect::<Result<_, _>>()?;
            Ok(ShellSpec {
                command,
                workdir,
                env,
                on_error,
                max_retries,
                outputs,
            })
        })();

        let spec = match resolved {
            Ok(spec) => spec,
            Err(err) => {
                self.fail_step(workflow, step_id, err.error_kind(), err.to_string());
                return true;
            }
        };

        match self
            .shell
            .run(&spec, &workflow.id, step_id, &self.cancel)
            .await
        {
            Ok(outputs) => self.complete_step(workflow, step_id, outputs),
            Err(ShellError::Cancelled) => {
                // Leave the step running; recovery resets it on restart.
            }
            Err(err) => {
                self.fail_step(workflow, step_id, ErrorKind::Executor, err.to_string());
            }
        }
        true
    }

    // -- Spawn --

    async fn dispatch_spawn(&self, workflow: &mut Workflow, step_id: &str) -> bool {
        let StepConfig::Spawn {
            agent,
            workdir,
            command,
            env,
        } = workflow.steps[step_id].config.clone()
        else {
            return false;
        };

        self.mark_running(workflow, step_id);

        let request = SpawnRequest {
            workflow_id: workflow.id.clone(),
            agent_id: agent.clone(),
            workdir: workdir.clone(),
            command,
            env,
        };
        match self.driver.spawn(&request).await {
            Ok(session) => {
                workflow.agents.insert(
                    agent.clone(),
                    AgentRegistration {
                        session: session.clone(),
                        workdir,
                        current_step: None,
                        alive: true,
                    },
                );
                self.router.publish(OrchestratorEvent::AgentSpawned {
                    workflow: workflow.id.clone(),
                    agent,
                    session: session.clone(),
                });
                let outputs =
                    std::collections::BTreeMap::from([("session".to_string(), OutputValue::String(session))]);
                self.complete_step(workflow, step_id, outputs);
            }
            Err(err) => {
                self.fail_step(workflow, step_id, ErrorKind::Executor, err.to_string());
            }
        }
        true
    }

    // -- Kill --

    async fn dispatch_kill(&self, workflow: &mut Workflow, step_id: &str) -> bool {
        let StepConfig::Kill { agent, graceful } = workflow.steps[step_id].config.clone() else {
            return false;
        };

        self.mark_running(workflow, step_id);

        // Kill failure is non-fatal: the step completes either way.
        if let Err(err) = self.driver.stop(&agent, graceful).await {
            tracing::warn!(agent = agent.as_str(), error = %err, "failed to stop agent");
        }
        self.driver.deregister(&agent).await;
        if let Some(registration) = workflow.agents.get_mut(&agent) {
            registration.alive = false;
            registration.current_step = None;
        }
        self.router
            .publish(OrchestratorEvent::AgentStopped { agent });
        self.complete_step(workflow, step_id, Default::default());
        true
    }

    // -- Expand --

    fn dispatch_expand(&self, workflow: &mut Workflow, step_id: &str) -> bool {
        self.mark_running(workflow, step_id);

        let step = workflow.steps[step_id].clone();
        match self.expander.expand(workflow, &step) {
            Ok(result) => {
                let children = result.step_ids.clone();
                install_expansion(workflow, step_id, result);
                let outputs = std::collections::BTreeMap::from([(
                    "children".to_string(),
                    OutputValue::Json(serde_json::json!(children)),
                )]);
                self.complete_step(workflow, step_id, outputs);
            }
            Err(err) => {
                self.fail_step(workflow, step_id, err.error_kind(), err.to_string());
            }
        }
        true
    }

    // -- Branch --

    /// Fork the condition evaluation onto a bounded background task; the
    /// step stays running until the task installs the result under a
    /// fresh lock.
    fn dispatch_branch(&self, workflow: &mut Workflow, step_id: &str) -> bool {
        let StepConfig::Branch { timeout_ms, .. } = &workflow.steps[step_id].config else {
            return false;
        };
        let timeout = Duration::from_millis(timeout_ms.unwrap_or(self.config.branch_timeout_ms));

        self.mark_running(workflow, step_id);

        let snapshot = workflow.clone();
        let step_id = step_id.to_string();
        let store = Arc::clone(&self.store);
        let expander = Arc::clone(&self.expander);
        let permits = Arc::clone(&self.branch_permits);
        let cancel = self.cancel.child_token();
        let wake = self.wake_tx.clone();

        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            run_branch_task(snapshot, step_id, store, expander, timeout, cancel, wake).await;
        });
        true
    }

    // -- Agent --

    async fn dispatch_agent(&self, workflow: &mut Workflow, step_id: &str) -> bool {
        let StepConfig::Agent { agent, prompt, .. } = workflow.steps[step_id].config.clone()
        else {
            return false;
        };

        // The agent already has a running step: leave this one pending
        // for a later tick.
        if !lifecycle::is_agent_idle(workflow, &agent) {
            tracing::debug!(
                workflow = workflow.id.as_str(),
                step = step_id,
                agent = agent.as_str(),
                "agent busy; deferring step"
            );
            return false;
        }

        if !workflow.agents.get(&agent).is_some_and(|r| r.alive) {
            self.fail_step(
                workflow,
                step_id,
                ErrorKind::AgentNotFound,
                format!("agent '{agent}' is not registered or not alive"),
            );
            return true;
        }

        let prompt = match vars::resolve_output_refs(&prompt, workflow) {
            Ok(prompt) => prompt,
            Err(err) => {
                self.fail_step(workflow, step_id, err.error_kind(), err.to_string());
                return true;
            }
        };

        match self.driver.inject_prompt(&agent, &prompt).await {
            Ok(()) => {
                self.mark_running(workflow, step_id);
                if let Some(registration) = workflow.agents.get_mut(&agent) {
                    registration.current_step = Some(step_id.to_string());
                }
                self.driver
                    .set_current_step(&agent, Some(step_id.to_string()))
                    .await;
            }
            Err(err) => {
                let kind = match &err {
                    SessionError::AgentNotFound(_) => ErrorKind::AgentNotFound,
                    _ => ErrorKind::SessionDead,
                };
                self.fail_step(workflow, step_id, kind, err.to_string());
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Branch background task
// ---------------------------------------------------------------------------

async fn run_branch_task<S: WorkflowStore>(
    snapshot: Workflow,
    step_id: String,
    store: Arc<S>,
    expander: Arc<Expander>,
    timeout: Duration,
    cancel: CancellationToken,
    wake: mpsc::UnboundedSender<()>,
) {
    let step: Step = snapshot.steps[&step_id].clone();
    let StepConfig::Branch {
        condition,
        on_true,
        on_false,
        on_timeout,
        ..
    } = step.config.clone()
    else {
        return;
    };

    let Some(outcome) = evaluate_condition(&condition, timeout, &cancel).await else {
        return;
    };
    tracing::debug!(
        workflow = snapshot.id.as_str(),
        step = step_id.as_str(),
        outcome = %outcome,
        "branch condition evaluated"
    );

    let target = select_target(
        on_true.as_ref(),
        on_false.as_ref(),
        on_timeout.as_ref(),
        outcome,
    );
    let expansion = target.map(|t| expander.expand_branch_target(&snapshot, &step, t));

    // Install under a fresh lock; the scheduler may be mid-tick on this
    // workflow, so retry until the lock frees.
    loop {
        match store.try_lock(&snapshot.id) {
            Ok(lock) => {
                let result = install_branch_result(&store, &snapshot.id, &step_id, outcome, expansion)
                    .await;
                drop(lock);
                if let Err(err) = result {
                    tracing::warn!(
                        workflow = snapshot.id.as_str(),
                        step = step_id.as_str(),
                        error = %err,
                        "failed to install branch result"
                    );
                }
                break;
            }
            Err(err) if err.is_lock_conflict() => {
                tokio::select! {
                    _ = tokio::time::sleep(BRANCH_LOCK_RETRY) => {}
                    _ = cancel.cancelled() => return,
                }
            }
            Err(err) => {
                tracing::warn!(
                    workflow = snapshot.id.as_str(),
                    error = %err,
                    "branch task could not lock workflow"
                );
                break;
            }
        }
    }
    let _ = wake.send(());
}

async fn install_branch_result<S: WorkflowStore>(
    store: &Arc<S>,
    workflow_id: &str,
    step_id: &str,
    outcome: super::branch::BranchOutcome,
    expansion: Option<Result<meow_types::workflow::ExpandResult, crate::template::ExpandError>>,
) -> Result<(), StoreError> {
    let mut workflow = store.get(workflow_id).await?;
    let Some(step) = workflow.steps.get(step_id) else {
        return Ok(());
    };
    if step.status != StepStatus::Running {
        // Recovery or cancellation got here first.
        return Ok(());
    }

    let now = Utc::now();
    match expansion {
        None => {
            let step = workflow.steps.get_mut(step_id).unwrap();
            step.outputs.insert(
                "outcome".to_string(),
                OutputValue::String(outcome.as_str().to_string()),
            );
            step.status = StepStatus::Done;
            step.ended_at = Some(now);
        }
        Some(Ok(result)) => {
            let children = result.step_ids.clone();
            if children.iter().any(|id| workflow.steps.contains_key(id)) {
                let step = workflow.steps.get_mut(step_id).unwrap();
                step.fail(
                    ErrorKind::Validation,
                    "branch children collide with existing steps".to_string(),
                    now,
                );
            } else {
                install_expansion(&mut workflow, step_id, result);
                let step = workflow.steps.get_mut(step_id).unwrap();
                step.outputs.insert(
                    "outcome".to_string(),
                    OutputValue::String(outcome.as_str().to_string()),
                );
                step.outputs.insert(
                    "children".to_string(),
                    OutputValue::Json(serde_json::json!(children)),
                );
                step.status = StepStatus::Done;
                step.ended_at = Some(now);
            }
        }
        Some(Err(err)) => {
            let step = workflow.steps.get_mut(step_id).unwrap();
            step.fail(err.error_kind(), err.to_string(), now);
        }
    }

    workflow.updated_at = now;
    store.save(&workflow).await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
