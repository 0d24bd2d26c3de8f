//! IPC message handling.
//!
//! The socket server (meow-infra) parses frames and hands each
//! [`AgentMessage`] to the [`EventHandler`], which mutates the target
//! workflow under the store's lock. Step completion validates outputs
//! against the declared schema; a validation failure returns the step to
//! `running` with the issues in the reply so the agent can retry.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use meow_types::error::IpcError;
use meow_types::event::OrchestratorEvent;
use meow_types::ipc::{AgentMessage, IpcReply};
use meow_types::workflow::{OutputValue, StepConfig, StepStatus};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::event::EventRouter;
use crate::session::SessionDriver;
use crate::store::WorkflowStore;

use super::lifecycle;
use super::outputs::validate_outputs;

/// How long a handler waits for the workflow lock before giving up.
const LOCK_WAIT: Duration = Duration::from_secs(5);
const LOCK_RETRY: Duration = Duration::from_millis(50);

/// Handles inbound agent messages by mutating workflows through the
/// store.
pub struct EventHandler<S: WorkflowStore, D: SessionDriver> {
    store: Arc<S>,
    driver: Arc<D>,
    router: Arc<EventRouter>,
    wake: mpsc::UnboundedSender<()>,
}

impl<S: WorkflowStore, D: SessionDriver> EventHandler<S, D> {
    pub fn new(
        store: Arc<S>,
        driver: Arc<D>,
        router: Arc<EventRouter>,
        wake: mpsc::UnboundedSender<()>,
    ) -> Self {
        Self {
            store,
            driver,
            router,
            wake,
        }
    }

    /// Handle one message and produce the wire reply.
    pub async fn handle(&self, message: AgentMessage) -> IpcReply {
        let result = match message {
            AgentMessage::StepDone {
                workflow,
                step,
                outputs,
            } => self.handle_step_done(&workflow, &step, outputs).await,
            AgentMessage::GetPrompt { agent } => self.handle_get_prompt(&agent).await,
            AgentMessage::Approval {
                workflow,
                gate_id,
                approved,
                notes,
            } => {
                self.handle_approval(&workflow, &gate_id, approved, notes)
                    .await
            }
            AgentMessage::Event {
                event_type,
                agent,
                data,
            } => self.handle_event(&event_type, &agent, data).await,
        };
        match result {
            Ok(()) => IpcReply::ok(),
            Err(err) => {
                tracing::debug!(error = %err, "IPC message rejected");
                IpcReply::err(err.to_string())
            }
        }
    }

    /// Take the workflow lock, waiting briefly if the scheduler holds it
    /// mid-tick.
    async fn acquire_lock(&self, id: &str) -> Result<S::Lock, IpcError> {
        let deadline = tokio::time::Instant::now() + LOCK_WAIT;
        loop {
            match self.store.try_lock(id) {
                Ok(lock) => return Ok(lock),
                Err(err) if err.is_lock_conflict() => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(IpcError::Store(err));
                    }
                    tokio::time::sleep(LOCK_RETRY).await;
                }
                Err(err) => return Err(IpcError::Store(err)),
            }
        }
    }

    // -----------------------------------------------------------------------
    // step_done
    // -----------------------------------------------------------------------

    async fn handle_step_done(
        &self,
        workflow_id: &str,
        step_id: &str,
        reported: std::collections::BTreeMap<String, Value>,
    ) -> Result<(), IpcError> {
        let _lock = self.acquire_lock(workflow_id).await?;
        let mut workflow = self
            .store
            .get(workflow_id)
            .await
            .map_err(|_| IpcError::UnknownWorkflow(workflow_id.to_string()))?;

        let step = workflow
            .steps
            .get_mut(step_id)
            .ok_or_else(|| IpcError::UnknownStep(step_id.to_string()))?;
        if step.status != StepStatus::Running {
            return Err(IpcError::UnexpectedStatus {
                step: step_id.to_string(),
                status: step.status.to_string(),
            });
        }
        let StepConfig::Agent {
            agent, outputs: declared, ..
        } = step.config.clone()
        else {
            return Err(IpcError::UnexpectedStatus {
                step: step_id.to_string(),
                status: "not an agent step".to_string(),
            });
        };

        step.status = StepStatus::Completing;

        let workdir = workflow
            .agents
            .get(&agent)
            .map(|r| r.workdir.clone())
            .unwrap_or_else(|| PathBuf::from("."));

        match validate_outputs(&declared, &reported, &workdir) {
            Ok(validated) => {
                let now = Utc::now();
                let step = workflow.steps.get_mut(step_id).unwrap();
                step.outputs.extend(validated);
                step.status = StepStatus::Done;
                step.ended_at = Some(now);
                if let Some(registration) = workflow.agents.get_mut(&agent) {
                    registration.current_step = None;
                }
                workflow.updated_at = now;
                self.store.save(&workflow).await?;

                self.driver.set_current_step(&agent, None).await;
                self.router.record_completion(&agent);
                self.router.publish(OrchestratorEvent::StepCompleted {
                    workflow: workflow_id.to_string(),
                    step: step_id.to_string(),
                });
                let _ = self.wake.send(());
                tracing::info!(
                    workflow = workflow_id,
                    step = step_id,
                    agent = agent.as_str(),
                    "agent step completed"
                );
                Ok(())
            }
            Err(issues) => {
                // Back to running: the agent fixes its outputs and
                // reports again.
                let step = workflow.steps.get_mut(step_id).unwrap();
                step.status = StepStatus::Running;
                workflow.updated_at = Utc::now();
                self.store.save(&workflow).await?;

                let detail = issues
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; ");
                tracing::warn!(
                    workflow = workflow_id,
                    step = step_id,
                    issues = detail.as_str(),
                    "step outputs failed validation"
                );
                Err(IpcError::Validation(detail))
            }
        }
    }

    // -----------------------------------------------------------------------
    // get_prompt
    // -----------------------------------------------------------------------

    /// Prompt lookup for a polling agent.
    ///
    /// Dispatch stays scheduler-owned, so every arm replies empty; the
    /// lookup is still performed for diagnostics.
    async fn handle_get_prompt(&self, agent: &str) -> Result<(), IpcError> {
        let workflows = self.store.get_by_agent(agent).await?;
        for workflow in &workflows {
            let transitioning = workflow.steps.values().any(|step| {
                step.status == StepStatus::Completing && step.config.agent_id() == Some(agent)
            });
            if transitioning {
                tracing::trace!(agent, workflow = workflow.id.as_str(), "step transitioning");
                return Ok(());
            }
            if let Some(next) = lifecycle::next_ready_for_agent(workflow, agent) {
                tracing::trace!(
                    agent,
                    workflow = workflow.id.as_str(),
                    next = next.as_str(),
                    "next step will be dispatched by the scheduler"
                );
                return Ok(());
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // approval
    // -----------------------------------------------------------------------

    async fn handle_approval(
        &self,
        workflow_id: &str,
        gate_id: &str,
        approved: bool,
        notes: Option<String>,
    ) -> Result<(), IpcError> {
        let _lock = self.acquire_lock(workflow_id).await?;
        let mut workflow = self
            .store
            .get(workflow_id)
            .await
            .map_err(|_| IpcError::UnknownWorkflow(workflow_id.to_string()))?;

        let step = workflow
            .steps
            .get_mut(gate_id)
            .ok_or_else(|| IpcError::UnknownStep(gate_id.to_string()))?;
        if step.status != StepStatus::Running {
            return Err(IpcError::UnexpectedStatus {
                step: gate_id.to_string(),
                status: step.status.to_string(),
            });
        }

        step.outputs
            .insert("approved".to_string(), OutputValue::Bool(approved));
        if let Some(notes) = notes {
            step.outputs
                .insert("notes".to_string(), OutputValue::String(notes));
        }
        workflow.updated_at = Utc::now();
        self.store.save(&workflow).await?;
        let _ = self.wake.send(());
        tracing::info!(workflow = workflow_id, gate = gate_id, approved, "approval recorded");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // event
    // -----------------------------------------------------------------------

    async fn handle_event(
        &self,
        event_type: &str,
        agent: &str,
        data: Value,
    ) -> Result<(), IpcError> {
        let routed = self.router.route(event_type, agent, data).await;
        if !routed {
            tracing::debug!(event_type, agent, "event suppressed by grace filter");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
