//! Crash-recovery planning over a persisted workflow.
//!
//! After a restart, steps left in `running` may have lost their owner:
//! orchestrator-local steps always did (their executor died with the
//! process), and agent-bound steps did if the agent's session is gone.
//! Those are reset to `pending` so the scheduler re-dispatches them;
//! steps belonging to live agents stay `running` and complete over IPC
//! as usual.

use chrono::{DateTime, Utc};
use meow_types::workflow::{StepStatus, Workflow};

use crate::session::SessionDriver;

/// Summary of one workflow's recovery pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Steps reset from running to pending.
    pub reset_steps: usize,
    /// Agents whose sessions were found dead.
    pub dead_agents: usize,
}

/// Reset orphaned running steps and refresh agent liveness.
pub async fn reset_orphaned_steps<D: SessionDriver>(
    workflow: &mut Workflow,
    driver: &D,
    now: DateTime<Utc>,
) -> RecoveryReport {
    let mut report = RecoveryReport::default();

    // Refresh liveness on registered agents first; step decisions key
    // off the result.
    let agent_ids: Vec<String> = workflow.agents.keys().cloned().collect();
    for agent_id in &agent_ids {
        let alive = driver.is_running(agent_id).await;
        let registration = workflow
            .agents
            .get_mut(agent_id)
            .filter(|r| r.alive && !alive);
        if let Some(registration) = registration {
            registration.alive = false;
            registration.current_step = None;
            report.dead_agents += 1;
            tracing::warn!(
                workflow = workflow.id.as_str(),
                agent = agent_id.as_str(),
                "agent session died while orchestrator was down"
            );
        }
    }

    let step_ids: Vec<String> = workflow
        .steps
        .values()
        .filter(|step| {
            matches!(step.status, StepStatus::Running | StepStatus::Completing)
        })
        .map(|step| step.id.clone())
        .collect();

    for step_id in step_ids {
        let step = &workflow.steps[&step_id];
        let keep_running = match step.config.agent_id() {
            Some(agent) => workflow.agents.get(agent).is_some_and(|r| r.alive),
            // Orchestrator-local executors died with the process.
            None => false,
        };
        if keep_running {
            continue;
        }

        let step = workflow.steps.get_mut(&step_id).unwrap();
        tracing::info!(
            workflow = workflow.id.as_str(),
            step = step_id.as_str(),
            "resetting orphaned step to pending"
        );
        step.status = StepStatus::Pending;
        step.started_at = None;
        report.reset_steps += 1;
        if let Some(agent) = step.config.agent_id() {
            if let Some(registration) = workflow.agents.get_mut(agent) {
                if registration.current_step.as_deref() == Some(step_id.as_str()) {
                    registration.current_step = None;
                }
            }
        }
    }

    if report.reset_steps > 0 || report.dead_agents > 0 {
        workflow.updated_at = now;
    }
    report
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
