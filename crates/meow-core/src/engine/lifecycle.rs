//! Step and workflow lifecycle aggregation.
//!
//! Pure functions over the workflow document: ready-set computation, the
//! skip cascade, terminal aggregation, and the deterministic dispatch
//! order (orchestrator-local executors before agent-bound; lexicographic
//! within each group).

use chrono::{DateTime, Utc};
use meow_types::workflow::{StepStatus, Workflow, WorkflowStatus};

/// Step identifiers that are ready to dispatch this tick, in dispatch
/// order.
///
/// A step is ready when it is pending and every dependency exists and is
/// in a terminal accepting status. A dependency that does not exist yet
/// (to be created by a not-yet-run expansion) keeps the step waiting.
pub fn ready_steps(workflow: &Workflow) -> Vec<String> {
    let mut ready: Vec<&str> = workflow
        .steps
        .values()
        .filter(|step| step.status == StepStatus::Pending)
        .filter(|step| {
            step.depends_on.iter().all(|dep| {
                workflow
                    .steps
                    .get(dep)
                    .is_some_and(|d| d.status.is_accepting())
            })
        })
        .map(|step| step.id.as_str())
        .collect();

    ready.sort_by_key(|id| {
        let step = &workflow.steps[*id];
        (!step.executor.is_orchestrator_local(), step.id.clone())
    });
    ready.into_iter().map(String::from).collect()
}

/// Skip every pending step that transitively depends on a failed or
/// skipped step. Returns the number of steps skipped.
///
/// Runs to a fixpoint so chains of dependents collapse in one call.
pub fn apply_skip_cascade(workflow: &mut Workflow, now: DateTime<Utc>) -> usize {
    let mut skipped = 0;
    loop {
        let to_skip: Vec<String> = workflow
            .steps
            .values()
            .filter(|step| step.status == StepStatus::Pending)
            .filter(|step| {
                step.depends_on.iter().any(|dep| {
                    workflow.steps.get(dep).is_some_and(|d| {
                        matches!(d.status, StepStatus::Failed | StepStatus::Skipped)
                    })
                })
            })
            .map(|step| step.id.clone())
            .collect();

        if to_skip.is_empty() {
            break;
        }
        for id in to_skip {
            if let Some(step) = workflow.steps.get_mut(&id) {
                tracing::debug!(workflow = workflow.id.as_str(), step = id.as_str(), "skipping step");
                step.status = StepStatus::Skipped;
                step.ended_at = Some(now);
                skipped += 1;
            }
        }
    }
    skipped
}

/// Whether every step has reached a terminal status.
pub fn all_terminal(workflow: &Workflow) -> bool {
    workflow
        .steps
        .values()
        .all(|step| step.status.is_terminal())
}

/// Whether any step has failed.
pub fn has_failed(workflow: &Workflow) -> bool {
    workflow
        .steps
        .values()
        .any(|step| step.status == StepStatus::Failed)
}

/// When all steps are terminal, write the aggregate workflow status:
/// failed if any step failed, done otherwise. Returns true if the status
/// changed.
pub fn finalize_status(workflow: &mut Workflow, now: DateTime<Utc>) -> bool {
    if workflow.is_terminal() || !all_terminal(workflow) {
        return false;
    }
    workflow.status = if has_failed(workflow) {
        WorkflowStatus::Failed
    } else {
        WorkflowStatus::Done
    };
    workflow.updated_at = now;
    true
}

/// Whether no running or completing step is currently assigned to the
/// agent.
pub fn is_agent_idle(workflow: &Workflow, agent_id: &str) -> bool {
    !workflow.steps.values().any(|step| {
        matches!(step.status, StepStatus::Running | StepStatus::Completing)
            && step.config.agent_id() == Some(agent_id)
    })
}

/// The first ready agent step bound to the given agent, if any.
pub fn next_ready_for_agent(workflow: &Workflow, agent_id: &str) -> Option<String> {
    ready_steps(workflow)
        .into_iter()
        .find(|id| workflow.steps[id].config.agent_id() == Some(agent_id))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
