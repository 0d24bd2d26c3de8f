//! Orchestrator events published on the in-process event bus.

use serde_json::Value;

use crate::workflow::WorkflowStatus;

/// Events emitted by the scheduler and IPC layer for observers (the CLI,
/// tests, log sinks).
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// A workflow began executing.
    WorkflowStarted { workflow: String },
    /// A workflow reached a terminal status.
    WorkflowFinished {
        workflow: String,
        status: WorkflowStatus,
    },
    /// A step was dispatched.
    StepStarted { workflow: String, step: String },
    /// A step reached done.
    StepCompleted { workflow: String, step: String },
    /// A step failed.
    StepFailed {
        workflow: String,
        step: String,
        error: String,
    },
    /// An agent session was spawned or attached.
    AgentSpawned {
        workflow: String,
        agent: String,
        session: String,
    },
    /// An agent was stopped.
    AgentStopped { agent: String },
    /// An external agent event accepted by the router (post grace
    /// filtering).
    AgentEvent {
        event_type: String,
        agent: String,
        data: Value,
    },
}
