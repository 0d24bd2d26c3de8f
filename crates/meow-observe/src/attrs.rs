//! Span attribute constants for orchestrator instrumentation.
//!
//! All constants are string slices usable in `tracing::span!` and
//! `tracing::info_span!` field names, so dashboards and log queries see
//! one consistent vocabulary.

// --- Workflow attributes ---

/// The workflow identifier.
pub const WORKFLOW_ID: &str = "meow.workflow.id";

/// The workflow's terminal or current status.
pub const WORKFLOW_STATUS: &str = "meow.workflow.status";

// --- Step attributes ---

/// The step identifier.
pub const STEP_ID: &str = "meow.step.id";

/// The step's executor kind (shell, spawn, kill, expand, branch, agent).
pub const STEP_EXECUTOR: &str = "meow.step.executor";

/// The step's status after the instrumented operation.
pub const STEP_STATUS: &str = "meow.step.status";

// --- Agent attributes ---

/// The agent identifier.
pub const AGENT_ID: &str = "meow.agent.id";

/// The agent's multiplexer session name.
pub const AGENT_SESSION: &str = "meow.agent.session";

// --- Operation name values ---

/// One scheduler tick over all workflows.
pub const OP_TICK: &str = "tick";

/// Dispatching a single ready step.
pub const OP_DISPATCH: &str = "dispatch";

/// Expanding a template into child steps.
pub const OP_EXPAND: &str = "expand";

/// Evaluating a branch condition.
pub const OP_BRANCH: &str = "branch";

/// Injecting a prompt into an agent session.
pub const OP_INJECT: &str = "inject_prompt";
