//! Error types shared across orchestrator layers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Step error record (persisted)
// ---------------------------------------------------------------------------

/// Classification of a step failure, persisted with the step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Step config or outputs violate the declared schema.
    Validation,
    /// An executor failed (shell non-zero, condition error, parse error).
    Executor,
    /// The target agent is not registered.
    AgentNotFound,
    /// The agent's multiplexer session is gone.
    SessionDead,
    /// Expansion exceeded the nesting depth limit.
    DepthLimitExceeded,
    /// Expansion exceeded the total step limit.
    TotalStepsExceeded,
    /// A template or workflow within it could not be found.
    TemplateNotFound,
    /// A template module failed to parse.
    ParseError,
    /// A variable reference could not be resolved.
    VariableResolution,
    /// A branch condition deadline or agent-step timeout elapsed.
    Timeout,
    /// Store or filesystem failure.
    Store,
    /// Execution was cancelled.
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Executor => "executor",
            ErrorKind::AgentNotFound => "agent_not_found",
            ErrorKind::SessionDead => "session_dead",
            ErrorKind::DepthLimitExceeded => "depth_limit_exceeded",
            ErrorKind::TotalStepsExceeded => "total_steps_exceeded",
            ErrorKind::TemplateNotFound => "template_not_found",
            ErrorKind::ParseError => "parse_error",
            ErrorKind::VariableResolution => "variable_resolution",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Store => "store",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// The error record attached to a failed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: ErrorKind,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

/// Errors from workflow store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("workflow not found: {0}")]
    NotFound(String),

    #[error("workflow already exists: {0}")]
    Conflict(String),

    #[error("workflow lock held elsewhere: {0}")]
    LockConflict(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether this error means another holder has the workflow lock.
    ///
    /// The scheduler skips the workflow for the tick and retries next tick.
    pub fn is_lock_conflict(&self) -> bool {
        matches!(self, StoreError::LockConflict(_))
    }
}

// ---------------------------------------------------------------------------
// Session errors
// ---------------------------------------------------------------------------

/// Errors from the agent-session driver.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("agent not registered: {0}")]
    AgentNotFound(String),

    #[error("session is dead: {0}")]
    SessionDead(String),

    #[error("multiplexer command failed: {0}")]
    Multiplexer(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// IPC errors
// ---------------------------------------------------------------------------

/// Errors from the IPC server and its message handlers.
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    #[error("unknown step: {0}")]
    UnknownStep(String),

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("step '{step}' is not awaiting completion (status: {status})")]
    UnexpectedStatus { step: String, status: String },

    #[error("output validation failed: {0}")]
    Validation(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_serde_snake_case() {
        let json = serde_json::to_string(&ErrorKind::DepthLimitExceeded).unwrap();
        assert_eq!(json, "\"depth_limit_exceeded\"");
        let parsed: ErrorKind = serde_json::from_str("\"timeout\"").unwrap();
        assert_eq!(parsed, ErrorKind::Timeout);
    }

    #[test]
    fn store_error_lock_conflict_predicate() {
        let err = StoreError::LockConflict("wf-01".to_string());
        assert!(err.is_lock_conflict());
        let err = StoreError::NotFound("wf-01".to_string());
        assert!(!err.is_lock_conflict());
    }

    #[test]
    fn session_error_display() {
        let err = SessionError::AgentNotFound("coder".to_string());
        assert_eq!(err.to_string(), "agent not registered: coder");
    }

    #[test]
    fn ipc_error_unexpected_status_display() {
        let err = IpcError::UnexpectedStatus {
            step: "build".to_string(),
            status: "pending".to_string(),
        };
        assert!(err.to_string().contains("build"));
        assert!(err.to_string().contains("pending"));
    }
}
