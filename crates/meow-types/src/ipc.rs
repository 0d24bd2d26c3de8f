//! IPC wire frames spoken between agents and the orchestrator.
//!
//! Agents connect to a local stream socket (path exported as
//! [`MEOW_ORCH_SOCK`]) and exchange newline-delimited JSON: one
//! [`AgentMessage`] per line inbound, one [`IpcReply`] per line outbound.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Reserved environment variables
// ---------------------------------------------------------------------------

/// Agent identifier, injected into every spawned agent session.
pub const MEOW_AGENT: &str = "MEOW_AGENT";

/// Workflow identifier, injected into agent sessions and shell steps.
pub const MEOW_WORKFLOW: &str = "MEOW_WORKFLOW";

/// Step identifier, injected into shell steps.
pub const MEOW_STEP: &str = "MEOW_STEP";

/// Path of the orchestrator IPC socket, injected into agent sessions.
pub const MEOW_ORCH_SOCK: &str = "MEOW_ORCH_SOCK";

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A message from an agent to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    /// An agent reports that its current step is finished, with outputs
    /// to validate against the step's declared schema.
    StepDone {
        workflow: String,
        step: String,
        #[serde(default)]
        outputs: BTreeMap<String, Value>,
    },
    /// An agent asks whether a prompt is waiting for it.
    GetPrompt { agent: String },
    /// A response to an approval gate.
    Approval {
        workflow: String,
        gate_id: String,
        approved: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        notes: Option<String>,
    },
    /// A free-form lifecycle event (e.g. "agent-stopped"), routed to
    /// registered waiters after grace-period filtering.
    Event {
        event_type: String,
        #[serde(default)]
        agent: String,
        #[serde(default)]
        data: Value,
    },
}

/// The orchestrator's reply to any [`AgentMessage`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcReply {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IpcReply {
    /// A successful reply with no payload.
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    /// A failed reply carrying an error message.
    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
