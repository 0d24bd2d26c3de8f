//! Persisted orchestrator process state.
//!
//! Two small JSON documents under `.meow/state/`: the resume state that
//! distinguishes a restart from a fresh start, and the heartbeat used to
//! diagnose crashed sibling processes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Resume state at `.meow/state/orchestrator.json`.
///
/// Presence of this document means a previous orchestrator drove this
/// project; startup resumes instead of re-expanding the top-level
/// template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorState {
    /// Process identifier of the orchestrator that wrote this state.
    pub pid: u32,
    /// The top-level template reference the orchestrator was started with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    /// Scheduler ticks completed so far.
    pub tick_count: u64,
}

/// Liveness record at `.meow/state/heartbeat.json`, touched at a bounded
/// frequency while the orchestrator runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub pid: u32,
    pub updated_at: DateTime<Utc>,
}

impl Heartbeat {
    /// Whether this heartbeat is older than `stale_after_ms` as of `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after_ms: u64) -> bool {
        let age = now.signed_duration_since(self.updated_at);
        age.num_milliseconds() > stale_after_ms as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn orchestrator_state_roundtrip() {
        let state = OrchestratorState {
            pid: 4242,
            template: Some("lib/build".to_string()),
            tick_count: 17,
        };
        let json = serde_json::to_string(&state).unwrap();
        let parsed: OrchestratorState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.pid, 4242);
        assert_eq!(parsed.tick_count, 17);
        assert_eq!(parsed.template.as_deref(), Some("lib/build"));
    }

    #[test]
    fn heartbeat_staleness() {
        let now = Utc::now();
        let fresh = Heartbeat {
            pid: 1,
            updated_at: now - Duration::seconds(5),
        };
        assert!(!fresh.is_stale(now, 30_000));

        let stale = Heartbeat {
            pid: 1,
            updated_at: now - Duration::seconds(60),
        };
        assert!(stale.is_stale(now, 30_000));
    }
}
