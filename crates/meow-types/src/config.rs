//! Orchestrator configuration.
//!
//! Loaded from `<project_root>/.meow/config.toml` by the infrastructure
//! layer; every field has a default so a missing or partial file works.

use serde::{Deserialize, Serialize};

/// Tunable parameters of the orchestrator process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Scheduler poll interval in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Window after a step completion during which stray "agent-stopped"
    /// events for that agent are suppressed.
    #[serde(default = "default_grace_ms")]
    pub agent_stopped_grace_ms: u64,

    /// Maximum expansion nesting depth.
    #[serde(default = "default_max_depth")]
    pub max_expand_depth: u32,

    /// Maximum total steps in a workflow after any expansion.
    #[serde(default = "default_max_total_steps")]
    pub max_total_steps: usize,

    /// Delay after spawning an agent session before it is considered ready.
    #[serde(default = "default_startup_delay_ms")]
    pub startup_delay_ms: u64,

    /// Delay between pre-keys and the prompt payload during injection.
    #[serde(default = "default_inject_delay_ms")]
    pub inject_pre_delay_ms: u64,

    /// Delay between the prompt payload and the submit key.
    #[serde(default = "default_inject_delay_ms")]
    pub inject_post_delay_ms: u64,

    /// Submit-key retry attempts on transient multiplexer errors.
    #[serde(default = "default_submit_retries")]
    pub submit_retries: u32,

    /// Delay between submit-key retries in milliseconds.
    #[serde(default = "default_submit_retry_delay_ms")]
    pub submit_retry_delay_ms: u64,

    /// Grace period between interrupt and kill when stopping an agent.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    /// Default branch-condition timeout when the step declares none.
    #[serde(default = "default_branch_timeout_ms")]
    pub branch_timeout_ms: u64,

    /// Maximum concurrently-evaluating branch conditions.
    #[serde(default = "default_branch_parallelism")]
    pub branch_parallelism: usize,

    /// Base backoff for shell-step retries in milliseconds (doubles per
    /// attempt).
    #[serde(default = "default_shell_backoff_ms")]
    pub shell_retry_backoff_ms: u64,

    /// How often the heartbeat file is touched.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Age beyond which a sibling heartbeat is considered stale.
    #[serde(default = "default_heartbeat_stale_ms")]
    pub heartbeat_stale_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            agent_stopped_grace_ms: default_grace_ms(),
            max_expand_depth: default_max_depth(),
            max_total_steps: default_max_total_steps(),
            startup_delay_ms: default_startup_delay_ms(),
            inject_pre_delay_ms: default_inject_delay_ms(),
            inject_post_delay_ms: default_inject_delay_ms(),
            submit_retries: default_submit_retries(),
            submit_retry_delay_ms: default_submit_retry_delay_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            branch_timeout_ms: default_branch_timeout_ms(),
            branch_parallelism: default_branch_parallelism(),
            shell_retry_backoff_ms: default_shell_backoff_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_stale_ms: default_heartbeat_stale_ms(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_grace_ms() -> u64 {
    5_000
}

fn default_max_depth() -> u32 {
    10
}

fn default_max_total_steps() -> usize {
    10_000
}

fn default_startup_delay_ms() -> u64 {
    2_000
}

fn default_inject_delay_ms() -> u64 {
    150
}

fn default_submit_retries() -> u32 {
    3
}

fn default_submit_retry_delay_ms() -> u64 {
    200
}

fn default_stop_grace_ms() -> u64 {
    2_000
}

fn default_branch_timeout_ms() -> u64 {
    30_000
}

fn default_branch_parallelism() -> usize {
    8
}

fn default_shell_backoff_ms() -> u64 {
    500
}

fn default_heartbeat_interval_ms() -> u64 {
    2_000
}

fn default_heartbeat_stale_ms() -> u64 {
    30_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_limits() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_expand_depth, 10);
        assert_eq!(config.max_total_steps, 10_000);
        assert_eq!(config.submit_retries, 3);
        assert_eq!(config.submit_retry_delay_ms, 200);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: OrchestratorConfig =
            toml::from_str("poll_interval_ms = 100").unwrap();
        assert_eq!(config.poll_interval_ms, 100);
        assert_eq!(config.max_expand_depth, 10);
        assert_eq!(config.agent_stopped_grace_ms, 5_000);
    }
}
