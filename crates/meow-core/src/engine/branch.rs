//! Branch condition evaluation.
//!
//! Executes a shell-style condition with a deadline and maps the result
//! to a three-way outcome: exit 0 is true, any non-zero exit or
//! execution error is false, and a deadline hit is timeout. Target
//! selection prefers `on_timeout` for timeouts and falls back to
//! `on_false`, preserving the outcome for observers either way.

use std::time::Duration;

use meow_types::workflow::BranchTarget;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// The three-way result of a branch condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchOutcome {
    True,
    False,
    Timeout,
}

impl BranchOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            BranchOutcome::True => "true",
            BranchOutcome::False => "false",
            BranchOutcome::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for BranchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execute a condition under `sh -c` with a deadline.
///
/// Returns `None` when cancelled; the caller abandons the branch and
/// recovery re-dispatches it after restart.
pub async fn evaluate_condition(
    condition: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Option<BranchOutcome> {
    let mut command = Command::new("sh");
    command.arg("-c").arg(condition);
    command.kill_on_drop(true);

    let outcome = tokio::select! {
        result = command.output() => match result {
            Ok(output) if output.status.success() => BranchOutcome::True,
            Ok(_) => BranchOutcome::False,
            Err(err) => {
                tracing::warn!(condition, error = %err, "branch condition failed to execute");
                BranchOutcome::False
            }
        },
        _ = tokio::time::sleep(timeout) => BranchOutcome::Timeout,
        _ = cancel.cancelled() => return None,
    };
    Some(outcome)
}

/// Select the branch target for an outcome.
///
/// Timeout prefers `on_timeout` and falls back to `on_false`. A `None`
/// result means the branch completes with zero children.
pub fn select_target<'a>(
    on_true: Option<&'a BranchTarget>,
    on_false: Option<&'a BranchTarget>,
    on_timeout: Option<&'a BranchTarget>,
    outcome: BranchOutcome,
) -> Option<&'a BranchTarget> {
    match outcome {
        BranchOutcome::True => on_true,
        BranchOutcome::False => on_false,
        BranchOutcome::Timeout => on_timeout.or(on_false),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
