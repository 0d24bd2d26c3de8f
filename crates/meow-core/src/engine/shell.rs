//! Shell step executor.
//!
//! Runs the configured command under `sh -c`, captures stdout, stderr,
//! and the exit code, maps declared output selectors, and applies the
//! step's `on_error` policy (fail, continue, or retry with exponential
//! backoff). Cancellation aborts the child process.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use meow_types::ipc::{MEOW_STEP, MEOW_WORKFLOW};
use meow_types::workflow::{OnError, OutputValue};
use serde_json::Value;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Spec and errors
// ---------------------------------------------------------------------------

/// A fully-resolved shell execution request. The scheduler resolves
/// `{{...}}` output references in the command, env values, and output
/// selectors before building this.
#[derive(Debug, Clone)]
pub struct ShellSpec {
    pub command: String,
    pub workdir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub on_error: OnError,
    pub max_retries: u32,
    /// Declared outputs: name -> selector.
    pub outputs: BTreeMap<String, String>,
}

/// Errors from shell execution.
#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    /// The command exited non-zero and `on_error` is fail.
    #[error("command exited with code {code}: {stderr}")]
    NonZero { code: i32, stderr: String },

    /// The shell itself could not be started.
    #[error("failed to spawn shell: {0}")]
    Spawn(#[from] std::io::Error),

    /// A declared output could not be produced.
    #[error("output '{key}': {message}")]
    InvalidOutput { key: String, message: String },

    /// Execution was cancelled.
    #[error("execution cancelled")]
    Cancelled,
}

/// Captured results of one command execution.
struct Capture {
    stdout: String,
    stderr: String,
    exit_code: i32,
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Executes shell steps.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    /// Base backoff between retries; doubles per attempt.
    backoff: Duration,
}

impl ShellRunner {
    pub fn new(backoff: Duration) -> Self {
        Self { backoff }
    }

    /// Run a shell step to completion under the `on_error` policy.
    pub async fn run(
        &self,
        spec: &ShellSpec,
        workflow_id: &str,
        step_id: &str,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, OutputValue>, ShellError> {
        let mut attempt: u32 = 0;
        loop {
            let capture = self
                .execute_once(spec, workflow_id, step_id, cancel)
                .await?;

            if capture.exit_code == 0 {
                return collect_outputs(spec, &capture).await;
            }

            match spec.on_error {
                OnError::Fail => {
                    return Err(ShellError::NonZero {
                        code: capture.exit_code,
                        stderr: capture.stderr,
                    });
                }
                OnError::Retry if attempt < spec.max_retries => {
                    let delay = self.backoff * 2u32.saturating_pow(attempt);
                    tracing::debug!(
                        workflow = workflow_id,
                        step = step_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying shell step after non-zero exit"
                    );
                    attempt += 1;
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(ShellError::Cancelled),
                    }
                }
                OnError::Continue | OnError::Retry => {
                    // Retries exhausted fall through to continue.
                    let mut outputs = collect_outputs(spec, &capture).await?;
                    outputs.insert(
                        "error".to_string(),
                        OutputValue::String(format!(
                            "exit code {}: {}",
                            capture.exit_code, capture.stderr
                        )),
                    );
                    return Ok(outputs);
                }
            }
        }
    }

    async fn execute_once(
        &self,
        spec: &ShellSpec,
        workflow_id: &str,
        step_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Capture, ShellError> {
        let mut command = Command::new("sh");
        command.arg("-c").arg(&spec.command);
        if let Some(workdir) = &spec.workdir {
            command.current_dir(workdir);
        }
        command.envs(&spec.env);
        command.env(MEOW_WORKFLOW, workflow_id);
        command.env(MEOW_STEP, step_id);
        command.kill_on_drop(true);

        let output = tokio::select! {
            result = command.output() => result?,
            _ = cancel.cancelled() => return Err(ShellError::Cancelled),
        };

        Ok(Capture {
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

// ---------------------------------------------------------------------------
// Output collection
// ---------------------------------------------------------------------------

/// Build the step's output map: the three standard captures, plus each
/// declared selector.
async fn collect_outputs(
    spec: &ShellSpec,
    capture: &Capture,
) -> Result<BTreeMap<String, OutputValue>, ShellError> {
    let mut outputs = BTreeMap::new();
    outputs.insert(
        "stdout".to_string(),
        OutputValue::String(capture.stdout.clone()),
    );
    outputs.insert(
        "stderr".to_string(),
        OutputValue::String(capture.stderr.clone()),
    );
    outputs.insert(
        "exit_code".to_string(),
        OutputValue::Number(capture.exit_code as f64),
    );

    for (key, selector) in &spec.outputs {
        let value = match selector.as_str() {
            "stdout" => OutputValue::String(capture.stdout.clone()),
            "stderr" => OutputValue::String(capture.stderr.clone()),
            "exit_code" => OutputValue::Number(capture.exit_code as f64),
            "json" => serde_json::from_str(&capture.stdout)
                .map(OutputValue::Json)
                .map_err(|e| ShellError::InvalidOutput {
                    key: key.clone(),
                    message: format!("stdout is not valid JSON: {e}"),
                })?,
            other => {
                if let Some(path) = other.strip_prefix("file:") {
                    let resolved = resolve_capture_refs(path, capture);
                    let content = tokio::fs::read_to_string(&resolved).await.map_err(|e| {
                        ShellError::InvalidOutput {
                            key: key.clone(),
                            message: format!("failed to read '{resolved}': {e}"),
                        }
                    })?;
                    OutputValue::String(content.trim_end().to_string())
                } else {
                    OutputValue::Json(Value::Null)
                }
            }
        };
        outputs.insert(key.clone(), value);
    }

    Ok(outputs)
}

/// Resolve `{{stdout}}`, `{{stderr}}`, and `{{exit_code}}` in a file
/// path against this execution's captures.
fn resolve_capture_refs(path: &str, capture: &Capture) -> String {
    path.replace("{{stdout}}", &capture.stdout)
        .replace("{{stderr}}", &capture.stderr)
        .replace("{{exit_code}}", &capture.exit_code.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(command: &str) -> ShellSpec {
        ShellSpec {
            command: command.to_string(),
            workdir: None,
            env: BTreeMap::new(),
            on_error: OnError::Fail,
            max_retries: 3,
            outputs: BTreeMap::new(),
        }
    }

    fn runner() -> ShellRunner {
        ShellRunner::new(Duration::from_millis(1))
    }

    // -----------------------------------------------------------------------
    // Captures
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn captures_stdout_stderr_exit_code() {
        let outputs = runner()
            .run(&spec("echo hello"), "wf", "s", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outputs["stdout"], OutputValue::String("hello".to_string()));
        assert_eq!(outputs["stderr"], OutputValue::String(String::new()));
        assert_eq!(outputs["exit_code"], OutputValue::Number(0.0));
    }

    #[tokio::test]
    async fn injects_reserved_env() {
        let outputs = runner()
            .run(
                &spec("echo $MEOW_WORKFLOW/$MEOW_STEP"),
                "wf-7",
                "step-3",
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(
            outputs["stdout"],
            OutputValue::String("wf-7/step-3".to_string())
        );
    }

    #[tokio::test]
    async fn step_env_is_applied() {
        let mut s = spec("echo $GREETING");
        s.env.insert("GREETING".to_string(), "meow".to_string());
        let outputs = runner()
            .run(&s, "wf", "s", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outputs["stdout"], OutputValue::String("meow".to_string()));
    }

    // -----------------------------------------------------------------------
    // on_error policies
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn non_zero_fails_by_default() {
        let err = runner()
            .run(&spec("exit 3"), "wf", "s", &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            ShellError::NonZero { code, .. } => assert_eq!(code, 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn continue_records_error_output() {
        let mut s = spec("echo partial; exit 1");
        s.on_error = OnError::Continue;
        let outputs = runner()
            .run(&s, "wf", "s", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outputs["stdout"], OutputValue::String("partial".to_string()));
        assert!(matches!(&outputs["error"], OutputValue::String(msg) if msg.contains("exit code 1")));
    }

    #[tokio::test]
    async fn retry_exhaustion_falls_through_to_continue() {
        let mut s = spec("exit 1");
        s.on_error = OnError::Retry;
        s.max_retries = 2;
        let outputs = runner()
            .run(&s, "wf", "s", &CancellationToken::new())
            .await
            .unwrap();
        assert!(outputs.contains_key("error"));
        assert_eq!(outputs["exit_code"], OutputValue::Number(1.0));
    }

    #[tokio::test]
    async fn retry_succeeds_once_command_passes() {
        // Fails until the marker file exists, which the first attempt
        // creates: attempt 1 fails, attempt 2 succeeds.
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("marker");
        let mut s = spec(&format!(
            "test -f {m} || {{ touch {m}; exit 1; }}",
            m = marker.display()
        ));
        s.on_error = OnError::Retry;
        s.max_retries = 3;
        let outputs = runner()
            .run(&s, "wf", "s", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outputs["exit_code"], OutputValue::Number(0.0));
        assert!(!outputs.contains_key("error"));
    }

    // -----------------------------------------------------------------------
    // Output selectors
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn declared_selectors_map_captures() {
        let mut s = spec("echo out; echo err >&2");
        s.outputs = BTreeMap::from([
            ("o".to_string(), "stdout".to_string()),
            ("e".to_string(), "stderr".to_string()),
            ("code".to_string(), "exit_code".to_string()),
        ]);
        let outputs = runner()
            .run(&s, "wf", "s", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outputs["o"], OutputValue::String("out".to_string()));
        assert_eq!(outputs["e"], OutputValue::String("err".to_string()));
        assert_eq!(outputs["code"], OutputValue::Number(0.0));
    }

    #[tokio::test]
    async fn json_selector_parses_stdout() {
        let mut s = spec(r#"echo '{"n": 5}'"#);
        s.outputs = BTreeMap::from([("data".to_string(), "json".to_string())]);
        let outputs = runner()
            .run(&s, "wf", "s", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outputs["data"], OutputValue::Json(json!({"n": 5})));
    }

    #[tokio::test]
    async fn json_selector_rejects_invalid_stdout() {
        let mut s = spec("echo not-json");
        s.outputs = BTreeMap::from([("data".to_string(), "json".to_string())]);
        let err = runner()
            .run(&s, "wf", "s", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ShellError::InvalidOutput { .. }));
    }

    #[tokio::test]
    async fn file_selector_reads_and_trims() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("result.txt");
        let mut s = spec(&format!("printf 'content\\n\\n' > {}", file.display()));
        s.outputs = BTreeMap::from([(
            "result".to_string(),
            format!("file:{}", file.display()),
        )]);
        let outputs = runner()
            .run(&s, "wf", "s", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outputs["result"], OutputValue::String("content".to_string()));
    }

    #[tokio::test]
    async fn file_selector_resolves_capture_refs() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("named-by-stdout");
        std::fs::write(&file, "found").unwrap();
        let mut s = spec(&format!("echo {}", file.display()));
        s.outputs = BTreeMap::from([("result".to_string(), "file:{{stdout}}".to_string())]);
        let outputs = runner()
            .run(&s, "wf", "s", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outputs["result"], OutputValue::String("found".to_string()));
    }

    #[tokio::test]
    async fn unknown_selector_records_null() {
        let mut s = spec("true");
        s.outputs = BTreeMap::from([("x".to_string(), "mystery".to_string())]);
        let outputs = runner()
            .run(&s, "wf", "s", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outputs["x"], OutputValue::Json(Value::Null));
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn cancellation_aborts_child() {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });
        let err = runner()
            .run(&spec("sleep 30"), "wf", "s", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ShellError::Cancelled));
    }
}
