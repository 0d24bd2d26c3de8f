//! Workflow domain types for the meow orchestrator.
//!
//! Defines the persisted representation of a workflow: the root document,
//! its steps (one of six executor kinds), registered agents, and captured
//! step outputs. Maps use `BTreeMap` so that serialization is deterministic
//! and a save/load/save round trip is byte-equivalent.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorKind, StepError};

// ---------------------------------------------------------------------------
// Workflow (root document)
// ---------------------------------------------------------------------------

/// The root workflow document, persisted as one YAML file per workflow.
///
/// Mutated only while the per-workflow lock is held; persisted on every
/// mutation. Terminal once `status` is done, failed, or cancelled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Stable workflow identifier (also the file stem on disk).
    pub id: String,
    /// Current workflow status.
    pub status: WorkflowStatus,
    /// When the workflow was created.
    pub created_at: DateTime<Utc>,
    /// When the workflow was last mutated.
    pub updated_at: DateTime<Utc>,
    /// All steps, keyed by step identifier. Identifiers are unique within
    /// the workflow; children of an expansion are `<parent>.<child>`.
    pub steps: BTreeMap<String, Step>,
    /// Workflow-level variables available to template expansion.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: BTreeMap<String, Value>,
    /// The template reference this workflow was created from, if any.
    /// Used to resolve local (`.name`) sub-template references.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    /// Active agents registered by spawn steps, keyed by agent identifier.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub agents: BTreeMap<String, AgentRegistration>,
}

impl Workflow {
    /// Create a new pending workflow with no steps.
    pub fn new(id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            status: WorkflowStatus::Pending,
            created_at: now,
            updated_at: now,
            steps: BTreeMap::new(),
            vars: BTreeMap::new(),
            template: None,
            agents: BTreeMap::new(),
        }
    }

    /// Whether the workflow has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            WorkflowStatus::Done | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

/// Overall status of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Done => "done",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// A single node of the workflow DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Step identifier, unique within the workflow.
    pub id: String,
    /// Which executor carries this step out.
    pub executor: ExecutorKind,
    /// Step identifiers that must reach a terminal accepting status before
    /// this step may run.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Current step status.
    pub status: StepStatus,
    /// Executor-specific configuration payload.
    pub config: StepConfig,
    /// Captured outputs, keyed by output name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, OutputValue>,
    /// Error record if the step failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    /// Identifier of the expand or branch step that produced this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expanded_from: Option<String>,
    /// Identifiers of the child steps this step expanded into.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expanded_into: Vec<String>,
    /// When the step was dispatched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the step reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Step timeout in milliseconds (enforced for agent steps).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Module path this step was loaded from, for resolving local
    /// (`.name`) template references in expand and branch payloads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_module: Option<PathBuf>,
}

impl Step {
    /// Create a pending step with the given identifier and config.
    ///
    /// The executor tag is derived from the config variant.
    pub fn new(id: impl Into<String>, config: StepConfig) -> Self {
        Self {
            id: id.into(),
            executor: config.executor_kind(),
            depends_on: Vec::new(),
            status: StepStatus::Pending,
            config,
            outputs: BTreeMap::new(),
            error: None,
            expanded_from: None,
            expanded_into: Vec::new(),
            started_at: None,
            ended_at: None,
            timeout_ms: None,
            source_module: None,
        }
    }

    /// Mark the step failed with the given error kind and message.
    pub fn fail(&mut self, kind: ErrorKind, message: impl Into<String>, now: DateTime<Utc>) {
        self.status = StepStatus::Failed;
        self.error = Some(StepError {
            kind,
            message: message.into(),
        });
        self.ended_at = Some(now);
    }
}

/// Status of an individual step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completing,
    Done,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Whether this status is terminal (no further transitions).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Done | StepStatus::Failed | StepStatus::Skipped
        )
    }

    /// Whether a dependency in this status lets a dependent run.
    pub fn is_accepting(self) -> bool {
        matches!(self, StepStatus::Done | StepStatus::Skipped)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completing => "completing",
            StepStatus::Done => "done",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// The six executor kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    Shell,
    Spawn,
    Kill,
    Expand,
    Branch,
    Agent,
}

impl ExecutorKind {
    /// Whether this executor runs inside the orchestrator process.
    ///
    /// Orchestrator-local steps are dispatched before agent-bound steps
    /// within a tick.
    pub fn is_orchestrator_local(self) -> bool {
        !matches!(self, ExecutorKind::Agent)
    }
}

// ---------------------------------------------------------------------------
// Step configuration payloads
// ---------------------------------------------------------------------------

/// Executor-specific configuration. Internally tagged to match the
/// template file structure:
///
/// ```toml
/// [workflow.build.steps.config]
/// type = "shell"
/// command = "cargo build"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepConfig {
    /// Run a shell command and capture its outputs.
    Shell {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workdir: Option<PathBuf>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
        #[serde(default)]
        on_error: OnError,
        #[serde(default = "default_max_retries")]
        max_retries: u32,
        /// Declared outputs: name -> selector (`stdout`, `stderr`,
        /// `exit_code`, `json`, or `file:<path>`).
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        outputs: BTreeMap<String, String>,
    },
    /// Start an external agent in a multiplexer session.
    Spawn {
        agent: String,
        workdir: PathBuf,
        command: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
    },
    /// Stop a running agent.
    Kill {
        agent: String,
        #[serde(default = "default_true")]
        graceful: bool,
    },
    /// Splice a template's steps into the workflow.
    Expand {
        template: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        vars: BTreeMap<String, Value>,
    },
    /// Evaluate a shell condition and install one of up to three targets.
    Branch {
        condition: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_true: Option<BranchTarget>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_false: Option<BranchTarget>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_timeout: Option<BranchTarget>,
    },
    /// Inject a prompt into a registered agent and await completion
    /// over IPC.
    Agent {
        agent: String,
        prompt: String,
        /// Declared output schema: name -> expected type.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        outputs: BTreeMap<String, OutputType>,
    },
}

impl StepConfig {
    /// The executor kind this payload belongs to.
    pub fn executor_kind(&self) -> ExecutorKind {
        match self {
            StepConfig::Shell { .. } => ExecutorKind::Shell,
            StepConfig::Spawn { .. } => ExecutorKind::Spawn,
            StepConfig::Kill { .. } => ExecutorKind::Kill,
            StepConfig::Expand { .. } => ExecutorKind::Expand,
            StepConfig::Branch { .. } => ExecutorKind::Branch,
            StepConfig::Agent { .. } => ExecutorKind::Agent,
        }
    }

    /// The target agent identifier for agent-bound payloads.
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            StepConfig::Agent { agent, .. } => Some(agent),
            _ => None,
        }
    }
}

/// Behavior when a shell step exits non-zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Fail the step (default).
    #[default]
    Fail,
    /// Mark the step done and record the error under the `error` output.
    Continue,
    /// Retry with exponential backoff, then fall through to continue.
    Retry,
}

fn default_max_retries() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

/// Target of a branch outcome: a template reference or inline steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BranchTarget {
    /// Expand a template, with branch-local variables layered over
    /// workflow variables.
    Template {
        template: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        vars: BTreeMap<String, Value>,
    },
    /// Materialise an inline list of step descriptors.
    Inline { steps: Vec<InlineStep> },
}

/// An inline step descriptor inside a branch target.
///
/// The same shape as a template step: identifier, dependencies, and a
/// config payload whose strings may contain `{{...}}` placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InlineStep {
    pub id: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Step timeout as a duration string (e.g. "50ms", "5s", "10m").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    pub config: StepConfig,
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

/// Expected type for a declared agent-step output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputType {
    String,
    Number,
    Boolean,
    Json,
    FilePath,
}

/// A captured step output.
///
/// Heterogeneous structured data addressable by key; the declared
/// [`OutputType`] on the step drives parsing and validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum OutputValue {
    String(String),
    Number(f64),
    Bool(bool),
    Json(Value),
    Path(PathBuf),
}

impl OutputValue {
    /// Render the value as a display string (compact JSON for `Json`).
    pub fn render(&self) -> String {
        match self {
            OutputValue::String(s) => s.clone(),
            OutputValue::Number(n) => n.to_string(),
            OutputValue::Bool(b) => b.to_string(),
            OutputValue::Json(v) => serde_json::to_string(v).unwrap_or_default(),
            OutputValue::Path(p) => p.display().to_string(),
        }
    }

    /// Convert the value to a plain JSON value.
    pub fn as_json(&self) -> Value {
        match self {
            OutputValue::String(s) => Value::String(s.clone()),
            OutputValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            OutputValue::Bool(b) => Value::Bool(*b),
            OutputValue::Json(v) => v.clone(),
            OutputValue::Path(p) => Value::String(p.display().to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

/// Per-workflow registration of a spawned agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    /// External multiplexer session name.
    pub session: String,
    /// Working directory the agent was spawned in.
    pub workdir: PathBuf,
    /// The step currently dispatched to this agent, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    /// Liveness flag, cleared by kill steps and recovery.
    pub alive: bool,
}

/// Build the canonical multiplexer session name for an agent.
///
/// Stable across restarts so attach-on-restart works.
pub fn session_name(workflow_id: &str, agent_id: &str) -> String {
    format!("meow-{workflow_id}-{agent_id}")
}

// ---------------------------------------------------------------------------
// Expansion
// ---------------------------------------------------------------------------

/// The baked child steps of one expansion, ready for insertion.
#[derive(Debug, Clone)]
pub struct ExpandResult {
    /// Child steps with parent-prefixed identifiers and rewritten
    /// internal dependencies.
    pub steps: Vec<Step>,
    /// The child identifiers, in insertion order.
    pub step_ids: Vec<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shell_step(id: &str, command: &str) -> Step {
        Step::new(
            id,
            StepConfig::Shell {
                command: command.to_string(),
                workdir: None,
                env: BTreeMap::new(),
                on_error: OnError::Fail,
                max_retries: 3,
                outputs: BTreeMap::new(),
            },
        )
    }

    fn sample_workflow() -> Workflow {
        let now = "2026-01-10T12:00:00Z".parse().unwrap();
        let mut wf = Workflow::new("wf-01", now);
        wf.status = WorkflowStatus::Running;

        let mut a = shell_step("a", "echo a");
        a.status = StepStatus::Done;
        a.outputs
            .insert("stdout".to_string(), OutputValue::String("a".to_string()));

        let mut b = shell_step("b", "echo b");
        b.depends_on = vec!["a".to_string()];

        let mut agent_step = Step::new(
            "review",
            StepConfig::Agent {
                agent: "coder".to_string(),
                prompt: "Review the diff".to_string(),
                outputs: BTreeMap::from([("verdict".to_string(), OutputType::String)]),
            },
        );
        agent_step.depends_on = vec!["b".to_string()];
        agent_step.timeout_ms = Some(60_000);

        wf.steps.insert(a.id.clone(), a);
        wf.steps.insert(b.id.clone(), b);
        wf.steps.insert(agent_step.id.clone(), agent_step);

        wf.agents.insert(
            "coder".to_string(),
            AgentRegistration {
                session: session_name("wf-01", "coder"),
                workdir: PathBuf::from("/tmp/work"),
                current_step: None,
                alive: true,
            },
        );
        wf
    }

    // -----------------------------------------------------------------------
    // YAML round trip
    // -----------------------------------------------------------------------

    #[test]
    fn workflow_yaml_roundtrip() {
        let original = sample_workflow();
        let yaml = serde_yaml_ng::to_string(&original).expect("serialize to YAML");
        assert!(yaml.contains("wf-01"));
        assert!(yaml.contains("type: agent"));

        let parsed: Workflow = serde_yaml_ng::from_str(&yaml).expect("deserialize from YAML");
        assert_eq!(parsed.id, "wf-01");
        assert_eq!(parsed.steps.len(), 3);
        assert_eq!(parsed.agents.len(), 1);
    }

    #[test]
    fn workflow_yaml_roundtrip_is_byte_stable() {
        // Fixed timestamps: serialize -> deserialize -> serialize must be
        // byte-equivalent. BTreeMaps guarantee deterministic key order.
        let original = sample_workflow();
        let first = serde_yaml_ng::to_string(&original).unwrap();
        let reparsed: Workflow = serde_yaml_ng::from_str(&first).unwrap();
        let second = serde_yaml_ng::to_string(&reparsed).unwrap();
        assert_eq!(first, second);
    }

    // -----------------------------------------------------------------------
    // StepConfig variants
    // -----------------------------------------------------------------------

    #[test]
    fn step_config_shell_serde() {
        let config = StepConfig::Shell {
            command: "echo hi".to_string(),
            workdir: Some(PathBuf::from("/tmp")),
            env: BTreeMap::from([("KEY".to_string(), "val".to_string())]),
            on_error: OnError::Continue,
            max_retries: 2,
            outputs: BTreeMap::from([("result".to_string(), "stdout".to_string())]),
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"type\":\"shell\""));
        let parsed: StepConfig = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, StepConfig::Shell { .. }));
    }

    #[test]
    fn step_config_shell_defaults() {
        let toml = r#"
type = "shell"
command = "true"
"#;
        let config: StepConfig = toml::from_str(toml).unwrap();
        match config {
            StepConfig::Shell {
                on_error,
                max_retries,
                ..
            } => {
                assert_eq!(on_error, OnError::Fail);
                assert_eq!(max_retries, 3);
            }
            _ => panic!("expected shell config"),
        }
    }

    #[test]
    fn step_config_spawn_serde() {
        let config = StepConfig::Spawn {
            agent: "coder".to_string(),
            workdir: PathBuf::from("/tmp/work"),
            command: "claude".to_string(),
            env: BTreeMap::new(),
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"type\":\"spawn\""));
        let parsed: StepConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.executor_kind(), ExecutorKind::Spawn);
    }

    #[test]
    fn step_config_kill_graceful_default() {
        let toml = r#"
type = "kill"
agent = "coder"
"#;
        let config: StepConfig = toml::from_str(toml).unwrap();
        match config {
            StepConfig::Kill { graceful, .. } => assert!(graceful),
            _ => panic!("expected kill config"),
        }
    }

    #[test]
    fn step_config_branch_with_inline_target() {
        let config = StepConfig::Branch {
            condition: "test 1 = 1".to_string(),
            timeout_ms: Some(5000),
            on_true: Some(BranchTarget::Inline {
                steps: vec![InlineStep {
                    id: "notify".to_string(),
                    depends_on: vec![],
                    timeout: None,
                    config: StepConfig::Shell {
                        command: "echo notified".to_string(),
                        workdir: None,
                        env: BTreeMap::new(),
                        on_error: OnError::Fail,
                        max_retries: 3,
                        outputs: BTreeMap::new(),
                    },
                }],
            }),
            on_false: None,
            on_timeout: None,
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"kind\":\"inline\""));
        let parsed: StepConfig = serde_json::from_str(&json).unwrap();
        match parsed {
            StepConfig::Branch { on_true, .. } => match on_true.unwrap() {
                BranchTarget::Inline { steps } => assert_eq!(steps[0].id, "notify"),
                BranchTarget::Template { .. } => panic!("expected inline target"),
            },
            _ => panic!("expected branch config"),
        }
    }

    #[test]
    fn step_config_agent_schema_serde() {
        let config = StepConfig::Agent {
            agent: "coder".to_string(),
            prompt: "Fix the bug".to_string(),
            outputs: BTreeMap::from([
                ("summary".to_string(), OutputType::String),
                ("patch".to_string(), OutputType::FilePath),
            ]),
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"file_path\""));
        let parsed: StepConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.agent_id(), Some("coder"));
    }

    // -----------------------------------------------------------------------
    // Status predicates
    // -----------------------------------------------------------------------

    #[test]
    fn step_status_terminal_and_accepting() {
        assert!(StepStatus::Done.is_terminal());
        assert!(StepStatus::Failed.is_terminal());
        assert!(StepStatus::Skipped.is_terminal());
        assert!(!StepStatus::Completing.is_terminal());

        assert!(StepStatus::Done.is_accepting());
        assert!(StepStatus::Skipped.is_accepting());
        assert!(!StepStatus::Failed.is_accepting());
    }

    #[test]
    fn executor_kind_locality() {
        assert!(ExecutorKind::Shell.is_orchestrator_local());
        assert!(ExecutorKind::Branch.is_orchestrator_local());
        assert!(!ExecutorKind::Agent.is_orchestrator_local());
    }

    // -----------------------------------------------------------------------
    // OutputValue
    // -----------------------------------------------------------------------

    #[test]
    fn output_value_render() {
        assert_eq!(OutputValue::String("hi".to_string()).render(), "hi");
        assert_eq!(OutputValue::Number(3.0).render(), "3");
        assert_eq!(OutputValue::Bool(true).render(), "true");
        assert_eq!(
            OutputValue::Json(json!({"k": 1})).render(),
            r#"{"k":1}"#
        );
    }

    #[test]
    fn output_value_serde_tagged() {
        let v = OutputValue::Path(PathBuf::from("/tmp/work/out.txt"));
        let json = serde_json::to_string(&v).unwrap();
        assert!(json.contains("\"type\":\"path\""));
        let parsed: OutputValue = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, v);
    }

    // -----------------------------------------------------------------------
    // Session naming
    // -----------------------------------------------------------------------

    #[test]
    fn session_name_is_stable() {
        assert_eq!(session_name("wf-01", "coder"), "meow-wf-01-coder");
    }
}
