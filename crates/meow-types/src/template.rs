//! Template module types.
//!
//! A template module is one `*.meow.toml` file holding named workflow
//! templates. The parser in `meow-core` deserializes into these types;
//! the expander bakes them into concrete [`crate::workflow::Step`]s.
//!
//! ```toml
//! [workflow.build]
//! default = true
//!
//! [[workflow.build.steps]]
//! id = "compile"
//! executor = "shell"
//!
//! [workflow.build.steps.config]
//! type = "shell"
//! command = "cargo build"
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::workflow::{ExecutorKind, InlineStep, StepConfig};

/// One parsed `*.meow.toml` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateModule {
    /// Named workflow templates in this module.
    #[serde(rename = "workflow")]
    pub workflows: BTreeMap<String, WorkflowTemplate>,
}

impl TemplateModule {
    /// Select the default workflow: the one marked `default = true`, else
    /// the sole workflow if the module holds exactly one, else the first
    /// by name.
    pub fn default_workflow(&self) -> Option<(&str, &WorkflowTemplate)> {
        if let Some((name, tpl)) = self.workflows.iter().find(|(_, t)| t.default) {
            return Some((name.as_str(), tpl));
        }
        self.workflows
            .iter()
            .next()
            .map(|(name, tpl)| (name.as_str(), tpl))
    }
}

/// A named workflow template inside a module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    /// Whether this is the module's default workflow.
    #[serde(default)]
    pub default: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Template-level variable defaults.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: BTreeMap<String, Value>,
    /// Ordered step declarations.
    pub steps: Vec<StepTemplate>,
}

/// One step declaration inside a workflow template.
///
/// Config strings may contain `{{name}}` placeholders, substituted at
/// bake time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTemplate {
    /// Local step identifier, prefixed with the parent id at bake time.
    pub id: String,
    /// Executor tag; must agree with the config payload variant.
    pub executor: ExecutorKind,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Step timeout as a duration string (e.g. "50ms", "5s", "10m").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    pub config: StepConfig,
}

impl From<InlineStep> for StepTemplate {
    fn from(inline: InlineStep) -> Self {
        let executor = inline.config.executor_kind();
        Self {
            id: inline.id,
            executor,
            depends_on: inline.depends_on,
            timeout: inline.timeout,
            config: inline.config,
        }
    }
}
