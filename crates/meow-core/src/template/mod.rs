//! Template module loading, validation, variable substitution, and baking.
//!
//! A template module is a `*.meow.toml` file holding named workflow
//! templates. The expander resolves a template reference to a module
//! path, loads it through the [`TemplateLoader`] seam, substitutes
//! variables, and bakes the steps into the live workflow with rewritten
//! identifiers and dependencies.

pub mod bake;
pub mod parser;
pub mod vars;

use std::path::PathBuf;

use meow_types::error::ErrorKind;
use thiserror::Error;

pub use parser::{TemplateLoader, TomlTemplateLoader, parse_duration};

/// Errors from template loading, variable resolution, and expansion.
#[derive(Debug, Error)]
pub enum ExpandError {
    /// No module file exists for the reference. `searched` lists every
    /// path that was tried.
    #[error("template not found: '{reference}' (searched: {})", format_searched(.searched))]
    TemplateNotFound {
        reference: String,
        searched: Vec<PathBuf>,
    },

    /// The module loaded but has no workflow with the requested name.
    #[error("workflow '{workflow}' not found in module '{module}'")]
    WorkflowNotFound { workflow: String, module: String },

    /// The module file failed to parse or validate.
    #[error("parse error: {0}")]
    Parse(String),

    /// A `{{name}}` reference has no binding and deferral was not
    /// requested.
    #[error("variable resolution error: {0}")]
    VariableResolution(String),

    /// Expansion nesting exceeded the depth limit.
    #[error("expansion depth {depth} exceeds maximum {max}")]
    DepthLimitExceeded { depth: u32, max: u32 },

    /// Expansion would exceed the total step limit.
    #[error("expansion would create {total} steps, exceeding maximum {max}")]
    TotalStepsExceeded { total: usize, max: usize },

    /// A baked step is structurally invalid (duplicate id, bad timeout).
    #[error("validation error: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExpandError {
    /// Map to the persisted error classification for a failed step.
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            ExpandError::TemplateNotFound { .. } => ErrorKind::TemplateNotFound,
            ExpandError::WorkflowNotFound { .. } => ErrorKind::TemplateNotFound,
            ExpandError::Parse(_) => ErrorKind::ParseError,
            ExpandError::VariableResolution(_) => ErrorKind::VariableResolution,
            ExpandError::DepthLimitExceeded { .. } => ErrorKind::DepthLimitExceeded,
            ExpandError::TotalStepsExceeded { .. } => ErrorKind::TotalStepsExceeded,
            ExpandError::Validation(_) => ErrorKind::Validation,
            ExpandError::Io(_) => ErrorKind::Store,
        }
    }
}

fn format_searched(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
