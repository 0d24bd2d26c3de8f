//! Template module parsing and structural validation.
//!
//! The expander reads modules through the [`TemplateLoader`] seam so the
//! file format stays a collaborator concern; [`TomlTemplateLoader`] is
//! the provided implementation for `*.meow.toml` files.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use meow_types::template::{StepTemplate, TemplateModule};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

use super::ExpandError;

// ---------------------------------------------------------------------------
// Loader seam
// ---------------------------------------------------------------------------

/// Loads template modules for the expander.
pub trait TemplateLoader: Send + Sync {
    /// Load and validate the module at `path`.
    fn load_module(&self, path: &Path) -> Result<TemplateModule, ExpandError>;
}

/// Loads `*.meow.toml` modules from the filesystem.
#[derive(Debug, Default)]
pub struct TomlTemplateLoader;

impl TemplateLoader for TomlTemplateLoader {
    fn load_module(&self, path: &Path) -> Result<TemplateModule, ExpandError> {
        let content = std::fs::read_to_string(path)?;
        let module: TemplateModule = toml::from_str(&content)
            .map_err(|e| ExpandError::Parse(format!("{}: {e}", path.display())))?;
        validate_module(&module)?;
        Ok(module)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a parsed module.
///
/// Per workflow: at least one step, unique step ids, executor tags
/// agreeing with config payloads, dependency references to existing
/// sibling ids, and an acyclic dependency graph.
pub fn validate_module(module: &TemplateModule) -> Result<(), ExpandError> {
    if module.workflows.is_empty() {
        return Err(ExpandError::Parse(
            "module contains no workflows".to_string(),
        ));
    }

    for (name, workflow) in &module.workflows {
        if workflow.steps.is_empty() {
            return Err(ExpandError::Validation(format!(
                "workflow '{name}' has no steps"
            )));
        }

        let mut seen = HashSet::new();
        for step in &workflow.steps {
            if step.id.is_empty() || step.id.contains('.') {
                return Err(ExpandError::Validation(format!(
                    "workflow '{name}': step id '{}' must be non-empty and must not contain '.'",
                    step.id
                )));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(ExpandError::Validation(format!(
                    "workflow '{name}': duplicate step id '{}'",
                    step.id
                )));
            }
            if step.executor != step.config.executor_kind() {
                return Err(ExpandError::Validation(format!(
                    "workflow '{name}': step '{}' is tagged {:?} but configured as {:?}",
                    step.id,
                    step.executor,
                    step.config.executor_kind()
                )));
            }
            if let Some(timeout) = &step.timeout {
                parse_duration(timeout).map_err(|e| {
                    ExpandError::Validation(format!(
                        "workflow '{name}': step '{}': {e}",
                        step.id
                    ))
                })?;
            }
        }

        for step in &workflow.steps {
            for dep in &step.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(ExpandError::Validation(format!(
                        "workflow '{name}': step '{}' depends on unknown step '{dep}'",
                        step.id
                    )));
                }
            }
        }

        validate_dag(name, &workflow.steps)?;
    }

    Ok(())
}

/// Verify the step dependency graph is acyclic via topological sort.
fn validate_dag(workflow_name: &str, steps: &[StepTemplate]) -> Result<(), ExpandError> {
    let id_to_idx: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    let mut graph = DiGraph::<&str, ()>::new();
    let node_indices: Vec<_> = steps.iter().map(|s| graph.add_node(s.id.as_str())).collect();

    for step in steps {
        let to_idx = id_to_idx[step.id.as_str()];
        for dep in &step.depends_on {
            let from_idx = id_to_idx[dep.as_str()];
            graph.add_edge(node_indices[from_idx], node_indices[to_idx], ());
        }
    }

    toposort(&graph, None).map_err(|cycle| {
        let node_id = graph[cycle.node_id()];
        ExpandError::Validation(format!(
            "workflow '{workflow_name}': dependency cycle involving step '{node_id}'"
        ))
    })?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Duration strings
// ---------------------------------------------------------------------------

/// Parse a duration string like "50ms", "5s", "10m", or "1h".
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("duration '{trimmed}' is missing a unit"))?;
    let (digits, unit) = trimmed.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("duration '{trimmed}' has no numeric value"))?;

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(format!("unknown duration unit '{unit}' in '{trimmed}'")),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_module(dir: &tempfile::TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    const VALID: &str = r#"
[workflow.build]
default = true

[[workflow.build.steps]]
id = "compile"
executor = "shell"

[workflow.build.steps.config]
type = "shell"
command = "cargo build"

[[workflow.build.steps]]
id = "test"
executor = "shell"
depends_on = ["compile"]

[workflow.build.steps.config]
type = "shell"
command = "cargo test"
"#;

    // -----------------------------------------------------------------------
    // Loading
    // -----------------------------------------------------------------------

    #[test]
    fn load_valid_module() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_module(&dir, "build.meow.toml", VALID);
        let module = TomlTemplateLoader.load_module(&path).unwrap();
        assert_eq!(module.workflows.len(), 1);
        assert_eq!(module.workflows["build"].steps.len(), 2);
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let err = TomlTemplateLoader
            .load_module(Path::new("/nonexistent/x.meow.toml"))
            .unwrap_err();
        assert!(matches!(err, ExpandError::Io(_)));
    }

    #[test]
    fn load_invalid_toml_is_parse_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_module(&dir, "bad.meow.toml", "not [ valid toml");
        let err = TomlTemplateLoader.load_module(&path).unwrap_err();
        assert!(matches!(err, ExpandError::Parse(_)));
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    #[test]
    fn duplicate_step_id_rejected() {
        let toml = r#"
[workflow.w]

[[workflow.w.steps]]
id = "a"
executor = "shell"

[workflow.w.steps.config]
type = "shell"
command = "true"

[[workflow.w.steps]]
id = "a"
executor = "shell"

[workflow.w.steps.config]
type = "shell"
command = "true"
"#;
        let module: TemplateModule = ::toml::from_str(toml).unwrap();
        let err = validate_module(&module).unwrap_err();
        assert!(err.to_string().contains("duplicate step id"));
    }

    #[test]
    fn dotted_step_id_rejected() {
        // '.' is reserved as the expansion separator
        let toml = r#"
[workflow.w]

[[workflow.w.steps]]
id = "a.b"
executor = "shell"

[workflow.w.steps.config]
type = "shell"
command = "true"
"#;
        let module: TemplateModule = ::toml::from_str(toml).unwrap();
        assert!(validate_module(&module).is_err());
    }

    #[test]
    fn unknown_dependency_rejected() {
        let toml = r#"
[workflow.w]

[[workflow.w.steps]]
id = "a"
executor = "shell"
depends_on = ["missing"]

[workflow.w.steps.config]
type = "shell"
command = "true"
"#;
        let module: TemplateModule = ::toml::from_str(toml).unwrap();
        let err = validate_module(&module).unwrap_err();
        assert!(err.to_string().contains("unknown step 'missing'"));
    }

    #[test]
    fn dependency_cycle_rejected() {
        let toml = r#"
[workflow.w]

[[workflow.w.steps]]
id = "a"
executor = "shell"
depends_on = ["b"]

[workflow.w.steps.config]
type = "shell"
command = "true"

[[workflow.w.steps]]
id = "b"
executor = "shell"
depends_on = ["a"]

[workflow.w.steps.config]
type = "shell"
command = "true"
"#;
        let module: TemplateModule = ::toml::from_str(toml).unwrap();
        let err = validate_module(&module).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn executor_config_mismatch_rejected() {
        let toml = r#"
[workflow.w]

[[workflow.w.steps]]
id = "a"
executor = "agent"

[workflow.w.steps.config]
type = "shell"
command = "true"
"#;
        let module: TemplateModule = ::toml::from_str(toml).unwrap();
        let err = validate_module(&module).unwrap_err();
        assert!(err.to_string().contains("tagged"));
    }

    // -----------------------------------------------------------------------
    // Durations
    // -----------------------------------------------------------------------

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("50ms").unwrap(), Duration::from_millis(50));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn parse_duration_rejects_garbage() {
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("5").is_err());
        assert!(parse_duration("5fortnights").is_err());
    }
}
