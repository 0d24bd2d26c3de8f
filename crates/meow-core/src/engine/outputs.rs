//! Agent-step output validation.
//!
//! Validates reported outputs against the step's declared schema,
//! coercing stringified values (agents often shell out their reports via
//! command-line tools), and enforcing that `file_path` outputs exist and
//! stay inside the agent's working directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use meow_types::workflow::{OutputType, OutputValue};
use path_clean::PathClean;
use serde_json::Value;

/// One validation failure, keyed by output name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub key: String,
    pub message: String,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.key, self.message)
    }
}

/// Validate reported outputs against the declared schema.
///
/// Every declared key must be present and conform to its type; extra
/// keys are carried through as JSON. On any failure the full issue list
/// is returned so the agent can fix everything in one retry.
pub fn validate_outputs(
    declared: &BTreeMap<String, OutputType>,
    provided: &BTreeMap<String, Value>,
    workdir: &Path,
) -> Result<BTreeMap<String, OutputValue>, Vec<ValidationIssue>> {
    let mut validated = BTreeMap::new();
    let mut issues = Vec::new();

    for (key, expected) in declared {
        let Some(value) = provided.get(key) else {
            issues.push(ValidationIssue {
                key: key.clone(),
                message: "missing required output".to_string(),
            });
            continue;
        };
        match coerce(value, *expected, workdir) {
            Ok(output) => {
                validated.insert(key.clone(), output);
            }
            Err(message) => issues.push(ValidationIssue {
                key: key.clone(),
                message,
            }),
        }
    }

    // Undeclared extras are kept verbatim.
    for (key, value) in provided {
        if !declared.contains_key(key) {
            validated.insert(key.clone(), OutputValue::Json(value.clone()));
        }
    }

    if issues.is_empty() {
        Ok(validated)
    } else {
        Err(issues)
    }
}

/// Coerce a reported value to the expected type.
fn coerce(value: &Value, expected: OutputType, workdir: &Path) -> Result<OutputValue, String> {
    match expected {
        OutputType::String => match value {
            Value::String(s) => Ok(OutputValue::String(s.clone())),
            Value::Number(n) => Ok(OutputValue::String(n.to_string())),
            Value::Bool(b) => Ok(OutputValue::String(b.to_string())),
            other => Err(format!("expected string, got {}", type_name(other))),
        },
        OutputType::Number => match value {
            Value::Number(n) => n
                .as_f64()
                .map(OutputValue::Number)
                .ok_or_else(|| "number out of range".to_string()),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(OutputValue::Number)
                .map_err(|_| format!("expected number, got non-numeric string '{s}'")),
            other => Err(format!("expected number, got {}", type_name(other))),
        },
        OutputType::Boolean => match value {
            Value::Bool(b) => Ok(OutputValue::Bool(*b)),
            Value::String(s) => match s.trim() {
                "true" => Ok(OutputValue::Bool(true)),
                "false" => Ok(OutputValue::Bool(false)),
                other => Err(format!("expected boolean, got string '{other}'")),
            },
            other => Err(format!("expected boolean, got {}", type_name(other))),
        },
        OutputType::Json => match value {
            Value::String(s) => serde_json::from_str(s)
                .map(OutputValue::Json)
                .map_err(|e| format!("invalid JSON string: {e}")),
            other => Ok(OutputValue::Json(other.clone())),
        },
        OutputType::FilePath => {
            let Value::String(s) = value else {
                return Err(format!("expected file path, got {}", type_name(value)));
            };
            let path = PathBuf::from(s);
            if !path.exists() {
                return Err(format!("file does not exist: {s}"));
            }
            if !is_within_workdir(&path, workdir) {
                return Err(format!(
                    "path '{s}' escapes the agent workdir '{}'",
                    workdir.display()
                ));
            }
            Ok(OutputValue::Path(path))
        }
    }
}

/// Whether `path` equals the workdir or sits under it.
///
/// Both paths are cleaned and compared component-wise, so the check is
/// separator-anchored: `/tmp/workspace/evil.txt` is not inside
/// `/tmp/work`.
pub fn is_within_workdir(path: &Path, workdir: &Path) -> bool {
    let resolved = path
        .canonicalize()
        .unwrap_or_else(|_| path.to_path_buf())
        .clean();
    let base = workdir
        .canonicalize()
        .unwrap_or_else(|_| workdir.to_path_buf())
        .clean();
    resolved.starts_with(&base)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn declared(pairs: &[(&str, OutputType)]) -> BTreeMap<String, OutputType> {
        pairs
            .iter()
            .map(|(k, t)| (k.to_string(), *t))
            .collect()
    }

    fn provided(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Coercion
    // -----------------------------------------------------------------------

    #[test]
    fn string_accepts_scalars() {
        let result = validate_outputs(
            &declared(&[("a", OutputType::String), ("b", OutputType::String)]),
            &provided(&[("a", json!("hi")), ("b", json!(7))]),
            Path::new("/tmp"),
        )
        .unwrap();
        assert_eq!(result["a"], OutputValue::String("hi".to_string()));
        assert_eq!(result["b"], OutputValue::String("7".to_string()));
    }

    #[test]
    fn number_coerces_stringified() {
        let result = validate_outputs(
            &declared(&[("n", OutputType::Number)]),
            &provided(&[("n", json!("42"))]),
            Path::new("/tmp"),
        )
        .unwrap();
        assert_eq!(result["n"], OutputValue::Number(42.0));
    }

    #[test]
    fn boolean_coerces_stringified() {
        let result = validate_outputs(
            &declared(&[("ok", OutputType::Boolean)]),
            &provided(&[("ok", json!("true"))]),
            Path::new("/tmp"),
        )
        .unwrap();
        assert_eq!(result["ok"], OutputValue::Bool(true));
    }

    #[test]
    fn json_parses_string_payload() {
        let result = validate_outputs(
            &declared(&[("data", OutputType::Json)]),
            &provided(&[("data", json!(r#"{"k":1}"#))]),
            Path::new("/tmp"),
        )
        .unwrap();
        assert_eq!(result["data"], OutputValue::Json(json!({"k": 1})));
    }

    #[test]
    fn invalid_json_string_is_issue() {
        let issues = validate_outputs(
            &declared(&[("data", OutputType::Json)]),
            &provided(&[("data", json!("not json {"))]),
            Path::new("/tmp"),
        )
        .unwrap_err();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].key, "data");
    }

    #[test]
    fn missing_declared_key_is_issue() {
        let issues = validate_outputs(
            &declared(&[("verdict", OutputType::String)]),
            &provided(&[]),
            Path::new("/tmp"),
        )
        .unwrap_err();
        assert!(issues[0].message.contains("missing"));
    }

    #[test]
    fn all_issues_reported_at_once() {
        let issues = validate_outputs(
            &declared(&[("a", OutputType::Number), ("b", OutputType::Boolean)]),
            &provided(&[("a", json!("abc")), ("b", json!("maybe"))]),
            Path::new("/tmp"),
        )
        .unwrap_err();
        assert_eq!(issues.len(), 2);
    }

    #[test]
    fn undeclared_extras_carried_as_json() {
        let result = validate_outputs(
            &declared(&[]),
            &provided(&[("extra", json!([1, 2]))]),
            Path::new("/tmp"),
        )
        .unwrap();
        assert_eq!(result["extra"], OutputValue::Json(json!([1, 2])));
    }

    // -----------------------------------------------------------------------
    // File paths
    // -----------------------------------------------------------------------

    #[test]
    fn file_path_inside_workdir_accepted() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("out.txt");
        std::fs::write(&file, "data").unwrap();

        let result = validate_outputs(
            &declared(&[("report", OutputType::FilePath)]),
            &provided(&[("report", json!(file.display().to_string()))]),
            dir.path(),
        )
        .unwrap();
        assert!(matches!(result["report"], OutputValue::Path(_)));
    }

    #[test]
    fn missing_file_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let issues = validate_outputs(
            &declared(&[("report", OutputType::FilePath)]),
            &provided(&[("report", json!("/nonexistent/report.txt"))]),
            dir.path(),
        )
        .unwrap_err();
        assert!(issues[0].message.contains("does not exist"));
    }

    #[test]
    fn file_outside_workdir_rejected() {
        let outside = tempfile::TempDir::new().unwrap();
        let file = outside.path().join("evil.txt");
        std::fs::write(&file, "data").unwrap();
        let workdir = tempfile::TempDir::new().unwrap();

        let issues = validate_outputs(
            &declared(&[("report", OutputType::FilePath)]),
            &provided(&[("report", json!(file.display().to_string()))]),
            workdir.path(),
        )
        .unwrap_err();
        assert!(issues[0].message.contains("escapes"));
    }

    #[test]
    fn prefix_attack_rejected() {
        // /tmp/workspace shares a string prefix with /tmp/work but is a
        // different directory; the check must anchor on separators.
        assert!(!is_within_workdir(
            Path::new("/tmp/workspace/evil.txt"),
            Path::new("/tmp/work"),
        ));
    }

    #[test]
    fn workdir_itself_is_within() {
        assert!(is_within_workdir(Path::new("/tmp/work"), Path::new("/tmp/work")));
        assert!(is_within_workdir(
            Path::new("/tmp/work/sub/file.txt"),
            Path::new("/tmp/work"),
        ));
    }

    #[test]
    fn dot_segments_are_cleaned() {
        assert!(!is_within_workdir(
            Path::new("/tmp/work/../workspace/evil.txt"),
            Path::new("/tmp/work"),
        ));
    }
}
