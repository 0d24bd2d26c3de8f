//! Variable substitution for template payloads.
//!
//! Supports `{{name}}` placeholders in step config strings and values.
//! Precedence is layered, highest first (step-level expand vars, then
//! workflow vars, then template defaults). A placeholder that is the
//! entire string ("pure reference") preserves the bound value's original
//! type; placeholders inside a larger string render to their stringified
//! form.
//!
//! References of the form `{{<step_id>.outputs.<key>}}` are never
//! resolved at bake time; [`resolve_output_refs`] resolves them at
//! dispatch time against the workflow's completed steps.

use std::collections::BTreeMap;

use meow_types::workflow::{BranchTarget, StepConfig, StepStatus, Workflow};
use serde_json::Value;

use super::ExpandError;

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// Layered variable bindings, highest precedence first.
pub struct VarScope<'a> {
    layers: Vec<&'a BTreeMap<String, Value>>,
}

impl<'a> VarScope<'a> {
    /// Build a scope from layers ordered highest-precedence first.
    pub fn new(layers: Vec<&'a BTreeMap<String, Value>>) -> Self {
        Self { layers }
    }

    /// Look up a name, trying each layer in order.
    pub fn lookup(&self, name: &str) -> Option<&'a Value> {
        self.layers.iter().find_map(|layer| layer.get(name))
    }
}

// ---------------------------------------------------------------------------
// Placeholder scanning
// ---------------------------------------------------------------------------

/// Find `{{ name }}` placeholders in a string. Returns byte ranges of the
/// full placeholder (braces included) and the trimmed inner name.
fn find_placeholders(input: &str) -> Vec<(usize, usize, &str)> {
    let mut found = Vec::new();
    let mut from = 0;
    while let Some(open) = input[from..].find("{{") {
        let start = from + open;
        let Some(close) = input[start + 2..].find("}}") else {
            break;
        };
        let end = start + 2 + close + 2;
        let name = input[start + 2..end - 2].trim();
        found.push((start, end, name));
        from = end;
    }
    found
}

/// Whether a placeholder name is a step-output reference, resolved at
/// dispatch time rather than bake time.
fn is_output_ref(name: &str) -> bool {
    name.contains(".outputs.")
}

// ---------------------------------------------------------------------------
// Substitution
// ---------------------------------------------------------------------------

/// Substitute placeholders in a string.
///
/// A pure reference (the whole string is one placeholder) returns the
/// bound value with its original type; composite strings render each
/// replacement. Output references pass through untouched. An unbound
/// name is an error unless `defer` is set, in which case the literal is
/// kept.
pub fn substitute_string(
    input: &str,
    scope: &VarScope<'_>,
    defer: bool,
) -> Result<Value, ExpandError> {
    let placeholders = find_placeholders(input);
    if placeholders.is_empty() {
        return Ok(Value::String(input.to_string()));
    }

    // Pure reference: preserve the bound value's type.
    if placeholders.len() == 1 {
        let (start, end, name) = placeholders[0];
        if start == 0 && end == input.len() && !is_output_ref(name) {
            return match scope.lookup(name) {
                Some(value) => Ok(value.clone()),
                None if defer => Ok(Value::String(input.to_string())),
                None => Err(ExpandError::VariableResolution(format!(
                    "undefined variable '{name}'"
                ))),
            };
        }
    }

    // Composite: render each replacement as a string.
    let mut result = String::with_capacity(input.len());
    let mut cursor = 0;
    for (start, end, name) in placeholders {
        result.push_str(&input[cursor..start]);
        if is_output_ref(name) {
            result.push_str(&input[start..end]);
        } else {
            match scope.lookup(name) {
                Some(value) => result.push_str(&render(value)),
                None if defer => result.push_str(&input[start..end]),
                None => {
                    return Err(ExpandError::VariableResolution(format!(
                        "undefined variable '{name}'"
                    )));
                }
            }
        }
        cursor = end;
    }
    result.push_str(&input[cursor..]);
    Ok(Value::String(result))
}

/// Substitute placeholders in a JSON value, recursing into objects and
/// arrays with the same precedence.
pub fn substitute_value(
    value: &Value,
    scope: &VarScope<'_>,
    defer: bool,
) -> Result<Value, ExpandError> {
    match value {
        Value::String(s) => substitute_string(s, scope, defer),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(substitute_value(item, scope, defer)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), substitute_value(v, scope, defer)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Substitute placeholders throughout a step config payload.
///
/// Branch targets are left untouched: they are substituted when the
/// branch materialises them, with branch-local variables layered in.
pub fn substitute_config(
    config: &StepConfig,
    scope: &VarScope<'_>,
    defer: bool,
) -> Result<StepConfig, ExpandError> {
    let sub = |s: &str| -> Result<String, ExpandError> {
        Ok(as_rendered(substitute_string(s, scope, defer)?))
    };

    let sub_map = |map: &BTreeMap<String, String>| -> Result<BTreeMap<String, String>, ExpandError> {
        map.iter()
            .map(|(k, v)| Ok((k.clone(), sub(v)?)))
            .collect()
    };

    match config {
        StepConfig::Shell {
            command,
            workdir,
            env,
            on_error,
            max_retries,
            outputs,
        } => Ok(StepConfig::Shell {
            command: sub(command)?,
            workdir: workdir.clone(),
            env: sub_map(env)?,
            on_error: *on_error,
            max_retries: *max_retries,
            outputs: sub_map(outputs)?,
        }),
        StepConfig::Spawn {
            agent,
            workdir,
            command,
            env,
        } => Ok(StepConfig::Spawn {
            agent: sub(agent)?,
            workdir: workdir.clone(),
            command: sub(command)?,
            env: sub_map(env)?,
        }),
        StepConfig::Kill { agent, graceful } => Ok(StepConfig::Kill {
            agent: sub(agent)?,
            graceful: *graceful,
        }),
        StepConfig::Expand { template, vars } => {
            let mut substituted = BTreeMap::new();
            for (k, v) in vars {
                substituted.insert(k.clone(), substitute_value(v, scope, defer)?);
            }
            Ok(StepConfig::Expand {
                template: sub(template)?,
                vars: substituted,
            })
        }
        StepConfig::Branch {
            condition,
            timeout_ms,
            on_true,
            on_false,
            on_timeout,
        } => Ok(StepConfig::Branch {
            condition: sub(condition)?,
            timeout_ms: *timeout_ms,
            on_true: on_true.clone(),
            on_false: on_false.clone(),
            on_timeout: on_timeout.clone(),
        }),
        StepConfig::Agent {
            agent,
            prompt,
            outputs,
        } => Ok(StepConfig::Agent {
            agent: sub(agent)?,
            prompt: sub(prompt)?,
            outputs: outputs.clone(),
        }),
    }
}

/// Branch-local variables layered over workflow variables, applied to an
/// inline or template target's vars map.
pub fn layer_branch_vars(
    target: &BranchTarget,
    workflow_vars: &BTreeMap<String, Value>,
) -> BTreeMap<String, Value> {
    let mut layered = workflow_vars.clone();
    if let BranchTarget::Template { vars, .. } = target {
        for (k, v) in vars {
            layered.insert(k.clone(), v.clone());
        }
    }
    layered
}

// ---------------------------------------------------------------------------
// Dispatch-time output references
// ---------------------------------------------------------------------------

/// Resolve `{{<step_id>.outputs.<key>}}` references against the
/// workflow's completed steps.
///
/// Unknown steps, non-done steps, and missing keys are errors: a step
/// reaching dispatch with an unresolvable reference is misconfigured.
pub fn resolve_output_refs(input: &str, workflow: &Workflow) -> Result<String, ExpandError> {
    let placeholders = find_placeholders(input);
    if placeholders.is_empty() {
        return Ok(input.to_string());
    }

    let mut result = String::with_capacity(input.len());
    let mut cursor = 0;
    for (start, end, name) in placeholders {
        result.push_str(&input[cursor..start]);
        if let Some((step_id, key)) = name.split_once(".outputs.") {
            let step = workflow.steps.get(step_id).ok_or_else(|| {
                ExpandError::VariableResolution(format!(
                    "output reference '{name}': no step '{step_id}'"
                ))
            })?;
            if step.status != StepStatus::Done {
                return Err(ExpandError::VariableResolution(format!(
                    "output reference '{name}': step '{step_id}' is {} (want done)",
                    step.status
                )));
            }
            let value = step.outputs.get(key).ok_or_else(|| {
                ExpandError::VariableResolution(format!(
                    "output reference '{name}': step '{step_id}' has no output '{key}'"
                ))
            })?;
            result.push_str(&value.render());
        } else {
            // Not an output reference; leave untouched (deferred vars).
            result.push_str(&input[start..end]);
        }
        cursor = end;
    }
    result.push_str(&input[cursor..]);
    Ok(result)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Render a JSON value for in-string replacement (compact JSON for
/// objects and arrays).
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn as_rendered(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => render(&other),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use meow_types::workflow::{OutputValue, Step, StepConfig};
    use serde_json::json;

    fn scope_with(vars: &BTreeMap<String, Value>) -> VarScope<'_> {
        VarScope::new(vec![vars])
    }

    // -----------------------------------------------------------------------
    // Pure references preserve type
    // -----------------------------------------------------------------------

    #[test]
    fn pure_reference_preserves_number_type() {
        let vars = BTreeMap::from([("count".to_string(), json!(42))]);
        let result = substitute_string("{{count}}", &scope_with(&vars), false).unwrap();
        assert_eq!(result, json!(42));
    }

    #[test]
    fn pure_reference_preserves_object_type() {
        let vars = BTreeMap::from([("cfg".to_string(), json!({"a": 1}))]);
        let result = substitute_string("{{cfg}}", &scope_with(&vars), false).unwrap();
        assert_eq!(result, json!({"a": 1}));
    }

    #[test]
    fn composite_renders_stringified() {
        let vars = BTreeMap::from([("count".to_string(), json!(42))]);
        let result =
            substitute_string("found {{count}} items", &scope_with(&vars), false).unwrap();
        assert_eq!(result, json!("found 42 items"));
    }

    #[test]
    fn whitespace_inside_braces_is_tolerated() {
        let vars = BTreeMap::from([("name".to_string(), json!("meow"))]);
        let result = substitute_string("hi {{ name }}", &scope_with(&vars), false).unwrap();
        assert_eq!(result, json!("hi meow"));
    }

    // -----------------------------------------------------------------------
    // Precedence
    // -----------------------------------------------------------------------

    #[test]
    fn higher_layer_wins() {
        let step_vars = BTreeMap::from([("target".to_string(), json!("step"))]);
        let wf_vars = BTreeMap::from([
            ("target".to_string(), json!("workflow")),
            ("other".to_string(), json!("wf-only")),
        ]);
        let scope = VarScope::new(vec![&step_vars, &wf_vars]);
        assert_eq!(
            substitute_string("{{target}}", &scope, false).unwrap(),
            json!("step")
        );
        assert_eq!(
            substitute_string("{{other}}", &scope, false).unwrap(),
            json!("wf-only")
        );
    }

    #[test]
    fn precedence_applies_inside_nested_objects() {
        let step_vars = BTreeMap::from([("env".to_string(), json!("prod"))]);
        let wf_vars = BTreeMap::from([("env".to_string(), json!("dev"))]);
        let scope = VarScope::new(vec![&step_vars, &wf_vars]);
        let value = json!({"deploy": {"target": "{{env}}"}, "list": ["{{env}}"]});
        let result = substitute_value(&value, &scope, false).unwrap();
        assert_eq!(result, json!({"deploy": {"target": "prod"}, "list": ["prod"]}));
    }

    // -----------------------------------------------------------------------
    // Defer and errors
    // -----------------------------------------------------------------------

    #[test]
    fn undefined_variable_is_error() {
        let vars = BTreeMap::new();
        let err = substitute_string("{{missing}}", &scope_with(&vars), false).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn undefined_variable_deferred_keeps_literal() {
        let vars = BTreeMap::new();
        let result = substitute_string("{{missing}}", &scope_with(&vars), true).unwrap();
        assert_eq!(result, json!("{{missing}}"));
    }

    #[test]
    fn output_refs_pass_through_at_bake_time() {
        let vars = BTreeMap::new();
        let result =
            substitute_string("{{build.outputs.artifact}}", &scope_with(&vars), false).unwrap();
        assert_eq!(result, json!("{{build.outputs.artifact}}"));
    }

    // -----------------------------------------------------------------------
    // Dispatch-time output resolution
    // -----------------------------------------------------------------------

    fn workflow_with_done_step() -> Workflow {
        let mut wf = Workflow::new("wf", Utc::now());
        let mut step = Step::new(
            "build",
            StepConfig::Shell {
                command: "true".to_string(),
                workdir: None,
                env: BTreeMap::new(),
                on_error: Default::default(),
                max_retries: 3,
                outputs: BTreeMap::new(),
            },
        );
        step.status = StepStatus::Done;
        step.outputs.insert(
            "artifact".to_string(),
            OutputValue::String("target/app".to_string()),
        );
        wf.steps.insert(step.id.clone(), step);
        wf
    }

    #[test]
    fn resolve_output_refs_against_done_step() {
        let wf = workflow_with_done_step();
        let result = resolve_output_refs("cp {{build.outputs.artifact}} /srv", &wf).unwrap();
        assert_eq!(result, "cp target/app /srv");
    }

    #[test]
    fn resolve_output_refs_unknown_step_errors() {
        let wf = workflow_with_done_step();
        let err = resolve_output_refs("{{nope.outputs.x}}", &wf).unwrap_err();
        assert!(err.to_string().contains("no step 'nope'"));
    }

    #[test]
    fn resolve_output_refs_missing_key_errors() {
        let wf = workflow_with_done_step();
        let err = resolve_output_refs("{{build.outputs.nope}}", &wf).unwrap_err();
        assert!(err.to_string().contains("no output 'nope'"));
    }

    #[test]
    fn resolve_output_refs_leaves_plain_vars() {
        let wf = workflow_with_done_step();
        let result = resolve_output_refs("{{name}}", &wf).unwrap();
        assert_eq!(result, "{{name}}");
    }

    // -----------------------------------------------------------------------
    // Config substitution
    // -----------------------------------------------------------------------

    #[test]
    fn substitute_config_shell_command_and_env() {
        let vars = BTreeMap::from([("branch".to_string(), json!("main"))]);
        let config = StepConfig::Shell {
            command: "git checkout {{branch}}".to_string(),
            workdir: None,
            env: BTreeMap::from([("BRANCH".to_string(), "{{branch}}".to_string())]),
            on_error: Default::default(),
            max_retries: 3,
            outputs: BTreeMap::new(),
        };
        let result = substitute_config(&config, &scope_with(&vars), false).unwrap();
        match result {
            StepConfig::Shell { command, env, .. } => {
                assert_eq!(command, "git checkout main");
                assert_eq!(env["BRANCH"], "main");
            }
            _ => panic!("expected shell config"),
        }
    }
}
