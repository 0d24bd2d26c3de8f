//! Baking: turning template steps into concrete workflow steps.
//!
//! Baked children get parent-prefixed identifiers
//! (`<parent>.<child_local_id>`); dependencies on siblings within the
//! same expansion are rewritten the same way, dependencies on outside
//! identifiers pass through verbatim, and a child with no internal
//! dependencies gains a synthetic dependency on the parent step so it
//! becomes ready exactly when the expansion is installed.

use std::collections::HashSet;
use std::path::Path;

use meow_types::template::StepTemplate;
use meow_types::workflow::{ExpandResult, Step};

use super::parser::parse_duration;
use super::vars::{VarScope, substitute_config};
use super::ExpandError;

/// Bake template steps into workflow steps under `parent_id`.
pub fn bake_steps(
    parent_id: &str,
    templates: &[StepTemplate],
    scope: &VarScope<'_>,
    defer: bool,
    source_module: Option<&Path>,
) -> Result<ExpandResult, ExpandError> {
    let local_ids: HashSet<&str> = templates.iter().map(|t| t.id.as_str()).collect();

    let mut steps = Vec::with_capacity(templates.len());
    let mut step_ids = Vec::with_capacity(templates.len());

    for template in templates {
        let config = substitute_config(&template.config, scope, defer)?;
        let child_id = format!("{parent_id}.{}", template.id);

        let mut depends_on: Vec<String> = template
            .depends_on
            .iter()
            .map(|dep| {
                if local_ids.contains(dep.as_str()) {
                    format!("{parent_id}.{dep}")
                } else {
                    dep.clone()
                }
            })
            .collect();
        if depends_on.is_empty() {
            depends_on.push(parent_id.to_string());
        }

        let timeout_ms = match &template.timeout {
            Some(spec) => Some(
                parse_duration(spec)
                    .map_err(ExpandError::Validation)?
                    .as_millis() as u64,
            ),
            None => None,
        };

        let mut step = Step::new(child_id.clone(), config);
        step.depends_on = depends_on;
        step.expanded_from = Some(parent_id.to_string());
        step.timeout_ms = timeout_ms;
        step.source_module = source_module.map(Path::to_path_buf);

        step_ids.push(child_id);
        steps.push(step);
    }

    Ok(ExpandResult { steps, step_ids })
}
