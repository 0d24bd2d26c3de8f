//! Template expander.
//!
//! Resolves a template reference to a module file, loads it through the
//! [`TemplateLoader`] seam, selects the target workflow, substitutes
//! variables, and bakes the steps into the live workflow under the
//! parent step's identifier. Expansion is bounded by a nesting-depth
//! limit and a total-step limit.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use meow_types::template::{StepTemplate, TemplateModule, WorkflowTemplate};
use meow_types::workflow::{
    BranchTarget, ExecutorKind, ExpandResult, Step, StepConfig, Workflow,
};

use crate::template::bake::bake_steps;
use crate::template::vars::{VarScope, layer_branch_vars};
use crate::template::{ExpandError, TemplateLoader};

/// Library template file extension.
const MODULE_EXTENSION: &str = ".meow.toml";

/// Expands template references into baked step sub-graphs.
pub struct Expander {
    loader: Arc<dyn TemplateLoader>,
    project_root: PathBuf,
    user_lib: PathBuf,
    max_depth: u32,
    max_total_steps: usize,
}

impl Expander {
    pub fn new(
        loader: Arc<dyn TemplateLoader>,
        project_root: PathBuf,
        user_lib: PathBuf,
        max_depth: u32,
        max_total_steps: usize,
    ) -> Self {
        Self {
            loader,
            project_root,
            user_lib,
            max_depth,
            max_total_steps,
        }
    }

    // -----------------------------------------------------------------------
    // Depth
    // -----------------------------------------------------------------------

    /// The number of expand ancestors of a step, following its
    /// `expanded_from` chain. Branch parents do not count.
    pub fn expansion_depth(workflow: &Workflow, step_id: &str) -> u32 {
        let mut depth = 0;
        let mut current = workflow
            .steps
            .get(step_id)
            .and_then(|s| s.expanded_from.as_deref());
        while let Some(parent_id) = current {
            let Some(parent) = workflow.steps.get(parent_id) else {
                break;
            };
            if parent.executor == ExecutorKind::Expand {
                depth += 1;
            }
            current = parent.expanded_from.as_deref();
        }
        depth
    }

    // -----------------------------------------------------------------------
    // Reference resolution
    // -----------------------------------------------------------------------

    /// Resolve a template reference to `(module path, workflow name)`.
    ///
    /// Resolution rules, tried in order:
    /// 1. local (`.name`, no separator) — the calling step's module;
    /// 2. module-qualified (`path#workflow`);
    /// 3. library (`lib/name`) — project scope then user scope;
    /// 4. explicit path (ends in `.toml` or contains a separator) —
    ///    the module's default workflow.
    pub fn resolve_reference(
        &self,
        reference: &str,
        source_module: Option<&Path>,
    ) -> Result<(PathBuf, Option<String>), ExpandError> {
        if let Some(name) = reference.strip_prefix('.') {
            if !reference.contains('/') {
                let module = source_module.ok_or_else(|| {
                    ExpandError::Validation(format!(
                        "local reference '{reference}' requires a calling step with a source module"
                    ))
                })?;
                return Ok((module.to_path_buf(), Some(name.to_string())));
            }
        }

        if let Some((path, workflow)) = reference.split_once('#') {
            let resolved = self.resolve_path(path, source_module);
            return Ok((resolved, Some(workflow.to_string())));
        }

        if let Some(name) = reference.strip_prefix("lib/") {
            let file = format!("{name}{MODULE_EXTENSION}");
            let project_path = self.project_root.join(".meow").join("lib").join(&file);
            let user_path = self.user_lib.join(&file);
            if project_path.exists() {
                return Ok((project_path, None));
            }
            if user_path.exists() {
                return Ok((user_path, None));
            }
            return Err(ExpandError::TemplateNotFound {
                reference: reference.to_string(),
                searched: vec![project_path, user_path],
            });
        }

        if reference.ends_with(".toml") || reference.contains('/') {
            return Ok((self.resolve_path(reference, source_module), None));
        }

        Err(ExpandError::Validation(format!(
            "named-template reference '{reference}' is not supported; \
             use a lib/ reference, a module path, or a local .name"
        )))
    }

    fn resolve_path(&self, path: &str, source_module: Option<&Path>) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            return path.to_path_buf();
        }
        match source_module.and_then(Path::parent) {
            Some(parent) => parent.join(path),
            None => self.project_root.join(path),
        }
    }

    /// Select a workflow from a loaded module by name, or the module's
    /// default.
    fn select_workflow<'m>(
        module: &'m TemplateModule,
        name: Option<&'m str>,
        module_path: &Path,
    ) -> Result<(&'m str, &'m WorkflowTemplate), ExpandError> {
        match name {
            Some(name) => module
                .workflows
                .get(name)
                .map(|tpl| (name, tpl))
                .ok_or_else(|| ExpandError::WorkflowNotFound {
                    workflow: name.to_string(),
                    module: module_path.display().to_string(),
                }),
            None => module
                .default_workflow()
                .ok_or_else(|| ExpandError::Parse(format!(
                    "module '{}' contains no workflows",
                    module_path.display()
                ))),
        }
    }

    // -----------------------------------------------------------------------
    // Expansion
    // -----------------------------------------------------------------------

    /// Expand an expand step into baked children.
    ///
    /// Enforces the depth limit before loading and the total-step limit
    /// before returning; on error no children are produced.
    pub fn expand(&self, workflow: &Workflow, step: &Step) -> Result<ExpandResult, ExpandError> {
        let StepConfig::Expand { template, vars } = &step.config else {
            return Err(ExpandError::Validation(format!(
                "step '{}' is not an expand step",
                step.id
            )));
        };

        let depth = Self::expansion_depth(workflow, &step.id);
        if depth >= self.max_depth {
            return Err(ExpandError::DepthLimitExceeded {
                depth,
                max: self.max_depth,
            });
        }

        let (module_path, workflow_name) =
            self.resolve_reference(template, step.source_module.as_deref())?;
        let module = self.loader.load_module(&module_path)?;
        let (name, tpl) =
            Self::select_workflow(&module, workflow_name.as_deref(), &module_path)?;

        tracing::debug!(
            workflow = workflow.id.as_str(),
            step = step.id.as_str(),
            template = name,
            module = %module_path.display(),
            depth,
            "expanding template"
        );

        let scope = VarScope::new(vec![vars, &workflow.vars, &tpl.vars]);
        let result = bake_steps(&step.id, &tpl.steps, &scope, false, Some(&module_path))?;
        self.check_insertable(workflow, &result)?;
        Ok(result)
    }

    /// Expand the top-level template for a fresh workflow: identifiers
    /// stay unprefixed, dependencies pass through verbatim, and no
    /// synthetic dependency is added.
    pub fn expand_top_level(
        &self,
        reference: &str,
        workflow_vars: &std::collections::BTreeMap<String, serde_json::Value>,
    ) -> Result<Vec<Step>, ExpandError> {
        let (module_path, workflow_name) = self.resolve_reference(reference, None)?;
        let module = self.loader.load_module(&module_path)?;
        let (name, tpl) =
            Self::select_workflow(&module, workflow_name.as_deref(), &module_path)?;

        if tpl.steps.len() > self.max_total_steps {
            return Err(ExpandError::TotalStepsExceeded {
                total: tpl.steps.len(),
                max: self.max_total_steps,
            });
        }

        tracing::info!(template = name, module = %module_path.display(), "expanding top-level template");

        let scope = VarScope::new(vec![workflow_vars, &tpl.vars]);
        let mut steps = Vec::with_capacity(tpl.steps.len());
        for template in &tpl.steps {
            let config = crate::template::vars::substitute_config(&template.config, &scope, false)?;
            let timeout_ms = match &template.timeout {
                Some(spec) => Some(
                    crate::template::parse_duration(spec)
                        .map_err(ExpandError::Validation)?
                        .as_millis() as u64,
                ),
                None => None,
            };
            let mut step = Step::new(template.id.clone(), config);
            step.depends_on = template.depends_on.clone();
            step.timeout_ms = timeout_ms;
            step.source_module = Some(module_path.clone());
            steps.push(step);
        }
        Ok(steps)
    }

    /// Expand a branch target (template or inline) under the branch
    /// step's identifier, with branch-local variables layered over
    /// workflow variables.
    pub fn expand_branch_target(
        &self,
        workflow: &Workflow,
        step: &Step,
        target: &BranchTarget,
    ) -> Result<ExpandResult, ExpandError> {
        let layered = layer_branch_vars(target, &workflow.vars);
        let result = match target {
            BranchTarget::Template { template, .. } => {
                let (module_path, workflow_name) =
                    self.resolve_reference(template, step.source_module.as_deref())?;
                let module = self.loader.load_module(&module_path)?;
                let (_, tpl) =
                    Self::select_workflow(&module, workflow_name.as_deref(), &module_path)?;
                let scope = VarScope::new(vec![&layered, &tpl.vars]);
                bake_steps(&step.id, &tpl.steps, &scope, false, Some(&module_path))?
            }
            BranchTarget::Inline { steps } => {
                let templates: Vec<StepTemplate> =
                    steps.iter().cloned().map(StepTemplate::from).collect();
                let scope = VarScope::new(vec![&layered]);
                bake_steps(
                    &step.id,
                    &templates,
                    &scope,
                    false,
                    step.source_module.as_deref(),
                )?
            }
        };
        self.check_insertable(workflow, &result)?;
        Ok(result)
    }

    /// Enforce the total-step limit and identifier uniqueness for an
    /// expansion about to be installed.
    fn check_insertable(
        &self,
        workflow: &Workflow,
        result: &ExpandResult,
    ) -> Result<(), ExpandError> {
        let total = workflow.steps.len() + result.steps.len();
        if total > self.max_total_steps {
            return Err(ExpandError::TotalStepsExceeded {
                total,
                max: self.max_total_steps,
            });
        }
        for id in &result.step_ids {
            if workflow.steps.contains_key(id) {
                return Err(ExpandError::Validation(format!(
                    "expansion child '{id}' collides with an existing step"
                )));
            }
        }
        Ok(())
    }
}

/// Install baked children into the workflow and record them on the
/// parent.
pub fn install_expansion(workflow: &mut Workflow, parent_id: &str, result: ExpandResult) {
    for step in result.steps {
        workflow.steps.insert(step.id.clone(), step);
    }
    if let Some(parent) = workflow.steps.get_mut(parent_id) {
        parent.expanded_into = result.step_ids;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::TomlTemplateLoader;
    use chrono::Utc;
    use std::collections::BTreeMap;

    const CHILD_MODULE: &str = r#"
[workflow.deploy]
default = true

[[workflow.deploy.steps]]
id = "package"
executor = "shell"

[workflow.deploy.steps.config]
type = "shell"
command = "tar cf {{artifact}}.tar target"

[[workflow.deploy.steps]]
id = "upload"
executor = "shell"
depends_on = ["package"]

[workflow.deploy.steps.config]
type = "shell"
command = "scp {{artifact}}.tar host:"
"#;

    fn project_with_module(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::TempDir::new().unwrap();
        let lib = dir.path().join(".meow").join("lib");
        std::fs::create_dir_all(&lib).unwrap();
        let path = lib.join("deploy.meow.toml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    fn expander(project_root: &Path) -> Expander {
        Expander::new(
            Arc::new(TomlTemplateLoader),
            project_root.to_path_buf(),
            project_root.join("userlib"),
            10,
            10_000,
        )
    }

    fn expand_step(id: &str, template: &str, vars: BTreeMap<String, serde_json::Value>) -> Step {
        Step::new(id, StepConfig::Expand {
            template: template.to_string(),
            vars,
        })
    }

    // -----------------------------------------------------------------------
    // Reference resolution
    // -----------------------------------------------------------------------

    #[test]
    fn local_reference_uses_source_module() {
        let (dir, module_path) = project_with_module(CHILD_MODULE);
        let exp = expander(dir.path());
        let (path, name) = exp
            .resolve_reference(".deploy", Some(&module_path))
            .unwrap();
        assert_eq!(path, module_path);
        assert_eq!(name.as_deref(), Some("deploy"));
    }

    #[test]
    fn local_reference_without_source_module_errors() {
        let (dir, _) = project_with_module(CHILD_MODULE);
        let exp = expander(dir.path());
        let err = exp.resolve_reference(".deploy", None).unwrap_err();
        assert!(err.to_string().contains("source module"));
    }

    #[test]
    fn module_qualified_reference_splits_name() {
        let (dir, _) = project_with_module(CHILD_MODULE);
        let exp = expander(dir.path());
        let (path, name) = exp
            .resolve_reference("modules/ci.meow.toml#build", None)
            .unwrap();
        assert_eq!(path, dir.path().join("modules/ci.meow.toml"));
        assert_eq!(name.as_deref(), Some("build"));
    }

    #[test]
    fn lib_reference_prefers_project_scope() {
        let (dir, module_path) = project_with_module(CHILD_MODULE);
        let exp = expander(dir.path());
        let (path, name) = exp.resolve_reference("lib/deploy", None).unwrap();
        assert_eq!(path, module_path);
        assert_eq!(name, None);
    }

    #[test]
    fn lib_reference_miss_lists_both_paths() {
        let dir = tempfile::TempDir::new().unwrap();
        let exp = expander(dir.path());
        let err = exp.resolve_reference("lib/absent", None).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains(".meow/lib/absent.meow.toml"));
        assert!(msg.contains("userlib"));
    }

    #[test]
    fn explicit_path_selects_default_workflow() {
        let (dir, _) = project_with_module(CHILD_MODULE);
        let exp = expander(dir.path());
        let (_, name) = exp
            .resolve_reference(".meow/lib/deploy.meow.toml", None)
            .unwrap();
        assert_eq!(name, None);
    }

    #[test]
    fn bare_name_is_unsupported() {
        let dir = tempfile::TempDir::new().unwrap();
        let exp = expander(dir.path());
        let err = exp.resolve_reference("deploy", None).unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }

    // -----------------------------------------------------------------------
    // Expansion
    // -----------------------------------------------------------------------

    #[test]
    fn expand_bakes_prefixed_children() {
        let (dir, _) = project_with_module(CHILD_MODULE);
        let exp = expander(dir.path());

        let mut wf = Workflow::new("wf", Utc::now());
        let step = expand_step(
            "release",
            "lib/deploy",
            BTreeMap::from([("artifact".to_string(), serde_json::json!("app"))]),
        );
        wf.steps.insert(step.id.clone(), step.clone());

        let result = exp.expand(&wf, &step).unwrap();
        assert_eq!(result.step_ids, vec!["release.package", "release.upload"]);
        assert_eq!(result.steps[1].depends_on, vec!["release.package"]);
        match &result.steps[0].config {
            StepConfig::Shell { command, .. } => {
                assert_eq!(command, "tar cf app.tar target");
            }
            _ => panic!("expected shell config"),
        }
    }

    #[test]
    fn step_vars_override_workflow_vars() {
        let (dir, _) = project_with_module(CHILD_MODULE);
        let exp = expander(dir.path());

        let mut wf = Workflow::new("wf", Utc::now());
        wf.vars
            .insert("artifact".to_string(), serde_json::json!("workflow-level"));
        let step = expand_step(
            "release",
            "lib/deploy",
            BTreeMap::from([("artifact".to_string(), serde_json::json!("step-level"))]),
        );
        wf.steps.insert(step.id.clone(), step.clone());

        let result = exp.expand(&wf, &step).unwrap();
        match &result.steps[0].config {
            StepConfig::Shell { command, .. } => {
                assert!(command.contains("step-level"), "got: {command}");
            }
            _ => panic!("expected shell config"),
        }
    }

    #[test]
    fn depth_limit_blocks_expansion() {
        let (dir, _) = project_with_module(CHILD_MODULE);
        let mut exp = expander(dir.path());
        exp.max_depth = 1;

        let mut wf = Workflow::new("wf", Utc::now());
        let outer = expand_step("outer", "lib/deploy", BTreeMap::new());
        wf.steps.insert(outer.id.clone(), outer);
        let mut inner = expand_step("outer.inner", "lib/deploy", BTreeMap::new());
        inner.expanded_from = Some("outer".to_string());
        wf.steps.insert(inner.id.clone(), inner.clone());

        let err = exp.expand(&wf, &inner).unwrap_err();
        assert!(matches!(err, ExpandError::DepthLimitExceeded { depth: 1, max: 1 }));
    }

    #[test]
    fn total_step_limit_blocks_expansion() {
        let (dir, _) = project_with_module(CHILD_MODULE);
        let mut exp = expander(dir.path());
        exp.max_total_steps = 2;

        let mut wf = Workflow::new("wf", Utc::now());
        let step = expand_step(
            "release",
            "lib/deploy",
            BTreeMap::from([("artifact".to_string(), serde_json::json!("a"))]),
        );
        wf.steps.insert(step.id.clone(), step.clone());

        // 1 existing + 2 children > 2
        let err = exp.expand(&wf, &step).unwrap_err();
        assert!(matches!(err, ExpandError::TotalStepsExceeded { .. }));
    }

    #[test]
    fn child_id_collision_rejected() {
        let (dir, _) = project_with_module(CHILD_MODULE);
        let exp = expander(dir.path());

        let mut wf = Workflow::new("wf", Utc::now());
        let step = expand_step(
            "release",
            "lib/deploy",
            BTreeMap::from([("artifact".to_string(), serde_json::json!("a"))]),
        );
        wf.steps.insert(step.id.clone(), step.clone());
        // Pre-existing step with a colliding identifier
        let squatter = expand_step("release.package", "lib/deploy", BTreeMap::new());
        wf.steps.insert(squatter.id.clone(), squatter);

        let err = exp.expand(&wf, &step).unwrap_err();
        assert!(err.to_string().contains("collides"));
    }

    #[test]
    fn expansion_depth_counts_only_expand_ancestors() {
        let mut wf = Workflow::new("wf", Utc::now());
        let top = expand_step("top", "lib/deploy", BTreeMap::new());
        wf.steps.insert(top.id.clone(), top);

        let mut child = expand_step("top.mid", "lib/deploy", BTreeMap::new());
        child.expanded_from = Some("top".to_string());
        wf.steps.insert(child.id.clone(), child);

        let mut grandchild = expand_step("top.mid.leaf", "lib/deploy", BTreeMap::new());
        grandchild.expanded_from = Some("top.mid".to_string());
        wf.steps.insert(grandchild.id.clone(), grandchild);

        assert_eq!(Expander::expansion_depth(&wf, "top"), 0);
        assert_eq!(Expander::expansion_depth(&wf, "top.mid"), 1);
        assert_eq!(Expander::expansion_depth(&wf, "top.mid.leaf"), 2);
    }

    // -----------------------------------------------------------------------
    // Installation
    // -----------------------------------------------------------------------

    #[test]
    fn install_records_children_on_parent() {
        let (dir, _) = project_with_module(CHILD_MODULE);
        let exp = expander(dir.path());

        let mut wf = Workflow::new("wf", Utc::now());
        let step = expand_step(
            "release",
            "lib/deploy",
            BTreeMap::from([("artifact".to_string(), serde_json::json!("a"))]),
        );
        wf.steps.insert(step.id.clone(), step.clone());

        let result = exp.expand(&wf, &step).unwrap();
        install_expansion(&mut wf, "release", result);

        assert_eq!(wf.steps.len(), 3);
        assert_eq!(
            wf.steps["release"].expanded_into,
            vec!["release.package", "release.upload"]
        );
        assert_eq!(
            wf.steps["release.package"].expanded_from.as_deref(),
            Some("release")
        );
    }
}
