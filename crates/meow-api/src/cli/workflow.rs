//! CLI workflow command handlers.
//!
//! Provides run, resume, list, status, cancel, and approve operations
//! over the project's workflow store and orchestrator.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::Value;

use meow_core::store::WorkflowStore;
use meow_types::workflow::{OutputValue, StepStatus, Workflow, WorkflowStatus};

use crate::orchestrator::Orchestrator;

// ---------------------------------------------------------------------------
// run / resume
// ---------------------------------------------------------------------------

/// `meow run <template>`: submit and drive to completion. Returns the
/// process exit code.
pub async fn handle_run(
    project_root: &Path,
    template: &str,
    var_args: &[String],
    json: bool,
) -> Result<i32> {
    let vars = parse_vars(var_args)?;
    let orchestrator = Orchestrator::init(project_root).await?;
    let _process_lock = orchestrator.lock_process()?;

    let created = orchestrator
        .start_or_resume(Some(template), vars)
        .await?;
    if let Some(id) = &created {
        if json {
            println!("{}", serde_json::json!({ "workflow": id }));
        } else {
            println!("{} workflow {}", style("created").green().bold(), style(id).cyan());
        }
    } else if !json {
        println!(
            "{} existing state found; resuming instead of re-expanding",
            style("note").yellow().bold()
        );
    }

    let all_done = orchestrator.run(created).await?;
    print_outcome(&orchestrator, json, all_done).await?;
    Ok(if all_done { 0 } else { 1 })
}

/// `meow resume`: pick up all non-terminal workflows after a restart.
pub async fn handle_resume(project_root: &Path, json: bool) -> Result<i32> {
    let orchestrator = Orchestrator::init(project_root).await?;
    let _process_lock = orchestrator.lock_process()?;

    orchestrator.start_or_resume(None, BTreeMap::new()).await?;
    let all_done = orchestrator.run(None).await?;
    print_outcome(&orchestrator, json, all_done).await?;
    Ok(if all_done { 0 } else { 1 })
}

async fn print_outcome(orchestrator: &Orchestrator, json: bool, all_done: bool) -> Result<()> {
    let workflows = orchestrator.store().list(None).await?;
    if json {
        let summary: Vec<_> = workflows
            .iter()
            .map(|wf| serde_json::json!({ "id": wf.id, "status": wf.status.to_string() }))
            .collect();
        println!(
            "{}",
            serde_json::json!({ "all_done": all_done, "workflows": summary })
        );
    } else {
        for wf in &workflows {
            println!("  {} {}", status_styled(wf.status), wf.id);
        }
        if all_done {
            println!("{}", style("all workflows done").green().bold());
        } else {
            println!("{}", style("some workflows did not finish cleanly").red().bold());
        }
    }
    Ok(())
}

/// Parse `--var key=value` pairs; values that parse as JSON keep their
/// type, everything else is a string.
fn parse_vars(pairs: &[String]) -> Result<BTreeMap<String, Value>> {
    let mut vars = BTreeMap::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("invalid --var '{pair}': expected key=value");
        };
        let parsed = serde_json::from_str(value).unwrap_or(Value::String(value.to_string()));
        vars.insert(key.to_string(), parsed);
    }
    Ok(vars)
}

// ---------------------------------------------------------------------------
// list
// ---------------------------------------------------------------------------

pub async fn handle_list(project_root: &Path, status: Option<&str>, json: bool) -> Result<()> {
    let filter = status.map(parse_status).transpose()?;
    let store = Orchestrator::open_store(project_root).await?;
    let workflows = store.list(filter).await?;

    if json {
        let rows: Vec<_> = workflows
            .iter()
            .map(|wf| {
                serde_json::json!({
                    "id": wf.id,
                    "status": wf.status.to_string(),
                    "steps": wf.steps.len(),
                    "done": done_count(wf),
                    "agents": wf.agents.len(),
                    "updated_at": wf.updated_at,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if workflows.is_empty() {
        println!("no workflows");
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_BORDERS_ONLY)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["ID", "STATUS", "STEPS", "AGENTS", "UPDATED"]);
    for wf in &workflows {
        table.add_row(vec![
            Cell::new(&wf.id),
            status_cell(wf.status),
            Cell::new(format!("{}/{}", done_count(wf), wf.steps.len())),
            Cell::new(wf.agents.len()),
            Cell::new(wf.updated_at.format("%Y-%m-%d %H:%M:%S").to_string()),
        ]);
    }
    println!("{table}");
    Ok(())
}

// ---------------------------------------------------------------------------
// status
// ---------------------------------------------------------------------------

pub async fn handle_status(project_root: &Path, id: &str, json: bool) -> Result<()> {
    let store = Orchestrator::open_store(project_root).await?;
    let workflow = store
        .get(id)
        .await
        .with_context(|| format!("workflow '{id}' not found"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&workflow)?);
        return Ok(());
    }

    println!(
        "{} {} ({})",
        style("workflow").bold(),
        style(&workflow.id).cyan(),
        status_styled(workflow.status)
    );
    if let Some(template) = &workflow.template {
        println!("  template: {template}");
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_BORDERS_ONLY)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["STEP", "EXECUTOR", "STATUS", "DETAIL"]);
    for step in workflow.steps.values() {
        let detail = match (&step.error, step.outputs.get("outcome")) {
            (Some(error), _) => format!("{}: {}", error.kind, error.message),
            (None, Some(OutputValue::String(outcome))) => format!("outcome: {outcome}"),
            _ => String::new(),
        };
        table.add_row(vec![
            Cell::new(&step.id),
            Cell::new(format!("{:?}", step.executor).to_lowercase()),
            step_status_cell(step.status),
            Cell::new(detail),
        ]);
    }
    println!("{table}");

    if !workflow.agents.is_empty() {
        let mut agents = Table::new();
        agents
            .load_preset(presets::UTF8_BORDERS_ONLY)
            .set_header(vec!["AGENT", "SESSION", "ALIVE", "CURRENT STEP"]);
        for (agent_id, registration) in &workflow.agents {
            agents.add_row(vec![
                Cell::new(agent_id),
                Cell::new(&registration.session),
                Cell::new(registration.alive),
                Cell::new(registration.current_step.as_deref().unwrap_or("-")),
            ]);
        }
        println!("{agents}");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// cancel
// ---------------------------------------------------------------------------

pub async fn handle_cancel(project_root: &Path, id: &str, json: bool) -> Result<()> {
    let store = Orchestrator::open_store(project_root).await?;
    let _lock = store
        .try_lock(id)
        .context("workflow is busy; try again in a moment")?;
    let mut workflow = store
        .get(id)
        .await
        .with_context(|| format!("workflow '{id}' not found"))?;

    if workflow.is_terminal() {
        bail!("workflow '{id}' is already {}", workflow.status);
    }

    workflow.status = WorkflowStatus::Cancelled;
    workflow.updated_at = Utc::now();
    store.save(&workflow).await?;

    if json {
        println!("{}", serde_json::json!({ "workflow": id, "status": "cancelled" }));
    } else {
        println!("{} {}", style("cancelled").yellow().bold(), id);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// approve
// ---------------------------------------------------------------------------

pub async fn handle_approve(
    project_root: &Path,
    workflow_id: &str,
    gate_id: &str,
    approved: bool,
    notes: Option<&str>,
    json: bool,
) -> Result<()> {
    let store = Orchestrator::open_store(project_root).await?;
    let _lock = store
        .try_lock(workflow_id)
        .context("workflow is busy; try again in a moment")?;
    let mut workflow = store
        .get(workflow_id)
        .await
        .with_context(|| format!("workflow '{workflow_id}' not found"))?;

    let step = workflow
        .steps
        .get_mut(gate_id)
        .with_context(|| format!("gate step '{gate_id}' not found"))?;
    if step.status != StepStatus::Running {
        bail!("gate '{gate_id}' is {} (expected running)", step.status);
    }

    step.outputs
        .insert("approved".to_string(), OutputValue::Bool(approved));
    if let Some(notes) = notes {
        step.outputs
            .insert("notes".to_string(), OutputValue::String(notes.to_string()));
    }
    workflow.updated_at = Utc::now();
    store.save(&workflow).await?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "workflow": workflow_id, "gate": gate_id, "approved": approved })
        );
    } else {
        let verdict = if approved {
            style("approved").green().bold()
        } else {
            style("denied").red().bold()
        };
        println!("{verdict} {workflow_id}/{gate_id}");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn done_count(workflow: &Workflow) -> usize {
    workflow
        .steps
        .values()
        .filter(|s| s.status == StepStatus::Done)
        .count()
}

fn parse_status(input: &str) -> Result<WorkflowStatus> {
    match input {
        "pending" => Ok(WorkflowStatus::Pending),
        "running" => Ok(WorkflowStatus::Running),
        "done" => Ok(WorkflowStatus::Done),
        "failed" => Ok(WorkflowStatus::Failed),
        "cancelled" => Ok(WorkflowStatus::Cancelled),
        other => bail!("unknown status '{other}'"),
    }
}

fn status_styled(status: WorkflowStatus) -> console::StyledObject<String> {
    let text = status.to_string();
    match status {
        WorkflowStatus::Done => style(text).green(),
        WorkflowStatus::Failed => style(text).red(),
        WorkflowStatus::Cancelled => style(text).yellow(),
        WorkflowStatus::Running => style(text).cyan(),
        WorkflowStatus::Pending => style(text).dim(),
    }
}

fn status_cell(status: WorkflowStatus) -> Cell {
    let cell = Cell::new(status.to_string());
    match status {
        WorkflowStatus::Done => cell.fg(Color::Green),
        WorkflowStatus::Failed => cell.fg(Color::Red),
        WorkflowStatus::Cancelled => cell.fg(Color::Yellow),
        WorkflowStatus::Running => cell.fg(Color::Cyan),
        WorkflowStatus::Pending => cell.fg(Color::Grey),
    }
}

fn step_status_cell(status: StepStatus) -> Cell {
    let cell = Cell::new(status.to_string());
    match status {
        StepStatus::Done => cell.fg(Color::Green),
        StepStatus::Failed => cell.fg(Color::Red),
        StepStatus::Skipped => cell.fg(Color::Yellow),
        StepStatus::Running | StepStatus::Completing => cell.fg(Color::Cyan),
        StepStatus::Pending => cell.fg(Color::Grey),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_vars_json_and_string() {
        let vars = parse_vars(&[
            "count=3".to_string(),
            "name=release".to_string(),
            "flags=[1,2]".to_string(),
        ])
        .unwrap();
        assert_eq!(vars["count"], serde_json::json!(3));
        assert_eq!(vars["name"], serde_json::json!("release"));
        assert_eq!(vars["flags"], serde_json::json!([1, 2]));
    }

    #[test]
    fn parse_vars_rejects_missing_equals() {
        assert!(parse_vars(&["oops".to_string()]).is_err());
    }

    #[test]
    fn parse_status_accepts_known_values() {
        assert_eq!(parse_status("done").unwrap(), WorkflowStatus::Done);
        assert!(parse_status("sideways").is_err());
    }
}
