//! Test doubles for engine tests: an in-memory store and a scripted
//! session driver.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use meow_types::error::{SessionError, StoreError};
use meow_types::workflow::{OnError, Step, StepConfig, Workflow, WorkflowStatus};

use crate::session::{SessionDriver, SpawnRequest};
use crate::store::WorkflowStore;

// ---------------------------------------------------------------------------
// MemStore
// ---------------------------------------------------------------------------

/// In-memory workflow store with per-workflow async locks.
#[derive(Default)]
pub struct MemStore {
    workflows: Mutex<HashMap<String, Workflow>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, workflow: Workflow) {
        self.workflows
            .lock()
            .unwrap()
            .insert(workflow.id.clone(), workflow);
    }

    pub fn snapshot(&self, id: &str) -> Option<Workflow> {
        self.workflows.lock().unwrap().get(id).cloned()
    }
}

impl WorkflowStore for MemStore {
    type Lock = tokio::sync::OwnedMutexGuard<()>;

    async fn create(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let mut map = self.workflows.lock().unwrap();
        if map.contains_key(&workflow.id) {
            return Err(StoreError::Conflict(workflow.id.clone()));
        }
        map.insert(workflow.id.clone(), workflow.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Workflow, StoreError> {
        self.workflows
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn save(&self, workflow: &Workflow) -> Result<(), StoreError> {
        self.workflows
            .lock()
            .unwrap()
            .insert(workflow.id.clone(), workflow.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.workflows
            .lock()
            .unwrap()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn list(&self, filter: Option<WorkflowStatus>) -> Result<Vec<Workflow>, StoreError> {
        let mut all: Vec<Workflow> = self
            .workflows
            .lock()
            .unwrap()
            .values()
            .filter(|wf| filter.is_none_or(|status| wf.status == status))
            .cloned()
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn get_by_agent(&self, agent_id: &str) -> Result<Vec<Workflow>, StoreError> {
        Ok(self
            .workflows
            .lock()
            .unwrap()
            .values()
            .filter(|wf| wf.agents.contains_key(agent_id))
            .cloned()
            .collect())
    }

    fn try_lock(&self, id: &str) -> Result<Self::Lock, StoreError> {
        let lock = self
            .locks
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        lock.try_lock_owned()
            .map_err(|_| StoreError::LockConflict(id.to_string()))
    }
}

// ---------------------------------------------------------------------------
// ScriptedDriver
// ---------------------------------------------------------------------------

/// Session driver double that records calls and answers liveness from a
/// scripted set.
#[derive(Default)]
pub struct ScriptedDriver {
    pub alive: Mutex<HashSet<String>>,
    pub injected: Mutex<Vec<(String, String)>>,
    pub interrupted: Mutex<Vec<String>>,
    pub stopped: Mutex<Vec<(String, bool)>>,
    pub current: Mutex<HashMap<String, String>>,
    /// Agents whose prompt injections should fail.
    pub failing: Mutex<HashSet<String>>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_alive(&self, agent: &str) {
        self.alive.lock().unwrap().insert(agent.to_string());
    }

    pub fn injected_prompts(&self) -> Vec<(String, String)> {
        self.injected.lock().unwrap().clone()
    }

    pub fn interrupted_agents(&self) -> Vec<String> {
        self.interrupted.lock().unwrap().clone()
    }
}

impl SessionDriver for ScriptedDriver {
    async fn spawn(&self, request: &SpawnRequest) -> Result<String, SessionError> {
        let session = meow_types::workflow::session_name(&request.workflow_id, &request.agent_id);
        self.alive.lock().unwrap().insert(request.agent_id.clone());
        Ok(session)
    }

    async fn register(&self, _workflow_id: &str, _agent_id: &str, _session: &str, _workdir: &Path) {
    }

    async fn deregister(&self, agent_id: &str) {
        self.alive.lock().unwrap().remove(agent_id);
    }

    async fn inject_prompt(&self, agent_id: &str, prompt: &str) -> Result<(), SessionError> {
        if self.failing.lock().unwrap().contains(agent_id) {
            return Err(SessionError::SessionDead(agent_id.to_string()));
        }
        self.injected
            .lock()
            .unwrap()
            .push((agent_id.to_string(), prompt.to_string()));
        Ok(())
    }

    async fn stop(&self, agent_id: &str, graceful: bool) -> Result<(), SessionError> {
        self.stopped
            .lock()
            .unwrap()
            .push((agent_id.to_string(), graceful));
        self.alive.lock().unwrap().remove(agent_id);
        Ok(())
    }

    async fn interrupt(&self, agent_id: &str) -> Result<(), SessionError> {
        self.interrupted.lock().unwrap().push(agent_id.to_string());
        Ok(())
    }

    async fn is_running(&self, agent_id: &str) -> bool {
        self.alive.lock().unwrap().contains(agent_id)
    }

    async fn set_current_step(&self, agent_id: &str, step_id: Option<String>) {
        let mut current = self.current.lock().unwrap();
        match step_id {
            Some(step) => {
                current.insert(agent_id.to_string(), step);
            }
            None => {
                current.remove(agent_id);
            }
        }
    }

    async fn current_step(&self, agent_id: &str) -> Option<String> {
        self.current.lock().unwrap().get(agent_id).cloned()
    }
}

// ---------------------------------------------------------------------------
// Step builders
// ---------------------------------------------------------------------------

pub fn shell_step(id: &str, deps: Vec<&str>, command: &str) -> Step {
    let mut step = Step::new(
        id,
        StepConfig::Shell {
            command: command.to_string(),
            workdir: None,
            env: BTreeMap::new(),
            on_error: OnError::Fail,
            max_retries: 3,
            outputs: BTreeMap::new(),
        },
    );
    step.depends_on = deps.into_iter().map(String::from).collect();
    step
}

pub fn agent_step(id: &str, agent: &str, deps: Vec<&str>) -> Step {
    let mut step = Step::new(
        id,
        StepConfig::Agent {
            agent: agent.to_string(),
            prompt: format!("work on {id}"),
            outputs: BTreeMap::new(),
        },
    );
    step.depends_on = deps.into_iter().map(String::from).collect();
    step
}
