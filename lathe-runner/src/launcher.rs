//! Workflow launcher
//!
//! Accepts pipeline scripts, starts each one as a workflow execution and
//! exposes the state, output and report of the executions it started.
//! Each workflow runs in its own task; a semaphore bounds how many execute
//! at once, the rest wait in `Pending`.

use chrono::{DateTime, Utc};
use lathe_core::domain::log::LogEntry;
use lathe_core::domain::workflow::{ExecutionReport, WorkflowState};
use lathe_dsl::parse_pipeline;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::engine::{Engine, StateHandle};
use crate::error::{ExecutionError, LaunchError};
use crate::log_buffer::LogBufferService;
use crate::plugin::WORKFLOW_EXECUTION_ID;

type ExecutionTask = JoinHandle<Result<ExecutionReport, ExecutionError>>;

struct Workflow {
    state: StateHandle,
    submitted_at: DateTime<Utc>,
    task: Option<ExecutionTask>,
}

/// Listing entry for a submitted workflow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowSummary {
    pub id: String,
    pub state: WorkflowState,
    pub submitted_at: DateTime<Utc>,
}

/// Starts and tracks workflow executions
pub struct WorkflowLauncher {
    engine: Arc<Engine>,
    logs: Arc<dyn LogBufferService>,
    semaphore: Arc<Semaphore>,
    workflows: Mutex<HashMap<String, Workflow>>,
}

impl WorkflowLauncher {
    /// Creates a launcher running at most `max_parallel` workflows at once
    pub fn new(engine: Arc<Engine>, logs: Arc<dyn LogBufferService>, max_parallel: usize) -> Self {
        Self {
            engine,
            logs,
            semaphore: Arc::new(Semaphore::new(max_parallel)),
            workflows: Mutex::new(HashMap::new()),
        }
    }

    /// Parses a pipeline script and starts it
    ///
    /// # Arguments
    /// * `source` - Pipeline script text
    /// * `properties` - Execution properties; `workflowExecutionId` is assigned here
    ///
    /// # Returns
    /// The workflow execution id, as soon as the workflow is queued
    ///
    /// # Errors
    /// Returns the parse error for a malformed script; nothing is started.
    pub fn submit(
        &self,
        source: &str,
        mut properties: HashMap<String, Value>,
    ) -> Result<String, LaunchError> {
        let pipeline = parse_pipeline(source)?;

        let id = Uuid::new_v4().to_string();
        properties.insert(WORKFLOW_EXECUTION_ID.to_string(), Value::String(id.clone()));

        let state = StateHandle::new(WorkflowState::Pending);
        let task = self.spawn_execution(id.clone(), pipeline, properties, state.clone());

        self.lock().insert(
            id.clone(),
            Workflow {
                state,
                submitted_at: Utc::now(),
                task: Some(task),
            },
        );

        info!("Submitted workflow {}", id);
        Ok(id)
    }

    fn spawn_execution(
        &self,
        id: String,
        pipeline: lathe_core::domain::pipeline::Pipeline,
        properties: HashMap<String, Value>,
        state: StateHandle,
    ) -> ExecutionTask {
        let engine = Arc::clone(&self.engine);
        let logs = Arc::clone(&self.logs);
        let semaphore = Arc::clone(&self.semaphore);

        tokio::spawn(async move {
            // The semaphore is never closed
            let _permit = semaphore.acquire_owned().await.ok();

            let result = engine.execute(&pipeline, &properties, &state).await;
            if let Err(e) = &result {
                error!("Workflow {} could not run: {}", id, e);
                logs.add_entry(&id, LogEntry::error(e.to_string()));
            }

            // Pollers must see Done even when nothing ran
            state.advance(WorkflowState::Done);
            result
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Workflow>> {
        self.workflows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state of a workflow, `Undefined` for unknown ids
    pub fn query_state(&self, id: &str) -> WorkflowState {
        self.lock()
            .get(id)
            .map(|w| w.state.get())
            .unwrap_or(WorkflowState::Undefined)
    }

    /// State handle of a workflow, for callers that want to await transitions
    pub fn state_handle(&self, id: &str) -> Option<StateHandle> {
        self.lock().get(id).map(|w| w.state.clone())
    }

    /// Drains the output buffered for a workflow since the last call
    pub fn logs(&self, id: &str) -> Vec<LogEntry> {
        self.logs.drain(id)
    }

    /// Waits for a workflow to finish and takes its report
    ///
    /// # Errors
    /// - `UnknownWorkflow` for ids this launcher never issued
    /// - `AlreadyAwaited` if the report was already taken
    /// - `Execution` if the workflow could not run
    /// - `Aborted` if the execution task panicked
    pub async fn wait(&self, id: &str) -> Result<ExecutionReport, LaunchError> {
        let task = {
            let mut workflows = self.lock();
            let workflow = workflows
                .get_mut(id)
                .ok_or_else(|| LaunchError::UnknownWorkflow(id.to_string()))?;
            workflow
                .task
                .take()
                .ok_or_else(|| LaunchError::AlreadyAwaited(id.to_string()))?
        };

        let result = task.await.map_err(|e| LaunchError::Aborted {
            id: id.to_string(),
            reason: e.to_string(),
        })?;

        Ok(result?)
    }

    /// Submitted workflows, oldest first
    pub fn list(&self) -> Vec<WorkflowSummary> {
        let mut summaries: Vec<_> = self
            .lock()
            .iter()
            .map(|(id, w)| WorkflowSummary {
                id: id.clone(),
                state: w.state.get(),
                submitted_at: w.submitted_at,
            })
            .collect();
        summaries.sort_by_key(|s| s.submitted_at);
        summaries
    }

    /// Forgets a finished workflow and its buffered output
    ///
    /// Returns false if the workflow is unknown or not done yet.
    pub fn remove(&self, id: &str) -> bool {
        let mut workflows = self.lock();
        let done = workflows.get(id).is_some_and(|w| w.state.get().is_done());
        if done {
            workflows.remove(id);
            self.logs.remove(id);
        }
        done
    }
}
