//! Pipeline execution engine
//!
//! Walks a parsed pipeline:
//! - Stages run in document order; the first failing stage ends the walk
//! - Parallel branches of a stage run concurrently and are joined in arrival order
//! - Containerized stages get a container for the duration of their steps
//! - Each step is dispatched through the plugin registry under the retry policy
//!
//! A stage failure does not fail the execution. The workflow still reaches
//! `Done` and the report carries the partial results and the failed stage.

mod activity;
mod cancel;
mod state;

pub use activity::{RetryPolicy, StepActivity};
pub use cancel::CancelToken;
pub use state::StateHandle;

use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use lathe_core::domain::log::LogEntry;
use lathe_core::domain::pipeline::{Agent, Pipeline, Stage, Step};
use lathe_core::domain::workflow::{
    ExecutionReport, StageFailure, StageOutput, StageResults, WorkflowState,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::container::{ContainerManager, ContainerRuntime};
use crate::error::{ExecutionError, StepError};
use crate::log_buffer::LogBufferService;
use crate::plugin::{CONTAINER_ID, PluginRegistry, WORKFLOW_EXECUTION_ID};

/// Output of a stage and whether it completed
type StageRun = (StageOutput, Result<(), StepError>);

/// Executes pipelines against a plugin registry and a container runtime
pub struct Engine {
    activity: StepActivity,
    containers: ContainerManager,
    logs: Arc<dyn LogBufferService>,
}

impl Engine {
    pub fn new(
        registry: Arc<PluginRegistry>,
        runtime: Arc<dyn ContainerRuntime>,
        logs: Arc<dyn LogBufferService>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            activity: StepActivity::new(registry, policy),
            containers: ContainerManager::new(runtime),
            logs,
        }
    }

    /// Executes a pipeline to completion
    ///
    /// # Arguments
    /// * `pipeline` - The parsed pipeline
    /// * `properties` - Execution properties; must carry `workflowExecutionId`
    /// * `state` - Handle advanced through `Started`, `Running` and `Done`
    ///
    /// # Returns
    /// The per-stage results, including the failed stage if one failed
    ///
    /// # Errors
    /// Returns an error only if the correlation property is missing, in which
    /// case nothing runs and the state is left untouched.
    pub async fn execute(
        &self,
        pipeline: &Pipeline,
        properties: &HashMap<String, Value>,
        state: &StateHandle,
    ) -> Result<ExecutionReport, ExecutionError> {
        let workflow_id = workflow_id(properties)?;

        state.advance(WorkflowState::Started);
        info!(
            "Workflow {} started with {} stage(s)",
            workflow_id,
            pipeline.stages.len()
        );

        state.advance(WorkflowState::Running);

        let root = CancelToken::new();
        let mut report = ExecutionReport {
            workflow_id: workflow_id.clone(),
            stages: StageResults::new(),
            failure: None,
        };

        for stage in &pipeline.stages {
            self.log(&workflow_id, LogEntry::info(format!("Stage '{}' started", stage.name)));

            let (output, outcome) = self
                .run_stage(&workflow_id, stage, &pipeline.agent, &root, false)
                .await;
            report.stages.insert(stage.name.clone(), output);

            if let Err(e) = outcome {
                error!("Stage '{}' of workflow {} failed: {}", stage.name, workflow_id, e);
                self.log(
                    &workflow_id,
                    LogEntry::error(format!("Stage '{}' failed: {}", stage.name, e)),
                );
                report.failure = Some(StageFailure {
                    stage: stage.name.clone(),
                    error: e.to_string(),
                });
                break;
            }
        }

        state.advance(WorkflowState::Done);
        info!(
            "Workflow {} done ({})",
            workflow_id,
            if report.succeeded() { "success" } else { "failure" }
        );

        Ok(report)
    }

    fn log(&self, workflow_id: &str, entry: LogEntry) {
        self.logs.add_entry(workflow_id, entry);
    }

    /// Runs a stage: its parallel branches first, then its own steps
    fn run_stage<'a>(
        &'a self,
        workflow_id: &'a str,
        stage: &'a Stage,
        inherited: &'a Agent,
        cancel: &'a CancelToken,
        interrupt: bool,
    ) -> BoxFuture<'a, StageRun> {
        Box::pin(async move {
            let agent = stage.effective_agent(inherited);

            let mut branches = None;
            if !stage.parallel.is_empty() {
                let (results, outcome) = self.run_parallel(workflow_id, stage, agent, cancel).await;
                if let Err(e) = outcome {
                    return (StageOutput::from_parts(Some(results), None), Err(e));
                }
                branches = Some(results);
            }

            if stage.steps.is_empty() {
                return (StageOutput::from_parts(branches, None), Ok(()));
            }

            let (steps, outcome) = self
                .run_steps(workflow_id, stage, agent, cancel, interrupt)
                .await;
            (StageOutput::from_parts(branches, Some(steps)), outcome)
        })
    }

    /// Runs the branches of a stage concurrently
    ///
    /// The first failure cancels the remaining branches; the join still waits
    /// for every branch to settle and then reports that first failure.
    async fn run_parallel(
        &self,
        workflow_id: &str,
        stage: &Stage,
        agent: &Agent,
        cancel: &CancelToken,
    ) -> (StageResults, Result<(), StepError>) {
        let siblings = cancel.child();
        let interrupt = stage.is_fail_fast();
        let total = stage.parallel.len();

        debug!(
            "Stage '{}' running {} branch(es), failFast={}",
            stage.name, total, interrupt
        );

        let mut pending: FuturesUnordered<_> = stage
            .parallel
            .iter()
            .enumerate()
            .map(|(index, branch)| {
                let siblings = &siblings;
                async move {
                    let run = self
                        .run_stage(workflow_id, branch, agent, siblings, interrupt)
                        .await;
                    (index, run)
                }
            })
            .collect();

        let mut outputs: Vec<Option<StageOutput>> = vec![None; total];
        let mut first_error = None;
        let mut settled = 0;

        while let Some((index, (output, outcome))) = pending.next().await {
            settled += 1;
            let branch = &stage.parallel[index].name;

            match outcome {
                Ok(()) => debug!(
                    "Branch '{}' of stage '{}' finished ({}/{})",
                    branch, stage.name, settled, total
                ),
                Err(e) if first_error.is_none() => {
                    warn!(
                        "Branch '{}' of stage '{}' failed: {}, cancelling remaining branches",
                        branch, stage.name, e
                    );
                    siblings.cancel();
                    first_error = Some(e);
                }
                Err(e) => debug!(
                    "Branch '{}' of stage '{}' settled with {} ({}/{})",
                    branch, stage.name, e, settled, total
                ),
            }

            outputs[index] = Some(output);
        }

        let mut results = StageResults::new();
        for (branch, output) in stage.parallel.iter().zip(outputs) {
            if let Some(output) = output {
                results.insert(branch.name.clone(), output);
            }
        }

        (results, first_error.map_or(Ok(()), Err))
    }

    /// Runs the stage's own steps, inside a container for docker agents
    ///
    /// The container is released after the last step whether or not the
    /// steps succeeded.
    async fn run_steps(
        &self,
        workflow_id: &str,
        stage: &Stage,
        agent: &Agent,
        cancel: &CancelToken,
        interrupt: bool,
    ) -> (Vec<String>, Result<(), StepError>) {
        let Some(image) = agent.image_with_tag() else {
            return self
                .run_step_list(workflow_id, &stage.steps, None, cancel, interrupt)
                .await;
        };

        if cancel.is_cancelled() {
            return (Vec::new(), Err(StepError::Cancelled));
        }

        let container = match self.containers.acquire(&image).await {
            Ok(lease) => lease,
            Err(e) => {
                error!("Stage '{}' could not start its container: {:#}", stage.name, e);
                return (
                    Vec::new(),
                    Err(StepError::Container {
                        image,
                        message: format!("{:#}", e),
                    }),
                );
            }
        };

        self.log(
            workflow_id,
            LogEntry::info(format!(
                "Stage '{}' running in container {} ({})",
                stage.name,
                container.id(),
                image
            )),
        );

        let run = self
            .run_step_list(workflow_id, &stage.steps, Some(container.id()), cancel, interrupt)
            .await;

        container.release().await;
        run
    }

    /// Runs steps in order, stopping at the first failure
    ///
    /// A failed step contributes its error text to the output.
    async fn run_step_list(
        &self,
        workflow_id: &str,
        steps: &[Step],
        container_id: Option<&str>,
        cancel: &CancelToken,
        interrupt: bool,
    ) -> (Vec<String>, Result<(), StepError>) {
        let mut outputs = Vec::with_capacity(steps.len());

        for step in steps {
            if cancel.is_cancelled() {
                return (outputs, Err(StepError::Cancelled));
            }

            let (command, mut params) = step.to_command();
            params.insert(WORKFLOW_EXECUTION_ID, workflow_id);
            if let Some(container_id) = container_id {
                params.insert(CONTAINER_ID, container_id);
            }

            match self.activity.run(command, &params, cancel, interrupt).await {
                Ok(output) => outputs.push(output.unwrap_or_default()),
                Err(e) => {
                    outputs.push(e.to_string());
                    return (outputs, Err(e));
                }
            }
        }

        (outputs, Ok(()))
    }
}

fn workflow_id(properties: &HashMap<String, Value>) -> Result<String, ExecutionError> {
    match properties.get(WORKFLOW_EXECUTION_ID) {
        Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        Some(Value::Number(id)) => Ok(id.to_string()),
        _ => Err(ExecutionError::MissingProperty(
            WORKFLOW_EXECUTION_ID.to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::testing::{Call, FakeRuntime};
    use crate::log_buffer::InMemoryLogBuffer;
    use crate::plugin::PluginContext;
    use crate::plugin::registry::testing::{Behavior, ScriptedPlugin};
    use lathe_core::domain::pipeline::StepParams;
    use lathe_dsl::parse_pipeline;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Fixture {
        engine: Engine,
        runtime: Arc<FakeRuntime>,
        logs: Arc<InMemoryLogBuffer>,
        calls: Arc<AtomicU32>,
        seen: Arc<Mutex<Vec<StepParams>>>,
    }

    async fn fixture_with(runtime: FakeRuntime) -> Fixture {
        let logs = Arc::new(InMemoryLogBuffer::new());
        let runtime = Arc::new(runtime);
        let registry = Arc::new(PluginRegistry::new(PluginContext {
            logs: logs.clone(),
            containers: runtime.clone(),
            workspace_dir: std::env::temp_dir(),
        }));

        let plugin = ScriptedPlugin::new(&[
            ("echo", Behavior::Echo),
            ("quiet", Behavior::Silent),
            ("boom", Behavior::Fail("exit status 1".to_string())),
            ("slow", Behavior::Sleep(Duration::from_secs(2))),
            ("crash", Behavior::Panic),
        ]);
        let calls = plugin.calls.clone();
        let seen = plugin.seen.clone();
        registry.register("fake", Box::new(plugin)).await.unwrap();

        let policy = RetryPolicy {
            max_attempts: 1,
            attempt_timeout: Duration::from_secs(30),
            ..RetryPolicy::default()
        };

        Fixture {
            engine: Engine::new(registry, runtime.clone(), logs.clone(), policy),
            runtime,
            logs,
            calls,
            seen,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(FakeRuntime::default()).await
    }

    fn properties() -> HashMap<String, Value> {
        HashMap::from([(
            WORKFLOW_EXECUTION_ID.to_string(),
            Value::String("wf-1".to_string()),
        )])
    }

    async fn run(fixture: &Fixture, source: &str) -> (ExecutionReport, StateHandle) {
        let pipeline = parse_pipeline(source).unwrap();
        let state = StateHandle::new(WorkflowState::Pending);
        let report = fixture
            .engine
            .execute(&pipeline, &properties(), &state)
            .await
            .unwrap();
        (report, state)
    }

    fn steps<'a>(results: &'a StageResults, name: &str) -> Vec<&'a str> {
        results
            .get(name)
            .and_then(|o| o.steps())
            .unwrap_or_default()
            .iter()
            .map(String::as_str)
            .collect()
    }

    #[tokio::test]
    async fn test_sequential_stages_collect_outputs() {
        let fixture = fixture().await;
        let (report, state) = run(
            &fixture,
            "pipeline { agent none stages {
                stage('Build') { steps { echo 'compiling' quiet 'x' } }
                stage('Test') { steps { echo 'testing' } }
            } }",
        )
        .await;

        assert!(report.succeeded());
        assert_eq!(state.get(), WorkflowState::Done);
        assert_eq!(steps(&report.stages, "Build"), vec!["compiling", ""]);
        assert_eq!(steps(&report.stages, "Test"), vec!["testing"]);

        let names: Vec<_> = report.stages.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["Build", "Test"]);
    }

    #[tokio::test]
    async fn test_step_params_carry_workflow_id() {
        let fixture = fixture().await;
        run(
            &fixture,
            "pipeline { agent none stages { stage('S') { steps { echo level: 'info', text: 'hi' } } } }",
        )
        .await;

        let seen = fixture.seen.lock().unwrap();
        let pairs: Vec<_> = seen[0].iter().collect();
        assert_eq!(
            pairs,
            vec![("level", "info"), ("text", "hi"), (WORKFLOW_EXECUTION_ID, "wf-1")]
        );
        assert!(!seen[0].contains_key(CONTAINER_ID));
    }

    #[tokio::test]
    async fn test_failed_step_records_error_and_finishes() {
        let fixture = fixture().await;
        let (report, state) = run(
            &fixture,
            "pipeline { agent none stages {
                stage('Build') { steps { echo 'before' boom 'make' echo 'never' } }
                stage('Deploy') { steps { echo 'skipped' } }
            } }",
        )
        .await;

        assert_eq!(state.get(), WorkflowState::Done);
        assert_eq!(steps(&report.stages, "Build"), vec!["before", "exit status 1"]);
        assert!(report.stages.get("Deploy").is_none());

        let failure = report.failure.unwrap();
        assert_eq!(failure.stage, "Build");
        assert_eq!(failure.error, "exit status 1");
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 2);

        let logs: Vec<_> = fixture.logs.drain("wf-1").into_iter().map(|e| e.message).collect();
        assert!(logs.contains(&"Stage 'Build' failed: exit status 1".to_string()));
    }

    #[tokio::test]
    async fn test_unresolved_command_fails_stage() {
        let fixture = fixture().await;
        let (report, state) = run(
            &fixture,
            "pipeline { agent none stages { stage('Ship') { steps { deploy 'prod' } } } }",
        )
        .await;

        assert_eq!(state.get(), WorkflowState::Done);
        assert_eq!(
            steps(&report.stages, "Ship"),
            vec!["no plugin registered for command 'deploy'"]
        );
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_state_sequence_is_monotonic() {
        let fixture = fixture().await;
        let pipeline = parse_pipeline(
            "pipeline { agent none stages { stage('S') { steps { boom 'x' } } } }",
        )
        .unwrap();
        let state = StateHandle::new(WorkflowState::Pending);

        let mut rx = state.subscribe();
        let observer = tokio::spawn(async move {
            let mut observed = Vec::new();
            while rx.changed().await.is_ok() {
                let current = *rx.borrow_and_update();
                observed.push(current);
                if current.is_done() {
                    break;
                }
            }
            observed
        });

        fixture
            .engine
            .execute(&pipeline, &properties(), &state)
            .await
            .unwrap();

        let observed = observer.await.unwrap();
        assert_eq!(observed.last(), Some(&WorkflowState::Done));
        assert!(observed.windows(2).all(|w| w[0] < w[1]));
        assert!(observed.iter().all(|s| *s >= WorkflowState::Started));
    }

    #[tokio::test]
    async fn test_missing_workflow_id_is_rejected() {
        let fixture = fixture().await;
        let pipeline =
            parse_pipeline("pipeline { agent none stages { stage('S') { steps { echo 'x' } } } }")
                .unwrap();
        let state = StateHandle::new(WorkflowState::Pending);

        let err = fixture
            .engine
            .execute(&pipeline, &HashMap::new(), &state)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ExecutionError::MissingProperty(WORKFLOW_EXECUTION_ID.to_string())
        );
        assert_eq!(state.get(), WorkflowState::Pending);
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_failure_waits_for_running_branch() {
        let fixture = fixture().await;
        let started = tokio::time::Instant::now();
        let (report, state) = run(
            &fixture,
            "pipeline { agent none stages {
                stage('Checks') { parallel {
                    stage('Branch A') { steps { slow 'a1' echo 'a2' } }
                    stage('Branch B') { steps { boom 'b' } }
                } }
                stage('After') { steps { echo 'skipped' } }
            } }",
        )
        .await;

        // Branch A's in-flight step is not interrupted; it stops before its next step
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(state.get(), WorkflowState::Done);

        let failure = report.failure.unwrap();
        assert_eq!(failure.stage, "Checks");
        assert_eq!(failure.error, "exit status 1");

        let branches = report.stages.get("Checks").and_then(|o| o.branches()).unwrap();
        assert_eq!(steps(branches, "Branch A"), vec!["a1"]);
        assert_eq!(steps(branches, "Branch B"), vec!["exit status 1"]);
        assert!(report.stages.get("After").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_fast_interrupts_running_branch() {
        let fixture = fixture().await;
        let started = tokio::time::Instant::now();
        let (report, _) = run(
            &fixture,
            "pipeline { agent none stages {
                stage('Checks') { failFast true parallel {
                    stage('Branch A') { steps { slow 'a1' } }
                    stage('Branch B') { steps { boom 'b' } }
                } }
            } }",
        )
        .await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(report.failure.unwrap().error, "exit status 1");

        let branches = report.stages.get("Checks").and_then(|o| o.branches()).unwrap();
        assert_eq!(steps(branches, "Branch A"), vec!["step cancelled"]);
    }

    #[tokio::test]
    async fn test_parallel_success_then_own_steps() {
        let fixture = fixture().await;
        let (report, _) = run(
            &fixture,
            "pipeline { agent none stages {
                stage('Matrix') {
                    steps { echo 'combine' }
                    parallel {
                        stage('Linux') { steps { echo 'linux' } }
                        stage('Mac') { steps { echo 'mac' } }
                    }
                }
            } }",
        )
        .await;

        assert!(report.succeeded());
        let output = report.stages.get("Matrix").unwrap();
        assert_eq!(output.steps().unwrap(), ["combine".to_string()]);

        let branches = output.branches().unwrap();
        let names: Vec<_> = branches.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["Linux", "Mac"]);
        assert_eq!(steps(branches, "Mac"), vec!["mac"]);
    }

    #[tokio::test]
    async fn test_container_is_released_after_failed_step() {
        let fixture = fixture().await;
        let (report, _) = run(
            &fixture,
            "pipeline { agent none stages {
                stage('Build') {
                    agent { docker 'maven:3.9.3-eclipse-temurin-17' }
                    steps { echo 'mvn --version' boom 'mvn test' }
                }
            } }",
        )
        .await;

        assert!(!report.succeeded());
        assert_eq!(
            fixture.runtime.calls(),
            vec![
                Call::Pull("maven:3.9.3-eclipse-temurin-17".to_string()),
                Call::Start("ctr-1=maven:3.9.3-eclipse-temurin-17".to_string()),
                Call::Stop("ctr-1".to_string()),
            ]
        );

        let seen = fixture.seen.lock().unwrap();
        assert!(seen.iter().all(|p| p.get(CONTAINER_ID) == Some("ctr-1")));
    }

    #[tokio::test]
    async fn test_every_started_container_is_stopped_once() {
        let fixture = fixture().await;
        run(
            &fixture,
            "pipeline { agent { docker 'node' } stages {
                stage('Checks') { parallel {
                    stage('Lint') { steps { echo 'lint' } }
                    stage('Unit') { steps { boom 'test' } }
                    stage('Host') { agent none steps { echo 'host' } }
                } }
            } }",
        )
        .await;

        let starts = fixture.runtime.count(|c| matches!(c, Call::Start(_)));
        let stops = fixture.runtime.count(|c| matches!(c, Call::Stop(_)));
        assert_eq!(starts, 2);
        assert_eq!(stops, 2);
        assert!(
            fixture
                .runtime
                .calls()
                .iter()
                .all(|c| !matches!(c, Call::Pull(image) if image != "node:latest"))
        );
    }

    #[tokio::test]
    async fn test_container_start_failure_runs_no_steps() {
        let fixture = fixture_with(FakeRuntime {
            fail_pull: true,
            ..Default::default()
        })
        .await;
        let (report, state) = run(
            &fixture,
            "pipeline { agent { docker 'missing/image' } stages {
                stage('Build') { steps { echo 'x' } }
            } }",
        )
        .await;

        assert_eq!(state.get(), WorkflowState::Done);
        let failure = report.failure.unwrap();
        assert!(failure.error.contains("missing/image:latest"));
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 0);
        assert_eq!(fixture.runtime.count(|c| matches!(c, Call::Stop(_))), 0);
    }

    #[tokio::test]
    async fn test_container_stop_failure_is_not_fatal() {
        let fixture = fixture_with(FakeRuntime {
            fail_stop: true,
            ..Default::default()
        })
        .await;
        let (report, _) = run(
            &fixture,
            "pipeline { agent { docker 'alpine:3' } stages {
                stage('One') { steps { echo '1' } }
                stage('Two') { steps { echo '2' } }
            } }",
        )
        .await;

        assert!(report.succeeded());
        assert_eq!(fixture.runtime.count(|c| matches!(c, Call::Stop(_))), 2);
    }

    #[tokio::test]
    async fn test_stage_without_steps_starts_no_container() {
        let fixture = fixture_with(FakeRuntime {
            fail_pull: true,
            ..Default::default()
        })
        .await;
        let (report, _) = run(
            &fixture,
            "pipeline { agent { docker 'alpine' } stages {
                stage('Marker') { }
                stage('Build') { agent none steps { echo 'x' } }
            } }",
        )
        .await;

        assert!(report.succeeded());
        assert!(fixture.runtime.calls().is_empty());
        assert!(steps(&report.stages, "Marker").is_empty());
        assert_eq!(steps(&report.stages, "Build"), vec!["x"]);
    }

    #[tokio::test]
    async fn test_container_is_stopped_when_a_plugin_panics() {
        use futures::FutureExt;
        use std::panic::AssertUnwindSafe;

        let fixture = fixture().await;
        let pipeline = parse_pipeline(
            "pipeline { agent { docker 'alpine' } stages {
                stage('Build') { steps { crash 'make' } }
            } }",
        )
        .unwrap();
        let state = StateHandle::new(WorkflowState::Pending);

        let outcome = AssertUnwindSafe(fixture.engine.execute(&pipeline, &properties(), &state))
            .catch_unwind()
            .await;
        assert!(outcome.is_err());

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            fixture.runtime.calls().last(),
            Some(&Call::Stop("ctr-1".to_string()))
        );
    }
}
