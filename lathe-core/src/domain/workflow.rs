//! Workflow domain types
//!
//! Lifecycle state of a pipeline execution and the results it accumulates.

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Lifecycle marker of a single pipeline execution
///
/// Transitions are monotonic: `Pending → Started → Running → Done`.
/// `Undefined` is reported for executions the caller does not know about.
/// Serialized as its numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "i64", try_from = "i64")]
#[repr(i64)]
pub enum WorkflowState {
    Undefined = -1,
    Pending = 0,
    Started = 1,
    Running = 2,
    Done = 3,
}

impl WorkflowState {
    /// Numeric code exposed to external pollers
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            -1 => Some(WorkflowState::Undefined),
            0 => Some(WorkflowState::Pending),
            1 => Some(WorkflowState::Started),
            2 => Some(WorkflowState::Running),
            3 => Some(WorkflowState::Done),
            _ => None,
        }
    }

    pub fn is_done(self) -> bool {
        self == WorkflowState::Done
    }
}

impl From<WorkflowState> for i64 {
    fn from(state: WorkflowState) -> Self {
        state.code()
    }
}

impl TryFrom<i64> for WorkflowState {
    type Error = String;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        WorkflowState::from_code(code)
            .ok_or_else(|| format!("unknown workflow state code {}", code))
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkflowState::Undefined => "undefined",
            WorkflowState::Pending => "pending",
            WorkflowState::Started => "started",
            WorkflowState::Running => "running",
            WorkflowState::Done => "done",
        };
        f.write_str(name)
    }
}

/// Result recorded for one stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum StageOutput {
    /// Per-step output strings, in step order
    Steps(Vec<String>),
    /// Results of parallel branches keyed by branch name
    Branches(StageResults),
    /// A stage with both parallel branches and its own steps
    Combined {
        branches: StageResults,
        steps: Vec<String>,
    },
}

impl StageOutput {
    /// Builds the output of a stage from what it produced
    pub fn from_parts(branches: Option<StageResults>, steps: Option<Vec<String>>) -> Self {
        match (branches, steps) {
            (Some(branches), Some(steps)) => StageOutput::Combined { branches, steps },
            (Some(branches), None) => StageOutput::Branches(branches),
            (None, steps) => StageOutput::Steps(steps.unwrap_or_default()),
        }
    }

    /// Step outputs of this stage, if it ran any steps of its own
    pub fn steps(&self) -> Option<&[String]> {
        match self {
            StageOutput::Steps(steps) | StageOutput::Combined { steps, .. } => {
                Some(steps.as_slice())
            }
            StageOutput::Branches(_) => None,
        }
    }

    /// Branch results of this stage, if it had parallel branches
    pub fn branches(&self) -> Option<&StageResults> {
        match self {
            StageOutput::Branches(branches) | StageOutput::Combined { branches, .. } => {
                Some(branches)
            }
            StageOutput::Steps(_) => None,
        }
    }
}

/// Stage name to output, in the order stages were recorded
///
/// Recording a name twice replaces the earlier output at its original position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageResults(Vec<(String, StageOutput)>);

impl StageResults {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn insert(&mut self, name: impl Into<String>, output: StageOutput) {
        let name = name.into();
        match self.0.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = output,
            None => self.0.push((name, output)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&StageOutput> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, o)| o)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &StageOutput)> {
        self.0.iter().map(|(n, o)| (n.as_str(), o))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for StageResults {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, output) in &self.0 {
            map.serialize_entry(name, output)?;
        }
        map.end()
    }
}

/// The stage that halted a pipeline and why
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageFailure {
    pub stage: String,
    pub error: String,
}

/// Everything a finished execution produced
///
/// A stage failure does not fail the execution: the remaining stages are
/// skipped, the failure is recorded here and the partial results are kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionReport {
    pub workflow_id: String,
    pub stages: StageResults,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<StageFailure>,
}

impl ExecutionReport {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}
