//! Pipeline AST
//!
//! The typed document produced by parsing a declarative pipeline script.
//! Stage order is execution order; a stage may carry its own steps, a set of
//! parallel branches, or both.

use serde::{Deserialize, Serialize};

/// Tag appended to image references that do not name one
pub const DEFAULT_IMAGE_TAG: &str = "latest";

/// Root pipeline document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    /// Top-level agent, inherited by stages that do not override it
    pub agent: Agent,
    pub stages: Vec<Stage>,
}

impl Pipeline {
    /// Checks the structural invariants the grammar cannot express
    ///
    /// # Errors
    /// Returns a description of the first violation found:
    /// - the pipeline has no stages
    /// - a stage (at any nesting depth) has an empty name
    pub fn validate(&self) -> Result<(), String> {
        if self.stages.is_empty() {
            return Err("Pipeline must have at least one stage".to_string());
        }

        for stage in &self.stages {
            stage.validate()?;
        }

        Ok(())
    }
}

/// Execution context a stage runs in
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Agent {
    /// Bare host execution
    #[default]
    None,
    /// Containerized execution
    Docker { image: String },
}

impl Agent {
    /// Returns the container image for a docker agent with its tag normalized
    ///
    /// Images without a tag get `:latest`. The tag is looked up in the last
    /// path segment only, so a registry port (`host:5000/app`) is not mistaken
    /// for a tag.
    pub fn image_with_tag(&self) -> Option<String> {
        match self {
            Agent::None => None,
            Agent::Docker { image } => Some(normalize_image_tag(image)),
        }
    }
}

/// Appends the default tag to an image reference that has none
///
/// Only the last path segment is inspected, so a registry port is not taken
/// for a tag.
pub fn normalize_image_tag(image: &str) -> String {
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    if last_segment.contains(':') || last_segment.contains('@') {
        image.to_string()
    } else {
        format!("{}:{}", image, DEFAULT_IMAGE_TAG)
    }
}

/// A named unit of execution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    /// Agent override; `None` inherits the enclosing agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<Agent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_fast: Option<bool>,
    /// Child stages executed concurrently before this stage's own steps
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parallel: Vec<Stage>,
}

impl Stage {
    /// Resolves the agent this stage runs with
    pub fn effective_agent<'a>(&'a self, inherited: &'a Agent) -> &'a Agent {
        self.agent.as_ref().unwrap_or(inherited)
    }

    /// Whether `failFast true` was declared
    pub fn is_fail_fast(&self) -> bool {
        self.fail_fast.unwrap_or(false)
    }

    fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Stage name cannot be empty".to_string());
        }

        for branch in &self.parallel {
            branch.validate()?;
        }

        Ok(())
    }
}

/// A single command invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Step {
    /// `sh 'mvn test'`
    SingleKV { command: String, value: String },
    /// `git branch: 'main', url: '...'`
    MultiKV { command: String, params: Vec<Param> },
}

impl Step {
    /// Command keyword used to resolve the handling plugin
    pub fn command(&self) -> &str {
        match self {
            Step::SingleKV { command, .. } => command.as_str(),
            Step::MultiKV { command, .. } => command.as_str(),
        }
    }

    /// Normalizes the step into `(command, params)`
    ///
    /// A single-value step maps its value to the `text` key; a multi-value
    /// step keeps its declared pairs in order.
    pub fn to_command(&self) -> (&str, StepParams) {
        match self {
            Step::SingleKV { command, value } => {
                let mut params = StepParams::new();
                params.insert("text", value.clone());
                (command.as_str(), params)
            }
            Step::MultiKV { command, params } => (
                command.as_str(),
                params
                    .iter()
                    .map(|p| (p.key.clone(), p.value.clone()))
                    .collect(),
            ),
        }
    }
}

/// A `key: 'value'` pair of a multi-value step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub key: String,
    pub value: String,
}

/// Ordered parameter map handed to plugins
///
/// Keeps declaration order. Inserting an existing key replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepParams(Vec<(String, String)>);

impl StepParams {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Sets a parameter, replacing the value of an existing key
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for StepParams {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut params = StepParams::new();
        for (key, value) in iter {
            params.insert(key, value);
        }
        params
    }
}
