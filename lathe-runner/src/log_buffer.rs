//! Log buffer service
//!
//! Collects step output per workflow execution.
//! Plugins write entries while steps run; consumers drain them while polling
//! the workflow state and stop once it reports `Done`.

use lathe_core::domain::log::LogEntry;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Service for managing log buffers
///
/// Entries are grouped by workflow execution id so concurrent workflows
/// never interleave their output.
pub trait LogBufferService: Send + Sync {
    /// Adds a log entry to the buffer of a workflow
    ///
    /// # Arguments
    /// * `workflow_id` - The workflow execution the entry belongs to
    /// * `entry` - The log entry to add
    fn add_entry(&self, workflow_id: &str, entry: LogEntry);

    /// Drains all log entries buffered for a workflow
    ///
    /// # Returns
    /// The buffered entries in the order they were added
    fn drain(&self, workflow_id: &str) -> Vec<LogEntry>;

    /// Drops the buffer of a workflow
    fn remove(&self, workflow_id: &str);
}

/// In-memory implementation of LogBufferService
#[derive(Default)]
pub struct InMemoryLogBuffer {
    buffers: Mutex<HashMap<String, Vec<LogEntry>>>,
}

impl InMemoryLogBuffer {
    /// Creates a new in-memory log buffer
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogBufferService for InMemoryLogBuffer {
    fn add_entry(&self, workflow_id: &str, entry: LogEntry) {
        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        buffers
            .entry(workflow_id.to_string())
            .or_default()
            .push(entry);
    }

    fn drain(&self, workflow_id: &str) -> Vec<LogEntry> {
        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        buffers
            .get_mut(workflow_id)
            .map(|buffer| buffer.drain(..).collect())
            .unwrap_or_default()
    }

    fn remove(&self, workflow_id: &str) {
        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        buffers.remove(workflow_id);
    }
}
