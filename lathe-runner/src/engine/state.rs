//! Workflow state handle
//!
//! Shared between the engine, which advances it, and pollers, which read it
//! at any time. The state only moves forward.

use lathe_core::domain::workflow::WorkflowState;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone)]
pub struct StateHandle {
    tx: Arc<watch::Sender<WorkflowState>>,
}

impl StateHandle {
    pub fn new(initial: WorkflowState) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Current state
    pub fn get(&self) -> WorkflowState {
        *self.tx.borrow()
    }

    /// Moves to `next` if it is later in the lifecycle
    ///
    /// Returns whether the state changed.
    pub fn advance(&self, next: WorkflowState) -> bool {
        self.tx.send_if_modified(|current| {
            if next > *current {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    /// Receiver notified on every transition
    pub fn subscribe(&self) -> watch::Receiver<WorkflowState> {
        self.tx.subscribe()
    }

    /// Resolves once the state is `Done`
    pub async fn wait_done(&self) {
        let mut rx = self.subscribe();
        // The sender is owned by `self`, so the channel cannot close here
        let _ = rx.wait_for(|state| state.is_done()).await;
    }
}

impl Default for StateHandle {
    fn default() -> Self {
        Self::new(WorkflowState::Undefined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_never_moves_backwards() {
        let state = StateHandle::new(WorkflowState::Pending);
        assert!(state.advance(WorkflowState::Running));
        assert!(!state.advance(WorkflowState::Started));
        assert!(!state.advance(WorkflowState::Running));
        assert_eq!(state.get(), WorkflowState::Running);
        assert!(state.advance(WorkflowState::Done));
        assert_eq!(state.get(), WorkflowState::Done);
    }

    #[tokio::test]
    async fn test_wait_done() {
        let state = StateHandle::new(WorkflowState::Started);
        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.wait_done().await })
        };

        state.advance(WorkflowState::Done);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
