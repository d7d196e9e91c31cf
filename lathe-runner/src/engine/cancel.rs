//! Cooperative cancellation
//!
//! A token is cancelled explicitly or through any of its ancestors. Branches
//! check it between steps and before each attempt; in-flight work is only
//! interrupted where the caller selects on [`CancelToken::cancelled`].

use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Node>,
}

struct Node {
    flag: watch::Sender<bool>,
    parent: Option<CancelToken>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::with_parent(None)
    }

    fn with_parent(parent: Option<CancelToken>) -> Self {
        let (flag, _) = watch::channel(false);
        Self {
            inner: Arc::new(Node { flag, parent }),
        }
    }

    /// A token cancelled together with this one, which can also be cancelled alone
    pub fn child(&self) -> Self {
        Self::with_parent(Some(self.clone()))
    }

    pub fn cancel(&self) {
        self.inner.flag.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.flag.borrow()
            || self
                .inner
                .parent
                .as_ref()
                .is_some_and(CancelToken::is_cancelled)
    }

    /// Resolves once this token or an ancestor is cancelled
    pub fn cancelled(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut rx = self.inner.flag.subscribe();
            let own = async move {
                // The sender lives as long as `self`, so this only ends on cancel
                let _ = rx.wait_for(|cancelled| *cancelled).await;
            };

            match &self.inner.parent {
                Some(parent) => {
                    tokio::select! {
                        _ = own => {}
                        _ = parent.cancelled() => {}
                    }
                }
                None => own.await,
            }
        })
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
