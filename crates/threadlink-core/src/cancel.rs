//! Cancellation token used to tear down execution contexts.
//!
//! A token can be cloned and shared across tasks. Child tokens observe their
//! parent's cancellation, but cancelling a child leaves the parent running:
//! terminating a context stops every channel it opened, while closing one
//! channel leaves the context alone.

use futures::future::select_all;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

/// A hierarchical cancellation token for cooperative shutdown of async tasks.
///
/// # Example
///
/// ```
/// use threadlink::CancellationToken;
///
/// let context = CancellationToken::new();
/// let channel = context.child_token();
///
/// context.cancel();
/// assert!(channel.is_cancelled());
/// ```
#[derive(Debug, Clone)]
pub struct CancellationToken {
    state: Arc<watch::Sender<bool>>,
    parent: Option<Box<CancellationToken>>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    /// Create a new root token.
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
            parent: None,
        }
    }

    /// Request cancellation.
    ///
    /// All clones and all children of this token observe the cancellation.
    pub fn cancel(&self) {
        self.state.send_replace(true);
    }

    /// Check if cancellation has been requested on this token or any ancestor.
    pub fn is_cancelled(&self) -> bool {
        *self.state.borrow() || self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    /// Create a child token that is cancelled together with this one.
    pub fn child_token(&self) -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
            parent: Some(Box::new(self.clone())),
        }
    }

    /// Wait until this token or any ancestor is cancelled.
    pub async fn cancelled(&self) {
        let mut waits = Vec::new();
        let mut token = Some(self);
        while let Some(current) = token {
            let mut rx = current.state.subscribe();
            waits.push(Box::pin(async move {
                let _ = rx.wait_for(|cancelled| *cancelled).await;
            }));
            token = current.parent.as_deref();
        }
        select_all(waits).await;
    }

    /// Drive `fut` to completion unless the token is cancelled first.
    pub async fn run_until_cancelled<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            _ = self.cancelled() => None,
            output = fut => Some(output),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_new_token_not_cancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_clone_shares_state() {
        let token1 = CancellationToken::new();
        let token2 = token1.clone();

        token1.cancel();

        assert!(token1.is_cancelled());
        assert!(token2.is_cancelled());
    }

    #[test]
    fn test_child_does_not_cancel_parent() {
        let parent = CancellationToken::new();
        let child = parent.child_token();

        child.cancel();

        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_on_parent_cancel() {
        let parent = CancellationToken::new();
        let grandchild = parent.child_token().child_token();

        let waiter = tokio::spawn(async move { grandchild.cancelled().await });
        parent.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("grandchild should observe cancellation")
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_until_cancelled() {
        let token = CancellationToken::new();
        assert_eq!(token.run_until_cancelled(async { 7 }).await, Some(7));

        token.cancel();
        let pending = futures::future::pending::<()>();
        assert_eq!(token.run_until_cancelled(pending).await, None);
    }
}
