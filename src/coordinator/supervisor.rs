//! Fail-fast task group
//!
//! Every task of a node runs under one cancellation token. The first task to
//! fail cancels the token; siblings observe it and exit, and [`Supervisor::wait`]
//! returns that first error once all of them are gone.

use crate::common::{Error, Result};
use std::future::Future;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub struct Supervisor {
    cancel: CancellationToken,
    tasks: JoinSet<(String, Result<()>)>,
}

impl Supervisor {
    /// Group scoped to a child of `parent`: cancelling the parent stops the
    /// group, a failing task does not cancel the parent.
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            cancel: parent.child_token(),
            tasks: JoinSet::new(),
        }
    }

    /// Token shared by every task of the group.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn spawn<F>(&mut self, name: impl Into<String>, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        tracing::debug!(task = %name, "Spawning supervised task");
        self.tasks.spawn(async move { (name, task.await) });
    }

    /// Wait for every task; returns the first error, if any.
    pub async fn wait(mut self) -> Result<()> {
        let mut first_error: Option<Error> = None;

        while let Some(joined) = self.tasks.join_next().await {
            let (name, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) if e.is_panic() => (
                    "<panicked>".to_string(),
                    Err(Error::Internal(format!("supervised task panicked: {}", e))),
                ),
                Err(e) => (
                    "<aborted>".to_string(),
                    Err(Error::Internal(format!("supervised task aborted: {}", e))),
                ),
            };

            match result {
                Ok(()) => tracing::debug!(task = %name, "Task finished"),
                Err(e) => {
                    if first_error.is_none() {
                        tracing::error!(task = %name, "Task failed, stopping group: {}", e);
                        self.cancel.cancel();
                        first_error = Some(e);
                    } else {
                        tracing::debug!(task = %name, "Task failed after group stop: {}", e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn wait_for_cancel(cancel: CancellationToken) -> Result<()> {
        cancel.cancelled().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_first_error_cancels_siblings() {
        let parent = CancellationToken::new();
        let mut group = Supervisor::new(&parent);

        group.spawn("sibling-1", wait_for_cancel(group.token()));
        group.spawn("sibling-2", wait_for_cancel(group.token()));
        group.spawn("failing", async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err::<(), _>(Error::LeaseExpired(7))
        });
        group.spawn("late", {
            let token = group.token();
            async move {
                token.cancelled().await;
                Err::<(), _>(Error::BackendUnavailable("late".into()))
            }
        });

        let err = group.wait().await.unwrap_err();
        assert!(matches!(err, Error::LeaseExpired(7)));
        // the parent scope is untouched
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_parent_cancel_stops_group_cleanly() {
        let parent = CancellationToken::new();
        let mut group = Supervisor::new(&parent);
        group.spawn("a", wait_for_cancel(group.token()));
        group.spawn("b", wait_for_cancel(group.token()));
        assert_eq!(group.len(), 2);

        parent.cancel();
        group.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_panic_is_reported() {
        let parent = CancellationToken::new();
        let mut group = Supervisor::new(&parent);
        group.spawn("sibling", wait_for_cancel(group.token()));
        group.spawn("panics", async {
            let explode = true;
            if explode {
                panic!("boom");
            }
            Ok::<(), Error>(())
        });

        let err = group.wait().await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
