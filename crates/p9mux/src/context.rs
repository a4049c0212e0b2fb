//! Per-request cancellation and deadline.
//!
//! A [`Context`] travels with every request. It is checked at each point a
//! caller can block: waiting for a tag, handing the request to the
//! dispatcher, and waiting for the response. Its deadline also bounds the
//! time the dispatcher may spend writing the request.

use std::time::Duration;

use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::error::Error;

#[derive(Clone, Debug, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context which is never cancelled and has no deadline
    pub fn background() -> Context {
        Context::default()
    }

    /// Child context which is also done once `timeout` has elapsed
    pub fn with_timeout(&self, timeout: Duration) -> Context {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Child context which is also done at `deadline`.
    ///
    /// The parent's deadline still applies if it is earlier.
    pub fn with_deadline(&self, deadline: Instant) -> Context {
        Context {
            token: self.token.child_token(),
            deadline: Some(match self.deadline {
                Some(parent) => parent.min(deadline),
                None => deadline,
            }),
        }
    }

    /// Child context which can be cancelled on its own
    pub fn with_cancel(&self) -> Context {
        Context {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Cancel this context and every context derived from it
    pub fn cancel(&self) {
        self.token.cancel()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Why the context is done, or `None` while it is still live
    pub fn err(&self) -> Option<Error> {
        if self.token.is_cancelled() {
            Some(Error::Cancelled)
        } else if self.deadline.is_some_and(|d| d <= Instant::now()) {
            Some(Error::DeadlineExceeded)
        } else {
            None
        }
    }

    /// Resolves once the context is done, with the reason
    pub async fn done(&self) -> Error {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => Error::Cancelled,
                _ = sleep_until(deadline) => Error::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                Error::Cancelled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn background_is_never_done() {
        let ctx = Context::background();
        assert!(ctx.err().is_none());
        assert!(ctx.deadline().is_none());
        let done = tokio::time::timeout(Duration::from_millis(20), ctx.done()).await;
        assert!(done.is_err());
    }

    #[tokio::test]
    async fn deadline_expires() {
        let ctx = Context::background().with_timeout(Duration::from_millis(10));
        assert!(matches!(ctx.done().await, Error::DeadlineExceeded));
        assert!(matches!(ctx.err(), Some(Error::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn cancel_reaches_children_only() {
        let parent = Context::background().with_cancel();
        let child = parent.with_timeout(Duration::from_secs(60));
        let sibling = Context::background().with_cancel();

        parent.cancel();
        assert!(matches!(child.done().await, Error::Cancelled));
        assert!(matches!(parent.err(), Some(Error::Cancelled)));
        assert!(sibling.err().is_none());

        let grandchild = child.with_cancel();
        grandchild.cancel();
        assert!(matches!(grandchild.err(), Some(Error::Cancelled)));
    }

    #[tokio::test]
    async fn child_keeps_earlier_parent_deadline() {
        let parent = Context::background().with_timeout(Duration::from_millis(10));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());

        let tighter = parent.with_timeout(Duration::from_millis(1));
        assert!(tighter.deadline() < parent.deadline());
    }
}
