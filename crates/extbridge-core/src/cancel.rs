//! Cooperative cancellation for session loops.
//!
//! A `CancellationToken` is shared between a session's dispatcher, its
//! control-channel writer, its pairing timer and the liveness supervisor.
//! Blocking reads race against [`CancellationToken::cancelled`] so that a
//! supervisor sweep or a listener shutdown unwinds them promptly.

use tokio_util::sync;

/// Shared flag that ends a session's tasks once set.
///
/// ```
/// use extbridge_core::cancel::CancellationToken;
///
/// let session = CancellationToken::new();
/// let supervisor = session.clone();
///
/// supervisor.cancel();
/// assert!(session.check().is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: sync::CancellationToken,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that is cancelled with this one but can also be cancelled alone.
    pub fn child_token(&self) -> Self {
        Self {
            inner: self.inner.child_token(),
        }
    }

    /// Request cancellation and wake every task waiting in `cancelled()`.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Wait until the token is cancelled.
    ///
    /// Returns immediately if it already is.
    pub async fn cancelled(&self) {
        self.inner.cancelled().await
    }

    /// `Err(CancelledError)` once cancellation has been requested.
    pub fn check(&self) -> Result<(), CancelledError> {
        match self.is_cancelled() {
            true => Err(CancelledError),
            false => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("session was cancelled")]
pub struct CancelledError;

impl From<CancelledError> for crate::error::BridgeError {
    fn from(_: CancelledError) -> Self {
        crate::error::BridgeError::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cancel_is_visible_through_clones() {
        let dispatcher = CancellationToken::new();
        let supervisor = dispatcher.clone();
        assert_eq!(dispatcher.check(), Ok(()));

        supervisor.cancel();
        assert!(dispatcher.is_cancelled());
        assert_eq!(dispatcher.check(), Err(CancelledError));
    }

    #[test]
    fn test_child_follows_parent_but_not_back() {
        let shutdown = CancellationToken::new();
        let session = shutdown.child_token();

        session.cancel();
        assert!(session.is_cancelled());
        assert!(!shutdown.is_cancelled());

        let other = shutdown.child_token();
        shutdown.cancel();
        assert!(other.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_returns_when_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .expect("should resolve immediately");
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let token = CancellationToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };

        tokio::task::yield_now().await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[test]
    fn test_cancelled_error_converts() {
        let err: crate::error::BridgeError = CancelledError.into();
        assert!(matches!(err, crate::error::BridgeError::Cancelled));
    }
}
