//! Cooperative cancellation
//!
//! A broadcast signal shared by the caller, the scheduler and every in-flight
//! part. Workers poll [`CancellationToken::is_cancelled`] at chunk
//! boundaries; sleeps (limiter waits, retry backoff) race against
//! [`CancellationToken::cancelled`] so they end promptly.

use crate::error::{Result, TransferError};
use tokio_util::sync::CancellationToken as Inner;

/// Cancellation signal for one or more transfers
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Inner,
}

impl CancellationToken {
    /// Create an un-cancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation; calling this more than once has no further effect
    pub fn cancel(&self) {
        if !self.inner.is_cancelled() {
            tracing::debug!("Cancellation requested");
        }
        self.inner.cancel();
    }

    /// Whether cancellation has been signalled
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Token that is cancelled with this one, and can also be cancelled alone
    pub fn child(&self) -> Self {
        Self {
            inner: self.inner.child_token(),
        }
    }

    /// Resolves once cancellation is signalled
    pub async fn cancelled(&self) {
        self.inner.cancelled().await;
    }

    /// `Err(Cancelled)` once cancellation is signalled
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(TransferError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cancel_is_idempotent() {
        let token = CancellationToken::new();
        assert!(token.check().is_ok());

        token.cancel();
        token.cancel();

        assert!(token.is_cancelled());
        assert_eq!(token.check(), Err(TransferError::Cancelled));
    }

    #[test]
    fn test_child_follows_parent() {
        let parent = CancellationToken::new();
        let child = parent.child();

        child.cancel();
        assert!(!parent.is_cancelled());

        let other = parent.child();
        parent.cancel();
        assert!(other.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
