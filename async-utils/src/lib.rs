//! Async utilities for cancellation-aware futures.
//!
//! Provides the `OrCancelExt` trait for making futures cancellable
//! with tokio's `CancellationToken`, and `CancelScope`, which pairs a
//! token with an optional deadline so that one value can bound a whole
//! multi-step operation.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Error returned when a future is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CancelErr {
    /// The token was cancelled by its owner.
    #[error("operation cancelled")]
    Cancelled,
    /// The scope's deadline elapsed.
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// A cancellation token plus an optional deadline.
///
/// Cloning is cheap; clones observe the same token.
#[derive(Debug, Clone)]
pub struct CancelScope {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CancelScope {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Bound the scope by `deadline`. An earlier existing deadline is kept.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// A timeout past the clock range leaves the scope without a deadline.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// A scope whose token is a child of this one: cancelling the parent
    /// cancels the child, not the other way around.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Non-blocking check, token first.
    pub fn check(&self) -> Result<(), CancelErr> {
        if self.token.is_cancelled() {
            return Err(CancelErr::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(CancelErr::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Resolves once the token is cancelled or the deadline passes,
    /// yielding the cause.
    pub async fn cancelled(&self) -> CancelErr {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => CancelErr::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => CancelErr::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                CancelErr::Cancelled
            }
        }
    }

    /// Sleep for `duration` unless the scope ends first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), CancelErr> {
        if duration.is_zero() {
            return self.check();
        }
        tokio::time::sleep(duration).or_cancel_scope(self).await
    }
}

impl Default for CancelScope {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

impl From<CancellationToken> for CancelScope {
    fn from(token: CancellationToken) -> Self {
        Self::new(token)
    }
}

/// Extension trait for making futures cancellable.
///
/// Allows any future to race against a `CancellationToken`, returning
/// `Err(CancelErr::Cancelled)` if the token is cancelled before the
/// future completes.
#[async_trait]
pub trait OrCancelExt: Sized {
    type Output;

    /// Race this future against the cancellation token.
    ///
    /// Returns `Ok(output)` if the future completes first, or
    /// `Err(CancelErr::Cancelled)` if the token is cancelled.
    async fn or_cancel(self, token: &CancellationToken) -> Result<Self::Output, CancelErr>;

    /// Race this future against a scope's token and deadline.
    async fn or_cancel_scope(self, scope: &CancelScope) -> Result<Self::Output, CancelErr>;
}

#[async_trait]
impl<F> OrCancelExt for F
where
    F: Future + Send,
    F::Output: Send,
{
    type Output = F::Output;

    async fn or_cancel(self, token: &CancellationToken) -> Result<Self::Output, CancelErr> {
        tokio::select! {
            _ = token.cancelled() => Err(CancelErr::Cancelled),
            res = self => Ok(res),
        }
    }

    async fn or_cancel_scope(self, scope: &CancelScope) -> Result<Self::Output, CancelErr> {
        tokio::select! {
            cause = scope.cancelled() => Err(cause),
            res = self => Ok(res),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::task;
    use tokio::time::sleep;

    #[tokio::test]
    async fn returns_ok_when_future_completes_first() {
        let token = CancellationToken::new();
        let value = async { 42 };

        let result = value.or_cancel(&token).await;

        assert_eq!(Ok(42), result);
    }

    #[tokio::test]
    async fn returns_err_when_token_cancelled_first() {
        let token = CancellationToken::new();
        let token_clone = token.clone();

        let cancel_handle = task::spawn(async move {
            sleep(Duration::from_millis(10)).await;
            token_clone.cancel();
        });

        let result = async {
            sleep(Duration::from_millis(100)).await;
            7
        }
        .or_cancel(&token)
        .await;

        cancel_handle.await.expect("cancel task panicked");
        assert_eq!(Err(CancelErr::Cancelled), result);
    }

    #[tokio::test]
    async fn returns_err_when_token_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel();

        let result = async {
            sleep(Duration::from_millis(50)).await;
            5
        }
        .or_cancel(&token)
        .await;

        assert_eq!(Err(CancelErr::Cancelled), result);
    }

    #[tokio::test]
    async fn scope_reports_deadline_when_it_elapses_first() {
        let scope = CancelScope::default().with_timeout(Duration::from_millis(10));

        let result = async {
            sleep(Duration::from_millis(200)).await;
            1
        }
        .or_cancel_scope(&scope)
        .await;

        assert_eq!(Err(CancelErr::DeadlineExceeded), result);
        assert_eq!(Err(CancelErr::DeadlineExceeded), scope.check());
    }

    #[tokio::test]
    async fn scope_check_prefers_token_cancellation() {
        let scope = CancelScope::default().with_timeout(Duration::ZERO);
        scope.cancel();

        assert_eq!(Err(CancelErr::Cancelled), scope.check());
    }

    #[tokio::test]
    async fn scope_keeps_earliest_deadline() {
        let now = Instant::now();
        let scope = CancelScope::default()
            .with_deadline(now + Duration::from_secs(1))
            .with_deadline(now + Duration::from_secs(10));

        assert_eq!(Some(now + Duration::from_secs(1)), scope.deadline());
    }

    #[tokio::test]
    async fn child_scope_follows_parent_cancellation() {
        let parent = CancelScope::default();
        let child = parent.child();

        parent.cancel();

        assert_eq!(Err(CancelErr::Cancelled), child.check());
    }

    #[tokio::test]
    async fn cancelling_child_leaves_parent_running() {
        let parent = CancelScope::default();
        let child = parent.child();

        child.cancel();

        assert_eq!(Ok(()), parent.check());
    }

    #[tokio::test]
    async fn unbounded_timeout_leaves_no_deadline() {
        let scope = CancelScope::default().with_timeout(Duration::MAX);

        assert_eq!(None, scope.deadline());
        assert_eq!(Ok(()), scope.check());
    }

    #[tokio::test]
    async fn sleep_returns_early_on_cancel() {
        let scope = CancelScope::default();
        let canceller = scope.clone();
        let started = Instant::now();

        task::spawn(async move {
            sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let result = scope.sleep(Duration::from_secs(5)).await;

        assert_eq!(Err(CancelErr::Cancelled), result);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
