//! Racing futures against a `CancellationToken`.

use std::future::Future;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// The token fired before the future finished.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("operation cancelled")]
pub struct Cancelled;

#[async_trait]
pub trait OrCancel: Sized {
    type Output;

    /// Resolves to the future's output, or `Err(Cancelled)` as soon as
    /// `token` is cancelled. A token that is already cancelled wins even if
    /// the future is immediately ready.
    async fn or_cancel(self, token: &CancellationToken) -> Result<Self::Output, Cancelled>;
}

#[async_trait]
impl<F> OrCancel for F
where
    F: Future + Send,
    F::Output: Send,
{
    type Output = F::Output;

    async fn or_cancel(self, token: &CancellationToken) -> Result<Self::Output, Cancelled> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(Cancelled),
            output = self => Ok(output),
        }
    }
}
