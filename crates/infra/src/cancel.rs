//! Cancellation of in-flight store calls.

use tokio_util::sync::CancellationToken;

use crate::store::{StoreError, StoreResult};

/// Race a store future against a [`CancellationToken`].
///
/// When the token fires first the store future is dropped, which aborts the pending
/// database command (and rolls back any open transaction), and the caller gets
/// [`StoreError::Cancelled`].
pub trait Cancellable<T>: Future<Output = StoreResult<T>> + Sized {
    fn with_cancel(
        self,
        token: &CancellationToken,
    ) -> impl Future<Output = StoreResult<T>> + Send
    where
        Self: Send,
        T: Send,
    {
        let token = token.clone();
        async move {
            tokio::select! {
                biased;
                () = token.cancelled() => Err(StoreError::Cancelled),
                result = self => result,
            }
        }
    }
}

impl<T, F> Cancellable<T> for F where F: Future<Output = StoreResult<T>> + Sized {}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn completes_when_not_cancelled() {
        let token = CancellationToken::new();
        let value = async { Ok::<_, StoreError>(7) }.with_cancel(&token).await;
        assert_eq!(value.unwrap(), 7);
    }

    #[tokio::test]
    async fn cancelled_token_aborts_pending_call() {
        let token = CancellationToken::new();
        let slow = async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, StoreError>(())
        };

        token.cancel();
        let err = slow.with_cancel(&token).await.unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));
    }

    #[tokio::test]
    async fn cancellation_mid_flight() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let err = std::future::pending::<StoreResult<()>>()
            .with_cancel(&token)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));
    }
}
