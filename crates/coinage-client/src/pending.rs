//! Cancellable in-flight requests

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::task::JoinHandle;

use crate::error::{ProtocolError, Result};

/// Handle to one outstanding request
///
/// Awaiting yields exactly one result. [`PendingRequest::cancel`] aborts the
/// request; a cancelled request never delivers.
#[derive(Debug)]
pub struct PendingRequest<T> {
    handle: JoinHandle<Result<T>>,
}

impl<T: Send + 'static> PendingRequest<T> {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(future),
        }
    }

    /// Abort the request and release its resources
    pub fn cancel(self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl<T> Future for PendingRequest<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.handle).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(e)) if e.is_cancelled() => Poll::Ready(Err(ProtocolError::Cancelled)),
            Poll::Ready(Err(e)) => std::panic::resume_unwind(e.into_panic()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_delivers_result() {
        let pending = PendingRequest::spawn(async { Ok(7u32) });
        assert_eq!(pending.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_cancel_prevents_completion() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let pending = PendingRequest::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        pending.cancel();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!ran.load(Ordering::SeqCst));
    }
}
