//! One-shot completion channel for backend work.
//!
//! Backend calls block, so they run on the blocking pool and report back
//! through a oneshot. The sender is written exactly once; if the worker dies
//! without writing, the receiver resolves to [`EngineError::Interrupted`].
//! Dropping a [`Completion`] early just discards the result.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::EngineError;

pub(crate) struct Completion<T> {
    rx: oneshot::Receiver<Result<T, EngineError>>,
}

impl<T> Future for Completion<T> {
    type Output = Result<T, EngineError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(EngineError::Interrupted)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Run `work` on the blocking pool.
pub(crate) fn run_blocking<T, F>(work: F) -> Completion<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, EngineError> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    tokio::task::spawn_blocking(move || {
        let _ = tx.send(work());
    });
    Completion { rx }
}
