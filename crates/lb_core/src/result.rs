//! Result-channel helpers.
//!
//! Every fallible storage operation returns a plain `Result`; asynchronous
//! ones return an [`AsyncResult`]. The helpers here adapt panicking code into
//! that channel, compose errors with provenance and fan out over batches.

use futures::future::{join_all, BoxFuture, FutureExt};
use std::any::Any;
use std::fmt::Display;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::warn;

use crate::error::{AggregateError, BoxError, Error, WrappedError};

pub type AsyncResult<'a, T, E = Error> = BoxFuture<'a, Result<T, E>>;

/// Lift a future of a plain value into an [`AsyncResult`].
pub fn ok_async<'a, T, E, F>(value: F) -> AsyncResult<'a, T, E>
where
    F: Future<Output = T> + Send + 'a,
    T: Send + 'a,
    E: Send + 'a,
{
    async move { Ok(value.await) }.boxed()
}

pub fn err_async<'a, T, E>(err: E) -> AsyncResult<'a, T, E>
where
    T: Send + 'a,
    E: Send + 'a,
{
    futures::future::ready(Err(err)).boxed()
}

fn captured(payload: Box<dyn Any + Send>) -> Error {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    };
    warn!(panic = %message, "panic captured into result");
    Error::Panicked(message)
}

/// Run `f`, capturing a panic as [`Error::Panicked`].
pub fn from_throwing<T, F>(f: F) -> Result<T, Error>
where
    F: FnOnce() -> T,
{
    catch_unwind(AssertUnwindSafe(f)).map_err(captured)
}

/// Await `fut`, capturing a panic while polling as [`Error::Panicked`].
pub async fn from_future<T, F>(fut: F) -> Result<T, Error>
where
    F: Future<Output = T>,
{
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .map_err(captured)
}

/// Call `f` and await the future it returns; a panic in either step is
/// captured.
pub async fn from_async_fn<T, F, Fut>(f: F) -> Result<T, Error>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let fut = from_throwing(f)?;
    from_future(fut).await
}

/// Compose `message` over one or more causes.
pub fn wrap_err<I, E>(message: impl Into<String>, causes: I) -> WrappedError
where
    I: IntoIterator<Item = E>,
    E: Into<BoxError>,
{
    WrappedError::new(message, causes.into_iter().map(Into::into).collect())
}

/// Await every result concurrently. All values come back in input order when
/// every one succeeded; otherwise every failure is reported together.
pub async fn all<I, F, T, E>(results: I) -> Result<Vec<T>, AggregateError>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T, E>>,
    E: Into<BoxError>,
{
    let settled = join_all(results).await;
    let mut values = Vec::with_capacity(settled.len());
    let mut errors = Vec::new();
    for (idx, res) in settled.into_iter().enumerate() {
        match res {
            Ok(v) => values.push(v),
            Err(e) => errors.push((idx, e.into())),
        }
    }
    if errors.is_empty() {
        Ok(values)
    } else {
        Err(AggregateError::new("one or more operations failed", errors))
    }
}

/// Convert back to panicking semantics, for test boundaries.
pub async fn to_panic<T, E, F>(result: F) -> T
where
    F: Future<Output = Result<T, E>>,
    E: Display,
{
    match result.await {
        Ok(v) => v,
        Err(e) => panic!("unexpected error result: {e}"),
    }
}
