//! Cancellable waits on event streams and timeouts.
//!
//! Waiting is always tied to a [`CancellationToken`]. Cancelling releases the
//! subscription; the result of a cancelled wait is `None` and callers must not
//! read anything else into it.

use std::future::Future;
use std::time::Duration;

use futures::future::{select_all, BoxFuture, FutureExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

use crate::error::WatchError;

/// Fail with [`WatchError::Timeout`] if `fut` is still pending after `duration`.
pub async fn with_timeout<T, F>(duration: Duration, fut: F) -> Result<T, WatchError>
where
    F: Future<Output = Result<T, WatchError>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(WatchError::Timeout {
            ms: duration.as_millis() as u64,
        }),
    }
}

/// Wait for the first value on `rx` that satisfies `predicate`.
///
/// Returns `None` if `cancel` fires or the channel closes first. Lagged
/// receivers skip the missed values and keep waiting. `rx` is consumed, so
/// the subscription is dropped when the wait ends either way.
pub async fn wait_for<T, P>(
    mut rx: broadcast::Receiver<T>,
    mut predicate: P,
    cancel: CancellationToken,
) -> Option<T>
where
    T: Clone,
    P: FnMut(&T) -> bool,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            next = rx.recv() => next,
        };
        match next {
            Ok(value) if predicate(&value) => return Some(value),
            Ok(_) => continue,
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "waiter lagged behind the event stream");
            }
            Err(RecvError::Closed) => return None,
        }
    }
}

/// Race several waits; the first to settle wins and the rest are cancelled.
///
/// Each future receives a child of `cancel`, so cancelling the race cancels
/// every participant. Returns the index of the winner and its output.
pub async fn wait_for_any<T>(
    cancel: &CancellationToken,
    waits: Vec<Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, T> + Send>>,
) -> Option<(usize, T)>
where
    T: Send + 'static,
{
    if waits.is_empty() {
        return None;
    }
    let race = cancel.child_token();
    let futures: Vec<_> = waits
        .into_iter()
        .map(|start| start(race.child_token()))
        .collect();

    let outcome = tokio::select! {
        biased;
        _ = race.cancelled() => None,
        (value, index, _rest) = select_all(futures) => Some((index, value)),
    };
    race.cancel();
    outcome
}

/// Box a future for [`wait_for_any`].
pub fn boxed<T, F, Fut>(f: F) -> Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, T> + Send>
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = T> + Send + 'static,
{
    Box::new(move |token| f(token).boxed())
}
