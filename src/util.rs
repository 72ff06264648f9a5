//! Shared async helpers.

use std::future::Future;
use std::time::Duration;

use tokio::task::spawn_blocking;
use tokio::time::timeout;

use crate::{alog_debug, Error, Result};

/// Run blocking file work off the async runtime.
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

/// Bound a collaborator call by `duration`.
pub async fn with_timeout<F, T>(duration: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(duration, fut).await {
        Ok(inner) => inner,
        Err(_) => Err(Error::Timeout(duration)),
    }
}

/// Run `op`, and run it once more if it lost an update race.
///
/// `op` must re-read whatever state it depends on; the retry is only
/// meaningful with fresh context.
pub async fn retry_once_on_conflict<F, Fut, T>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match op().await {
        Err(Error::ConcurrentModification(reason)) => {
            alog_debug!("retrying after concurrent modification: {}", reason);
            op().await
        }
        other => other,
    }
}
