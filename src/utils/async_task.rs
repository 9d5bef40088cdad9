use std::future::Future;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio::time::timeout;
use tracing::error;
use tracing::warn;

use crate::BackoffPolicy;
use crate::Error;
use crate::Result;
use crate::StoreError;

/// Runs `task` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are used up.
///
/// Each attempt is bounded by `policy.timeout()`. The delay between attempts
/// starts at `base_delay` and doubles up to `max_delay`. After the last
/// attempt the last error is returned as-is, or `RetryExhausted` when the
/// last attempt timed out.
pub(crate) async fn task_with_timeout_and_exponential_backoff<F, T, P>(
    task: F,
    policy: BackoffPolicy,
) -> Result<P>
where
    F: Fn() -> T,
    T: Future<Output = Result<P>>,
{
    let max_retries = policy.max_retries.max(1);
    let mut delay = policy.base_delay();
    let mut retries = 0;

    loop {
        let last = match timeout(policy.timeout(), task()).await {
            Ok(Ok(r)) => return Ok(r),
            Ok(Err(e)) if !e.is_retryable() => return Err(e),
            Ok(Err(e)) => {
                warn!(attempt = retries + 1, "retryable failure: {}", e);
                e
            }
            Err(_) => {
                warn!(attempt = retries + 1, "attempt timed out after {:?}", policy.timeout());
                Error::Store(StoreError::RetryExhausted {
                    attempts: retries + 1,
                    last: format!("timed out after {:?}", policy.timeout()),
                })
            }
        };

        retries += 1;
        if retries >= max_retries {
            warn!("task failed after {} attempts", retries);
            return Err(last);
        }
        sleep(delay).await;
        delay = (delay * 2).min(policy.max_delay());
    }
}

/// Spawns a named background task, logging its error if it ends with one
pub(crate) fn spawn_task<F, Fut>(
    name: &str,
    task_fn: F,
) -> JoinHandle<()>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let name = name.to_string();
    tokio::spawn(async move {
        if let Err(e) = task_fn().await {
            error!("spawned task: {name} stopped or encountered an error: {:?}", e);
        }
    })
}
