//! Fixed-interval polling with a deadline

use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Poll `check` every `delay` until it returns `Some(value)` or `timeout` elapses.
///
/// The last poll happens at the deadline, so a condition that becomes true
/// exactly at the end of the window still succeeds. Errors from `check`
/// propagate immediately. The thread is released between polls.
pub async fn wait_for<T, F, Fut>(
    condition: &str,
    timeout: Duration,
    delay: Duration,
    mut check: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let start = Instant::now();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        if let Some(value) = check().await? {
            trace!(condition, attempts, "condition met");
            return Ok(value);
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(Error::readiness(condition, timeout));
        }
        trace!(condition, attempts, "condition not met yet");
        tokio::time::sleep(delay.min(timeout - elapsed)).await;
    }
}

/// [`wait_for`] over a boolean check, waiting until it equals `expected`
pub async fn wait_until<F, Fut>(
    condition: &str,
    timeout: Duration,
    delay: Duration,
    expected: bool,
    mut check: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    wait_for(condition, timeout, delay, || {
        let fut = check();
        async move { Ok((fut.await? == expected).then_some(())) }
    })
    .await
}
