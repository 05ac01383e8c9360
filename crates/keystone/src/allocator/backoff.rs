use crate::error::{Error, Result};
use core::{future::Future, time::Duration};
use rand::Rng;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;

/// Bounded exponential backoff toward the authority.
///
/// Each attempt is capped by `rpc_timeout`. Failed attempts sleep a random
/// duration in `[0, backoff]` (full jitter), where `backoff` starts at
/// `initial_backoff` and doubles up to `max_backoff`. Once `deadline` has
/// elapsed since the first attempt the call gives up.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub deadline: Duration,
    pub rpc_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_secs(1),
            deadline: Duration::from_secs(5),
            rpc_timeout: Duration::from_secs(3),
        }
    }
}

/// Runs `op` until it succeeds, fails permanently, the policy deadline passes
/// or `cancel` fires.
///
/// # Errors
///
/// - [`Error::ServiceShutdown`] if `cancel` fires first.
/// - The operation's own error if it is not transient.
/// - [`Error::AllocatorUnavailable`] once the deadline passes.
pub async fn with_backoff<T, F, Fut>(
    allocator: &'static str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let deadline = Instant::now() + policy.deadline;
    let mut backoff = policy.initial_backoff;
    let mut attempts = 0_u32;

    loop {
        attempts += 1;
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::ServiceShutdown),
            res = timeout(policy.rpc_timeout, op()) => res,
        };

        let reason = match outcome {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if !e.is_transient() => return Err(e),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("call timed out after {:?}", policy.rpc_timeout),
        };

        let now = Instant::now();
        if now >= deadline {
            tracing::warn!(allocator, attempts, "Authority unreachable: {reason}");
            return Err(Error::AllocatorUnavailable {
                allocator,
                attempts,
                reason,
            });
        }

        let jittered = rand::rng().random_range(0..=backoff.as_millis() as u64);
        let pause = Duration::from_millis(jittered).min(deadline - now);
        tracing::debug!(allocator, attempts, ?pause, "Retrying authority call: {reason}");

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::ServiceShutdown),
            () = sleep(pause) => {}
        }
        backoff = (backoff * 2).min(policy.max_backoff);
    }
}
