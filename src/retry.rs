use backoff::future::retry;
use backoff::ExponentialBackoffBuilder;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

use crate::error::{map_signal, ResolutionError, ResolutionResult, RetryPolicy, UpstreamSignal};

/// Jittered exponential retry for a single provider call. Sits inside the
/// poll schedule: a transient failure of one `task_get` is retried here
/// without consuming a poll attempt.
#[derive(Debug, Clone)]
pub struct TransientRetry {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub max_attempts: u32,
    /// Each attempt is abandoned after this long.
    pub call_timeout: Duration,
}

impl TransientRetry {
    /// Run `op` until it succeeds, fails permanently, runs out of attempts,
    /// or `deadline` passes. Failures are classified by the error mapper;
    /// only `Backoff` and `AfterWait` kinds are retried.
    ///
    /// `deadline` is hard: each attempt's timeout is clipped to it, and the
    /// waits between attempts never cross it.
    pub async fn run<T, F, Fut>(&self, label: &str, deadline: Instant, mut op: F) -> ResolutionResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UpstreamSignal>>,
    {
        let attempts = AtomicU32::new(0);
        let max_attempts = self.max_attempts.max(1);
        let call_timeout = self.call_timeout;
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_randomization_factor(0.5)
            .with_max_elapsed_time(Some(deadline.saturating_duration_since(Instant::now())))
            .build();

        let retried = retry(policy, || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let limit = call_timeout.min(deadline.saturating_duration_since(Instant::now()));
            let call = (!limit.is_zero()).then(|| op());
            async move {
                let Some(call) = call else {
                    return Err(backoff::Error::permanent(ResolutionError::Timeout(format!(
                        "{label}: deadline reached before attempt {attempt}"
                    ))));
                };
                let signal = match tokio::time::timeout(limit, call).await {
                    Ok(Ok(value)) => return Ok(value),
                    Ok(Err(signal)) => signal,
                    Err(_) => UpstreamSignal::CallTimeout(limit),
                };
                let err = map_signal(&signal);
                if attempt >= max_attempts || err.kind().retry_policy() == RetryPolicy::Never {
                    return Err(backoff::Error::permanent(err));
                }
                warn!("{} failed (attempt {}/{}): {}", label, attempt, max_attempts, err);
                match err {
                    ResolutionError::RateLimited { retry_after } => {
                        Err(backoff::Error::retry_after(err, retry_after))
                    }
                    other => Err(backoff::Error::transient(other)),
                }
            }
        });

        match tokio::time::timeout_at(deadline, retried).await {
            Ok(result) => result,
            Err(_) => Err(ResolutionError::Timeout(format!(
                "{label}: no answer before the deadline"
            ))),
        }
    }
}
