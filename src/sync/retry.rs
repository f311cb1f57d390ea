use std::future::Future;

use crate::config::RetryPolicy;
use crate::provider::ProviderError;

/// Run a provider call with bounded backoff.
///
/// Retries only errors the provider reports as retryable; credential and
/// protocol failures surface immediately. `what` labels log lines.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => {
                tracing::warn!(error = %err, what, "Provider call failed permanently");
                return Err(err);
            }
            Err(err) if attempt >= policy.max_attempts => {
                tracing::warn!(
                    error = %err,
                    what,
                    attempts = attempt,
                    "Provider call failed; retries exhausted"
                );
                return Err(err);
            }
            Err(err) => {
                let delay = policy.backoff_for(attempt);
                tracing::debug!(
                    error = %err,
                    what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Provider call failed; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
