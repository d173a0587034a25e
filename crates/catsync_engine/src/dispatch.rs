//! Rate-limited, retried, time-bounded remote calls.

use crate::config::RetryConfig;
use crate::error::{SyncError, SyncResult};
use crate::metrics::SyncMetrics;
use crate::rate_limiter::RateLimiter;
use crate::remote::{RemoteCatalog, RemoteResult};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Wraps every remote call in the limiter, a timeout and the retry policy.
pub struct RemoteDispatcher<R> {
    remote: Arc<R>,
    limiter: Arc<RateLimiter>,
    retry: RetryConfig,
    timeout: Duration,
    metrics: Arc<SyncMetrics>,
}

impl<R: RemoteCatalog> RemoteDispatcher<R> {
    /// Creates a dispatcher.
    pub fn new(
        remote: Arc<R>,
        limiter: Arc<RateLimiter>,
        retry: RetryConfig,
        timeout: Duration,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        Self {
            remote,
            limiter,
            retry,
            timeout,
            metrics,
        }
    }

    /// The wrapped remote.
    pub fn remote(&self) -> &R {
        &self.remote
    }

    /// The shared limiter.
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Runs one logical remote call.
    ///
    /// Every attempt takes a token first. Throttles feed the limiter and
    /// are retried up to `max_throttle_retries` without using up the
    /// transient budget. Transient failures and timeouts back off
    /// exponentially up to `max_attempts`. Rejections return at once.
    pub async fn call<T, F, Fut>(&self, op: F) -> SyncResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = RemoteResult<T>>,
    {
        let mut attempts = 0u32;
        let mut throttles = 0u32;
        loop {
            self.limiter.acquire().await;
            let outcome = match tokio::time::timeout(self.timeout, op()).await {
                Ok(result) => result.map_err(SyncError::from),
                Err(_) => Err(SyncError::Timeout(self.timeout)),
            };

            let err = match outcome {
                Ok(value) => {
                    self.limiter.on_success();
                    return Ok(value);
                }
                Err(err) => err,
            };

            match err {
                SyncError::RateLimited { retry_after } => {
                    self.metrics.throttled();
                    self.limiter.on_throttled(retry_after);
                    throttles += 1;
                    if throttles > self.retry.max_throttle_retries {
                        warn!(throttles, "throttle retry budget exhausted");
                        return Err(SyncError::RateLimited { retry_after });
                    }
                }
                err @ (SyncError::Transient(_) | SyncError::Timeout(_)) => {
                    attempts += 1;
                    if attempts >= self.retry.max_attempts {
                        warn!(attempts, error = %err, "transient retry budget exhausted");
                        return Err(err);
                    }
                    self.metrics.retried();
                    let delay = self.retry.delay_for_attempt(attempts);
                    debug!(
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying remote call"
                    );
                    tokio::time::sleep(delay).await;
                }
                err => return Err(err),
            }
        }
    }
}
