use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use chatvault_types::api::Envelope;
use chatvault_types::{SyncEvent, SyncLog, SyncLogger};

use crate::error::ClientError;
use crate::limiter::RateLimiter;
use crate::transport::Transport;

/// Wait applied when the server signals a rate limit without saying how long.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per call, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`: base doubled per failed attempt,
    /// capped, plus up to 10% jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1 << exp).min(self.max_delay);
        let jitter_ms = rand::rng().random_range(0..=delay.as_millis() as u64 / 10);
        delay + Duration::from_millis(jitter_ms)
    }
}

/// Sleep for `delay` unless the run is cancelled first.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<(), ClientError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ClientError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Map an HTTP status to the error taxonomy. `Ok` for 2xx.
pub fn classify_status(status: u16, retry_after: Option<Duration>) -> Result<(), ClientError> {
    match status {
        200..=299 => Ok(()),
        429 => Err(ClientError::RateLimited(retry_after.unwrap_or(DEFAULT_RETRY_AFTER))),
        401 | 403 => Err(ClientError::Auth(format!("HTTP {}", status))),
        404 | 410 => Err(ClientError::NotFound(format!("HTTP {}", status))),
        408 => Err(ClientError::Transport("HTTP 408 request timeout".into())),
        500..=599 => Err(ClientError::Server(status)),
        _ => Err(ClientError::Rejected(format!("HTTP {}", status))),
    }
}

/// Map an API-level error code carried in an `ok: false` body.
pub fn classify_api_error(code: &str) -> ClientError {
    match code {
        "ratelimited" | "rate_limited" => ClientError::RateLimited(DEFAULT_RETRY_AFTER),
        // credential rejections only; a missing scope concerns one resource
        "invalid_auth" | "not_authed" | "account_inactive" | "token_revoked" | "token_expired" => {
            ClientError::Auth(code.to_string())
        }
        "channel_not_found" | "thread_not_found" | "not_in_channel" => {
            ClientError::NotFound(code.to_string())
        }
        "internal_error" | "fatal_error" | "service_unavailable" | "request_timeout" => {
            ClientError::Transport(code.to_string())
        }
        _ => ClientError::Rejected(code.to_string()),
    }
}

fn check_envelope(body: &Bytes) -> Result<(), ClientError> {
    match serde_json::from_slice::<Envelope>(body) {
        Ok(env) if env.ok => Ok(()),
        Ok(env) => Err(classify_api_error(env.error.as_deref().unwrap_or("unknown_error"))),
        Err(e) => Err(ClientError::Decode(e.to_string())),
    }
}

/// Rate-limited, retrying API client.
///
/// Each logical call is admitted by the shared limiter before its first
/// attempt and before every backoff retry. A server-signalled rate limit
/// waits exactly the requested time and retries without taking another
/// permit.
pub struct RetryClient<T> {
    transport: T,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
    cancel: CancellationToken,
    logger: Arc<dyn SyncLogger>,
}

impl<T: Transport> RetryClient<T> {
    pub fn new(
        transport: T,
        limiter: Arc<RateLimiter>,
        policy: RetryPolicy,
        cancel: CancellationToken,
        logger: Arc<dyn SyncLogger>,
    ) -> Self {
        Self {
            transport,
            limiter,
            policy,
            cancel,
            logger,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Perform a JSON API call and return the body of the first successful
    /// attempt. Both the HTTP status and the `ok` flag of the body are
    /// checked.
    pub async fn call(
        &self,
        operation: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<Bytes, ClientError> {
        self.limiter.acquire(&self.cancel).await?;

        let mut attempt = 1;
        loop {
            let result = match self.transport.get(url, query).await {
                Ok(resp) => classify_status(resp.status, resp.retry_after)
                    .and_then(|_| check_envelope(&resp.body))
                    .map(|_| resp.body),
                Err(e) => Err(e),
            };

            let err = match result {
                Ok(body) => return Ok(body),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => e,
            };

            if attempt >= self.policy.max_attempts {
                return Err(ClientError::Exhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            if let ClientError::RateLimited(wait) = err {
                self.logger.log(SyncLog::new(
                    "client",
                    None,
                    SyncEvent::RateLimited {
                        operation: operation.to_string(),
                        retry_after_ms: wait.as_millis() as u64,
                    },
                ));
                sleep_or_cancel(wait, &self.cancel).await?;
            } else {
                let delay = self.policy.backoff(attempt);
                self.logger.log(SyncLog::new(
                    "client",
                    None,
                    SyncEvent::RetryScheduled {
                        operation: operation.to_string(),
                        attempt,
                        max_attempts: self.policy.max_attempts,
                        delay_ms: delay.as_millis() as u64,
                        cause: err.to_string(),
                    },
                ));
                sleep_or_cancel(delay, &self.cancel).await?;
                self.limiter.acquire(&self.cancel).await?;
            }

            attempt += 1;
        }
    }
}
