//! Token-bucket admission for outbound calls.
//!
//! Wraps a `governor` direct limiter: N permits per window, refilled one
//! permit every `window / N`, with a burst of N. A single instance is
//! shared by every call of a run.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter as GovRateLimiter};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ClientError;

#[derive(Debug)]
pub struct RateLimiter {
    inner: DefaultDirectRateLimiter,
    permits: NonZeroU32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(permits: NonZeroU32, window: Duration) -> Self {
        let period = window / permits.get();
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(permits))
            .allow_burst(permits);

        Self {
            inner: GovRateLimiter::direct(quota),
            permits,
            window,
        }
    }

    pub fn per_minute(permits: NonZeroU32) -> Self {
        Self::new(permits, Duration::from_secs(60))
    }

    /// Wait for one permit. Only the calling task waits; cancellation wins
    /// over a pending admission.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), ClientError> {
        if self.inner.check().is_ok() {
            return Ok(());
        }
        debug!(permits = self.permits.get(), window = ?self.window, "rate limiter saturated, waiting");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            _ = self.inner.until_ready() => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    fn nz(n: u32) -> NonZeroU32 {
        NonZeroU32::new(n).unwrap()
    }

    #[tokio::test]
    async fn burst_beyond_bucket_is_paced_by_budget() {
        // 50 permits per second: the first 50 pass at once, every further
        // permit costs 20ms, so 60 calls need at least ~200ms.
        let limiter = RateLimiter::new(nz(50), Duration::from_secs(1));
        let cancel = CancellationToken::new();

        let start = Instant::now();
        for _ in 0..60 {
            limiter.acquire(&cancel).await.unwrap();
        }
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(180), "finished too fast: {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(2), "finished too slow: {:?}", elapsed);
    }

    #[tokio::test]
    async fn shared_between_tasks() {
        let limiter = Arc::new(RateLimiter::new(nz(20), Duration::from_secs(1)));
        let cancel = CancellationToken::new();

        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..10 {
                    limiter.acquire(&cancel).await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        // 40 permits against a bucket of 20 refilled every 50ms
        assert!(start.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test]
    async fn cancellation_interrupts_wait() {
        let limiter = RateLimiter::new(nz(1), Duration::from_secs(3600));
        let cancel = CancellationToken::new();
        limiter.acquire(&cancel).await.unwrap();

        cancel.cancel();
        let err = limiter.acquire(&cancel).await.unwrap_err();
        assert!(matches!(err, ClientError::Cancelled));
    }
}
