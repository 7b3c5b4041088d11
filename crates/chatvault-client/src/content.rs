use std::future::Future;

use crate::error::ClientError;
use crate::retry::{RetryClient, classify_status};
use crate::transport::{StreamResponse, Transport};

/// Source of file bytes. One call is one attempt: retrying is left to the
/// downloader, which has to re-verify whatever it receives anyway.
///
/// Admission is separate from opening so the caller can follow the same
/// accounting as API calls: `admit` before the first attempt and before
/// every backoff retry, never before a retry the server asked for.
pub trait ContentSource: Send + Sync {
    fn admit(&self) -> impl Future<Output = Result<(), ClientError>> + Send;

    fn open(&self, url: &str) -> impl Future<Output = Result<StreamResponse, ClientError>> + Send;
}

impl<T: Transport> ContentSource for RetryClient<T> {
    /// One permit from the limiter shared with API calls.
    async fn admit(&self) -> Result<(), ClientError> {
        self.limiter().acquire(self.cancel_token()).await
    }

    /// Non-2xx statuses come back as the matching error so the caller can
    /// tell a rate limit from a missing file.
    async fn open(&self, url: &str) -> Result<StreamResponse, ClientError> {
        let resp = self.transport().get_stream(url).await?;
        classify_status(resp.status, resp.retry_after)?;
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::RateLimiter;
    use crate::retry::RetryPolicy;
    use crate::transport::RawResponse;
    use bytes::Bytes;
    use chatvault_types::NullLogger;
    use futures_util::{StreamExt, stream};
    use std::num::NonZeroU32;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct FixedStream(u16);

    fn nz(n: u32) -> NonZeroU32 {
        NonZeroU32::new(n).unwrap()
    }

    impl Transport for FixedStream {
        async fn get(&self, _url: &str, _query: &[(&str, String)]) -> Result<RawResponse, ClientError> {
            Err(ClientError::Rejected("not scripted".into()))
        }

        async fn get_stream(&self, _url: &str) -> Result<StreamResponse, ClientError> {
            Ok(StreamResponse {
                status: self.0,
                retry_after: None,
                content_length: Some(5),
                body: stream::iter(vec![Ok(Bytes::from_static(b"he")), Ok(Bytes::from_static(b"llo"))]).boxed(),
            })
        }
    }

    fn client(status: u16) -> RetryClient<FixedStream> {
        limited(status, RateLimiter::new(nz(10), Duration::from_secs(1)))
    }

    fn limited(status: u16, limiter: RateLimiter) -> RetryClient<FixedStream> {
        RetryClient::new(
            FixedStream(status),
            Arc::new(limiter),
            RetryPolicy::default(),
            CancellationToken::new(),
            Arc::new(NullLogger),
        )
    }

    #[tokio::test]
    async fn successful_open_streams_body() {
        let resp = client(200).open("http://files/a").await.unwrap();
        let chunks: Vec<Bytes> = resp.body.map(|c| c.unwrap()).collect().await;
        assert_eq!(chunks.concat(), b"hello");
    }

    #[tokio::test]
    async fn error_status_is_classified() {
        assert!(matches!(
            client(404).open("http://files/a").await,
            Err(ClientError::NotFound(_))
        ));
        assert!(matches!(
            client(503).open("http://files/a").await,
            Err(ClientError::Server(503))
        ));
    }

    #[tokio::test]
    async fn opening_takes_no_permit() {
        // one permit per hour: only the explicit admission may spend it
        let client = limited(200, RateLimiter::new(nz(1), Duration::from_secs(3600)));
        client.admit().await.unwrap();
        for _ in 0..3 {
            client.open("http://files/a").await.unwrap();
        }

        client.cancel_token().cancel();
        assert!(matches!(client.admit().await, Err(ClientError::Cancelled)));
    }
}
