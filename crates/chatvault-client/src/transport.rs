use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use reqwest::Client;
use reqwest::header::{HeaderMap, RETRY_AFTER};

use crate::error::ClientError;

pub type ByteStream = BoxStream<'static, Result<Bytes, ClientError>>;

/// A fully buffered response.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub retry_after: Option<Duration>,
    pub body: Bytes,
}

/// A response whose body is consumed incrementally.
pub struct StreamResponse {
    pub status: u16,
    pub retry_after: Option<Duration>,
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

/// Raw request/response boundary. Implementations perform exactly one
/// attempt and report only transport-level failures as errors; status
/// codes are interpreted by the caller.
pub trait Transport: Send + Sync {
    fn get(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> impl Future<Output = Result<RawResponse, ClientError>> + Send;

    fn get_stream(&self, url: &str) -> impl Future<Output = Result<StreamResponse, ClientError>> + Send;
}

/// Bearer-authenticated HTTP transport.
pub struct HttpTransport {
    client: Client,
    token: String,
    request_timeout: Duration,
}

impl HttpTransport {
    /// `request_timeout` bounds buffered API calls. Streamed downloads are
    /// only bounded by the connect timeout, since large files legitimately
    /// take longer.
    pub fn new(token: impl Into<String>, request_timeout: Duration) -> Result<Self, ClientError> {
        let client = Client::builder()
            .connect_timeout(request_timeout)
            .user_agent(concat!("chatvault/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ClientError::Transport(format!("Cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            token: token.into(),
            request_timeout,
        })
    }
}

impl Transport for HttpTransport {
    async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<RawResponse, ClientError> {
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .query(query)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| ClientError::Transport(format!("Request failed: {}", e)))?;

        let status = resp.status().as_u16();
        let retry_after = parse_retry_after(resp.headers());
        let body = resp
            .bytes()
            .await
            .map_err(|e| ClientError::Transport(format!("Body read failed: {}", e)))?;

        Ok(RawResponse {
            status,
            retry_after,
            body,
        })
    }

    async fn get_stream(&self, url: &str) -> Result<StreamResponse, ClientError> {
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| ClientError::Transport(format!("Download request failed: {}", e)))?;

        let status = resp.status().as_u16();
        let retry_after = parse_retry_after(resp.headers());
        let content_length = resp.content_length();
        let body = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| ClientError::Transport(format!("Stream error: {}", e))))
            .boxed();

        Ok(StreamResponse {
            status,
            retry_after,
            content_length,
            body,
        })
    }
}

/// `Retry-After` in delta-seconds form, the only form the API sends.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
