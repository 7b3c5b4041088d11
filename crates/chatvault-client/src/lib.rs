/// Outbound side of the backup: every call to the remote conversation API
/// passes through one shared token bucket and one retry policy.
///
/// - `transport`: raw request/response boundary (reqwest in production)
/// - `limiter`: token-bucket admission shared by all calls
/// - `retry`: backoff and rate-limit aware retry around single calls
/// - `slack`: the conversation API operations the collector consumes
/// - `content`: single-attempt byte streams for file downloads

pub mod content;
pub mod error;
pub mod limiter;
pub mod retry;
pub mod slack;
pub mod transport;

pub use content::ContentSource;
pub use error::ClientError;
pub use limiter::RateLimiter;
pub use retry::{RetryClient, RetryPolicy, sleep_or_cancel};
pub use slack::{ConversationApi, SlackApi};
pub use transport::{ByteStream, HttpTransport, RawResponse, StreamResponse, Transport};
