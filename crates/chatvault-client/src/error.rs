use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Connection, TLS or body read failure.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("server error: HTTP {0}")]
    Server(u16),

    #[error("rate limited, retry after {0:?}")]
    RateLimited(Duration),

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("malformed response: {0}")]
    Decode(String),

    #[error("{operation} failed after {attempts} attempts: {last}")]
    Exhausted {
        operation: String,
        attempts: u32,
        #[source]
        last: Box<ClientError>,
    },

    #[error("cancelled")]
    Cancelled,
}

impl ClientError {
    /// Failures worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Server(_) | Self::RateLimited(_))
    }

    /// Authentication failures abort the whole run, not just one channel.
    pub fn is_auth(&self) -> bool {
        match self {
            Self::Auth(_) => true,
            Self::Exhausted { last, .. } => last.is_auth(),
            _ => false,
        }
    }
}
