use std::path::PathBuf;

use chatvault_client::ClientError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("insufficient disk space: {needed} bytes needed, {available} available")]
    InsufficientSpace { needed: u64, available: u64 },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error(transparent)]
    Remote(#[from] ClientError),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<DownloadError>,
    },
}

impl DownloadError {
    /// A corrupted transfer is as retryable as a dropped connection.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ChecksumMismatch { .. } => true,
            Self::Remote(e) => e.is_transient(),
            _ => false,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }
}
