use std::path::Path;
use std::sync::Arc;

use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use chatvault_client::{ClientError, ContentSource, RetryPolicy, sleep_or_cancel};
use chatvault_types::{SyncEvent, SyncLog, SyncLogger};

use crate::error::DownloadError;
use crate::storage::part_path;

/// A verified file that has been renamed into place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Downloaded {
    pub checksum: String,
    pub bytes: u64,
}

/// Streams remote bytes to disk and verifies them.
///
/// One attempt is "fetch, hash while streaming, compare, rename". The whole
/// attempt is the retry unit: a checksum mismatch is retried like a dropped
/// connection and the partial file never reaches the target path.
pub struct Downloader<S> {
    source: Arc<S>,
    policy: RetryPolicy,
    cancel: CancellationToken,
    logger: Arc<dyn SyncLogger>,
}

impl<S: ContentSource> Downloader<S> {
    pub fn new(
        source: Arc<S>,
        policy: RetryPolicy,
        cancel: CancellationToken,
        logger: Arc<dyn SyncLogger>,
    ) -> Self {
        Self {
            source,
            policy,
            cancel,
            logger,
        }
    }

    pub async fn download(
        &self,
        channel_id: &str,
        file_id: &str,
        url: &str,
        target: &Path,
        expected: Option<&str>,
    ) -> Result<Downloaded, DownloadError> {
        self.source.admit().await?;

        let mut attempt = 1;
        loop {
            let err = match self.fetch_once(url, target, expected).await {
                Ok(downloaded) => return Ok(downloaded),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => e,
            };

            if attempt >= self.policy.max_attempts {
                return Err(DownloadError::Exhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            // a server-requested wait is served exactly and needs no new permit
            let (delay, admit) = match &err {
                DownloadError::Remote(ClientError::RateLimited(wait)) => (*wait, false),
                _ => (self.policy.backoff(attempt), true),
            };
            self.logger.log(SyncLog::new(
                "files",
                Some(channel_id),
                SyncEvent::RetryScheduled {
                    operation: format!("download {}", file_id),
                    attempt,
                    max_attempts: self.policy.max_attempts,
                    delay_ms: delay.as_millis() as u64,
                    cause: err.to_string(),
                },
            ));
            sleep_or_cancel(delay, &self.cancel).await?;
            if admit {
                self.source.admit().await?;
            }
            attempt += 1;
        }
    }

    async fn fetch_once(
        &self,
        url: &str,
        target: &Path,
        expected: Option<&str>,
    ) -> Result<Downloaded, DownloadError> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await.map_err(DownloadError::io(parent))?;
        }

        let part = part_path(target);
        let downloaded = match self.stream_to(url, &part).await {
            Ok(d) => d,
            Err(e) => {
                fs::remove_file(&part).await.ok();
                return Err(e);
            }
        };

        if let Some(expected) = expected {
            if !expected.eq_ignore_ascii_case(&downloaded.checksum) {
                fs::remove_file(&part).await.ok();
                return Err(DownloadError::ChecksumMismatch {
                    expected: expected.to_string(),
                    actual: downloaded.checksum,
                });
            }
        }

        fs::rename(&part, target).await.map_err(DownloadError::io(target))?;
        Ok(downloaded)
    }

    async fn stream_to(&self, url: &str, part: &Path) -> Result<Downloaded, DownloadError> {
        let resp = self.source.open(url).await?;
        let mut body = resp.body;

        let mut file = fs::File::create(part).await.map_err(DownloadError::io(part))?;
        let mut hasher = Sha256::new();
        let mut bytes: u64 = 0;

        while let Some(chunk) = body.next().await {
            if self.cancel.is_cancelled() {
                return Err(ClientError::Cancelled.into());
            }
            let chunk = chunk?;
            hasher.update(&chunk);
            file.write_all(&chunk).await.map_err(DownloadError::io(part))?;
            bytes += chunk.len() as u64;
        }

        file.flush().await.map_err(DownloadError::io(part))?;
        file.sync_all().await.map_err(DownloadError::io(part))?;

        Ok(Downloaded {
            checksum: hex::encode(hasher.finalize()),
            bytes,
        })
    }
}

/// Lowercase hex SHA-256 of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bytes::Bytes;
    use chatvault_client::StreamResponse;
    use chatvault_types::MemoryLogger;
    use futures_util::stream;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Serves scripted bodies per URL; the last body for a URL repeats.
    #[derive(Default)]
    pub(crate) struct FakeSource {
        bodies: Mutex<HashMap<String, VecDeque<Result<Vec<u8>, u16>>>>,
        pub(crate) opens: AtomicUsize,
        pub(crate) admits: AtomicUsize,
    }

    impl FakeSource {
        pub(crate) fn serve(&self, url: &str, responses: Vec<Result<Vec<u8>, u16>>) {
            self.bodies.lock().unwrap().insert(url.to_string(), responses.into());
        }

        pub(crate) fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }

        pub(crate) fn admits(&self) -> usize {
            self.admits.load(Ordering::SeqCst)
        }
    }

    impl ContentSource for FakeSource {
        async fn admit(&self) -> Result<(), ClientError> {
            self.admits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn open(&self, url: &str) -> Result<StreamResponse, ClientError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let next = {
                let mut bodies = self.bodies.lock().unwrap();
                let queue = bodies
                    .get_mut(url)
                    .ok_or_else(|| ClientError::NotFound(url.to_string()))?;
                if queue.len() > 1 {
                    queue.pop_front().unwrap()
                } else {
                    queue.front().cloned().unwrap()
                }
            };
            match next {
                Ok(data) => {
                    // split so the hash is computed over several chunks
                    let mid = data.len() / 2;
                    let chunks = vec![
                        Ok(Bytes::copy_from_slice(&data[..mid])),
                        Ok(Bytes::copy_from_slice(&data[mid..])),
                    ];
                    Ok(StreamResponse {
                        status: 200,
                        retry_after: None,
                        content_length: Some(data.len() as u64),
                        body: stream::iter(chunks).boxed(),
                    })
                }
                Err(429) => Err(ClientError::RateLimited(Duration::from_secs(7))),
                Err(500) => Err(ClientError::Server(500)),
                Err(404) => Err(ClientError::NotFound(url.to_string())),
                Err(code) => Err(ClientError::Rejected(format!("HTTP {}", code))),
            }
        }
    }

    pub(crate) fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
        }
    }

    fn downloader(source: Arc<FakeSource>, logger: Arc<MemoryLogger>) -> Downloader<FakeSource> {
        Downloader::new(source, policy(3), CancellationToken::new(), logger)
    }

    #[tokio::test(start_paused = true)]
    async fn verified_download_lands_at_target() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeSource::default());
        source.serve("u", vec![Ok(b"hello world".to_vec())]);
        let target = dir.path().join("files/C1/2024-01/F1.txt");

        let d = downloader(source, Arc::new(MemoryLogger::new()))
            .download("C1", "F1", "u", &target, Some(sha256_hex(b"hello world").as_str()))
            .await
            .unwrap();

        assert_eq!(d.bytes, 11);
        assert_eq!(d.checksum, sha256_hex(b"hello world"));
        assert_eq!(fs::read(&target).await.unwrap(), b"hello world");
        assert!(!part_path(&target).exists());
    }

    #[tokio::test(start_paused = true)]
    async fn corruption_is_retried_then_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeSource::default());
        source.serve("u", vec![Ok(b"hellX".to_vec()), Ok(b"hello".to_vec())]);
        let logger = Arc::new(MemoryLogger::new());
        let target = dir.path().join("F1.txt");

        downloader(source.clone(), logger.clone())
            .download("C1", "F1", "u", &target, Some(sha256_hex(b"hello").as_str()))
            .await
            .unwrap();

        assert_eq!(source.opens(), 2);
        assert_eq!(logger.count(|e| matches!(e, SyncEvent::RetryScheduled { .. })), 1);
        assert_eq!(fs::read(&target).await.unwrap(), b"hello");
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_corruption_exhausts_and_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeSource::default());
        source.serve("u", vec![Ok(b"garbage".to_vec())]);
        let target = dir.path().join("F1.txt");

        let err = downloader(source.clone(), Arc::new(MemoryLogger::new()))
            .download("C1", "F1", "u", &target, Some(sha256_hex(b"hello").as_str()))
            .await
            .unwrap_err();

        match err {
            DownloadError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, DownloadError::ChecksumMismatch { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(source.opens(), 3);
        assert!(!target.exists());
        assert!(!part_path(&target).exists());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_remote_file_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeSource::default());
        source.serve("u", vec![Err(404)]);

        let err = downloader(source.clone(), Arc::new(MemoryLogger::new()))
            .download("C1", "F1", "u", &dir.path().join("F1"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Remote(ClientError::NotFound(_))));
        assert_eq!(source.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn server_errors_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeSource::default());
        source.serve("u", vec![Err(500), Ok(b"ok".to_vec())]);

        downloader(source.clone(), Arc::new(MemoryLogger::new()))
            .download("C1", "F1", "u", &dir.path().join("F1"), None)
            .await
            .unwrap();
        assert_eq!(source.opens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_retry_waits_exactly_and_takes_no_permit() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeSource::default());
        source.serve("u", vec![Err(429), Ok(b"ok".to_vec())]);

        let start = tokio::time::Instant::now();
        downloader(source.clone(), Arc::new(MemoryLogger::new()))
            .download("C1", "F1", "u", &dir.path().join("F1"), None)
            .await
            .unwrap();

        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(7) && waited < Duration::from_secs(8), "{:?}", waited);
        assert_eq!(source.opens(), 2);
        assert_eq!(source.admits(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_retry_is_admitted_again() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeSource::default());
        source.serve("u", vec![Err(500), Err(500), Ok(b"ok".to_vec())]);

        downloader(source.clone(), Arc::new(MemoryLogger::new()))
            .download("C1", "F1", "u", &dir.path().join("F1"), None)
            .await
            .unwrap();

        assert_eq!(source.opens(), 3);
        assert_eq!(source.admits(), 3);
    }
}
