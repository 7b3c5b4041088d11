use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::fs;
use tracing::debug;

use chatvault_client::ContentSource;
use chatvault_db::Database;
use chatvault_types::{FileRecord, FileRef, SyncEvent, SyncLog, SyncLogger};

use crate::download::Downloader;
use crate::storage::Storage;

/// What happened to one attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    /// Already resolved and still on disk.
    Present,
    Downloaded { checksum: String, bytes: u64 },
    /// Bytes shared with an existing file instead of downloading.
    Linked { checksum: String, source: String },
    Skipped { reason: String },
}

/// Per-channel attachment counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FileStats {
    pub acquired: usize,
    pub linked: usize,
    pub present: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl FileStats {
    pub fn record(&mut self, outcome: &Result<FileOutcome>) {
        match outcome {
            Ok(FileOutcome::Present) => self.present += 1,
            Ok(FileOutcome::Downloaded { .. }) => self.acquired += 1,
            Ok(FileOutcome::Linked { .. }) => self.linked += 1,
            Ok(FileOutcome::Skipped { .. }) => self.skipped += 1,
            Err(_) => self.failed += 1,
        }
    }
}

/// Registers attachments and gets their bytes into the storage tree,
/// downloading only content the store has not seen before.
pub struct FilePipeline<S> {
    db: Arc<Database>,
    storage: Arc<Storage>,
    downloader: Downloader<S>,
    max_file_bytes: u64,
    logger: Arc<dyn SyncLogger>,
}

impl<S: ContentSource> FilePipeline<S> {
    pub fn new(
        db: Arc<Database>,
        storage: Arc<Storage>,
        downloader: Downloader<S>,
        max_file_bytes: u64,
        logger: Arc<dyn SyncLogger>,
    ) -> Self {
        Self {
            db,
            storage,
            downloader,
            max_file_bytes,
            logger,
        }
    }

    /// Register `file` and acquire its bytes. Failures are logged here and
    /// returned so the caller can count them; they never affect other files.
    pub async fn process(&self, file: &FileRef) -> Result<FileOutcome> {
        let result = self.acquire(file).await;

        let event = match &result {
            Ok(FileOutcome::Downloaded { checksum, bytes }) => SyncEvent::FileAcquired {
                file_id: file.id.clone(),
                bytes: *bytes,
                checksum: checksum.clone(),
            },
            Ok(FileOutcome::Linked { source, .. }) => SyncEvent::FileLinked {
                file_id: file.id.clone(),
                source: source.clone(),
            },
            Ok(FileOutcome::Skipped { reason }) => SyncEvent::FileSkipped {
                file_id: file.id.clone(),
                reason: reason.clone(),
            },
            Ok(FileOutcome::Present) => return result,
            Err(e) => SyncEvent::FileFailed {
                file_id: file.id.clone(),
                message: format!("{:#}", e),
            },
        };
        self.logger.log(SyncLog::new("files", Some(&file.channel_id), event));
        result
    }

    async fn acquire(&self, file: &FileRef) -> Result<FileOutcome> {
        let target = self.storage.file_path(file);
        let target_str = target.to_string_lossy().into_owned();

        let existing = self.db.get_file(&file.id, &file.channel_id, &file.message_id)?;
        if let Some(rec) = &existing {
            if !rec.is_pending() && rec.local_path == target_str && exists(&target).await {
                return Ok(FileOutcome::Present);
            }
        }

        // Pending row first, so the reference survives a failed acquisition.
        self.db.upsert_file(&FileRecord::pending(file, target_str.clone()))?;

        if file.url.is_empty() {
            return Ok(skipped("no downloadable content"));
        }
        if file.size_bytes > self.max_file_bytes {
            return Ok(skipped(&format!(
                "{} bytes exceeds limit of {}",
                file.size_bytes, self.max_file_bytes
            )));
        }

        let known = match &file.expected_checksum {
            Some(c) if !c.is_empty() => Some(c.to_ascii_lowercase()),
            _ => self.db.known_checksum(&file.id)?,
        };

        if let Some(checksum) = &known {
            if let Some(source) = self.existing_copy(checksum, file).await? {
                // Same channel, same remote id: the rows already share a path.
                if source != target {
                    self.storage.link_or_copy(&source, &target).await?;
                }
                self.register(file, &target_str, checksum)?;
                return Ok(FileOutcome::Linked {
                    checksum: checksum.clone(),
                    source: source.to_string_lossy().into_owned(),
                });
            }
        }

        self.storage.ensure_capacity(file.size_bytes)?;
        let downloaded = self
            .downloader
            .download(&file.channel_id, &file.id, &file.url, &target, known.as_deref())
            .await
            .with_context(|| format!("download of {} failed", file.name))?;

        // Identical bytes under another remote id: keep one copy.
        if let Some(source) = self
            .existing_copy(&downloaded.checksum, file)
            .await?
            .filter(|source| *source != target)
        {
            debug!("{} duplicates {}, linking", target.display(), source.display());
            self.storage.link_or_copy(&source, &target).await?;
        }

        self.register(file, &target_str, &downloaded.checksum)?;
        Ok(FileOutcome::Downloaded {
            checksum: downloaded.checksum,
            bytes: downloaded.bytes,
        })
    }

    /// A file on disk, owned by another row, whose content hashes to
    /// `checksum`.
    async fn existing_copy(&self, checksum: &str, file: &FileRef) -> Result<Option<PathBuf>> {
        for rec in self.db.files_with_checksum(checksum)? {
            let same_row = rec.id == file.id && rec.channel_id == file.channel_id && rec.message_id == file.message_id;
            if same_row {
                continue;
            }
            let path = PathBuf::from(&rec.local_path);
            if exists(&path).await {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    fn register(&self, file: &FileRef, local_path: &str, checksum: &str) -> Result<()> {
        let mut rec = FileRecord::pending(file, local_path.to_string());
        rec.checksum = checksum.to_string();
        self.db.upsert_file(&rec)
    }
}

fn skipped(reason: &str) -> FileOutcome {
    FileOutcome::Skipped {
        reason: reason.to_string(),
    }
}

async fn exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}
