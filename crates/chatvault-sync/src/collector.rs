use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;

use chatvault_client::{ClientError, ContentSource, ConversationApi};
use chatvault_db::{Database, MessageWrite, ReferentialError};
use chatvault_files::{FilePipeline, FileStats};
use chatvault_types::api::{MessageDto, parse_ts};
use chatvault_types::{Message, SyncEvent, SyncLog, SyncLogger};

use crate::normalize::normalize;

/// Counters of one channel walk.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CollectStats {
    pub pages: usize,
    pub new_messages: usize,
    pub updated_messages: usize,
    pub failed_messages: usize,
    pub files: FileStats,
}

/// Walks a channel's history and persists what the store does not have.
///
/// Incremental runs start from the channel's watermark: the newest top-level
/// message of the last walk that reached the end of the history. A walk that
/// breaks off leaves it where it was, so the next run fetches the gap again
/// and skips messages that already exist. Threads are marked pending when
/// their root is stored and cleared once every reply is in; pending threads
/// are fetched again at the start of each walk. With `full_resync` the whole
/// history is walked and known messages are upserted again.
pub struct MessageCollector<A, S> {
    api: Arc<A>,
    db: Arc<Database>,
    files: Option<Arc<FilePipeline<S>>>,
    full_resync: bool,
    logger: Arc<dyn SyncLogger>,
}

/// Per-walk cursor state.
struct Walk<'a> {
    channel_id: &'a str,
    seen: HashSet<String>,
    threads: HashSet<String>,
    stats: CollectStats,
}

impl<A: ConversationApi, S: ContentSource> MessageCollector<A, S> {
    pub fn new(
        api: Arc<A>,
        db: Arc<Database>,
        files: Option<Arc<FilePipeline<S>>>,
        full_resync: bool,
        logger: Arc<dyn SyncLogger>,
    ) -> Self {
        Self {
            api,
            db,
            files,
            full_resync,
            logger,
        }
    }

    /// Collect one channel. Page fetch and store failures abort the walk;
    /// failures local to one message or file are logged and skipped.
    pub async fn collect(&self, channel_id: &str) -> Result<CollectStats> {
        let watermark = if self.full_resync {
            None
        } else {
            self.db.channel_watermark(channel_id)?
        };
        debug!("Collecting {} from {:?}", channel_id, watermark);

        let mut walk = Walk {
            channel_id,
            seen: HashSet::new(),
            threads: HashSet::new(),
            stats: CollectStats::default(),
        };

        for root_id in self.db.pending_threads(channel_id)? {
            debug!("Retrying thread {} of {}", root_id, channel_id);
            self.collect_thread(&mut walk, &root_id).await?;
        }

        let mut cursor: Option<String> = None;
        let mut newest = None;

        loop {
            let page = self
                .api
                .fetch_message_page(channel_id, cursor.as_deref(), watermark)
                .await
                .with_context(|| format!("failed to fetch history of {}", channel_id))?;

            walk.stats.pages += 1;
            self.log(
                channel_id,
                SyncEvent::PageFetched {
                    messages: page.messages.len(),
                    has_more: page.next_cursor.is_some(),
                },
            );

            for dto in &page.messages {
                // history pages carry top-level messages only
                newest = newest.max(parse_ts(&dto.ts));
                if !walk.seen.insert(dto.ts.clone()) {
                    continue;
                }
                let Some(message) = self.store(&mut walk, dto).await? else {
                    continue;
                };
                if message.is_thread_root() {
                    self.collect_thread(&mut walk, &message.id).await?;
                }
            }

            match page.next_cursor {
                // a cursor that repeats would never terminate
                Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
                _ => break,
            }
        }

        if let Some(newest) = newest {
            if self.db.advance_watermark(channel_id, &newest)? {
                debug!("Watermark of {} is now {}", channel_id, newest);
            }
        }

        Ok(walk.stats)
    }

    /// Persist every reply of a thread before the walk moves on. The first
    /// element returned by the API is the root itself. The pending mark is
    /// cleared once the replies are stored, or when the thread is gone.
    async fn collect_thread(&self, walk: &mut Walk<'_>, root_id: &str) -> Result<()> {
        if !walk.threads.insert(root_id.to_string()) {
            return Ok(());
        }

        let replies = match self.api.fetch_thread_replies(walk.channel_id, root_id).await {
            Ok(replies) => replies,
            Err(e) if is_fatal(&e) => {
                return Err(e).with_context(|| format!("failed to fetch thread {}", root_id));
            }
            Err(e) => {
                if matches!(e, ClientError::NotFound(_)) {
                    self.db.clear_thread_pending(walk.channel_id, root_id)?;
                }
                walk.stats.failed_messages += 1;
                self.log(
                    walk.channel_id,
                    SyncEvent::MessageFailed {
                        message_id: root_id.to_string(),
                        message: format!("thread replies unavailable: {}", e),
                    },
                );
                return Ok(());
            }
        };

        let mut stored = 0;
        for dto in replies.iter().skip(1) {
            if !walk.seen.insert(dto.ts.clone()) {
                continue;
            }
            if self.store(walk, dto).await?.is_some() {
                stored += 1;
            }
        }
        self.db.clear_thread_pending(walk.channel_id, root_id)?;

        self.log(
            walk.channel_id,
            SyncEvent::ThreadCollected {
                root_id: root_id.to_string(),
                replies: stored,
            },
        );
        Ok(())
    }

    /// Author, message, then attachments. Returns the message when it was
    /// processed in this walk, `None` when it was skipped or rejected.
    async fn store(&self, walk: &mut Walk<'_>, dto: &MessageDto) -> Result<Option<Message>> {
        let Some(normalized) = normalize(walk.channel_id, dto) else {
            walk.stats.failed_messages += 1;
            self.log(
                walk.channel_id,
                SyncEvent::MessageFailed {
                    message_id: dto.ts.clone(),
                    message: "unparseable timestamp".to_string(),
                },
            );
            return Ok(None);
        };

        if !self.full_resync && self.db.message_exists(walk.channel_id, &normalized.message.id)? {
            return Ok(None);
        }

        self.db.insert_user(&normalized.author)?;

        match self.db.upsert_message(&normalized.message) {
            Ok(MessageWrite::Inserted) => walk.stats.new_messages += 1,
            Ok(MessageWrite::Updated) => walk.stats.updated_messages += 1,
            Ok(MessageWrite::Unchanged) => {}
            Err(e) if e.downcast_ref::<ReferentialError>().is_some() => {
                walk.stats.failed_messages += 1;
                self.log(
                    walk.channel_id,
                    SyncEvent::MessageFailed {
                        message_id: normalized.message.id.clone(),
                        message: e.to_string(),
                    },
                );
                return Ok(None);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to store message {}", normalized.message.id));
            }
        }

        if normalized.message.is_thread_root() && !walk.threads.contains(&normalized.message.id) {
            self.db.mark_thread_pending(walk.channel_id, &normalized.message.id)?;
        }

        if let Some(files) = &self.files {
            for file in &normalized.files {
                let outcome = files.process(file).await;
                walk.stats.files.record(&outcome);
            }
        }

        Ok(Some(normalized.message))
    }

    fn log(&self, channel_id: &str, event: SyncEvent) {
        self.logger.log(SyncLog::new("collector", Some(channel_id), event));
    }
}

/// Errors that end the channel walk even inside a thread.
fn is_fatal(e: &ClientError) -> bool {
    e.is_auth() || matches!(e, ClientError::Cancelled)
}
