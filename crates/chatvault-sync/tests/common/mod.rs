#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::{StreamExt, stream};
use tokio_util::sync::CancellationToken;

use chatvault_client::{ClientError, ContentSource, ConversationApi, RetryPolicy, StreamResponse};
use chatvault_db::Database;
use chatvault_files::{DiskSpace, Downloader, FilePipeline, Storage, SystemDiskSpace};
use chatvault_sync::{Orchestrator, RunOptions, RunReport};
use chatvault_types::MemoryLogger;
use chatvault_types::api::{AuthIdentity, ChannelDto, EditedDto, FileDto, MessageDto, MessagePage, parse_ts};

pub fn ts(n: u32) -> String {
    format!("{}.000000", 1_700_000_000 + n)
}

#[derive(Default)]
struct State {
    channels: Vec<ChannelDto>,
    /// Top-level messages per channel, oldest first.
    history: HashMap<String, Vec<MessageDto>>,
    /// Replies per (channel, root), oldest first.
    replies: HashMap<(String, String), Vec<MessageDto>>,
    files: HashMap<String, Vec<u8>>,
    failing_history: HashMap<String, ClientError>,
    failing_threads: HashMap<(String, String), ClientError>,
    /// Pages served before the history of a channel starts failing.
    page_budget: HashMap<String, usize>,
    auth_error: bool,
}

/// In-memory remote workspace.
pub struct FixtureApi {
    state: Mutex<State>,
    page_size: usize,
    pub history_calls: AtomicUsize,
    pub thread_calls: AtomicUsize,
    pub opens: AtomicUsize,
}

fn clone_error(e: &ClientError) -> ClientError {
    match e {
        ClientError::Auth(m) => ClientError::Auth(m.clone()),
        ClientError::NotFound(m) => ClientError::NotFound(m.clone()),
        ClientError::Server(s) => ClientError::Server(*s),
        other => ClientError::Rejected(other.to_string()),
    }
}

impl FixtureApi {
    pub fn new(page_size: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            page_size,
            history_calls: AtomicUsize::new(0),
            thread_calls: AtomicUsize::new(0),
            opens: AtomicUsize::new(0),
        }
    }

    pub fn channel(&self, id: &str, name: &str) {
        self.state.lock().unwrap().channels.push(ChannelDto {
            id: id.into(),
            name: name.into(),
            created: 1_600_000_000,
            ..Default::default()
        });
    }

    pub fn post(&self, channel: &str, n: u32, user: &str, text: &str) {
        self.push(
            channel,
            MessageDto {
                ts: ts(n),
                user: Some(user.into()),
                text: text.into(),
                ..Default::default()
            },
        );
    }

    pub fn push(&self, channel: &str, dto: MessageDto) {
        self.state
            .lock()
            .unwrap()
            .history
            .entry(channel.into())
            .or_default()
            .push(dto);
    }

    /// Add a reply to the top-level message `root`, marking it a thread root.
    pub fn reply(&self, channel: &str, root: u32, n: u32, user: &str, text: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(msg) = state
            .history
            .get_mut(channel)
            .and_then(|h| h.iter_mut().find(|m| m.ts == ts(root)))
        {
            msg.thread_ts = Some(ts(root));
        }
        state
            .replies
            .entry((channel.into(), ts(root)))
            .or_default()
            .push(MessageDto {
                ts: ts(n),
                user: Some(user.into()),
                text: text.into(),
                thread_ts: Some(ts(root)),
                ..Default::default()
            });
    }

    pub fn attach(&self, channel: &str, n: u32, file_id: &str, content: &[u8]) {
        let url = format!("https://files.test/{}", file_id);
        let mut state = self.state.lock().unwrap();
        state.files.insert(url.clone(), content.to_vec());
        if let Some(msg) = state
            .history
            .get_mut(channel)
            .and_then(|h| h.iter_mut().find(|m| m.ts == ts(n)))
        {
            msg.files.push(FileDto {
                id: file_id.into(),
                name: format!("{}.txt", file_id),
                filetype: "text".into(),
                size: content.len() as u64,
                created: 1_700_000_000 + n as i64,
                url_private_download: Some(url),
                ..Default::default()
            });
        }
    }

    pub fn edit(&self, channel: &str, n: u32, text: &str, edited_at: u32) {
        let mut state = self.state.lock().unwrap();
        if let Some(msg) = state
            .history
            .get_mut(channel)
            .and_then(|h| h.iter_mut().find(|m| m.ts == ts(n)))
        {
            msg.text = text.into();
            msg.edited = Some(EditedDto {
                user: msg.user.clone(),
                ts: ts(edited_at),
            });
        }
    }

    pub fn fail_history(&self, channel: &str, error: ClientError) {
        self.state
            .lock()
            .unwrap()
            .failing_history
            .insert(channel.into(), error);
    }

    pub fn fail_thread(&self, channel: &str, root: u32, error: ClientError) {
        self.state
            .lock()
            .unwrap()
            .failing_threads
            .insert((channel.into(), ts(root)), error);
    }

    pub fn fail_after_pages(&self, channel: &str, pages: usize) {
        self.state.lock().unwrap().page_budget.insert(channel.into(), pages);
    }

    pub fn heal(&self, channel: &str) {
        let mut state = self.state.lock().unwrap();
        state.failing_history.remove(channel);
        state.page_budget.remove(channel);
        state.failing_threads.retain(|(c, _), _| c != channel);
    }

    pub fn fail_auth(&self) {
        self.state.lock().unwrap().auth_error = true;
    }
}

impl ConversationApi for FixtureApi {
    async fn authenticate(&self) -> Result<AuthIdentity, ClientError> {
        if self.state.lock().unwrap().auth_error {
            return Err(ClientError::Auth("invalid_auth".into()));
        }
        Ok(AuthIdentity {
            user: "backup".into(),
            user_id: "U0".into(),
            team: "test".into(),
            team_id: "T0".into(),
        })
    }

    async fn list_channels(&self) -> Result<Vec<ChannelDto>, ClientError> {
        Ok(self.state.lock().unwrap().channels.clone())
    }

    async fn fetch_message_page(
        &self,
        channel_id: &str,
        cursor: Option<&str>,
        oldest: Option<DateTime<Utc>>,
    ) -> Result<MessagePage, ClientError> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();

        if let Some(e) = state.failing_history.get(channel_id) {
            return Err(clone_error(e));
        }
        if let Some(budget) = state.page_budget.get_mut(channel_id) {
            if *budget == 0 {
                return Err(ClientError::Server(503));
            }
            *budget -= 1;
        }

        let mut visible: Vec<MessageDto> = state
            .history
            .get(channel_id)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|m| match (oldest, parse_ts(&m.ts)) {
                (Some(oldest), Some(at)) => at > oldest,
                _ => true,
            })
            .collect();
        visible.reverse();

        let offset: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        let end = (offset + self.page_size).min(visible.len());
        let messages = visible.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
        let next_cursor = (end < visible.len()).then(|| end.to_string());

        Ok(MessagePage { messages, next_cursor })
    }

    async fn fetch_thread_replies(&self, channel_id: &str, thread_id: &str) -> Result<Vec<MessageDto>, ClientError> {
        self.thread_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();

        if let Some(e) = state
            .failing_threads
            .get(&(channel_id.to_string(), thread_id.to_string()))
        {
            return Err(clone_error(e));
        }

        let root = state
            .history
            .get(channel_id)
            .and_then(|h| h.iter().find(|m| m.ts == thread_id))
            .cloned()
            .ok_or_else(|| ClientError::NotFound("thread_not_found".into()))?;

        let mut thread = vec![root];
        if let Some(replies) = state.replies.get(&(channel_id.to_string(), thread_id.to_string())) {
            thread.extend(replies.iter().cloned());
        }
        Ok(thread)
    }
}

impl ContentSource for FixtureApi {
    async fn admit(&self) -> Result<(), ClientError> {
        Ok(())
    }

    async fn open(&self, url: &str) -> Result<StreamResponse, ClientError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let data = self
            .state
            .lock()
            .unwrap()
            .files
            .get(url)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(url.to_string()))?;

        Ok(StreamResponse {
            status: 200,
            retry_after: None,
            content_length: Some(data.len() as u64),
            body: stream::iter(vec![Ok(Bytes::from(data))]).boxed(),
        })
    }
}

/// Reports a fixed amount of free space for every path.
pub struct FixedSpace(pub u64);

impl DiskSpace for FixedSpace {
    fn available(&self, _path: &Path) -> Option<u64> {
        Some(self.0)
    }
}

/// A store, a storage tree and a remote fixture wired together.
pub struct Harness {
    _dir: tempfile::TempDir,
    pub storage_root: PathBuf,
    pub db: Arc<Database>,
    pub storage: Arc<Storage>,
    pub api: Arc<FixtureApi>,
    pub logger: Arc<MemoryLogger>,
    pipeline: Arc<FilePipeline<FixtureApi>>,
}

impl Harness {
    pub async fn new(api: FixtureApi) -> Self {
        Self::on_disk(api, Arc::new(SystemDiskSpace)).await
    }

    /// Like `new`, with the storage volume reporting `free` bytes.
    pub async fn with_free_space(api: FixtureApi, free: u64) -> Self {
        Self::on_disk(api, Arc::new(FixedSpace(free))).await
    }

    async fn on_disk(api: FixtureApi, disk: Arc<dyn DiskSpace>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let storage_root = dir.path().join("storage");
        let db = Arc::new(Database::open(&dir.path().join("backup.db")).unwrap());
        let storage = Arc::new(Storage::with_disk_space(storage_root.clone(), disk).await.unwrap());
        let api = Arc::new(api);
        let logger = Arc::new(MemoryLogger::new());

        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        };
        let downloader = Downloader::new(api.clone(), policy, CancellationToken::new(), logger.clone());
        let pipeline = Arc::new(FilePipeline::new(
            db.clone(),
            storage.clone(),
            downloader,
            1024 * 1024,
            logger.clone(),
        ));

        Self {
            _dir: dir,
            storage_root,
            db,
            storage,
            api,
            logger,
            pipeline,
        }
    }

    pub async fn run(&self, channels: &[&str], options: RunOptions) -> anyhow::Result<RunReport> {
        self.run_with_cancel(channels, options, CancellationToken::new()).await
    }

    pub async fn run_with_cancel(
        &self,
        channels: &[&str],
        options: RunOptions,
        cancel: CancellationToken,
    ) -> anyhow::Result<RunReport> {
        let orchestrator = Orchestrator::new(
            self.api.clone(),
            self.db.clone(),
            self.storage.clone(),
            self.pipeline.clone(),
            options,
            cancel,
            self.logger.clone(),
        );
        let channels: Vec<String> = channels.iter().map(|c| c.to_string()).collect();
        orchestrator.run(&channels).await
    }

    /// Message ids of a channel in the order they were first written.
    pub fn insertion_order(&self, channel: &str) -> Vec<String> {
        self.db
            .with_conn(|conn| {
                let mut stmt = conn.prepare("SELECT id FROM messages WHERE channel_id = ?1 ORDER BY rowid")?;
                let ids = stmt
                    .query_map([channel], |r| r.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ids)
            })
            .unwrap()
    }

    /// `(id, content)` of a channel in timestamp order.
    pub fn contents(&self, channel: &str) -> Vec<(String, String)> {
        self.db
            .channel_messages(channel)
            .unwrap()
            .into_iter()
            .map(|m| (m.id, m.content))
            .collect()
    }
}

pub fn full() -> RunOptions {
    RunOptions {
        full_resync: true,
        ..Default::default()
    }
}
