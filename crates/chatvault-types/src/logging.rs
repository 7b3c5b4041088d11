//! Pipeline logging capability.
//!
//! Components (client, collector, file pipeline, orchestrator) receive a
//! `SyncLogger` at construction instead of reaching for a global logger, so
//! tests can capture or silence their output.

use std::fmt;
use std::sync::Mutex;

/// Structured log entry for a backup operation.
#[derive(Debug, Clone)]
pub struct SyncLog {
    pub component: &'static str,
    pub channel_id: Option<String>,
    pub event: SyncEvent,
}

impl SyncLog {
    pub fn new(component: &'static str, channel_id: Option<&str>, event: SyncEvent) -> Self {
        Self {
            component,
            channel_id: channel_id.map(str::to_string),
            event,
        }
    }
}

/// Backup events that can be logged.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Orchestrator: run begins
    RunStarted { channels: usize },
    /// Orchestrator: channel walk begins
    ChannelStarted { name: String },
    /// Collector: one history page received
    PageFetched { messages: usize, has_more: bool },
    /// Collector: thread replies persisted for a root
    ThreadCollected { root_id: String, replies: usize },
    /// Collector: a single message could not be processed
    MessageFailed { message_id: String, message: String },
    /// File pipeline: fresh bytes downloaded and verified
    FileAcquired { file_id: String, bytes: u64, checksum: String },
    /// File pipeline: existing bytes linked instead of downloaded
    FileLinked { file_id: String, source: String },
    /// File pipeline: file not eligible for acquisition
    FileSkipped { file_id: String, reason: String },
    /// File pipeline: acquisition gave up
    FileFailed { file_id: String, message: String },
    /// Client: server asked us to back off
    RateLimited { operation: String, retry_after_ms: u64 },
    /// Client / downloader: a retry was scheduled
    RetryScheduled {
        operation: String,
        attempt: u32,
        max_attempts: u32,
        delay_ms: u64,
        cause: String,
    },
    /// Sweep: orphaned file removed
    OrphanReclaimed { file_id: String, path: String },
    /// Orchestrator: channel walk complete
    ChannelFinished { new_messages: usize, duration_ms: u64 },
    /// Orchestrator: channel walk aborted
    ChannelFailed { message: String },
    /// Orchestrator: run complete
    RunFinished {
        channels_ok: usize,
        channels_failed: usize,
        new_messages: usize,
    },
}

impl fmt::Display for SyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RunStarted { channels } => write!(f, "run_started channels={}", channels),
            Self::ChannelStarted { name } => write!(f, "channel_started name=#{}", name),
            Self::PageFetched { messages, has_more } => {
                write!(f, "page_fetched messages={} has_more={}", messages, has_more)
            }
            Self::ThreadCollected { root_id, replies } => {
                write!(f, "thread_collected root={} replies={}", root_id, replies)
            }
            Self::MessageFailed { message_id, message } => {
                write!(f, "message_failed id={}: {}", message_id, message)
            }
            Self::FileAcquired { file_id, bytes, checksum } => {
                write!(f, "file_acquired id={} bytes={} sha256={}", file_id, bytes, checksum)
            }
            Self::FileLinked { file_id, source } => {
                write!(f, "file_linked id={} source={}", file_id, source)
            }
            Self::FileSkipped { file_id, reason } => {
                write!(f, "file_skipped id={}: {}", file_id, reason)
            }
            Self::FileFailed { file_id, message } => {
                write!(f, "file_failed id={}: {}", file_id, message)
            }
            Self::RateLimited { operation, retry_after_ms } => {
                write!(f, "rate_limited op={} retry_after_ms={}", operation, retry_after_ms)
            }
            Self::RetryScheduled { operation, attempt, max_attempts, delay_ms, cause } => {
                write!(
                    f,
                    "retry_scheduled op={} attempt={}/{} delay_ms={}: {}",
                    operation, attempt, max_attempts, delay_ms, cause
                )
            }
            Self::OrphanReclaimed { file_id, path } => {
                write!(f, "orphan_reclaimed id={} path={}", file_id, path)
            }
            Self::ChannelFinished { new_messages, duration_ms } => {
                write!(f, "channel_finished new_messages={} duration_ms={}", new_messages, duration_ms)
            }
            Self::ChannelFailed { message } => write!(f, "channel_failed: {}", message),
            Self::RunFinished { channels_ok, channels_failed, new_messages } => {
                write!(
                    f,
                    "run_finished ok={} failed={} new_messages={}",
                    channels_ok, channels_failed, new_messages
                )
            }
        }
    }
}

/// Trait for pipeline logging. Implementations can write to tracing,
/// keep entries in memory, or discard them.
pub trait SyncLogger: Send + Sync {
    fn log(&self, entry: SyncLog);
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger;

impl SyncLogger for TracingLogger {
    fn log(&self, entry: SyncLog) {
        let channel = entry.channel_id.as_deref().unwrap_or("-");
        match &entry.event {
            SyncEvent::MessageFailed { .. }
            | SyncEvent::FileFailed { .. }
            | SyncEvent::RateLimited { .. }
            | SyncEvent::RetryScheduled { .. }
            | SyncEvent::ChannelFailed { .. } => {
                tracing::warn!(component = entry.component, channel = %channel, "{}", entry.event);
            }
            SyncEvent::PageFetched { .. }
            | SyncEvent::FileSkipped { .. }
            | SyncEvent::ThreadCollected { .. } => {
                tracing::debug!(component = entry.component, channel = %channel, "{}", entry.event);
            }
            _ => {
                tracing::info!(component = entry.component, channel = %channel, "{}", entry.event);
            }
        }
    }
}

/// No-op logger that discards all log entries.
pub struct NullLogger;

impl SyncLogger for NullLogger {
    fn log(&self, _entry: SyncLog) {}
}

/// Keeps every entry in memory; used by tests to assert on pipeline behaviour.
#[derive(Default)]
pub struct MemoryLogger {
    entries: Mutex<Vec<SyncLog>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SyncEvent> {
        self.entries
            .lock()
            .map(|e| e.iter().map(|l| l.event.clone()).collect())
            .unwrap_or_default()
    }

    pub fn count<F>(&self, pred: F) -> usize
    where
        F: Fn(&SyncEvent) -> bool,
    {
        self.events().iter().filter(|e| pred(e)).count()
    }
}

impl SyncLogger for MemoryLogger {
    fn log(&self, entry: SyncLog) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry);
        }
    }
}
