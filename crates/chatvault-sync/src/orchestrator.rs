use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use chatvault_client::{ClientError, ContentSource, ConversationApi};
use chatvault_db::Database;
use chatvault_files::{FilePipeline, FileStats, Storage, SweepReport, sweep_orphans};
use chatvault_types::api::AuthIdentity;
use chatvault_types::{SyncEvent, SyncLog, SyncLogger};

use crate::collector::{CollectStats, MessageCollector};
use crate::directory::ChannelDirectory;

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub full_resync: bool,
    pub skip_files: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelReport {
    pub channel_id: String,
    pub name: String,
    pub stats: CollectStats,
    pub duration: Duration,
    pub error: Option<String>,
}

impl ChannelReport {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn files(&self) -> &FileStats {
        &self.stats.files
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub identity: AuthIdentity,
    pub channels: Vec<ChannelReport>,
    pub sweep: Option<SweepReport>,
}

impl RunReport {
    pub fn channels_ok(&self) -> usize {
        self.channels.iter().filter(|c| c.is_ok()).count()
    }

    pub fn channels_failed(&self) -> usize {
        self.channels.len() - self.channels_ok()
    }

    pub fn new_messages(&self) -> usize {
        self.channels.iter().map(|c| c.stats.new_messages).sum()
    }
}

/// Runs one backup pass: authenticate, resolve the target channels, walk
/// each of them in the configured order, then sweep orphaned files.
///
/// A failing channel is reported and the run moves on. Authentication
/// failures end the whole run.
pub struct Orchestrator<A, S> {
    api: Arc<A>,
    db: Arc<Database>,
    storage: Arc<Storage>,
    files: Arc<FilePipeline<S>>,
    options: RunOptions,
    cancel: CancellationToken,
    logger: Arc<dyn SyncLogger>,
}

impl<A: ConversationApi, S: ContentSource> Orchestrator<A, S> {
    pub fn new(
        api: Arc<A>,
        db: Arc<Database>,
        storage: Arc<Storage>,
        files: Arc<FilePipeline<S>>,
        options: RunOptions,
        cancel: CancellationToken,
        logger: Arc<dyn SyncLogger>,
    ) -> Self {
        Self {
            api,
            db,
            storage,
            files,
            options,
            cancel,
            logger,
        }
    }

    pub async fn run(&self, channel_ids: &[String]) -> Result<RunReport> {
        let identity = self.api.authenticate().await.context("authentication failed")?;
        info!("Authenticated as {} (team {})", identity.user, identity.team);

        let listing = self.api.list_channels().await.context("failed to list channels")?;
        let directory = ChannelDirectory::from_listing(&listing);
        info!("{} channels visible, {} targeted", directory.len(), channel_ids.len());

        self.log(None, SyncEvent::RunStarted { channels: channel_ids.len() });

        let collector = MessageCollector::new(
            self.api.clone(),
            self.db.clone(),
            (!self.options.skip_files).then(|| self.files.clone()),
            self.options.full_resync,
            self.logger.clone(),
        );

        let mut reports = Vec::with_capacity(channel_ids.len());
        for channel_id in channel_ids {
            let name = directory.display_name(channel_id).to_string();
            let started = Instant::now();

            let result = if self.cancel.is_cancelled() {
                Err(anyhow!(ClientError::Cancelled))
            } else {
                self.sync_channel(&collector, &directory, channel_id).await
            };

            let report = match result {
                Ok(stats) => {
                    let duration = started.elapsed();
                    self.log(
                        Some(channel_id),
                        SyncEvent::ChannelFinished {
                            new_messages: stats.new_messages,
                            duration_ms: duration.as_millis() as u64,
                        },
                    );
                    ChannelReport {
                        channel_id: channel_id.clone(),
                        name,
                        stats,
                        duration,
                        error: None,
                    }
                }
                Err(e) if is_auth_failure(&e) => return Err(e),
                Err(e) => {
                    self.log(Some(channel_id), SyncEvent::ChannelFailed { message: format!("{:#}", e) });
                    ChannelReport {
                        channel_id: channel_id.clone(),
                        name,
                        stats: CollectStats::default(),
                        duration: started.elapsed(),
                        error: Some(format!("{:#}", e)),
                    }
                }
            };
            reports.push(report);
        }

        let sweep = if self.cancel.is_cancelled() {
            None
        } else {
            match sweep_orphans(&self.db, &self.storage, self.logger.as_ref()).await {
                Ok(report) => Some(report),
                Err(e) => {
                    warn!("Orphan sweep failed: {:#}", e);
                    None
                }
            }
        };

        let report = RunReport {
            identity,
            channels: reports,
            sweep,
        };
        self.log(
            None,
            SyncEvent::RunFinished {
                channels_ok: report.channels_ok(),
                channels_failed: report.channels_failed(),
                new_messages: report.new_messages(),
            },
        );
        Ok(report)
    }

    async fn sync_channel(
        &self,
        collector: &MessageCollector<A, S>,
        directory: &ChannelDirectory,
        channel_id: &str,
    ) -> Result<CollectStats> {
        let channel = directory
            .get(channel_id)
            .ok_or_else(|| anyhow!("channel {} not found or not accessible", channel_id))?;

        self.db.upsert_channel(channel)?;
        self.log(
            Some(channel_id),
            SyncEvent::ChannelStarted {
                name: channel.name.clone(),
            },
        );

        collector.collect(channel_id).await
    }

    fn log(&self, channel_id: Option<&str>, event: SyncEvent) {
        self.logger.log(SyncLog::new("orchestrator", channel_id, event));
    }
}

fn is_auth_failure(e: &anyhow::Error) -> bool {
    e.chain()
        .any(|cause| cause.downcast_ref::<ClientError>().is_some_and(ClientError::is_auth))
}
